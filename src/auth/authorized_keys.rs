//! Parsing and matching of OpenSSH-style authorized keys files.
//!
//! Each line holds `[options] <key-type> <base64-key> [comment]`, where
//! `options` is a comma separated list of `key[=value]` pairs and values may
//! be double-quoted (so they can themselves contain commas). The switchboard
//! recognizes `from`, `access`, `hostname` and `alias`; everything else is
//! ignored. Files are re-read for every authentication attempt, so edits
//! take effect without a restart.

use std::net::IpAddr;
use std::path::Path;

use russh::keys::ssh_key;
use slog::Logger;
use thiserror::Error;

/// The options recognized on an authorized keys entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyOptions {
    /// Source address patterns from the `from` option; empty means any.
    pub from: Vec<String>,
    /// Access level names collected from the `access` option(s).
    pub access: Vec<String>,
    /// Values of the `hostname` option(s); a single value is expected.
    pub hostname: Vec<String>,
    /// Additional names from the `alias` option(s).
    pub alias: Vec<String>,
}

/// One entry of an authorized keys file.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The public key from the key type and base64 columns.
    pub key: ssh_key::PublicKey,
    /// The options preceding the key, if any.
    pub options: KeyOptions,
}

/// Reason an authorized keys line was rejected.
#[derive(Debug, Error)]
pub enum EntryParseError {
    /// No key type and base64 columns were found.
    #[error("missing public key")]
    MissingKey,
    /// A quoted option value is never closed.
    #[error("unbalanced quotes in options")]
    UnbalancedQuotes,
    /// The key columns do not form a valid OpenSSH public key.
    #[error("invalid public key: {0}")]
    Key(#[from] ssh_key::Error),
}

/// The parsed contents of an authorized keys file.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    entries: Vec<Entry>,
}

impl AuthorizedKeys {
    /// Reads and parses the given file. Malformed lines are skipped with a
    /// warning; an unreadable file is an error the caller must handle.
    pub async fn load(path: &Path, logger: &Logger) -> std::io::Result<AuthorizedKeys> {
        let contents = tokio::fs::read_to_string(path).await?;
        Ok(AuthorizedKeys::parse(&contents, logger))
    }

    /// Parses authorized keys file contents.
    pub fn parse(contents: &str, logger: &Logger) -> AuthorizedKeys {
        let mut entries = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_entry(line) {
                Ok(entry) => entries.push(entry),
                Err(err) => slog::warn!(logger, "Skipping authorized keys line {}: {}", lineno + 1, err),
            }
        }
        AuthorizedKeys { entries }
    }

    /// Number of usable entries in the file.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the file held no usable entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Finds the entry matching an offered key, honoring any `from` source
    /// restriction against the peer address.
    pub fn find(&self, key: &ssh_key::PublicKey, peer: Option<IpAddr>) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|entry| entry.key.key_data() == key.key_data() && from_allows(&entry.options.from, peer))
    }
}

fn parse_entry(line: &str) -> Result<Entry, EntryParseError> {
    let (options, rest) = split_off_options(line)?;
    let mut columns = rest.split_whitespace();
    let algorithm = columns.next().ok_or(EntryParseError::MissingKey)?;
    let data = columns.next().ok_or(EntryParseError::MissingKey)?;
    let key = ssh_key::PublicKey::from_openssh(&format!("{algorithm} {data}"))?;
    Ok(Entry {
        key,
        options: parse_options(options)?,
    })
}

fn looks_like_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-") || token.starts_with("sk-")
}

/// Splits a line into its options prefix and the key columns. The boundary is
/// the first whitespace outside double quotes.
fn split_off_options(line: &str) -> Result<(&str, &str), EntryParseError> {
    if looks_like_key_type(line.split_whitespace().next().unwrap_or("")) {
        return Ok(("", line));
    }
    let mut quoted = false;
    let mut escaped = false;
    for (idx, ch) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => return Ok((&line[..idx], &line[idx..])),
            _ => {}
        }
    }
    // Options with nothing after them, or a quote that never closes.
    Err(if quoted { EntryParseError::UnbalancedQuotes } else { EntryParseError::MissingKey })
}

fn parse_options(options: &str) -> Result<KeyOptions, EntryParseError> {
    let mut parsed = KeyOptions::default();
    if options.is_empty() {
        return Ok(parsed);
    }
    for option in split_on_commas(options)? {
        let (key, value) = match option.split_once('=') {
            Some((key, value)) => (key, Some(unquote(value))),
            None => (option, None),
        };
        match (key.to_ascii_lowercase().as_str(), value) {
            ("from", Some(value)) => parsed.from.extend(split_list(&value)),
            ("access", Some(value)) => parsed.access.extend(split_list(&value)),
            ("hostname", Some(value)) => parsed.hostname.push(value),
            ("alias", Some(value)) => parsed.alias.push(value),
            // Flag options and anything unrecognized are not ours to enforce.
            _ => {}
        }
    }
    Ok(parsed)
}

/// Splits on commas outside double quotes.
fn split_on_commas(s: &str) -> Result<Vec<&str>, EntryParseError> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&s[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if quoted {
        return Err(EntryParseError::UnbalancedQuotes);
    }
    parts.push(&s[start..]);
    Ok(parts)
}

/// Strips surrounding double quotes and resolves `\"` and `\\` escapes.
fn unquote(value: &str) -> String {
    let value = value.trim();
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut escaped = false;
    for ch in inner.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Splits an (already unquoted) comma separated value into its elements.
fn split_list(value: &str) -> Vec<String> {
    value.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect()
}

/// Evaluates a `from` pattern list against the peer address. Negated
/// (`!`-prefixed) patterns veto; otherwise at least one pattern must match.
fn from_allows(patterns: &[String], peer: Option<IpAddr>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let Some(peer) = peer else {
        return false;
    };
    let addr = peer.to_string();
    let mut allowed = false;
    for pattern in patterns {
        if let Some(negated) = pattern.strip_prefix('!') {
            if wildcard_match(negated, &addr) {
                return false;
            }
        } else if wildcard_match(pattern, &addr) {
            allowed = true;
        }
    }
    allowed
}

/// OpenSSH-style pattern match: `*` matches any run of characters, `?`
/// exactly one.
fn wildcard_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();
    let (mut p, mut i) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, i));
            p += 1;
        } else if let Some((star, mark)) = backtrack {
            p = star + 1;
            i = mark + 1;
            backtrack = Some((star, mark + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use slog::o;

    use super::*;

    const KEY_A: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";
    const KEY_B: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0TdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn key(openssh: &str) -> ssh_key::PublicKey {
        ssh_key::PublicKey::from_openssh(openssh).unwrap()
    }

    #[test]
    fn parses_bare_entries() {
        let keys = AuthorizedKeys::parse(KEY_A, &discard());
        assert_eq!(keys.len(), 1);
        let entry = keys.find(&key(KEY_A), None).unwrap();
        assert_eq!(entry.options, KeyOptions::default());
    }

    #[test]
    fn parses_options_and_comment() {
        let contents = format!("access=listen,hostname=alice,alias=web,alias=backup {KEY_A} alice@example\n");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        let entry = keys.find(&key(KEY_A), None).unwrap();
        assert_eq!(entry.options.access, vec!["listen"]);
        assert_eq!(entry.options.hostname, vec!["alice"]);
        assert_eq!(entry.options.alias, vec!["web", "backup"]);
    }

    #[test]
    fn quoted_values_may_contain_commas() {
        let contents = format!("from=\"10.0.0.*,192.168.1.1\",access=\"listen,initiate\" {KEY_A}");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        let entry = keys.find(&key(KEY_A), Some("192.168.1.1".parse().unwrap())).unwrap();
        assert_eq!(entry.options.from, vec!["10.0.0.*", "192.168.1.1"]);
        assert_eq!(entry.options.access, vec!["listen", "initiate"]);
    }

    #[test]
    fn skips_comments_blanks_and_garbage() {
        let contents = format!("# comment\n\nnot-a-key at all\n{KEY_A}\n");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn unbalanced_quotes_reject_the_line() {
        let contents = format!("hostname=\"alice {KEY_A}");
        assert!(AuthorizedKeys::parse(&contents, &discard()).is_empty());
    }

    #[test]
    fn find_distinguishes_keys() {
        let contents = format!("hostname=a {KEY_A}\nhostname=b {KEY_B}\n");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        assert_eq!(keys.find(&key(KEY_A), None).unwrap().options.hostname, vec!["a"]);
        assert_eq!(keys.find(&key(KEY_B), None).unwrap().options.hostname, vec!["b"]);
    }

    #[test]
    fn from_restricts_source_addresses() {
        let contents = format!("from=\"10.0.0.*\" {KEY_A}");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        assert!(keys.find(&key(KEY_A), Some("10.0.0.7".parse().unwrap())).is_some());
        assert!(keys.find(&key(KEY_A), Some("10.0.1.7".parse().unwrap())).is_none());
        assert!(keys.find(&key(KEY_A), None).is_none());
    }

    #[test]
    fn negated_from_patterns_veto() {
        let contents = format!("from=\"10.0.0.*,!10.0.0.13\" {KEY_A}");
        let keys = AuthorizedKeys::parse(&contents, &discard());
        assert!(keys.find(&key(KEY_A), Some("10.0.0.7".parse().unwrap())).is_some());
        assert!(keys.find(&key(KEY_A), Some("10.0.0.13".parse().unwrap())).is_none());
    }

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("10.0.0.*", "10.0.0.255"));
        assert!(wildcard_match("*", "anything"));
        assert!(wildcard_match("10.0.?.1", "10.0.3.1"));
        assert!(!wildcard_match("10.0.?.1", "10.0.30.1"));
        assert!(!wildcard_match("10.0.0.*", "10.0.1.1"));
        assert!(wildcard_match("*.*.*.*", "1.2.3.4"));
        assert!(!wildcard_match("", "x"));
        assert!(wildcard_match("", ""));
    }

    #[tokio::test]
    async fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        tokio::fs::write(&path, format!("hostname=alice {KEY_A}\n")).await.unwrap();
        let keys = AuthorizedKeys::load(&path, &discard()).await.unwrap();
        assert_eq!(keys.len(), 1);

        let missing = AuthorizedKeys::load(&dir.path().join("nope"), &discard()).await;
        assert!(missing.is_err());
    }
}
