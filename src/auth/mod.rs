//! Defines how an authenticated client's key options translate into the
//! permissions it holds and the names it is known by.

pub mod authorized_keys;

use bitflags::bitflags;
use slog::Logger;

bitflags! {
    /// Actions a connected client is allowed to perform.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Permissions: u8 {
        /// Open (virtual) ports for listening.
        const LISTEN = 0b001;
        /// Connect to (virtual) ports.
        const INITIATE = 0b010;
        /// Enumerate the clients currently listening.
        const LIST_LISTENERS = 0b100;
    }
}

/// Expands a predefined access level into its permission bundle.
fn access_level(name: &str) -> Option<Permissions> {
    match name {
        "listen" => Some(Permissions::LISTEN),
        "initiate" => Some(Permissions::INITIATE | Permissions::LIST_LISTENERS),
        _ => None,
    }
}

/// Who an authenticated client is and what it may do, derived from the
/// options of the authorized keys entry that matched its key.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Primary name.
    pub hostname: String,
    /// Additional names, in authorized keys order.
    pub aliases: Vec<String>,
    /// All names: the hostname followed by the aliases.
    pub names: Vec<String>,
    /// The permission set granted by the key's access levels.
    pub permissions: Permissions,
}

impl ClientIdentity {
    /// Applies the options of an accepted key.
    ///
    /// Each `access` level unions its bundle into the permission set; unknown
    /// levels are logged and skipped, and a key without any is allowed but
    /// leaves the client unable to do anything. The primary name comes from
    /// the `hostname` option, falling back to the SSH username.
    pub fn from_key_options(username: &str, options: &authorized_keys::KeyOptions, logger: &Logger) -> ClientIdentity {
        if options.access.is_empty() {
            slog::warn!(logger, "Used key has no access level");
        }
        let mut permissions = Permissions::empty();
        for level in &options.access {
            match access_level(level) {
                Some(bundle) => permissions |= bundle,
                None => slog::error!(logger, "Key has unknown access level: \"{}\"", level),
            }
        }

        if options.hostname.len() > 1 {
            slog::warn!(logger, "Multiple hostnames specified, using the first");
        }
        let hostname = options.hostname.first().cloned().unwrap_or_else(|| username.to_string());
        let aliases = options.alias.clone();
        let mut names = Vec::with_capacity(1 + aliases.len());
        names.push(hostname.clone());
        names.extend(aliases.iter().cloned());

        ClientIdentity {
            hostname,
            aliases,
            names,
            permissions,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use slog::o;

    use super::authorized_keys::KeyOptions;
    use super::*;

    fn discard() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn options(access: &[&str], hostname: &[&str], alias: &[&str]) -> KeyOptions {
        KeyOptions {
            access: access.iter().map(|s| s.to_string()).collect(),
            hostname: hostname.iter().map(|s| s.to_string()).collect(),
            alias: alias.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn listen_level_grants_listen_only() {
        let identity = ClientIdentity::from_key_options("u", &options(&["listen"], &[], &[]), &discard());
        assert_eq!(identity.permissions, Permissions::LISTEN);
    }

    #[test]
    fn initiate_level_grants_initiate_and_list() {
        let identity = ClientIdentity::from_key_options("u", &options(&["initiate"], &[], &[]), &discard());
        assert_eq!(identity.permissions, Permissions::INITIATE | Permissions::LIST_LISTENERS);
    }

    #[test]
    fn unknown_levels_are_skipped() {
        let identity = ClientIdentity::from_key_options("u", &options(&["listen", "root"], &[], &[]), &discard());
        assert_eq!(identity.permissions, Permissions::LISTEN);
    }

    #[test]
    fn empty_access_leaves_no_permissions() {
        let identity = ClientIdentity::from_key_options("u", &options(&[], &[], &[]), &discard());
        assert_eq!(identity.permissions, Permissions::empty());
    }

    #[test]
    fn hostname_defaults_to_username() {
        let identity = ClientIdentity::from_key_options("carol", &options(&[], &[], &[]), &discard());
        assert_eq!(identity.hostname, "carol");
        assert_eq!(identity.names, vec!["carol"]);
    }

    #[test]
    fn first_hostname_wins() {
        let identity = ClientIdentity::from_key_options("u", &options(&[], &["web", "db"], &[]), &discard());
        assert_eq!(identity.hostname, "web");
    }

    #[test]
    fn names_list_the_hostname_then_aliases_in_order() {
        let identity = ClientIdentity::from_key_options("u", &options(&[], &["alice"], &["web", "backup"]), &discard());
        assert_eq!(identity.names, vec!["alice", "web", "backup"]);
        assert_eq!(identity.aliases, vec!["web", "backup"]);
    }
}
