//! Utilities for the `name~index` designators that initiators use to address
//! one specific publisher when several share a name.

/// Splits the index out of a designator.
///
/// `"web~1"` becomes `("web", 1)`; a designator without an index returns
/// `(s, default)`. The index is taken from the last `~` in the string, and
/// only when everything after it is digits. An index too large for `u32`
/// saturates, which lookup then reports as invalid rather than wrapping.
pub(crate) fn split_name_index(s: &str, default: u32) -> (&str, u32) {
    if let Some((name, digits)) = s.rsplit_once('~') {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return (name, digits.parse().unwrap_or(u32::MAX));
        }
    }
    (s, default)
}

/// Joins a name with an index, reversing [`split_name_index`].
pub(crate) fn join_name_index(name: &str, index: u32) -> String {
    format!("{name}~{index}")
}
