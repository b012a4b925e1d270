//! Name masks shared by application-id and port-name matching

/// Match `value` against `mask`; a trailing `*` makes the mask a prefix.
pub fn matches(mask: &str, value: &str) -> bool {
    match mask.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => mask == value,
    }
}
