//! Group path helpers
//!
//! Group paths are slash-delimited namespaces such as `/yyy/xxx/`. They are
//! usually written as dotted identifiers (`xxx.yyy`) which read in DNS
//! order and are reversed into path order here.

/// Normalize a group identifier into a group path.
///
/// `aaa.bbb` becomes `/bbb/aaa/`, `aaa.bbb*` becomes the relative `bbb/aaa/`.
/// Values that already end with `/` pass through unchanged.
pub fn normalize_group(group: &str) -> String {
    if group.ends_with('/') {
        return group.to_string();
    }
    if group.starts_with('/') {
        return format!("{}/", group);
    }
    let (prefix, body) = match group.strip_suffix('*') {
        Some(body) => ("", body),
        None => ("/", group),
    };
    let segments: Vec<&str> = body.split('.').rev().collect();
    format!("{}{}/", prefix, segments.join("/"))
}

pub fn is_absolute(group: &str) -> bool {
    group.starts_with('/')
}

/// Resolve a level's group against its parent's resolved group.
///
/// Absolute groups win, relative groups are appended to the parent and a
/// missing group inherits the parent. A relative group without a parent
/// cannot be resolved.
pub fn resolve_group(parent: Option<&str>, own: Option<&str>) -> Option<String> {
    match own {
        None => parent.map(str::to_string),
        Some(own) if is_absolute(own) => Some(own.to_string()),
        Some(own) => parent.map(|parent| format!("{}{}", parent, own)),
    }
}

/// Convert a group path into DNS labels: `/yyy/xxx/` becomes `xxx.yyy`
pub fn group_to_labels(group: &str) -> String {
    let segments: Vec<&str> = group.split('/').filter(|s| !s.is_empty()).rev().collect();
    segments.join(".")
}

/// Derive the parent group of an orchestrator application id.
///
/// `/yyy/xxx/zzz` becomes `/yyy/xxx/`.
pub fn group_from_app_id(app_id: &str) -> Option<String> {
    let (parent, _) = app_id.rsplit_once('/')?;
    Some(format!("{}/", parent))
}
