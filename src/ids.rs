use uuid::Uuid;

/// Reserved routing targets the kernel understands without any subscription behind them.
pub const BUILT_IN_OUTBOUNDS: [&str; 5] = ["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"];

/// Member `type` marker for entries that are not backed by a subscription
/// (built-in outbounds and references to other proxy groups).
pub const BUILT_IN_SOURCE: &str = "Built-In";

/// Mints a fresh synthetic identifier. IDs are never recycled.
pub fn new_id() -> String {
    format!("ID_{}", Uuid::new_v4().simple())
}

pub fn is_built_in(name: &str) -> bool {
    BUILT_IN_OUTBOUNDS.contains(&name)
}

/// Resolves a stored reference to the name the kernel expects.
///
/// Order matters: built-in outbounds first, then the synthetic ID lookup, and
/// finally the stored fallback so that dangling IDs degrade to a literal name.
pub fn resolve_name<'g, F>(id: &str, fallback: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<&'g str>,
{
    if is_built_in(id) {
        return fallback_or(id, fallback).to_string();
    }
    match lookup(id) {
        Some(name) => name.to_string(),
        None => fallback_or(id, fallback).to_string(),
    }
}

fn fallback_or<'a>(id: &'a str, fallback: &'a str) -> &'a str {
    if fallback.is_empty() {
        id
    } else {
        fallback
    }
}
