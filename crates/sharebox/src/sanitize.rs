//! Helpers for sanitizing data before it enters log lines and span attributes.
//!
//! Submitter identities are e-mail addresses and staging paths reveal the
//! server layout, so spans only ever carry the reduced forms produced here.

use std::path::Path;

/// Returns only the filename component of a path (no directory).
pub fn redact_path(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("<unknown>")
        .to_string()
}

/// Masks the local part of an e-mail style identity.
///
/// - `alice@example.com` → `a***@example.com`
/// - `bob` → `b***`
/// - `` → `<anonymous>`
pub fn mask_identity(identity: &str) -> String {
    let mut chars = identity.chars();
    let Some(first) = chars.next() else {
        return "<anonymous>".to_string();
    };

    match identity.find('@') {
        Some(at_pos) => format!("{}***{}", first, &identity[at_pos..]),
        None => format!("{}***", first),
    }
}
