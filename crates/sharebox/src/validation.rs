//! Checks applied to a submission before anything touches the disk.

use std::collections::HashSet;

use crate::error::ValidationError;

/// Number of leading bytes inspected for executable signatures.
pub const SIGNATURE_WINDOW: usize = 2048;

const EXECUTABLE_MAGIC: &[&[u8]] = &[
    b"MZ",                 // Windows PE / DOS
    b"\x7fELF",            // ELF
    b"\xfe\xed\xfa\xce",   // Mach-O 32-bit big endian
    b"\xce\xfa\xed\xfe",   // Mach-O 32-bit little endian
    b"\xfe\xed\xfa\xcf",   // Mach-O 64-bit big endian
    b"\xcf\xfa\xed\xfe",   // Mach-O 64-bit little endian
    b"\xca\xfe\xba\xbe",   // Mach-O universal
    b"#!",                 // interpreter script
];

/// Extension allow-list for submissions.
#[derive(Debug, Clone)]
pub struct UploadPolicy {
    allowed_extensions: HashSet<String>,
}

impl UploadPolicy {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed_extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_allowed(&self, name: &str) -> bool {
        extension_of(name)
            .map(|ext| self.allowed_extensions.contains(&ext.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    pub fn check_extension(&self, name: &str) -> Result<(), ValidationError> {
        if self.is_allowed(name) {
            Ok(())
        } else {
            Err(ValidationError::DisallowedExtension {
                name: name.to_string(),
            })
        }
    }
}

/// Extension of the last path component, without the dot.
pub fn extension_of(name: &str) -> Option<&str> {
    let file_name = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let dot = file_name.rfind('.')?;
    let ext = &file_name[dot + 1..];
    (!ext.is_empty()).then_some(ext)
}

/// True when `head` starts with a known executable or script signature.
pub fn looks_executable(head: &[u8]) -> bool {
    let head = &head[..head.len().min(SIGNATURE_WINDOW)];
    EXECUTABLE_MAGIC.iter().any(|magic| head.starts_with(magic))
}

/// Rejects names that are absolute or climb out of their directory.
pub fn check_traversal(name: &str) -> Result<(), ValidationError> {
    let rejected = || ValidationError::PathTraversal {
        name: name.to_string(),
    };

    if name.starts_with('/') || name.starts_with('\\') || has_drive_prefix(name) {
        return Err(rejected());
    }
    if name.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(rejected());
    }
    Ok(())
}

/// Normalizes a caller-supplied path relative to a storage root.
///
/// A single leading `/` is dropped (callers send "rooted" paths relative to
/// the destination tree); `.` and empty segments collapse. Returns `None`
/// for paths containing `..` or a drive prefix.
pub fn clean_relative_path(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if has_drive_prefix(raw) {
        return None;
    }

    let mut segments = Vec::new();
    for segment in raw.split(['/', '\\']) {
        match segment {
            "" | "." => continue,
            ".." => return None,
            other => segments.push(other),
        }
    }
    Some(segments.join("/"))
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}
