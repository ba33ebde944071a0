//! Concrete build drivers and the input checks they share.
//!
//! - [`arch`] - Arch Linux images via `mkarchiso`

pub mod arch;

use crate::plugin::{PluginError, PluginResult};

/// Package names are written one per line, so they may not be empty,
/// contain whitespace or look like a comment.
pub fn validate_packages(packages: &[String]) -> PluginResult<()> {
    for (index, package) in packages.iter().enumerate() {
        if package.is_empty() {
            return Err(PluginError::InvalidInput(format!(
                "package at index {index} is empty"
            )));
        }
        if package.starts_with('#') {
            return Err(PluginError::InvalidInput(format!(
                "package '{}' may not start with '#'",
                package.escape_debug()
            )));
        }
        if package.chars().any(char::is_whitespace) {
            return Err(PluginError::InvalidInput(format!(
                "package '{}' contains whitespace",
                package.escape_debug()
            )));
        }
    }
    Ok(())
}

/// RFC 1123 host name: dot-separated labels of 1-63 ASCII alphanumerics or
/// `-`, no label starting or ending with `-`, at most 253 characters.
pub fn validate_hostname(hostname: &str) -> PluginResult<()> {
    let invalid = |why: &str| {
        Err(PluginError::InvalidInput(format!(
            "invalid hostname '{}': {why}",
            hostname.escape_debug()
        )))
    };

    if hostname.is_empty() {
        return invalid("must not be empty");
    }
    if hostname.len() > 253 {
        return invalid("longer than 253 characters");
    }
    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return invalid("each label must be 1-63 characters");
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return invalid("only letters, digits and '-' are allowed");
        }
        if label.starts_with('-') || label.ends_with('-') {
            return invalid("labels may not start or end with '-'");
        }
    }
    Ok(())
}
