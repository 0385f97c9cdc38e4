use anyhow::{bail, Result};

/// Validate a VM uid for safe use in paths and device-mapper names
///
/// Constraints:
/// - Must be 1-64 characters
/// - Must contain only alphanumeric chars, dashes, or underscores
/// - Must not start with a dash
pub fn validate_uid(uid: &str) -> Result<()> {
    if uid.is_empty() {
        bail!("VM uid cannot be empty");
    }

    if uid.len() > 64 {
        bail!("VM uid must be 64 characters or less, got {}", uid.len());
    }

    if uid.starts_with('-') {
        bail!("VM uid cannot start with a dash");
    }

    if !uid
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!(
            "VM uid must contain only alphanumeric characters, dashes, or underscores: {:?}",
            uid
        );
    }

    Ok(())
}
