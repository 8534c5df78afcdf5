use std::sync::LazyLock;

use regex::Regex;

use crate::{utils::BACKUP_EXTENSION, LxcoreError, LxcoreResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The longest container name accepted.
pub const MAX_CONTAINER_NAME_LEN: usize = 64;

/// The longest description accepted.
pub const MAX_DESCRIPTION_LEN: usize = 65;

/// The longest web UI hint accepted.
pub const MAX_WEBUI_LEN: usize = 255;

static CONTAINER_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9_-]*[A-Za-z0-9])?$").unwrap());

static DESCRIPTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9 .\-_,]*$").unwrap());

static SNAPSHOT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").unwrap());

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Checks a container name: 1-64 characters of `[A-Za-z0-9_-]`, not starting or ending with
/// `-` or `_`.
pub fn validate_container_name(name: &str) -> LxcoreResult<()> {
    if name.is_empty() || name.len() > MAX_CONTAINER_NAME_LEN {
        return Err(LxcoreError::InvalidContainerName(format!(
            "{:?} must be 1-{} characters long",
            name, MAX_CONTAINER_NAME_LEN
        )));
    }

    if !CONTAINER_NAME_RE.is_match(name) {
        return Err(LxcoreError::InvalidContainerName(format!(
            "{:?} may only contain letters, digits, '-' and '_', and must start and end with a letter or digit",
            name
        )));
    }

    Ok(())
}

/// Checks a description: at most 65 characters of `[A-Za-z0-9 .-_,]`.
pub fn validate_description(description: &str) -> LxcoreResult<()> {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(LxcoreError::InvalidDescription(format!(
            "must be at most {} characters long",
            MAX_DESCRIPTION_LEN
        )));
    }

    if !DESCRIPTION_RE.is_match(description) {
        return Err(LxcoreError::InvalidDescription(
            "may only contain letters, digits, spaces and . - _ ,".to_string(),
        ));
    }

    Ok(())
}

/// Checks that an order index is a positive integer.
pub fn validate_index(index: u32) -> LxcoreResult<()> {
    if index < 1 {
        return Err(LxcoreError::InvalidIndex(format!(
            "{} is not a positive integer",
            index
        )));
    }

    Ok(())
}

/// Checks a snapshot name against `[A-Za-z0-9_-]+`.
pub fn validate_snapshot_name(snapshot: &str) -> LxcoreResult<()> {
    if !SNAPSHOT_NAME_RE.is_match(snapshot) {
        return Err(LxcoreError::InvalidSnapshotName(snapshot.to_string()));
    }

    Ok(())
}

/// Checks a web UI hint: single line, printable, bounded length.
pub fn validate_webui(webui: &str) -> LxcoreResult<()> {
    if webui.len() > MAX_WEBUI_LEN || webui.chars().any(|c| c.is_control()) {
        return Err(LxcoreError::InvalidArgument(format!(
            "web ui hint must be a single line of at most {} characters",
            MAX_WEBUI_LEN
        )));
    }

    Ok(())
}

/// Checks that a backup filename belongs to `container` and cannot escape its directory.
pub fn validate_backup_filename(container: &str, filename: &str) -> LxcoreResult<()> {
    let valid = filename.starts_with(&format!("{}_", container))
        && filename.ends_with(BACKUP_EXTENSION)
        && !filename.contains('/')
        && !filename.contains("..");

    if !valid {
        return Err(LxcoreError::InvalidBackupFilename(filename.to_string()));
    }

    Ok(())
}

/// Checks that an xz compression level is within `0..=9`.
pub fn validate_compression_level(level: u32) -> LxcoreResult<()> {
    if level > 9 {
        return Err(LxcoreError::InvalidCompressionLevel(level));
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
