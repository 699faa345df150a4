//! Pre-spawn plugin security validation.
//!
//! Every check here runs before the child process is created or any gRPC
//! dial is attempted. Argument and environment sanitization reuses the
//! subprocess executor's rules.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::PluginConfig;
use crate::error::{PluginError, PluginResult};

/// Validate a plugin configuration end to end.
///
/// # Errors
///
/// Returns [`PluginError::SecurityValidation`] on the first failing
/// check.
pub(crate) fn validate(config: &PluginConfig) -> PluginResult<()> {
    validate_name(&config.name)?;

    if config.strict_validation {
        validate_exec_path(&config.exec, config.allowed_plugins_dir.as_deref())?;
    }
    if config.verify_hash {
        verify_sha256(&config.exec, config.expected_sha256.as_deref())?;
    }

    for arg in &config.args {
        bridge_exec::validate_arg(arg).map_err(to_security_error)?;
    }

    let deny: HashSet<&str> = HashSet::new();
    for entry in &config.env {
        let (key, value) = bridge_exec::parse_env_entry(entry).map_err(to_security_error)?;
        bridge_exec::validate_env_pair(&key, &value, &deny).map_err(to_security_error)?;
    }

    Ok(())
}

fn to_security_error(e: bridge_exec::ExecError) -> PluginError {
    PluginError::SecurityValidation(e.to_string())
}

fn validate_name(name: &str) -> PluginResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PluginError::SecurityValidation(format!(
            "plugin name {name:?} must match [A-Za-z0-9_-]{{1,128}}"
        )))
    }
}

fn validate_exec_path(exec: &str, allowed_dir: Option<&str>) -> PluginResult<()> {
    let path = absolute_clean(exec)?;

    let meta = std::fs::metadata(&path).map_err(|e| {
        PluginError::SecurityValidation(format!("executable {exec:?}: {e}"))
    })?;
    if !meta.is_file() {
        return Err(PluginError::SecurityValidation(format!(
            "executable {exec:?} is not a regular file"
        )));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(PluginError::SecurityValidation(format!(
                "executable {exec:?} lacks execute permission"
            )));
        }
    }

    if let Some(allowed) = allowed_dir {
        let allowed = absolute_clean(allowed)?;
        if !path.starts_with(&allowed) {
            return Err(PluginError::SecurityValidation(format!(
                "executable {exec:?} is outside the allowed plugins directory"
            )));
        }
    }

    Ok(())
}

/// Resolve to an absolute path and reject parent traversal outright.
fn absolute_clean(raw: &str) -> PluginResult<PathBuf> {
    let path = Path::new(raw);
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PluginError::SecurityValidation(format!(
            "path {raw:?} contains parent traversal"
        )));
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        let cwd = std::env::current_dir().map_err(|e| {
            PluginError::SecurityValidation(format!("cannot resolve {raw:?}: {e}"))
        })?;
        Ok(cwd.join(path))
    }
}

fn verify_sha256(exec: &str, expected: Option<&str>) -> PluginResult<()> {
    let expected = expected.ok_or_else(|| {
        PluginError::SecurityValidation(
            "verifyHash requires expectedSHA256".to_string(),
        )
    })?;
    if expected.len() != 64 || !expected.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PluginError::SecurityValidation(format!(
            "expectedSHA256 must be 64 hex characters, got {} characters",
            expected.len()
        )));
    }

    let bytes = std::fs::read(exec).map_err(|e| {
        PluginError::SecurityValidation(format!("cannot hash {exec:?}: {e}"))
    })?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(PluginError::SecurityValidation(format!(
            "executable hash mismatch: expected {expected}, got {actual}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginConfig;

    fn base_config(exec: &str) -> PluginConfig {
        serde_json::from_str(&format!(r#"{{"name":"test-plugin","exec":"{exec}"}}"#)).unwrap()
    }

    fn executable_fixture(dir: &tempfile::TempDir) -> String {
        let path = dir.path().join("plugin-bin");
        std::fs::write(&path, b"#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_name_shape() {
        assert!(validate_name("good_name-123").is_ok());
        for name in ["", "bad name", "bad/name", "bad$name"] {
            assert!(validate_name(name).is_err(), "{name}");
        }
        assert!(validate_name(&"x".repeat(128)).is_ok());
        assert!(validate_name(&"x".repeat(129)).is_err());
    }

    #[test]
    fn test_strict_path_checks() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executable_fixture(&dir);
        assert!(validate(&base_config(&exec)).is_ok());

        // Missing file.
        let missing = dir.path().join("missing").to_string_lossy().into_owned();
        assert!(matches!(
            validate(&base_config(&missing)),
            Err(PluginError::SecurityValidation(_))
        ));

        // Traversal.
        let traversal = format!("{}/../plugin-bin", dir.path().join("sub").display());
        assert!(matches!(
            validate(&base_config(&traversal)),
            Err(PluginError::SecurityValidation(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-exec");
        std::fs::write(&path, b"data").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let config = base_config(&path.to_string_lossy());
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));
    }

    #[test]
    fn test_allowed_dir_containment() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executable_fixture(&dir);

        let mut config = base_config(&exec);
        config.allowed_plugins_dir = Some(dir.path().to_string_lossy().into_owned());
        assert!(validate(&config).is_ok());

        let other = tempfile::tempdir().unwrap();
        config.allowed_plugins_dir = Some(other.path().to_string_lossy().into_owned());
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));
    }

    #[test]
    fn test_hash_pinning() {
        use sha2::{Digest, Sha256};
        let dir = tempfile::tempdir().unwrap();
        let exec = executable_fixture(&dir);
        let digest = hex::encode(Sha256::digest(std::fs::read(&exec).unwrap()));

        let mut config = base_config(&exec);
        config.verify_hash = true;
        config.expected_sha256 = Some(digest.to_uppercase());
        // Case-insensitive comparison.
        assert!(validate(&config).is_ok());

        config.expected_sha256 = Some("0".repeat(64));
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));

        config.expected_sha256 = Some("abc".to_string());
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));
    }

    #[test]
    fn test_env_and_arg_sanitization() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executable_fixture(&dir);

        let mut config = base_config(&exec);
        config.args = vec!["$(evil)".to_string()];
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));

        let mut config = base_config(&exec);
        config.env = vec!["1BAD=x".to_string()];
        assert!(matches!(
            validate(&config),
            Err(PluginError::SecurityValidation(_))
        ));
    }
}
