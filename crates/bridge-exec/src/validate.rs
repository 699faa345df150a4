//! Pre-spawn security validation.
//!
//! All checks run before any process is created. The same argument and
//! environment rules guard plugin executables.

use std::collections::HashSet;

use crate::error::{ExecError, ExecResult};

/// Characters that terminate, chain, or redirect shell commands.
const DANGEROUS_CHARS: [char; 7] = [';', '&', '|', '$', '`', '>', '<'];

/// Shell interpreters recognized by name.
const SHELL_NAMES: [&str; 3] = ["sh", "bash", "zsh"];

/// Validate the command string.
///
/// # Errors
///
/// Returns [`ExecError::Validation`] when the command is empty, contains
/// shell control characters, misses a non-empty allow-list, or names a
/// shell interpreter without `use_shell`.
pub fn validate_command(command: &str, allowed: &[String], use_shell: bool) -> ExecResult<()> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(ExecError::Validation("command is empty".to_string()));
    }
    if let Some(c) = trimmed.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(ExecError::Validation(format!(
            "command contains forbidden character {c:?}"
        )));
    }
    if !allowed.is_empty() && !allowed.iter().any(|a| a == trimmed) {
        return Err(ExecError::Validation(format!(
            "command {trimmed:?} is not in the allowed list"
        )));
    }
    if is_shell_command(trimmed) && !use_shell {
        return Err(ExecError::Validation(format!(
            "shell command {trimmed:?} requires useShell"
        )));
    }
    Ok(())
}

/// Whether the command names a shell interpreter, either literally or by
/// path suffix.
#[must_use]
pub fn is_shell_command(command: &str) -> bool {
    SHELL_NAMES.iter().any(|shell| {
        command == *shell || command.ends_with(&format!("/{shell}"))
    })
}

/// Validate a single argument for non-shell invocations.
///
/// # Errors
///
/// Returns [`ExecError::Validation`] on shell control characters, command
/// substitution patterns, or null bytes.
pub fn validate_arg(arg: &str) -> ExecResult<()> {
    if arg.contains('\0') {
        return Err(ExecError::Validation("argument contains null byte".to_string()));
    }
    if let Some(c) = arg.chars().find(|c| DANGEROUS_CHARS.contains(c)) {
        return Err(ExecError::Validation(format!(
            "argument {arg:?} contains forbidden character {c:?}"
        )));
    }
    // Substitution patterns are rejected independently of the plain `$` rule.
    if arg.contains("$(") {
        return Err(ExecError::Validation(format!(
            "argument {arg:?} contains command substitution"
        )));
    }
    Ok(())
}

/// Validate one environment pair.
///
/// # Errors
///
/// Returns [`ExecError::Validation`] when the key is not a valid
/// identifier, is deny-listed, or the value carries substitution
/// characters or null bytes.
pub fn validate_env_pair(key: &str, value: &str, deny: &HashSet<&str>) -> ExecResult<()> {
    if !is_valid_env_key(key) {
        return Err(ExecError::Validation(format!(
            "invalid environment key {key:?}"
        )));
    }
    if deny.contains(key) {
        return Err(ExecError::Validation(format!(
            "environment key {key:?} is denied"
        )));
    }
    if value.contains('\0') {
        return Err(ExecError::Validation(format!(
            "environment value for {key:?} contains null byte"
        )));
    }
    if value.contains('$') && value.contains('(') {
        return Err(ExecError::Validation(format!(
            "environment value for {key:?} contains substitution characters"
        )));
    }
    Ok(())
}

/// Split a `KEY=VALUE` entry.
///
/// # Errors
///
/// Returns [`ExecError::Validation`] when the entry has no `=` or an
/// empty key.
pub fn parse_env_entry(entry: &str) -> ExecResult<(String, String)> {
    match entry.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(ExecError::Validation(format!(
            "environment entry {entry:?} is not KEY=VALUE"
        ))),
    }
}

/// Validate the working directory.
///
/// # Errors
///
/// Returns [`ExecError::Validation`] when the directory contains `..`.
pub fn validate_work_dir(dir: &str) -> ExecResult<()> {
    if dir.contains("..") {
        return Err(ExecError::Validation(format!(
            "workDir {dir:?} contains parent traversal"
        )));
    }
    Ok(())
}

fn is_valid_env_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {},
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_dangerous_chars() {
        for cmd in [
            "/usr/bin/cat;/bin/rm",
            "cat|grep",
            "cat&",
            "cat>out",
            "cat<in",
            "echo $HOME",
            "echo `id`",
        ] {
            assert!(
                matches!(validate_command(cmd, &[], false), Err(ExecError::Validation(_))),
                "{cmd}"
            );
        }
    }

    #[test]
    fn test_command_empty() {
        assert!(validate_command("  ", &[], false).is_err());
    }

    #[test]
    fn test_allow_list_exact_match() {
        let allowed = vec!["cat".to_string()];
        assert!(validate_command("cat", &allowed, false).is_ok());
        assert!(matches!(
            validate_command("rm", &allowed, false),
            Err(ExecError::Validation(_))
        ));
        assert!(validate_command("catalog", &allowed, false).is_err());
    }

    #[test]
    fn test_shell_classification() {
        for cmd in ["sh", "bash", "zsh", "/bin/sh", "/usr/bin/bash", "/opt/zsh"] {
            assert!(is_shell_command(cmd), "{cmd}");
            assert!(validate_command(cmd, &[], false).is_err());
            assert!(validate_command(cmd, &[], true).is_ok());
        }
        assert!(!is_shell_command("shred"));
        assert!(!is_shell_command("cat"));
    }

    #[test]
    fn test_arg_validation() {
        assert!(validate_arg("--flag=value").is_ok());
        assert!(validate_arg("plain").is_ok());
        for arg in ["a;b", "a|b", "$(id)", "`id`", "a>b", "a\0b"] {
            assert!(validate_arg(arg).is_err(), "{arg}");
        }
    }

    #[test]
    fn test_env_key_shape() {
        let deny = HashSet::new();
        assert!(validate_env_pair("GOOD_KEY", "v", &deny).is_ok());
        assert!(validate_env_pair("_underscore", "v", &deny).is_ok());
        for key in ["1BAD", "BAD-KEY", "BAD KEY", ""] {
            assert!(validate_env_pair(key, "v", &deny).is_err(), "{key}");
        }
    }

    #[test]
    fn test_env_value_substitution() {
        let deny = HashSet::new();
        assert!(validate_env_pair("K", "$HOME", &deny).is_ok());
        assert!(validate_env_pair("K", "(paren)", &deny).is_ok());
        assert!(validate_env_pair("K", "$(id)", &deny).is_err());
        assert!(validate_env_pair("K", "($X)", &deny).is_err());
    }

    #[test]
    fn test_env_deny_list() {
        let deny: HashSet<&str> = ["SECRET"].into();
        assert!(validate_env_pair("SECRET", "v", &deny).is_err());
        assert!(validate_env_pair("PUBLIC", "v", &deny).is_ok());
    }

    #[test]
    fn test_work_dir() {
        assert!(validate_work_dir("/tmp/work").is_ok());
        assert!(validate_work_dir("/tmp/../etc").is_err());
    }

    #[test]
    fn test_parse_env_entry() {
        assert_eq!(
            parse_env_entry("K=a=b").unwrap(),
            ("K".to_string(), "a=b".to_string())
        );
        assert!(parse_env_entry("NOEQUALS").is_err());
        assert!(parse_env_entry("=value").is_err());
    }
}
