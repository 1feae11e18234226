//! Shell detection and the sentinel wrapper each dialect uses for `run()`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub mod pty;

/// A supported shell dialect. Dispatch on this is a single `match`, not one
/// type per shell — there is nothing here that benefits from a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Bash,
    Zsh,
    Sh,
}

impl ShellKind {
    /// Infer a dialect from a shell binary path, defaulting to POSIX `sh`
    /// semantics for anything unrecognized (dash, ash, etc. all accept the
    /// same sentinel wrapper as `sh`).
    pub fn from_path(path: &str) -> Self {
        match path.rsplit('/').next().unwrap_or(path) {
            "bash" => Self::Bash,
            "zsh" => Self::Zsh,
            _ => Self::Sh,
        }
    }

    /// Build the sentinel-wrapped invocation for `command`, tagged with
    /// `token`. All three dialects here are POSIX-compatible enough to share
    /// one wrapper; the distinction exists for forward compatibility with
    /// non-POSIX dialects a caller might add.
    pub fn wrap_command(self, command: &str, token: &str) -> String {
        match self {
            Self::Bash | Self::Zsh | Self::Sh => format!(
                "printf '__SILC_BEGIN_{token}__\\n'; {{ {command}\n}}; __silc_ec=$?; printf '__SILC_END_{token}__:%d\\n' $__silc_ec\n"
            ),
        }
    }
}

impl std::fmt::Display for ShellKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bash => write!(f, "bash"),
            Self::Zsh => write!(f, "zsh"),
            Self::Sh => write!(f, "sh"),
        }
    }
}

/// Detect available shells on this system.
///
/// Reads `/etc/shells` first (filtering comments and blank lines), then falls
/// back to probing a hardcoded list of common paths. Results are deduplicated
/// by canonical path and sorted by rank: zsh > bash > sh.
pub fn detect_shells() -> Vec<String> {
    let candidates = if let Ok(contents) = std::fs::read_to_string("/etc/shells") {
        let from_file: Vec<String> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .filter(|l| Path::new(l).exists())
            .map(ToString::to_string)
            .collect();
        if from_file.is_empty() {
            fallback_candidates()
        } else {
            from_file
        }
    } else {
        fallback_candidates()
    };

    let mut seen = HashSet::new();
    let mut shells: Vec<String> = candidates
        .into_iter()
        .filter(|p| {
            let canonical = std::fs::canonicalize(p).unwrap_or_else(|_| PathBuf::from(p));
            seen.insert(canonical)
        })
        .collect();

    shells.sort_by_key(|s| shell_rank(s));
    shells
}

fn fallback_candidates() -> Vec<String> {
    ["/bin/sh", "/bin/bash", "/bin/zsh", "/usr/bin/zsh", "/usr/bin/bash"]
        .iter()
        .filter(|p| Path::new(p).exists())
        .map(|p| (*p).to_string())
        .collect()
}

fn shell_rank(path: &str) -> u8 {
    match ShellKind::from_path(path) {
        ShellKind::Zsh => 0,
        ShellKind::Bash => 1,
        ShellKind::Sh => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_command_contains_both_sentinels() {
        let wrapped = ShellKind::Sh.wrap_command("echo hi", "deadbeef");
        assert!(wrapped.contains("__SILC_BEGIN_deadbeef__"));
        assert!(wrapped.contains("__SILC_END_deadbeef__"));
    }

    #[test]
    fn from_path_recognizes_known_dialects() {
        assert_eq!(ShellKind::from_path("/bin/bash"), ShellKind::Bash);
        assert_eq!(ShellKind::from_path("/usr/bin/zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_path("/bin/dash"), ShellKind::Sh);
    }
}
