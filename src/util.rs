//! Small helpers shared across modules.

use std::borrow::Cow;

/// Expand a leading `~` to `$HOME`.
///
/// The local-proxy path is commonly configured as `~/localproxy` on devices.
///
/// - `"~"` → `"/home/user"`
/// - `"~/localproxy"` → `"/home/user/localproxy"`
/// - Anything else passes through unchanged.
pub fn expand_tilde(path: &str) -> Cow<'_, str> {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            if path == "~" {
                return Cow::Owned(home);
            }
            return Cow::Owned(format!("{}{}", home, &path[1..]));
        }
    }
    Cow::Borrowed(path)
}

/// True when `path` names an existing file with any execute bit set.
pub fn is_executable(path: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/usr/bin/localproxy"), "/usr/bin/localproxy");
        assert_eq!(expand_tilde("localproxy"), "localproxy");
    }

    #[test]
    fn test_expand_tilde_home() {
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(expand_tilde("~/localproxy"), format!("{home}/localproxy"));
            assert_eq!(expand_tilde("~"), home);
        }
    }

    #[test]
    fn test_is_executable() {
        assert!(is_executable("/bin/sh"));
        assert!(!is_executable("/nonexistent/binary"));
    }
}
