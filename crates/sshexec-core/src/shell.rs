//! Shell executable resolution.
//!
//! The shell is resolved exactly once at startup. Every command is later run
//! as `<shell> -c <raw command>`, so a missing shell makes the daemon useless
//! and startup must fail before the listener is bound.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Executable looked up on `PATH` when no shell is configured.
pub const DEFAULT_SHELL: &str = "sh";

/// Resolve the shell used to interpret commands.
///
/// `requested` may be a bare name (looked up on `PATH`) or a path, which must
/// point at an executable file. `None` resolves [`DEFAULT_SHELL`].
pub fn resolve_shell(requested: Option<&str>) -> Result<PathBuf> {
    let name = requested.unwrap_or(DEFAULT_SHELL);
    which::which(name).map_err(|source| Error::ShellNotFound {
        name: name.to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_shell_is_found() {
        let shell = resolve_shell(None).unwrap();
        assert!(shell.is_absolute());
        assert_eq!(shell.file_name().unwrap(), DEFAULT_SHELL);
    }

    #[test]
    fn absolute_path_resolves_to_itself() {
        let shell = resolve_shell(Some("/bin/sh")).unwrap();
        assert_eq!(shell, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn unknown_name_is_rejected() {
        let Error::ShellNotFound { name, .. } =
            resolve_shell(Some("sshexec-no-such-shell")).unwrap_err();
        assert_eq!(name, "sshexec-no-such-shell");
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("not-a-shell");
        std::fs::write(&path, "#!/bin/sh\n").unwrap();

        let requested = path.to_str().unwrap();
        assert!(resolve_shell(Some(requested)).is_err());
    }
}
