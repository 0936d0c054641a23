//! Real-tool discovery.
//!
//! The shim sits on PATH under the real tool's name, so a naive PATH
//! lookup would find the shim itself and recurse. Discovery therefore
//! prefers the explicit env override, then scans PATH while excluding the
//! shim's own directory, compared canonically.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::profile::ToolProfile;

/// Discovery failures. Fatal to the invocation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LocateError {
    /// The env override is set but points at nothing usable.
    #[error("{var} is set to {path:?} but no such file exists")]
    OverrideMissing {
        /// The override variable.
        var: &'static str,
        /// Its value.
        path: PathBuf,
    },

    /// No candidate on PATH outside the shim's own directory.
    #[error(
        "real '{tool}' not found on PATH (excluding the shim's directory); \
         set {var} to the real tool"
    )]
    NotFound {
        /// The tool searched for.
        tool: &'static str,
        /// The override variable to suggest.
        var: &'static str,
    },
}

/// Locates the real tool for `profile` using the process environment.
pub fn locate_real_tool(profile: &ToolProfile) -> Result<PathBuf, LocateError> {
    let own_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf));
    locate_with(profile, std::env::var_os("PATH"), own_dir.as_deref())
}

/// Discovery with the search path and excluded directory made explicit.
pub fn locate_with(
    profile: &ToolProfile,
    search_path: Option<std::ffi::OsString>,
    excluded_dir: Option<&Path>,
) -> Result<PathBuf, LocateError> {
    if let Some(explicit) = std::env::var_os(profile.env_override) {
        let path = PathBuf::from(explicit);
        if path.is_file() {
            return Ok(path);
        }
        return Err(LocateError::OverrideMissing {
            var: profile.env_override,
            path,
        });
    }

    let excluded = excluded_dir.and_then(|dir| dir.canonicalize().ok());
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let not_found = LocateError::NotFound {
        tool: profile.real_name,
        var: profile.env_override,
    };

    let candidates =
        which::which_in_all(profile.real_name, search_path, cwd).map_err(|_| not_found)?;
    for candidate in candidates {
        let candidate_dir = candidate
            .parent()
            .and_then(|dir| dir.canonicalize().ok());
        if excluded.is_some() && candidate_dir == excluded {
            continue;
        }
        return Ok(candidate);
    }

    Err(LocateError::NotFound {
        tool: profile.real_name,
        var: profile.env_override,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn path_scan_skips_the_shim_directory() {
        let shim_dir = tempfile::tempdir().unwrap();
        let real_dir = tempfile::tempdir().unwrap();
        let _decoy = make_executable(shim_dir.path(), "cl");
        let real = make_executable(real_dir.path(), "cl");

        let search = std::env::join_paths([shim_dir.path(), real_dir.path()]).unwrap();
        let found = locate_with(&ToolProfile::cl(), Some(search), Some(shim_dir.path())).unwrap();
        assert_eq!(found.canonicalize().unwrap(), real.canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn first_candidate_wins_when_nothing_is_excluded() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let first = make_executable(dir_a.path(), "link");
        let _second = make_executable(dir_b.path(), "link");

        let search = std::env::join_paths([dir_a.path(), dir_b.path()]).unwrap();
        let found = locate_with(&ToolProfile::link(), Some(search), None).unwrap();
        assert_eq!(found.canonicalize().unwrap(), first.canonicalize().unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn only_the_shim_on_path_means_not_found() {
        let shim_dir = tempfile::tempdir().unwrap();
        let _decoy = make_executable(shim_dir.path(), "cl");

        let search = std::env::join_paths([shim_dir.path()]).unwrap();
        let err =
            locate_with(&ToolProfile::cl(), Some(search), Some(shim_dir.path())).unwrap_err();
        assert!(matches!(err, LocateError::NotFound { .. }));
        assert!(err.to_string().contains("CL_REAL_PATH"));
    }

    #[test]
    fn empty_path_means_not_found() {
        let err = locate_with(
            &ToolProfile::cl(),
            Some(std::ffi::OsString::new()),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, LocateError::NotFound { .. }));
    }
}
