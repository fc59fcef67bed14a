//! Resolution of external tool names to runnable paths.

use std::env;
use std::path::{Path, PathBuf};

use super::{ToolError, ToolResult};

/// Searches an ordered list of directories for executables.
#[derive(Debug, Clone)]
pub struct ExecutableLocator {
    dirs: Vec<PathBuf>,
}

impl ExecutableLocator {
    /// Directories from `PATH`, followed by `extra_dirs`.
    pub fn from_env(extra_dirs: &[PathBuf]) -> Self {
        let mut dirs: Vec<PathBuf> = env::var_os("PATH")
            .map(|path| env::split_paths(&path).collect())
            .unwrap_or_default();
        dirs.extend(extra_dirs.iter().cloned());
        Self::with_dirs(dirs)
    }

    /// Search exactly `dirs`, in order.
    pub fn with_dirs(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            dirs: dirs
                .into_iter()
                .filter(|d| !d.as_os_str().is_empty())
                .collect(),
        }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// Return the first executable file called `name`.
    ///
    /// A name containing a path separator is checked as-is instead of searched.
    pub fn locate(&self, name: &str) -> ToolResult<PathBuf> {
        let direct = Path::new(name);
        if direct.components().count() > 1 || direct.is_absolute() {
            return if is_executable(direct) {
                Ok(direct.to_path_buf())
            } else {
                Err(ToolError::ExecutableNotFound {
                    name: name.to_string(),
                    searched: 0,
                })
            };
        }

        self.dirs
            .iter()
            .flat_map(|dir| candidates(dir, name))
            .find(|candidate| is_executable(candidate))
            .ok_or_else(|| ToolError::ExecutableNotFound {
                name: name.to_string(),
                searched: self.dirs.len(),
            })
    }
}

#[cfg(windows)]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name), dir.join(format!("{name}.exe"))]
}

#[cfg(not(windows))]
fn candidates(dir: &Path, name: &str) -> Vec<PathBuf> {
    vec![dir.join(name)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
