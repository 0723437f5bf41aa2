//! Access control for file log locations.
//!
//! A path is resolved before it is matched: links in its directories are
//! resolved to their real location, a link in the last component is
//! followed up to a configured number of hops, and only the final target
//! is compared with the include and exclude globs. A link placed inside an
//! allowed directory therefore cannot expose a file outside of it, whether
//! it points at the file or at a directory above it.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{LogError, Result};
use crate::glob::Glob;

/// Validates log paths against include/exclude globs.
#[derive(Debug, Clone)]
pub struct AccessGuard {
    include: Vec<Glob>,
    exclude: Vec<Glob>,
    symlink_hop_limit: u32,
}

impl AccessGuard {
    /// Compile an access policy.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidGlob`] if any glob fails to compile.
    pub fn new<I, E>(include: I, exclude: E, symlink_hop_limit: u32) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
        E: IntoIterator,
        E::Item: AsRef<str>,
    {
        let include = include
            .into_iter()
            .map(|g| Glob::new(g.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let exclude = exclude
            .into_iter()
            .map(|g| Glob::new(g.as_ref()))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            include,
            exclude,
            symlink_hop_limit,
        })
    }

    /// Maximum number of symbolic links followed for one path.
    #[must_use]
    pub const fn symlink_hop_limit(&self) -> u32 {
        self.symlink_hop_limit
    }

    /// Check whether `path` may be tailed.
    ///
    /// Returns the resolved path on success.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::AccessDenied`] with a human-readable reason when
    /// the policy rejects the path, and [`LogError::Io`] when a link cannot
    /// be read.
    pub fn check_access(&self, path: impl AsRef<Path>) -> Result<PathBuf> {
        if self.include.is_empty() {
            return Err(LogError::AccessDenied(
                "No allowed file log locations specified. Please check the 'access.include' \
                 section of the node configuration."
                    .to_string(),
            ));
        }

        let absolute = absolutize(path.as_ref())?;
        let resolved = self.resolve_links(absolute)?;

        let Some(include) = self.include.iter().find(|g| g.is_match(&resolved)) else {
            return Err(LogError::AccessDenied(format!(
                "Access denied: log path '{}' is not included into allowed locations.",
                resolved.display()
            )));
        };

        if let Some(exclude) = self.exclude.iter().find(|g| g.is_match(&resolved)) {
            debug!(path = %resolved.display(), glob = %exclude, "log path excluded");
            return Err(LogError::AccessDenied(format!(
                "Access denied: log path '{}' is excluded from allowed locations.",
                resolved.display()
            )));
        }

        debug!(path = %resolved.display(), glob = %include, "log path allowed");
        Ok(resolved)
    }

    fn resolve_links(&self, path: PathBuf) -> Result<PathBuf> {
        let mut path = resolve_parents(&path);
        let mut hops = 0;
        while is_symlink(&path) && hops < self.symlink_hop_limit {
            let target = std::fs::read_link(&path)?;
            let next = if target.is_absolute() {
                target
            } else {
                path.parent().unwrap_or_else(|| Path::new("/")).join(target)
            };
            debug!(from = %path.display(), to = %next.display(), hop = hops + 1, "resolved symbolic link");
            path = resolve_parents(&normalize(&next));
            hops += 1;
        }

        if is_symlink(&path) {
            let reason = if self.symlink_hop_limit == 0 {
                "Symbolic links to logs are not allowed.".to_string()
            } else {
                format!(
                    "Symbolic links resolution limit ({}) has been reached.",
                    self.symlink_hop_limit
                )
            };
            return Err(LogError::AccessDenied(reason));
        }

        Ok(path)
    }
}

fn is_symlink(path: &Path) -> bool {
    std::fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

/// Replace the directories above `path` with their real location. The
/// last component is kept, and so are directories that do not exist yet.
fn resolve_parents(path: &Path) -> PathBuf {
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return path.to_path_buf();
    };
    for existing in parent.ancestors() {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let missing = parent.strip_prefix(existing).unwrap_or(Path::new(""));
            return real.join(missing).join(name);
        }
    }
    path.to_path_buf()
}

fn absolutize(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(normalize(&joined))
}

/// Remove `.` and `..` components without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;
    use test_case::test_case;

    fn guard(include: &[&str], exclude: &[&str], hops: u32) -> AccessGuard {
        AccessGuard::new(include, exclude, hops).unwrap()
    }

    fn denied_reason(result: Result<PathBuf>) -> String {
        match result {
            Err(LogError::AccessDenied(reason)) => reason,
            other => format!("unexpected: {other:?}"),
        }
    }

    // ========================================================================
    // Glob evaluation
    // ========================================================================

    #[test]
    fn empty_include_list_rejects_everything() {
        let guard = guard(&[], &[], 1);
        let reason = denied_reason(guard.check_access("/var/log/app.log"));
        assert!(reason.starts_with("No allowed file log locations specified"));
    }

    #[test]
    fn included_path_is_allowed() {
        let guard = guard(&["/var/log/**"], &[], 1);
        let resolved = guard.check_access("/var/log/app/app.log").unwrap();
        assert_eq!(resolved, PathBuf::from("/var/log/app/app.log"));
    }

    #[test]
    fn path_outside_include_is_rejected() {
        let guard = guard(&["/var/log/**"], &[], 1);
        let reason = denied_reason(guard.check_access("/etc/shadow"));
        assert!(reason.contains("is not included into allowed locations"));
        assert!(reason.contains("/etc/shadow"));
    }

    #[test]
    fn exclude_overrides_include() {
        let guard = guard(&["/var/log/**"], &["/var/log/secure/**"], 1);
        let reason = denied_reason(guard.check_access("/var/log/secure/auth.log"));
        assert!(reason.contains("is excluded from allowed locations"));
    }

    #[test_case("/var/log/../../etc/passwd" ; "parent escape")]
    #[test_case("/var/log/./../log/../../etc/passwd" ; "mixed dots")]
    fn dot_segments_are_normalized_before_matching(path: &str) {
        let guard = guard(&["/var/log/**"], &[], 1);
        let reason = denied_reason(guard.check_access(path));
        assert!(reason.contains("'/etc/passwd'"));
    }

    #[test]
    fn relative_paths_are_made_absolute() {
        let cwd = std::env::current_dir().unwrap();
        let glob = format!("{}/**", cwd.display());
        let guard = AccessGuard::new([glob.as_str()], Vec::<String>::new(), 1).unwrap();
        let resolved = guard.check_access("some/app.log").unwrap();
        assert_eq!(resolved, cwd.join("some/app.log"));
    }

    #[test]
    fn invalid_glob_fails_construction() {
        assert!(AccessGuard::new(["/var/{log"], Vec::<String>::new(), 1).is_err());
    }

    // ========================================================================
    // Symbolic links
    // ========================================================================

    struct Layout {
        _dir: TempDir,
        allowed: PathBuf,
        outside: PathBuf,
    }

    fn layout() -> Layout {
        let dir = TempDir::new().unwrap();
        let allowed = dir.path().join("allowed");
        let outside = dir.path().join("outside");
        std::fs::create_dir_all(&allowed).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::fs::write(allowed.join("app.log"), "x\n").unwrap();
        std::fs::write(outside.join("secret.log"), "s\n").unwrap();
        Layout {
            _dir: dir,
            allowed,
            outside,
        }
    }

    fn allowed_glob(layout: &Layout) -> String {
        format!("{}/**", layout.allowed.display())
    }

    #[test]
    fn symlink_escaping_include_root_is_rejected() {
        let layout = layout();
        let link = layout.allowed.join("innocent.log");
        symlink(layout.outside.join("secret.log"), &link).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 1).unwrap();
        let reason = denied_reason(guard.check_access(&link));
        assert!(reason.contains("is not included into allowed locations"));
        assert!(reason.contains("secret.log"));
    }

    #[test]
    fn symlink_within_include_root_resolves() {
        let layout = layout();
        let link = layout.allowed.join("current.log");
        symlink("app.log", &link).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 1).unwrap();
        let resolved = guard.check_access(&link).unwrap();
        assert_eq!(resolved, normalize(&layout.allowed.join("app.log")));
    }

    #[test]
    fn directory_link_escaping_include_root_is_rejected() {
        let layout = layout();
        let link = layout.allowed.join("d");
        symlink(&layout.outside, &link).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 0).unwrap();
        let reason = denied_reason(guard.check_access(link.join("secret.log")));
        assert!(reason.contains("is not included into allowed locations"));
        assert!(reason.contains("outside"));
    }

    #[test]
    fn directory_link_within_include_root_is_allowed() {
        let layout = layout();
        let nested = layout.allowed.join("2024");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(nested.join("app.log"), "x\n").unwrap();
        symlink(&nested, layout.allowed.join("current")).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 0).unwrap();
        let resolved = guard
            .check_access(layout.allowed.join("current/app.log"))
            .unwrap();
        assert_eq!(resolved, nested.join("app.log"));
    }

    #[test]
    fn missing_directories_are_kept_as_written() {
        let layout = layout();
        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 0).unwrap();
        let path = layout.allowed.join("later/app.log");
        assert_eq!(guard.check_access(&path).unwrap(), path);
    }

    #[test]
    fn zero_hop_limit_rejects_any_symlink() {
        let layout = layout();
        let link = layout.allowed.join("current.log");
        symlink("app.log", &link).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 0).unwrap();
        let reason = denied_reason(guard.check_access(&link));
        assert_eq!(reason, "Symbolic links to logs are not allowed.");
    }

    #[test]
    fn hop_limit_is_enforced() {
        let layout = layout();
        let first = layout.allowed.join("first.log");
        let second = layout.allowed.join("second.log");
        symlink("app.log", &second).unwrap();
        symlink("second.log", &first).unwrap();

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 1).unwrap();
        let reason = denied_reason(guard.check_access(&first));
        assert_eq!(reason, "Symbolic links resolution limit (1) has been reached.");

        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 2).unwrap();
        assert!(guard.check_access(&first).is_ok());
    }

    #[test]
    fn regular_files_do_not_count_against_hop_limit() {
        let layout = layout();
        let guard = AccessGuard::new([allowed_glob(&layout)], Vec::<String>::new(), 0).unwrap();
        assert!(guard.check_access(layout.allowed.join("app.log")).is_ok());
    }
}
