//! Jail configuration
//!
//! Where the provisioned jail lives and how in-jail paths map onto the host.
//! The jail is built by an external provisioning service; this only describes
//! it and checks candidate paths against it.

use serde::Deserialize;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use crate::runner::JailError;

/// Jail configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JailConfig {
    /// Root of the provisioned jail on the host
    pub root: PathBuf,
    /// Candidate working directory, as seen inside the jail
    pub work_dir: PathBuf,
    /// Enter the jail with chroot(2) before exec (requires privileges)
    pub chroot: bool,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            work_dir: PathBuf::from("/home/user"),
            chroot: false,
        }
    }
}

impl JailConfig {
    pub fn new(root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            work_dir: work_dir.into(),
            chroot: false,
        }
    }

    pub fn with_chroot(mut self, chroot: bool) -> Self {
        self.chroot = chroot;
        self
    }

    /// Absolute, normalized form of an in-jail path. Relative paths are
    /// taken from the working directory; `..` never climbs above `/`.
    pub fn jail_path(&self, inner: &Path) -> PathBuf {
        let absolute = if inner.is_absolute() {
            inner.to_path_buf()
        } else {
            self.work_dir.join(inner)
        };

        let mut normalized = PathBuf::from("/");
        for component in absolute.components() {
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::ParentDir => {
                    normalized.pop();
                }
                _ => {}
            }
        }
        normalized
    }

    /// Host location of an in-jail path
    pub fn host_path(&self, inner: &Path) -> PathBuf {
        let inner = self.jail_path(inner);
        match inner.strip_prefix("/") {
            Ok(rel) => self.root.join(rel),
            Err(_) => self.root.join(inner),
        }
    }

    /// Host location of the candidate working directory
    pub fn host_work_dir(&self) -> PathBuf {
        self.host_path(&self.work_dir)
    }

    /// Check that `program` names an executable regular file inside the jail
    /// and return its host path
    pub fn resolve_executable(&self, program: &Path) -> Result<PathBuf, JailError> {
        let root = fs::canonicalize(&self.root)
            .map_err(|_| JailError::JailUnavailable(self.root.clone()))?;
        let host = self.host_path(program);

        // Symlinks are resolved on the host, so a link escaping the root is caught here
        let resolved = fs::canonicalize(&host).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => JailError::NotFound(program.to_path_buf()),
            _ => JailError::NotExecutable(program.to_path_buf()),
        })?;
        if !resolved.starts_with(&root) {
            return Err(JailError::OutsideJail(program.to_path_buf()));
        }

        let meta = fs::metadata(&resolved)
            .map_err(|_| JailError::NotFound(program.to_path_buf()))?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(JailError::NotExecutable(program.to_path_buf()));
        }
        Ok(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_file(path: &Path, mode: u32) {
        fs::write(path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
    }

    #[test]
    fn test_host_path_mapping() {
        let jail = JailConfig::new("/srv/jail", "/home/user");

        assert_eq!(
            jail.host_path(Path::new("/bin/sh")),
            PathBuf::from("/srv/jail/bin/sh")
        );
        assert_eq!(
            jail.host_path(Path::new("a.out")),
            PathBuf::from("/srv/jail/home/user/a.out")
        );
        assert_eq!(
            jail.host_path(Path::new("/../../etc/passwd")),
            PathBuf::from("/srv/jail/etc/passwd")
        );
        assert_eq!(jail.host_work_dir(), PathBuf::from("/srv/jail/home/user"));
    }

    #[test]
    fn test_jail_path_is_absolute() {
        let jail = JailConfig::new("/srv/jail", "/home/user");

        assert_eq!(jail.jail_path(Path::new("a.out")), PathBuf::from("/home/user/a.out"));
        assert_eq!(jail.jail_path(Path::new("./bin/../a.out")), PathBuf::from("/home/user/a.out"));
        assert_eq!(jail.jail_path(Path::new("../../../x")), PathBuf::from("/x"));
        assert_eq!(jail.jail_path(Path::new("/usr/bin/env")), PathBuf::from("/usr/bin/env"));
    }

    #[test]
    fn test_resolve_executable() {
        let root = tempdir().unwrap();
        let jail = JailConfig::new(root.path(), "/");
        write_file(&root.path().join("run"), 0o755);
        write_file(&root.path().join("data"), 0o644);
        fs::create_dir(root.path().join("dir")).unwrap();

        assert_eq!(
            jail.resolve_executable(Path::new("/run")).unwrap(),
            root.path().join("run")
        );
        assert!(matches!(
            jail.resolve_executable(Path::new("/data")),
            Err(JailError::NotExecutable(_))
        ));
        assert!(matches!(
            jail.resolve_executable(Path::new("/dir")),
            Err(JailError::NotExecutable(_))
        ));
        assert!(matches!(
            jail.resolve_executable(Path::new("/missing")),
            Err(JailError::NotFound(_))
        ));
    }

    #[test]
    fn test_symlink_escape_is_rejected() {
        let root = tempdir().unwrap();
        let jail = JailConfig::new(root.path(), "/");
        std::os::unix::fs::symlink("/bin/sh", root.path().join("sh")).unwrap();

        assert!(matches!(
            jail.resolve_executable(Path::new("/sh")),
            Err(JailError::OutsideJail(_))
        ));
    }

    #[test]
    fn test_missing_root_is_unavailable() {
        let jail = JailConfig::new("/nonexistent/jail/root", "/");
        assert!(matches!(
            jail.resolve_executable(Path::new("/bin/sh")),
            Err(JailError::JailUnavailable(_))
        ));
    }

    #[test]
    fn test_deserialize_defaults() {
        let jail: JailConfig = toml::from_str("root = \"/srv/jail\"").unwrap();
        assert_eq!(jail.root, PathBuf::from("/srv/jail"));
        assert_eq!(jail.work_dir, PathBuf::from("/home/user"));
        assert!(!jail.chroot);
    }
}
