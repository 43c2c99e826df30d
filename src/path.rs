//! Pre-validated filesystem paths.

use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// A path that has passed basic validation: non-empty, free of interior NUL
/// bytes. Construction is the only gate; `ValidPath` carries no further
/// guarantees (it is not canonicalized and may not exist).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ValidPath(PathBuf);

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("path contains a NUL byte")]
    ContainsNul,
}

impl ValidPath {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(PathError::Empty);
        }
        #[cfg(unix)]
        {
            use std::os::unix::ffi::OsStrExt;
            if path.as_os_str().as_bytes().contains(&0) {
                return Err(PathError::ContainsNul);
            }
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn join(&self, name: impl AsRef<Path>) -> ValidPath {
        ValidPath(self.0.join(name))
    }

    pub fn parent(&self) -> Option<ValidPath> {
        self.0.parent().map(|p| ValidPath(p.to_path_buf()))
    }

    pub fn file_name(&self) -> Option<&std::ffi::OsStr> {
        self.0.file_name()
    }
}

impl fmt::Debug for ValidPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for ValidPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl AsRef<Path> for ValidPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<&str> for ValidPath {
    type Error = PathError;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        ValidPath::new(value)
    }
}

impl TryFrom<PathBuf> for ValidPath {
    type Error = PathError;
    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        ValidPath::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_path() {
        assert!(matches!(ValidPath::new(""), Err(PathError::Empty)));
    }

    #[test]
    fn join_and_parent_round_trip() {
        let root = ValidPath::new("/tmp/root").unwrap();
        let child = root.join("child");
        assert_eq!(child.as_path(), Path::new("/tmp/root/child"));
        assert_eq!(child.parent().unwrap().as_path(), root.as_path());
        assert_eq!(child.file_name().unwrap(), "child");
    }

    #[cfg(unix)]
    #[test]
    fn rejects_interior_nul() {
        use std::os::unix::ffi::OsStrExt;
        let bad = std::ffi::OsStr::from_bytes(b"has\0nul");
        assert!(matches!(
            ValidPath::new(PathBuf::from(bad)),
            Err(PathError::ContainsNul)
        ));
    }
}
