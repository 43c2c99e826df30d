//! Thin synchronous syscall wrappers.
//!
//! These are the out-of-scope "given" primitives the rest of the crate is
//! specified against (spec §6). They run only on lane worker threads and do
//! no validation beyond what the OS gives us; every primitive here may
//! block for an arbitrary duration.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::path::ValidPath;

#[derive(Debug, Error)]
pub enum OpError {
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Access mode a file was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleMode {
    Read,
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptionsFlags {
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

/// A single-ownership wrapper over an OS file descriptor. Cannot be copied
/// or cloned; consumed by [`RawHandle::close`].
pub struct RawHandle {
    file: File,
    path: ValidPath,
    mode: HandleMode,
}

impl RawHandle {
    pub fn open(
        path: &ValidPath,
        mode: HandleMode,
        flags: OpenOptionsFlags,
    ) -> Result<Self, OpError> {
        let mut opts = OpenOptions::new();
        match mode {
            HandleMode::Read => {
                opts.read(true);
            }
            HandleMode::Write => {
                opts.write(true);
            }
            HandleMode::ReadWrite => {
                opts.read(true).write(true);
            }
        }
        if flags.create {
            opts.create(true);
        }
        if flags.truncate {
            opts.truncate(true);
        }
        if flags.append {
            opts.append(true);
        }
        let file = opts.open(path.as_path())?;
        Ok(Self {
            file,
            path: path.clone(),
            mode,
        })
    }

    pub fn path(&self) -> &ValidPath {
        &self.path
    }

    pub fn mode(&self) -> HandleMode {
        self.mode
    }

    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<usize, OpError> {
        Ok(self.file.read(buf)?)
    }

    pub fn read(&mut self, count: usize) -> Result<Vec<u8>, OpError> {
        let mut buf = vec![0u8; count];
        let n = self.file.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    pub fn write(&mut self, bytes: &[u8]) -> Result<(), OpError> {
        self.file.write_all(bytes)?;
        Ok(())
    }

    pub fn seek(&mut self, offset: i64, origin: SeekFrom) -> Result<u64, OpError> {
        let _ = offset;
        Ok(self.file.seek(origin)?)
    }

    pub fn sync(&mut self) -> Result<(), OpError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn close(self) -> Result<(), OpError> {
        drop(self.file);
        Ok(())
    }
}

/// Entry type reported by a directory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    SymbolicLink,
    Other,
}

#[derive(Debug, Clone)]
pub struct RawEntry {
    pub parent: ValidPath,
    pub name: std::ffi::OsString,
    pub kind: EntryType,
}

/// A single-ownership directory iterator handle.
pub struct DirHandle {
    inner: std::fs::ReadDir,
    parent: ValidPath,
}

impl DirHandle {
    pub fn open(path: &ValidPath) -> Result<Self, OpError> {
        Ok(Self {
            inner: std::fs::read_dir(path.as_path())?,
            parent: path.clone(),
        })
    }

    /// Reads up to `batch` entries in one call, amortizing the per-entry
    /// syscall overhead across the lane job.
    pub fn next_batch(&mut self, batch: usize) -> Result<Vec<RawEntry>, OpError> {
        let mut out = Vec::with_capacity(batch.min(64));
        for _ in 0..batch {
            match self.inner.next() {
                None => break,
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(entry)) => {
                    let file_type = entry.file_type()?;
                    let kind = if file_type.is_dir() {
                        EntryType::Directory
                    } else if file_type.is_symlink() {
                        EntryType::SymbolicLink
                    } else if file_type.is_file() {
                        EntryType::File
                    } else {
                        EntryType::Other
                    };
                    out.push(RawEntry {
                        parent: self.parent.clone(),
                        name: entry.file_name(),
                        kind,
                    });
                }
            }
        }
        Ok(out)
    }

    pub fn close(self) -> Result<(), OpError> {
        drop(self);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatInfo {
    pub device: u64,
    pub inode: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

#[cfg(unix)]
pub fn stat_info(path: &Path) -> Result<StatInfo, OpError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path)?;
    Ok(StatInfo {
        device: meta.dev(),
        inode: meta.ino(),
        is_dir: meta.is_dir(),
        is_symlink: false,
    })
}

#[cfg(unix)]
pub fn lstat_info(path: &Path) -> Result<StatInfo, OpError> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::symlink_metadata(path)?;
    Ok(StatInfo {
        device: meta.dev(),
        inode: meta.ino(),
        is_dir: meta.is_dir(),
        is_symlink: meta.is_symlink(),
    })
}

#[cfg(not(unix))]
pub fn stat_info(path: &Path) -> Result<StatInfo, OpError> {
    let meta = std::fs::metadata(path)?;
    Ok(StatInfo {
        device: 0,
        inode: 0,
        is_dir: meta.is_dir(),
        is_symlink: false,
    })
}

#[cfg(not(unix))]
pub fn lstat_info(path: &Path) -> Result<StatInfo, OpError> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(StatInfo {
        device: 0,
        inode: 0,
        is_dir: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
    })
}

pub fn rename(src: &Path, dst: &Path) -> Result<(), OpError> {
    std::fs::rename(src, dst)?;
    Ok(())
}

pub fn remove_file(path: &Path) -> Result<(), OpError> {
    std::fs::remove_file(path)?;
    Ok(())
}

/// fsync of a directory's own metadata, used to make a preceding rename
/// durable. Opens the directory read-only and calls `sync_all`.
pub fn directory_fsync(path: &Path) -> Result<(), OpError> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

pub fn random_suffix() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 8];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub fn temp_path_for(dest: &Path) -> PathBuf {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    dir.join(format!(".{file_name}.tmp-{}", random_suffix()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = ValidPath::new(dir.path().join("f")).unwrap();

        let mut w = RawHandle::open(
            &path,
            HandleMode::Write,
            OpenOptionsFlags {
                create: true,
                truncate: true,
                append: false,
            },
        )
        .unwrap();
        w.write(b"hello").unwrap();
        w.close().unwrap();

        let mut r = RawHandle::open(&path, HandleMode::Read, OpenOptionsFlags::default()).unwrap();
        let bytes = r.read(16).unwrap();
        assert_eq!(bytes, b"hello");
    }

    #[test]
    fn dir_handle_lists_all_entries_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a", "b", "c"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let path = ValidPath::new(dir.path().to_path_buf()).unwrap();
        let mut handle = DirHandle::open(&path).unwrap();
        let mut names = Vec::new();
        loop {
            let batch = handle.next_batch(1).unwrap();
            if batch.is_empty() {
                break;
            }
            names.extend(batch.into_iter().map(|e| e.name.to_string_lossy().into_owned()));
        }
        names.sort();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[cfg(unix)]
    #[test]
    fn stat_and_lstat_distinguish_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        std::fs::write(&target, b"x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let link_path = ValidPath::new(link).unwrap();
        let lstat = lstat_info(link_path.as_path()).unwrap();
        assert!(lstat.is_symlink);
        let stat = stat_info(link_path.as_path()).unwrap();
        assert!(!stat.is_dir);
    }

    #[test]
    fn rename_moves_file_to_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        std::fs::write(&src, b"payload").unwrap();
        rename(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"payload");
    }
}
