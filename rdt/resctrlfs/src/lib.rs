// Copyright (c) Facebook, Inc. and its affiliates.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![deny(clippy::all)]

use std::io::ErrorKind;
use std::io::Read;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::path::Path;
use std::path::PathBuf;

use nix::sys::statfs::RDTGROUP_SUPER_MAGIC;
use nix::sys::statfs::fstatfs;
use openat::Dir;
use openat::SimpleType;
use thiserror::Error;

mod info;
mod mount;
mod types;
pub use info::*;
pub use mount::*;
pub use types::*;


const DIR_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{1:?}: {0:?}")]
    IoError(PathBuf, #[source] std::io::Error),
    #[error("Unexpected line ({1}) in file: {0:?}")]
    UnexpectedLine(PathBuf, String),
    #[error("Not resctrl filesystem: {0:?}")]
    NotResctrl(PathBuf),
    #[error("No resctrl mount found in {0:?}")]
    NoMount(PathBuf),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::IoError(_, e) if e.kind() == ErrorKind::NotFound)
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::IoError(_, e) if e.kind() == ErrorKind::AlreadyExists)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// resctrlfs can give us a NotFound for various files and directories. In a lot of cases, these
/// are expected (e.g. when control or monitoring are disabled). Thus we translate these errors to
/// `None`.
pub fn wrap<S: Sized>(v: std::result::Result<S, Error>) -> std::result::Result<Option<S>, Error> {
    if let Err(Error::IoError(_, ref e)) = v {
        if e.kind() == ErrorKind::NotFound {
            return Ok(None);
        }
        if e.raw_os_error() == Some(nix::libc::ENODEV) {
            // If the resctrl group is removed after a control file is opened,
            // ENODEV may returned. Ignore it.
            return Ok(None);
        }
    }
    v.map(Some)
}

/// Directory operations on a resctrl hierarchy. Every path is relative to
/// the resctrl root; the empty path is the root itself.
pub trait ResctrlFs: Send + Sync {
    /// Absolute path of the resctrl root.
    fn root(&self) -> &Path;

    /// Names of the directories directly below `rel`, sorted.
    fn list_dirs(&self, rel: &Path) -> Result<Vec<String>>;

    fn exists(&self, rel: &Path) -> bool;

    fn create_dir(&self, rel: &Path) -> Result<()>;

    fn remove_dir(&self, rel: &Path) -> Result<()>;

    fn read_file(&self, rel: &Path) -> Result<String>;

    /// Replace the content of `rel` with `data` in a single write.
    fn write_file(&self, rel: &Path, data: &str) -> Result<()>;

    fn append_file(&self, rel: &Path, data: &str) -> Result<()>;
}

/// [`ResctrlFs`] backed by a directory handle on a mounted resctrl fs.
pub struct ResctrlDir {
    path: PathBuf,
    dir: Dir,
    recursive_remove: bool,
}

fn dir_path(rel: &Path) -> &Path {
    if rel.as_os_str().is_empty() {
        Path::new(".")
    } else {
        rel
    }
}

impl ResctrlDir {
    pub fn new(path: PathBuf, validate: bool) -> Result<ResctrlDir> {
        let dir = Dir::open(&path).map_err(|e| Error::IoError(path.clone(), e))?;
        // Check that it's a resctrl fs
        if validate {
            // SAFETY: Fix when https://github.com/nix-rust/nix/issues/2546 is
            let dir = unsafe { BorrowedFd::borrow_raw(dir.as_raw_fd()) };
            let statfs = match fstatfs(dir) {
                Ok(s) => s,
                Err(e) => {
                    return Err(Error::IoError(
                        path,
                        std::io::Error::other(format!("Failed to fstatfs: {}", e)),
                    ));
                }
            };

            if statfs.filesystem_type() != RDTGROUP_SUPER_MAGIC {
                return Err(Error::NotResctrl(path));
            }
        }
        Ok(ResctrlDir {
            path,
            dir,
            recursive_remove: false,
        })
    }

    /// Resctrl groups are removed with a plain rmdir even though they hold
    /// control files. Other backing stores (e.g. a copy of the hierarchy in
    /// a regular directory) need their content removed first.
    pub fn recursive_remove(mut self, recursive: bool) -> Self {
        self.recursive_remove = recursive;
        self
    }

    fn io_error<P: AsRef<Path>>(&self, rel: P, e: std::io::Error) -> Error {
        Error::IoError(self.path.join(rel), e)
    }
}

impl ResctrlFs for ResctrlDir {
    fn root(&self) -> &Path {
        &self.path
    }

    fn list_dirs(&self, rel: &Path) -> Result<Vec<String>> {
        let mut names = self
            .dir
            .list_dir(dir_path(rel))
            .map_err(|e| self.io_error(rel, e))?
            .filter_map(|entry| match entry {
                Ok(entry) if entry.simple_type() == Some(SimpleType::Dir) => {
                    Some(entry.file_name().to_string_lossy().into_owned())
                }
                _ => None,
            })
            .collect::<Vec<_>>();
        names.sort();
        Ok(names)
    }

    fn exists(&self, rel: &Path) -> bool {
        self.dir.metadata(dir_path(rel)).is_ok()
    }

    fn create_dir(&self, rel: &Path) -> Result<()> {
        self.dir
            .create_dir(rel, DIR_MODE)
            .map_err(|e| self.io_error(rel, e))
    }

    fn remove_dir(&self, rel: &Path) -> Result<()> {
        let res = if self.recursive_remove {
            std::fs::remove_dir_all(self.path.join(rel))
        } else {
            self.dir.remove_dir(rel)
        };
        res.map_err(|e| self.io_error(rel, e))
    }

    fn read_file(&self, rel: &Path) -> Result<String> {
        let mut file = self.dir.open_file(rel).map_err(|e| self.io_error(rel, e))?;
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| self.io_error(rel, e))?;
        Ok(content)
    }

    fn write_file(&self, rel: &Path, data: &str) -> Result<()> {
        let mut file = self
            .dir
            .write_file(rel, FILE_MODE)
            .map_err(|e| self.io_error(rel, e))?;
        file.write_all(data.as_bytes())
            .map_err(|e| self.io_error(rel, e))
    }

    fn append_file(&self, rel: &Path, data: &str) -> Result<()> {
        let mut file = self
            .dir
            .append_file(rel, FILE_MODE)
            .map_err(|e| self.io_error(rel, e))?;
        file.write_all(data.as_bytes())
            .map_err(|e| self.io_error(rel, e))
    }
}
