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

//! In-memory resctrl hierarchy that can be told to fail removals.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use resctrlfs::Error;
use resctrlfs::ResctrlFs;
use resctrlfs::Result;

#[derive(Default)]
struct Tree {
    dirs: BTreeSet<PathBuf>,
    files: BTreeMap<PathBuf, String>,
    busy: BTreeSet<PathBuf>,
}

pub struct FakeFs {
    root: PathBuf,
    tree: Mutex<Tree>,
}

impl FakeFs {
    pub fn new() -> FakeFs {
        let mut tree = Tree::default();
        tree.dirs.insert(PathBuf::new());
        FakeFs {
            root: PathBuf::from("/fake/resctrl"),
            tree: Mutex::new(tree),
        }
    }

    /// Same hardware as `TestResctrlfs::initialize()`.
    pub fn initialize(&self) {
        self.add_file(
            "schemata",
            "L3:0=fffff;1=fffff;2=fffff;3=fffff\nMB:0=100;1=100;2=100;3=100\n",
        );
        self.add_file("info/L3/cbm_mask", "fffff\n");
        self.add_file("info/L3/min_cbm_bits", "1\n");
        self.add_file("info/L3/num_closids", "16\n");
        self.add_file("info/MB/min_bandwidth", "10\n");
        self.add_file("info/MB/bandwidth_gran", "10\n");
        self.add_file("info/MB/num_closids", "8\n");
        self.add_file("info/L3_MON/mon_features", "llc_occupancy\n");
        self.add_file("info/L3_MON/num_rmids", "176\n");
    }

    pub fn add_dir<P: AsRef<Path>>(&self, p: P) {
        let mut tree = self.tree.lock().unwrap();
        for ancestor in p.as_ref().ancestors() {
            tree.dirs.insert(ancestor.to_path_buf());
        }
    }

    pub fn add_file<P: AsRef<Path>>(&self, p: P, content: &str) {
        if let Some(parent) = p.as_ref().parent() {
            self.add_dir(parent);
        }
        let mut tree = self.tree.lock().unwrap();
        tree.files
            .insert(p.as_ref().to_path_buf(), content.to_owned());
    }

    /// Make removals of `p` fail with EBUSY.
    pub fn set_busy<P: AsRef<Path>>(&self, p: P, busy: bool) {
        let mut tree = self.tree.lock().unwrap();
        if busy {
            tree.busy.insert(p.as_ref().to_path_buf());
        } else {
            tree.busy.remove(p.as_ref());
        }
    }

    pub fn has_dir<P: AsRef<Path>>(&self, p: P) -> bool {
        self.tree.lock().unwrap().dirs.contains(p.as_ref())
    }

    fn error(&self, rel: &Path, kind: ErrorKind) -> Error {
        Error::IoError(self.root.join(rel), std::io::Error::from(kind))
    }
}

impl ResctrlFs for FakeFs {
    fn root(&self) -> &Path {
        &self.root
    }

    fn list_dirs(&self, rel: &Path) -> Result<Vec<String>> {
        let tree = self.tree.lock().unwrap();
        if !tree.dirs.contains(rel) {
            return Err(self.error(rel, ErrorKind::NotFound));
        }
        Ok(tree
            .dirs
            .iter()
            .filter(|d| d.parent() == Some(rel))
            .filter_map(|d| d.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect())
    }

    fn exists(&self, rel: &Path) -> bool {
        let tree = self.tree.lock().unwrap();
        tree.dirs.contains(rel) || tree.files.contains_key(rel)
    }

    fn create_dir(&self, rel: &Path) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.dirs.contains(rel) {
            return Err(self.error(rel, ErrorKind::AlreadyExists));
        }
        if !rel.parent().is_some_and(|p| tree.dirs.contains(p)) {
            return Err(self.error(rel, ErrorKind::NotFound));
        }
        tree.dirs.insert(rel.to_path_buf());
        Ok(())
    }

    fn remove_dir(&self, rel: &Path) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if tree.busy.contains(rel) {
            return Err(self.error(rel, ErrorKind::ResourceBusy));
        }
        if !tree.dirs.contains(rel) {
            return Err(self.error(rel, ErrorKind::NotFound));
        }
        tree.dirs.retain(|d| !d.starts_with(rel));
        tree.files.retain(|f, _| !f.starts_with(rel));
        Ok(())
    }

    fn read_file(&self, rel: &Path) -> Result<String> {
        let tree = self.tree.lock().unwrap();
        tree.files
            .get(rel)
            .cloned()
            .ok_or_else(|| self.error(rel, ErrorKind::NotFound))
    }

    fn write_file(&self, rel: &Path, data: &str) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if !rel.parent().is_some_and(|p| tree.dirs.contains(p)) {
            return Err(self.error(rel, ErrorKind::NotFound));
        }
        tree.files.insert(rel.to_path_buf(), data.to_owned());
        Ok(())
    }

    fn append_file(&self, rel: &Path, data: &str) -> Result<()> {
        let mut tree = self.tree.lock().unwrap();
        if !rel.parent().is_some_and(|p| tree.dirs.contains(p)) {
            return Err(self.error(rel, ErrorKind::NotFound));
        }
        tree.files.entry(rel.to_path_buf()).or_default().push_str(data);
        Ok(())
    }
}
