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

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use resctrlfs::ResctrlFs;
use resctrlfs::ResctrlInfo;
use resctrlfs::wrap;
use slog::debug;
use slog::info;
use slog::warn;

use crate::Error;
use crate::Result;
use crate::alloc::Schema;
use crate::mon::MonData;
use crate::mon::read_mon_data;
use crate::validate::check_group_name;

/// Name of the class mapping to the resctrl root group.
pub const ROOT_CLASS_NAME: &str = "SYSTEM_DEFAULT";
/// Reserved name under which leftover groups are tracked until removed.
pub const STALE_CLASS_NAME: &str = "Stale";

const MON_GROUPS_DIR: &str = "mon_groups";
const SCHEMATA_FILE: &str = "schemata";
const TASKS_FILE: &str = "tasks";
const CPUS_LIST_FILE: &str = "cpus_list";

/// Directories of the root group that are not control groups.
const RESERVED_DIRS: &[&str] = &["info", "mon_groups", "mon_data"];

/// Everything the groups of an initialized context share.
pub(crate) struct Shared {
    pub fs: Arc<dyn ResctrlFs>,
    pub prefix: String,
    pub info: ResctrlInfo,
    pub logger: slog::Logger,
}

/// Where a control group stands with respect to the applied configuration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GroupState {
    /// Found on disk with our prefix before any configuration was applied.
    Unmanaged,
    /// Configured, directory already present.
    Existing,
    /// Configured, directory created by us.
    Created,
    /// Found on disk but no longer configured. Never written to; its removal
    /// failed and is retried on the next reconfiguration.
    Stale,
}

/// The directory of a control or monitor group.
pub struct GroupDir {
    rel: PathBuf,
    shared: Arc<Shared>,
}

impl GroupDir {
    pub(crate) fn fs(&self) -> &dyn ResctrlFs {
        self.shared.fs.as_ref()
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }

    pub(crate) fn rel(&self) -> &Path {
        &self.rel
    }

    fn join(&self, elems: &[&str]) -> PathBuf {
        elems.iter().fold(self.rel.clone(), |path, e| path.join(e))
    }
}

/// Operations common to control groups (classes) and monitor groups.
pub trait ResctrlGroup {
    fn name(&self) -> &str;

    fn group_dir(&self) -> &GroupDir;

    /// Path of `elems` inside the group, relative to the resctrl root.
    fn rel_path(&self, elems: &[&str]) -> PathBuf {
        self.group_dir().join(elems)
    }

    /// Absolute path of `elems` inside the group.
    fn path(&self, elems: &[&str]) -> PathBuf {
        let dir = self.group_dir();
        dir.fs().root().join(dir.join(elems))
    }

    /// Assign processes to the group. PIDs are written one at a time; the
    /// kernel rejects invalid ones.
    fn add_pids<S: AsRef<str>>(&self, pids: &[S]) -> Result<()>
    where
        Self: Sized,
    {
        let dir = self.group_dir();
        let tasks = dir.join(&[TASKS_FILE]);
        for pid in pids {
            dir.fs().append_file(&tasks, &format!("{}\n", pid.as_ref()))?;
        }
        Ok(())
    }

    /// PIDs assigned to the group, in the order the kernel lists them.
    fn get_pids(&self) -> Result<Vec<String>> {
        let dir = self.group_dir();
        Ok(dir
            .fs()
            .read_file(&dir.join(&[TASKS_FILE]))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    /// CPUs assigned to the group.
    fn get_cpus(&self) -> Result<Vec<u32>> {
        let dir = self.group_dir();
        let cpus = dir.fs().read_file(&dir.join(&[CPUS_LIST_FILE]))?;
        Ok(common::list_to_indices(cpus.trim())?)
    }

    /// Current monitoring counters of the group. Counters that cannot be
    /// read are left out.
    fn get_mon_data(&self) -> MonData {
        read_mon_data(self.group_dir())
    }
}

/// A monitor group inside a class.
pub struct MonGroup {
    name: String,
    parent: String,
    annotations: BTreeMap<String, String>,
    /// Whether the group was created (or adopted) through this context.
    /// Groups only found on disk are removed on reconfiguration.
    requested: bool,
    dir: GroupDir,
}

impl MonGroup {
    fn new(
        name: &str,
        parent: &CtrlGroup,
        annotations: BTreeMap<String, String>,
        requested: bool,
    ) -> MonGroup {
        let shared = parent.dir.shared.clone();
        let rel = parent
            .dir
            .join(&[MON_GROUPS_DIR])
            .join(format!("{}{}", shared.prefix, name));
        MonGroup {
            name: name.to_owned(),
            parent: parent.name.clone(),
            annotations,
            requested,
            dir: GroupDir { rel, shared },
        }
    }

    /// Name of the class owning this group.
    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn get_annotations(&self) -> &BTreeMap<String, String> {
        &self.annotations
    }
}

impl ResctrlGroup for MonGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn group_dir(&self) -> &GroupDir {
        &self.dir
    }
}

/// A class, i.e. a resctrl control group.
pub struct CtrlGroup {
    name: String,
    state: GroupState,
    schema: Option<Schema>,
    mon_groups: BTreeMap<String, MonGroup>,
    dir: GroupDir,
}

impl ResctrlGroup for CtrlGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn group_dir(&self) -> &GroupDir {
        &self.dir
    }
}

impl CtrlGroup {
    pub(crate) fn new(name: &str, state: GroupState, shared: Arc<Shared>) -> CtrlGroup {
        let rel = if name == ROOT_CLASS_NAME {
            PathBuf::new()
        } else {
            PathBuf::from(format!("{}{}", shared.prefix, name))
        };
        CtrlGroup {
            name: name.to_owned(),
            state,
            schema: None,
            mon_groups: BTreeMap::new(),
            dir: GroupDir { rel, shared },
        }
    }

    /// A group found on disk together with its monitor groups.
    pub(crate) fn discovered(
        name: &str,
        state: GroupState,
        mon_groups: &BTreeSet<String>,
        shared: Arc<Shared>,
    ) -> CtrlGroup {
        let mut group = CtrlGroup::new(name, state, shared);
        for mg in mon_groups {
            let mon_group = MonGroup::new(mg, &group, BTreeMap::new(), false);
            group.mon_groups.insert(mg.clone(), mon_group);
        }
        group
    }

    pub fn state(&self) -> GroupState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: GroupState) {
        self.state = state;
    }

    /// Schema last written to the group, if it was configured.
    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    pub(crate) fn write_schema(&mut self, schema: Schema) -> Result<()> {
        if !schema.is_empty() {
            let content = schema.to_string();
            self.dir
                .fs()
                .write_file(&self.rel_path(&[SCHEMATA_FILE]), &content)?;
            info!(self.dir.shared.logger, "Wrote schemata of class {}", self.name;
                "schemata" => content.trim_end());
        }
        self.schema = Some(schema);
        Ok(())
    }

    /// Monitor groups sorted by name.
    pub fn get_mon_groups(&self) -> Vec<&MonGroup> {
        self.mon_groups.values().collect()
    }

    pub fn get_mon_group(&self, name: &str) -> Result<&MonGroup> {
        self.mon_groups.get(name).ok_or_else(|| {
            Error::NotFound(format!("monitor group {} in class {}", name, self.name))
        })
    }

    /// Create a monitor group. A group left on disk by an earlier process is
    /// adopted rather than recreated.
    pub fn create_mon_group(
        &mut self,
        name: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<&MonGroup> {
        if self.dir.shared.info.l3_mon.is_none() {
            return Err(Error::Unsupported("monitoring".to_owned()));
        }
        check_group_name("monitor group", name)?;

        let adopted = match self.mon_groups.get_mut(name) {
            Some(mg) if mg.requested => {
                return Err(Error::AlreadyExists(format!(
                    "monitor group {} in class {}",
                    name, self.name
                )));
            }
            Some(mg) => {
                mg.requested = true;
                mg.annotations = annotations;
                true
            }
            None => {
                let mg = MonGroup::new(name, self, annotations, true);
                self.mon_groups.insert(name.to_owned(), mg);
                false
            }
        };

        if let Err(e) = self.ensure_mon_group_dir(&self.mon_groups[name]) {
            if adopted {
                if let Some(mg) = self.mon_groups.get_mut(name) {
                    mg.requested = false;
                }
            } else {
                self.mon_groups.remove(name);
            }
            return Err(e);
        }
        if adopted {
            info!(
                self.dir.shared.logger,
                "Adopted monitor group {}/{}", self.name, name
            );
        }
        Ok(&self.mon_groups[name])
    }

    fn ensure_mon_group_dir(&self, mg: &MonGroup) -> Result<()> {
        let fs = self.dir.fs();
        let mon_groups = self.rel_path(&[MON_GROUPS_DIR]);
        if !fs.exists(&mon_groups) {
            fs.create_dir(&mon_groups)?;
        }
        match fs.create_dir(&mg.dir.rel) {
            Err(e) if !e.is_already_exists() => Err(e.into()),
            Ok(()) => {
                info!(
                    self.dir.shared.logger,
                    "Created monitor group {}/{}", self.name, mg.name
                );
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }

    pub fn delete_mon_group(&mut self, name: &str) -> Result<()> {
        let mg = self.get_mon_group(name)?;
        self.dir.fs().remove_dir(&mg.dir.rel)?;
        info!(
            self.dir.shared.logger,
            "Deleted monitor group {}/{}", self.name, name
        );
        self.mon_groups.remove(name);
        Ok(())
    }

    /// Carry over the requested monitor groups of the previous instance of
    /// this class.
    pub(crate) fn inherit_mon_groups(&mut self, previous: CtrlGroup) {
        self.mon_groups = previous
            .mon_groups
            .into_iter()
            .filter(|(_, mg)| mg.requested)
            .collect();
    }

    pub(crate) fn clear_mon_groups(&mut self) {
        self.mon_groups.clear();
    }

    /// Drop every monitor group carrying our prefix that was not requested
    /// through this context and make sure the requested ones exist.
    /// `on_disk` lists the prefixed monitor groups found under the class.
    pub(crate) fn reconcile_mon_groups(&mut self, on_disk: &BTreeSet<String>) -> Result<()> {
        let fs = self.dir.fs();
        let logger = &self.dir.shared.logger;
        let mut first_err: Option<Error> = None;

        for name in on_disk {
            if self.mon_groups.get(name).is_some_and(|mg| mg.requested) {
                continue;
            }
            let rel = self
                .rel_path(&[MON_GROUPS_DIR])
                .join(format!("{}{}", self.dir.shared.prefix, name));
            match fs.remove_dir(&rel) {
                Ok(()) => info!(logger, "Removed stale monitor group {}/{}", self.name, name),
                Err(e) => {
                    warn!(
                        logger,
                        "Failed to remove stale monitor group {}/{}: {}", self.name, name, e
                    );
                    first_err.get_or_insert(e.into());
                }
            }
        }
        self.mon_groups.retain(|_, mg| mg.requested);

        for mg in self.mon_groups.values() {
            if !on_disk.contains(&mg.name) {
                if let Err(e) = self.ensure_mon_group_dir(mg) {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Prefixed monitor groups found under the class directory `class_dir`.
fn discover_mon_groups(shared: &Shared, class_dir: &Path) -> Result<BTreeSet<String>> {
    let dirs = wrap(shared.fs.list_dirs(&class_dir.join(MON_GROUPS_DIR)))?.unwrap_or_default();
    Ok(dirs
        .into_iter()
        .filter_map(|d| d.strip_prefix(shared.prefix.as_str()).map(str::to_owned))
        .filter(|d| !d.is_empty())
        .collect())
}

/// Groups found on disk.
#[derive(Default, Debug)]
pub(crate) struct OnDisk {
    /// Classes with their prefixed monitor groups. The root class is always
    /// present.
    pub classes: BTreeMap<String, BTreeSet<String>>,
    /// Directories carrying our prefix that no class name maps to, e.g.
    /// `<prefix>SYSTEM_DEFAULT`.
    pub stray: Vec<String>,
}

/// Scan the resctrl root. Directories without our prefix are not ours and
/// are left alone.
pub(crate) fn discover(shared: &Shared) -> Result<OnDisk> {
    let mut found = OnDisk::default();
    found.classes.insert(
        ROOT_CLASS_NAME.to_owned(),
        discover_mon_groups(shared, Path::new(""))?,
    );
    for dir in shared.fs.list_dirs(Path::new(""))? {
        if RESERVED_DIRS.contains(&dir.as_str()) {
            continue;
        }
        let class = match dir.strip_prefix(shared.prefix.as_str()) {
            Some(class) if !class.is_empty() && class != ROOT_CLASS_NAME => class,
            Some(_) => {
                debug!(shared.logger, "Discovered stray group {}", dir);
                found.stray.push(dir);
                continue;
            }
            None => {
                debug!(shared.logger, "Ignoring foreign group {}", dir);
                continue;
            }
        };
        let mon_groups = discover_mon_groups(shared, Path::new(&dir))?;
        debug!(shared.logger, "Discovered class {}", class;
            "mon_groups" => format!("{:?}", mon_groups));
        found.classes.insert(class.to_owned(), mon_groups);
    }
    Ok(found)
}
