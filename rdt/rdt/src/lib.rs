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

//! Cache and memory bandwidth partitioning with Intel RDT.
//!
//! A [`Rdt`] context translates a declarative [`config::Config`] of
//! partitions and classes into resctrl control groups: one directory per
//! class, named `<prefix><class>`, with a schemata file holding the cache
//! bitmasks and bandwidth percentages computed for the class. Directories
//! carrying the prefix that no longer match a configured class are removed,
//! as are monitor groups with the prefix that were not created through the
//! context.
//!
//! The context performs blocking filesystem operations and is not internally
//! synchronized. Calls mutating it take `&mut self`; a host sharing one
//! context between threads wraps it in a lock, which also keeps concurrent
//! reconfigurations from interleaving their reads and writes of the
//! resctrl tree. Nothing guards against other processes writing the same
//! tree.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use resctrlfs::ResctrlDir;
use resctrlfs::ResctrlFs;
use resctrlfs::ResctrlInfo;
use slog::error;
use slog::info;
use slog::warn;

pub mod alloc;
mod error;
mod group;
pub mod mon;
pub mod validate;

pub use alloc::Schema;
pub use error::Error;
pub use error::Result;
pub use group::CtrlGroup;
pub use group::GroupDir;
pub use group::GroupState;
pub use group::MonGroup;
pub use group::ROOT_CLASS_NAME;
pub use group::ResctrlGroup;
pub use group::STALE_CLASS_NAME;
pub use mon::MonData;
pub use mon::MonResource;

use crate::group::OnDisk;
use crate::group::Shared;

#[cfg(test)]
mod test;

struct State {
    shared: Arc<Shared>,
    classes: BTreeMap<String, CtrlGroup>,
    config: Option<config::Config>,
}

/// RDT control context. Created uninitialized; see [`Rdt::initialize`].
pub struct Rdt {
    logger: slog::Logger,
    state: Option<State>,
}

impl Rdt {
    pub fn new(logger: slog::Logger) -> Rdt {
        Rdt {
            logger,
            state: None,
        }
    }

    /// Initialize on the resctrl fs behind `fs`, managing the groups whose
    /// directory names start with `prefix`. Existing groups are picked up
    /// as they are; nothing is written until a configuration is applied.
    pub fn initialize(&mut self, prefix: &str, fs: Arc<dyn ResctrlFs>) -> Result<()> {
        self.init(prefix, fs, &[])
    }

    /// Initialize on the resctrl fs mounted on this system.
    pub fn initialize_default(&mut self, prefix: &str) -> Result<()> {
        let mount = resctrlfs::find_mount(Path::new(resctrlfs::DEFAULT_MOUNTS_FILE))?;
        let fs = ResctrlDir::new(mount.path.clone(), true)?;
        self.init(prefix, Arc::new(fs), &mount.options)
    }

    fn init(
        &mut self,
        prefix: &str,
        fs: Arc<dyn ResctrlFs>,
        mount_options: &[String],
    ) -> Result<()> {
        self.state = None;

        let mut info = ResctrlInfo::read(fs.as_ref())?;
        if info.mb.is_some()
            && mount_options
                .iter()
                .any(|o| o == resctrlfs::MOUNT_OPT_MBA_MBPS)
        {
            warn!(
                self.logger,
                "resctrl mounted with {}, MB allocation disabled",
                resctrlfs::MOUNT_OPT_MBA_MBPS
            );
            info.mb = None;
        }

        let shared = Arc::new(Shared {
            fs,
            prefix: prefix.to_owned(),
            info,
            logger: self.logger.clone(),
        });
        let classes = group::discover(&shared)?
            .classes
            .iter()
            .map(|(name, mon_groups)| {
                let state = if name == ROOT_CLASS_NAME {
                    GroupState::Existing
                } else {
                    GroupState::Unmanaged
                };
                let group = CtrlGroup::discovered(name, state, mon_groups, shared.clone());
                (name.clone(), group)
            })
            .collect::<BTreeMap<_, _>>();

        info!(
            self.logger,
            "RDT initialized on {}", shared.fs.root().display();
            "prefix" => prefix,
            "classes" => classes.len(),
            "l3" => shared.info.l3.is_some(),
            "mb" => shared.info.mb.is_some(),
            "monitoring" => shared.info.l3_mon.is_some()
        );
        self.state = Some(State {
            shared,
            classes,
            config: None,
        });
        Ok(())
    }

    /// Apply `config`: compute the schema of every class, create missing
    /// class directories, write schemata, then remove prefixed classes and
    /// monitor groups that are no longer wanted. Classes already present
    /// are left in place with their processes and monitor groups.
    pub fn set_config(&mut self, config: &config::Config) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::Config("RDT not initialized".to_owned()))?;
        let normalized = validate::validate(&self.logger, config, &state.shared.info)?;
        let schemas = alloc::compute_schemas(&normalized, &state.shared.info)?;
        let on_disk = group::discover(&state.shared)?;

        let mut previous = std::mem::take(&mut state.classes);
        let mut classes = BTreeMap::new();
        let res = reconcile(
            &self.logger,
            &state.shared,
            schemas,
            &on_disk,
            &mut previous,
            &mut classes,
        );
        // Whatever was not processed stays tracked as it was
        for (name, group) in previous {
            classes.entry(name).or_insert(group);
        }
        state.classes = classes;
        res?;

        state.config = Some(config.clone());
        info!(self.logger, "RDT configuration applied";
            "partitions" => normalized.partitions.len());
        Ok(())
    }

    /// Last configuration applied successfully.
    pub fn get_config(&self) -> Option<&config::Config> {
        self.state.as_ref().and_then(|s| s.config.as_ref())
    }

    /// Hardware capabilities, once initialized.
    pub fn info(&self) -> Option<&ResctrlInfo> {
        self.state.as_ref().map(|s| &s.shared.info)
    }

    /// Classes sorted by name, leftover groups pending removal excluded.
    pub fn get_classes(&self) -> Vec<&CtrlGroup> {
        self.state
            .iter()
            .flat_map(|s| s.classes.values())
            .filter(|c| c.state() != GroupState::Stale)
            .collect()
    }

    pub fn get_class(&self, name: &str) -> Result<&CtrlGroup> {
        self.state
            .as_ref()
            .and_then(|s| s.classes.get(name))
            .filter(|c| c.state() != GroupState::Stale)
            .ok_or_else(|| Error::NotFound(format!("class {}", name)))
    }

    pub fn get_class_mut(&mut self, name: &str) -> Result<&mut CtrlGroup> {
        self.state
            .as_mut()
            .and_then(|s| s.classes.get_mut(name))
            .filter(|c| c.state() != GroupState::Stale)
            .ok_or_else(|| Error::NotFound(format!("class {}", name)))
    }

    pub fn mon_supported(&self) -> bool {
        self.info().is_some_and(|i| i.l3_mon.is_some())
    }

    /// Monitoring events supported per resource.
    pub fn get_mon_features(&self) -> BTreeMap<MonResource, Vec<String>> {
        self.info()
            .and_then(|i| i.l3_mon.as_ref())
            .map(|m| BTreeMap::from([(MonResource::L3, m.mon_features.clone())]))
            .unwrap_or_default()
    }
}

/// Bring the directories on disk in line with `schemas`. Groups are moved
/// from `previous` to `classes` as they are processed.
fn reconcile(
    logger: &slog::Logger,
    shared: &Arc<Shared>,
    mut schemas: BTreeMap<String, Schema>,
    on_disk: &OnDisk,
    previous: &mut BTreeMap<String, CtrlGroup>,
    classes: &mut BTreeMap<String, CtrlGroup>,
) -> Result<()> {
    let mut desired: BTreeSet<String> = schemas.keys().cloned().collect();
    desired.insert(ROOT_CLASS_NAME.to_owned());

    // Creates
    for name in &desired {
        let state = if name == ROOT_CLASS_NAME || on_disk.classes.contains_key(name) {
            GroupState::Existing
        } else {
            GroupState::Created
        };
        let mut group = CtrlGroup::new(name, state, shared.clone());
        if state == GroupState::Created {
            shared.fs.create_dir(&group.rel_path(&[]))?;
            info!(logger, "Created class {}", name);
        }
        match previous.remove(name) {
            Some(prev) if prev.state() != GroupState::Stale => group.inherit_mon_groups(prev),
            _ => {}
        }
        let schema = schemas.remove(name);
        let group = classes.entry(name.clone()).or_insert(group);
        if let Some(schema) = schema {
            group.write_schema(schema)?;
        }
    }

    // Deletes
    let mut first_err: Option<Error> = None;
    for (name, mon_groups) in &on_disk.classes {
        if desired.contains(name) {
            continue;
        }
        let mut stale = previous
            .remove(name)
            .unwrap_or_else(|| CtrlGroup::new(name, GroupState::Stale, shared.clone()));
        stale.set_state(GroupState::Stale);
        stale.clear_mon_groups();
        let res = stale
            .reconcile_mon_groups(mon_groups)
            .and_then(|_| {
                shared
                    .fs
                    .remove_dir(&stale.rel_path(&[]))
                    .map_err(Error::from)
            });
        match res {
            Ok(()) => info!(logger, "Removed stale class {}", name),
            Err(e) => {
                error!(logger, "Failed to remove stale class {}: {}", name, e);
                classes.insert(name.clone(), stale);
                first_err.get_or_insert(e);
            }
        }
    }
    // Classes gone from disk and from the configuration
    previous.retain(|name, _| desired.contains(name) || on_disk.classes.contains_key(name));

    for dir in &on_disk.stray {
        match shared.fs.remove_dir(Path::new(dir)) {
            Ok(()) => info!(logger, "Removed stray group {}", dir),
            Err(e) => {
                error!(logger, "Failed to remove stray group {}: {}", dir, e);
                first_err.get_or_insert(e.into());
            }
        }
    }

    for (name, group) in classes.iter_mut() {
        if group.state() == GroupState::Stale {
            continue;
        }
        let empty = BTreeSet::new();
        let mon_groups = on_disk.classes.get(name).unwrap_or(&empty);
        if let Err(e) = group.reconcile_mon_groups(mon_groups) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}
