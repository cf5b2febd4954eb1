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

use resctrlfs::RmidBytes;
use serde::Deserialize;
use serde::Serialize;
use slog::warn;

use crate::group::GroupDir;

const MON_DATA_DIR: &str = "mon_data";
const MON_L3_DIR_PREFIX: &str = "mon_L3_";

/// Monitored resources.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub enum MonResource {
    L3,
}

/// Counter values of one domain, by event name.
pub type MonLeafData = BTreeMap<String, u64>;

/// Counter values of every L3 domain, by cache id.
pub type MonL3Data = BTreeMap<u64, MonLeafData>;

/// Monitoring counters of a group, read fresh on every query.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MonData {
    pub l3: MonL3Data,
}

/// Return L3 cache ID for given mon_data dir name. e.g. "mon_L3_01" returns 1.
fn l3_mon_dir_id(name: &str) -> Option<u64> {
    name.strip_prefix(MON_L3_DIR_PREFIX)?.parse().ok()
}

pub(crate) fn read_mon_data(dir: &GroupDir) -> MonData {
    let shared = dir.shared();
    let Some(l3_mon) = &shared.info.l3_mon else {
        return MonData::default();
    };
    let fs = dir.fs();
    let mon_data = dir.rel().join(MON_DATA_DIR);

    let domains = match fs.list_dirs(&mon_data) {
        Ok(domains) => domains,
        Err(e) => {
            warn!(shared.logger, "Failed to list monitoring domains: {}", e);
            return MonData::default();
        }
    };

    let mut l3 = MonL3Data::new();
    for domain_dir in domains {
        let Some(id) = l3_mon_dir_id(&domain_dir) else {
            continue;
        };
        let leaf = l3.entry(id).or_default();
        for event in &l3_mon.mon_features {
            let path = mon_data.join(&domain_dir).join(event);
            let value = fs
                .read_file(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| content.trim().parse::<RmidBytes>());
            match value {
                Ok(RmidBytes::Bytes(v)) => {
                    leaf.insert(event.clone(), v);
                }
                Ok(RmidBytes::Unavailable) => {}
                Err(e) => warn!(
                    shared.logger,
                    "Skipping counter {}: {}",
                    path.display(),
                    e
                ),
            }
        }
    }
    l3.retain(|_, leaf| !leaf.is_empty());
    MonData { l3 }
}
