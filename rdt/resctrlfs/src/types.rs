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

use std::str::FromStr;

use common::Bitmask;
use serde::Deserialize;
use serde::Serialize;

/// Internal representation of the value read from monitoring data. This is a
/// wrapper around u64 that is used to handle the "Unavailable" state that can
/// be returned by resctrlfs.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RmidBytes {
    Bytes(u64),
    Unavailable,
}

impl FromStr for RmidBytes {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "Unavailable" => Ok(RmidBytes::Unavailable),
            _ => Ok(RmidBytes::Bytes(s.parse().map_err(|_| "Not a number")?)),
        }
    }
}

/// Cache allocation capabilities from `info/L3`.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct L3Info {
    /// Mask of all cache ways that may be allocated.
    pub cbm_mask: Bitmask,
    /// Smallest number of consecutive bits a CBM may have.
    pub min_cbm_bits: u32,
    pub num_closids: u64,
    /// Cache ids, ascending, as listed in the root schemata.
    pub domains: Vec<u64>,
}

impl L3Info {
    /// Width of a full CBM.
    pub fn cbm_bits(&self) -> u32 {
        self.cbm_mask.count_ones()
    }
}

/// Memory bandwidth allocation capabilities from `info/MB`.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct MbInfo {
    pub min_bandwidth: u64,
    pub bandwidth_gran: u64,
    pub num_closids: u64,
    pub domains: Vec<u64>,
}

/// Monitoring capabilities from `info/L3_MON`.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct L3MonInfo {
    /// Event names, one counter file per event in each `mon_data/mon_L3_XX`.
    pub mon_features: Vec<String>,
    pub num_rmids: u64,
}

/// Hardware support as exposed by the `info` directory. A `None` resource is
/// not supported (or not enabled) on this system.
#[derive(Default, Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct ResctrlInfo {
    pub l3: Option<L3Info>,
    pub mb: Option<MbInfo>,
    pub l3_mon: Option<L3MonInfo>,
}
