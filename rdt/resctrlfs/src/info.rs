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
use std::path::Path;
use std::str::FromStr;

use common::Bitmask;

use crate::Error;
use crate::L3Info;
use crate::L3MonInfo;
use crate::MbInfo;
use crate::ResctrlFs;
use crate::ResctrlInfo;
use crate::Result;
use crate::wrap;

/// Read a file holding a single value.
fn read_value<T: FromStr>(fs: &dyn ResctrlFs, rel: &str) -> Result<T> {
    let content = fs.read_file(Path::new(rel))?;
    let line = content.lines().next().unwrap_or("").trim();
    line.parse::<T>()
        .map_err(|_| Error::UnexpectedLine(fs.root().join(rel), line.to_owned()))
}

/// Read a file holding one value per line.
fn read_lines(fs: &dyn ResctrlFs, rel: &str) -> Result<Vec<String>> {
    Ok(fs
        .read_file(Path::new(rel))?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Parse the domain ids of every resource in a schemata file, e.g.
/// "L3:0=fffff;1=fffff" gives {"L3": [0, 1]}.
pub fn parse_schemata_domains(path: &Path, content: &str) -> Result<BTreeMap<String, Vec<u64>>> {
    let unexpected = |line: &str| Error::UnexpectedLine(path.to_path_buf(), line.to_owned());
    let mut resources = BTreeMap::new();
    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let (name, items) = line.split_once(':').ok_or_else(|| unexpected(line))?;
        let mut domains = items
            .split(';')
            .map(|item| {
                item.split_once('=')
                    .and_then(|(id, _)| id.trim().parse::<u64>().ok())
                    .ok_or_else(|| unexpected(line))
            })
            .collect::<Result<Vec<_>>>()?;
        domains.sort_unstable();
        resources.insert(name.trim().to_owned(), domains);
    }
    Ok(resources)
}

fn read_l3_info(fs: &dyn ResctrlFs, domains: Vec<u64>) -> Result<L3Info> {
    let cbm_mask: String = read_value(fs, "info/L3/cbm_mask")?;
    let cbm_mask = Bitmask::from_hex(&cbm_mask)
        .map_err(|_| Error::UnexpectedLine(fs.root().join("info/L3/cbm_mask"), cbm_mask))?;
    Ok(L3Info {
        cbm_mask,
        min_cbm_bits: read_value(fs, "info/L3/min_cbm_bits")?,
        num_closids: read_value(fs, "info/L3/num_closids")?,
        domains,
    })
}

fn read_mb_info(fs: &dyn ResctrlFs, domains: Vec<u64>) -> Result<MbInfo> {
    Ok(MbInfo {
        min_bandwidth: read_value(fs, "info/MB/min_bandwidth")?,
        bandwidth_gran: read_value(fs, "info/MB/bandwidth_gran")?,
        num_closids: read_value(fs, "info/MB/num_closids")?,
        domains,
    })
}

fn read_l3_mon_info(fs: &dyn ResctrlFs) -> Result<L3MonInfo> {
    Ok(L3MonInfo {
        mon_features: read_lines(fs, "info/L3_MON/mon_features")?,
        num_rmids: read_value(fs, "info/L3_MON/num_rmids")?,
    })
}

impl ResctrlInfo {
    /// Read the capabilities of the resctrl fs behind `fs`. Resources whose
    /// info files are missing are reported as unsupported.
    pub fn read(fs: &dyn ResctrlFs) -> Result<ResctrlInfo> {
        let schemata = wrap(fs.read_file(Path::new("schemata")))?.unwrap_or_default();
        let mut domains = parse_schemata_domains(&fs.root().join("schemata"), &schemata)?;
        let mut domains_of = |res: &str| domains.remove(res).unwrap_or_default();
        Ok(ResctrlInfo {
            l3: wrap(read_l3_info(fs, domains_of("L3")))?,
            mb: wrap(read_mb_info(fs, domains_of("MB")))?,
            l3_mon: wrap(read_l3_mon_info(fs))?,
        })
    }
}
