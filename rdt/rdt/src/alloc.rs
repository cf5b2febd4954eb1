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

use common::Bitmask;
use resctrlfs::L3Info;
use resctrlfs::MbInfo;
use resctrlfs::ResctrlInfo;

use crate::Error;
use crate::Result;
use crate::validate::NormalizedConfig;
use crate::validate::NormalizedPartition;

/// Concrete allocation of one control group, per domain id.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct Schema {
    pub l3: BTreeMap<u64, Bitmask>,
    pub mb: BTreeMap<u64, u64>,
}

impl Schema {
    pub fn is_empty(&self) -> bool {
        self.l3.is_empty() && self.mb.is_empty()
    }
}

fn fmt_line<V>(
    f: &mut std::fmt::Formatter<'_>,
    resource: &str,
    values: &BTreeMap<u64, V>,
    fmt_value: fn(&V) -> String,
) -> std::fmt::Result {
    if values.is_empty() {
        return Ok(());
    }
    write!(f, "{}:", resource)?;
    for (i, (domain, value)) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ";")?;
        }
        write!(f, "{}={}", domain, fmt_value(value))?;
    }
    writeln!(f)
}

/// Renders the content of a schemata file, e.g.
/// "L3:0=fff00;1=fff00\nMB:0=100;1=100\n".
impl std::fmt::Display for Schema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt_line(f, "L3", &self.l3, |cbm| format!("{:x}", cbm))?;
        fmt_line(f, "MB", &self.mb, |pct| pct.to_string())
    }
}

/// `pct` percent of `total`, rounded half up.
fn pct_of(pct: u64, total: u64) -> u64 {
    (pct * total + 50) / 100
}

/// Carve the cache ways of domain number `idx` into one block per
/// partition, lowest bits to the first partition by name. Block bounds
/// follow the running percentage total, so partitions adding up to 100%
/// always fill the ways exactly. Returns the (lsb, width) of each block
/// relative to the lowest allocatable way.
fn partition_blocks(
    l3: &L3Info,
    domain: u64,
    idx: usize,
    partitions: &[NormalizedPartition],
) -> Result<Vec<(u32, u32)>> {
    let cbm_bits = l3.cbm_bits();
    let min_width = l3.min_cbm_bits.max(1);
    let mut total = 0;
    let mut next = 0;
    let mut blocks = Vec::with_capacity(partitions.len());
    for partition in partitions {
        let lsb = (pct_of(total, cbm_bits as u64) as u32).max(next);
        total += partition.l3[idx];
        let end = (pct_of(total, cbm_bits as u64) as u32).max(lsb);
        let width = (end - lsb).max(min_width);
        if lsb + width > cbm_bits {
            return Err(Error::Config(format!(
                "L3 partitions do not fit in the {} cache ways of domain {} (partition {} needs {} from way {})",
                cbm_bits, domain, partition.name, width, lsb
            )));
        }
        blocks.push((lsb, width));
        next = lsb + width;
    }
    Ok(blocks)
}

/// CBM of a class taking `pct` percent of a partition block. Classes of a
/// partition share the low end of its block, so siblings overlap.
fn class_cbm(l3: &L3Info, class: &str, block: (u32, u32), pct: u64) -> Result<Bitmask> {
    let (block_lsb, block_width) = block;
    let mut width = ((pct - 1) * block_width as u64 / 100) as u32 + 1;
    if width < l3.min_cbm_bits {
        if l3.min_cbm_bits > block_width {
            return Err(Error::Config(format!(
                "L3 schema of class {} needs at least {} cache ways, partition has {}",
                class, l3.min_cbm_bits, block_width
            )));
        }
        width = l3.min_cbm_bits;
    }
    let base = l3.cbm_mask.lsb_one().unwrap_or(0);
    Ok(Bitmask::from_range(base + block_lsb, width))
}

fn compute_l3(
    config: &NormalizedConfig,
    l3: &L3Info,
    domains: &[u64],
    schemas: &mut BTreeMap<String, Schema>,
) -> Result<()> {
    for (idx, &domain) in domains.iter().enumerate() {
        let blocks = partition_blocks(l3, domain, idx, &config.partitions)?;
        for (partition, block) in config.partitions.iter().zip(blocks) {
            for class in &partition.classes {
                let cbm = class_cbm(l3, &class.name, block, class.l3[idx])?;
                schemas
                    .entry(class.name.clone())
                    .or_default()
                    .l3
                    .insert(domain, cbm);
            }
        }
    }
    Ok(())
}

fn compute_mb(
    config: &NormalizedConfig,
    mb: &MbInfo,
    domains: &[u64],
    schemas: &mut BTreeMap<String, Schema>,
) {
    for (idx, &domain) in domains.iter().enumerate() {
        for partition in &config.partitions {
            for class in &partition.classes {
                let pct = pct_of(partition.mb[idx], class.mb[idx]).max(mb.min_bandwidth);
                schemas
                    .entry(class.name.clone())
                    .or_default()
                    .mb
                    .insert(domain, pct);
            }
        }
    }
}

/// Compute the schema of every configured class.
pub fn compute_schemas(
    config: &NormalizedConfig,
    info: &ResctrlInfo,
) -> Result<BTreeMap<String, Schema>> {
    let mut schemas: BTreeMap<String, Schema> = config
        .partitions
        .iter()
        .flat_map(|p| &p.classes)
        .map(|c| (c.name.clone(), Schema::default()))
        .collect();

    if let (Some(domains), Some(l3)) = (&config.l3_domains, &info.l3) {
        compute_l3(config, l3, domains, &mut schemas)?;
    }
    if let (Some(domains), Some(mb)) = (&config.mb_domains, &info.mb) {
        compute_mb(config, mb, domains, &mut schemas);
    }
    Ok(schemas)
}
