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

use config::Allocation;
use config::Config;
use config::Partition;
use config::Percentage;
use config::ResourceOptions;
use resctrlfs::ResctrlInfo;
use slog::warn;

use crate::Error;
use crate::Result;
use crate::STALE_CLASS_NAME;

/// A configuration with every percentage resolved to one value per
/// hardware domain. Percentage vectors are indexed like the domain list of
/// their resource.
#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct NormalizedConfig {
    /// Domains L3 is programmed on, `None` if L3 is not programmed.
    pub l3_domains: Option<Vec<u64>>,
    /// Domains MB is programmed on, `None` if MB is not programmed.
    pub mb_domains: Option<Vec<u64>>,
    /// Sorted by name.
    pub partitions: Vec<NormalizedPartition>,
}

#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct NormalizedPartition {
    pub name: String,
    pub l3: Vec<u64>,
    pub mb: Vec<u64>,
    /// Sorted by name.
    pub classes: Vec<NormalizedClass>,
}

#[derive(Default, Clone, PartialEq, Eq, Debug)]
pub struct NormalizedClass {
    pub name: String,
    /// Share of the partition's L3 allocation.
    pub l3: Vec<u64>,
    /// Share of the partition's MB allocation.
    pub mb: Vec<u64>,
}

/// Class and monitor group names become directory names.
pub(crate) fn check_group_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::Config(format!("Invalid {} name {:?}", kind, name)));
    }
    Ok(())
}

fn check_percentage(what: &str, pct: Percentage) -> Result<u64> {
    if pct.0 == 0 || pct.0 > 100 {
        return Err(Error::Config(format!(
            "{} must be within (0%, 100%], got {}",
            what, pct
        )));
    }
    Ok(pct.0)
}

/// Decide whether a resource is programmed and on which domains.
fn resource_domains(
    logger: &slog::Logger,
    resource: &str,
    config: &Config,
    allocation: fn(&Partition) -> Option<&Allocation>,
    options: &ResourceOptions,
    hw_domains: Option<&Vec<u64>>,
) -> Result<Option<Vec<u64>>> {
    if !config.partitions.values().any(|p| allocation(p).is_some()) {
        return Ok(None);
    }
    match hw_domains {
        Some(domains) if !domains.is_empty() => Ok(Some(domains.clone())),
        _ if options.optional => {
            warn!(
                logger,
                "{} allocation configured but not supported, ignoring it", resource
            );
            Ok(None)
        }
        _ => Err(Error::Unsupported(format!(
            "{} allocation configured but not supported by the hardware",
            resource
        ))),
    }
}

/// Resolve an allocation to one percentage per domain.
fn resolve_percentages(what: &str, allocation: &Allocation, domains: &[u64]) -> Result<Vec<u64>> {
    match allocation {
        Allocation::Uniform(pct) => Ok(vec![check_percentage(what, *pct)?; domains.len()]),
        Allocation::PerDomain(pcts) => {
            if pcts.len() != domains.len() {
                return Err(Error::Config(format!(
                    "{} lists {} percentages for {} domains",
                    what,
                    pcts.len(),
                    domains.len()
                )));
            }
            pcts.iter()
                .map(|pct| check_percentage(what, *pct))
                .collect()
        }
    }
}

fn resolve_allocation(
    partition: &str,
    field: &str,
    allocation: Option<&Allocation>,
    domains: &[u64],
) -> Result<Vec<u64>> {
    let what = format!("{} of partition {}", field, partition);
    match allocation {
        None => Err(Error::Config(format!("{} missing", what))),
        Some(allocation) => resolve_percentages(&what, allocation, domains),
    }
}

/// Resolve a class schema, the whole partition share if unset. Schemas of
/// a resource that is not programmed are only range checked.
fn resolve_schema(
    partition: &str,
    class: &str,
    field: &str,
    schema: Option<&Allocation>,
    domains: Option<&Vec<u64>>,
) -> Result<Vec<u64>> {
    let what = format!("{} of class {} in partition {}", field, class, partition);
    let schema = schema
        .cloned()
        .unwrap_or(Allocation::Uniform(Percentage(100)));
    match (domains, &schema) {
        (Some(domains), _) => resolve_percentages(&what, &schema, domains),
        (None, Allocation::Uniform(pct)) => check_percentage(&what, *pct).map(|_| Vec::new()),
        (None, Allocation::PerDomain(pcts)) => {
            for pct in pcts {
                check_percentage(&what, *pct)?;
            }
            Ok(Vec::new())
        }
    }
}

fn check_overcommit(
    resource: &str,
    domains: Option<&Vec<u64>>,
    partitions: &[NormalizedPartition],
    pcts: fn(&NormalizedPartition) -> &Vec<u64>,
) -> Result<()> {
    for (idx, domain) in domains.into_iter().flatten().enumerate() {
        let total: u64 = partitions.iter().map(|p| pcts(p)[idx]).sum();
        if total > 100 {
            return Err(Error::Config(format!(
                "{} of domain {} overcommitted: partitions allocate {}%",
                resource, domain, total
            )));
        }
    }
    Ok(())
}

/// Check the semantics of `config` against the hardware described by
/// `info` and resolve it to per-domain percentages.
pub fn validate(
    logger: &slog::Logger,
    config: &Config,
    info: &ResctrlInfo,
) -> Result<NormalizedConfig> {
    let l3_domains = resource_domains(
        logger,
        "L3",
        config,
        |p| p.l3_allocation.as_ref(),
        &config.options.l3,
        info.l3.as_ref().map(|l3| &l3.domains),
    )?;
    let mb_domains = resource_domains(
        logger,
        "MB",
        config,
        |p| p.mb_allocation.as_ref(),
        &config.options.mb,
        info.mb.as_ref().map(|mb| &mb.domains),
    )?;

    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    let mut partitions = Vec::with_capacity(config.partitions.len());
    for (name, partition) in &config.partitions {
        let l3 = match &l3_domains {
            Some(domains) => resolve_allocation(
                name,
                "l3_allocation",
                partition.l3_allocation.as_ref(),
                domains,
            )?,
            None => Vec::new(),
        };
        let mb = match &mb_domains {
            Some(domains) => resolve_allocation(
                name,
                "mb_allocation",
                partition.mb_allocation.as_ref(),
                domains,
            )?,
            None => Vec::new(),
        };

        let mut classes = Vec::with_capacity(partition.classes.len());
        for (class_name, class) in &partition.classes {
            check_group_name("class", class_name)?;
            if class_name == STALE_CLASS_NAME {
                return Err(Error::Config(format!(
                    "Class name {} is reserved",
                    STALE_CLASS_NAME
                )));
            }
            if let Some(other) = owners.insert(class_name, name) {
                return Err(Error::Config(format!(
                    "Class {} defined in partitions {} and {}",
                    class_name, other, name
                )));
            }
            classes.push(NormalizedClass {
                name: class_name.clone(),
                l3: resolve_schema(
                    name,
                    class_name,
                    "l3_schema",
                    class.l3_schema.as_ref(),
                    l3_domains.as_ref(),
                )?,
                mb: resolve_schema(
                    name,
                    class_name,
                    "mb_schema",
                    class.mb_schema.as_ref(),
                    mb_domains.as_ref(),
                )?,
            });
        }

        partitions.push(NormalizedPartition {
            name: name.clone(),
            l3,
            mb,
            classes,
        });
    }

    // MB percentages are throttling ceilings rather than exclusive shares;
    // partitions may each be granted the full bandwidth.
    check_overcommit("L3", l3_domains.as_ref(), &partitions, |p| &p.l3)?;

    Ok(NormalizedConfig {
        l3_domains,
        mb_domains,
        partitions,
    })
}
