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

//! Declarative description of how last level cache ways and memory
//! bandwidth are divided between partitions, and between the classes of
//! each partition. This crate only decodes the shape of a configuration;
//! its semantics are checked when it is applied.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use anyhow::bail;
use serde::Deserialize;
use serde::Serialize;


#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub options: Options,
    pub partitions: BTreeMap<String, Partition>,
}

/// Per resource type options.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Options {
    pub l3: ResourceOptions,
    pub mb: ResourceOptions,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(default)]
pub struct ResourceOptions {
    /// Whether a missing hardware feature is tolerated. A configuration
    /// using a non-optional resource the hardware lacks is rejected.
    pub optional: bool,
}

/// A share of the hardware, divided further between its classes.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Partition {
    pub l3_allocation: Option<Allocation>,
    pub mb_allocation: Option<Allocation>,
    #[serde(default)]
    pub classes: BTreeMap<String, Class>,
}

/// Schema of a class, relative to the allocation of its partition. Unset
/// values mean the whole partition share.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Class {
    pub l3_schema: Option<Allocation>,
    pub mb_schema: Option<Allocation>,
}

/// Either one percentage applied to every hardware domain, or one
/// percentage per domain in ascending domain id order.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Allocation {
    Uniform(Percentage),
    PerDomain(Vec<Percentage>),
}

/// A percentage, written as "60%", "60" or 60.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "PercentageRepr", into = "String")]
pub struct Percentage(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum PercentageRepr {
    Int(u64),
    Str(String),
}

impl TryFrom<PercentageRepr> for Percentage {
    type Error = String;
    fn try_from(repr: PercentageRepr) -> std::result::Result<Self, String> {
        match repr {
            PercentageRepr::Int(v) => Ok(Percentage(v)),
            PercentageRepr::Str(s) => s.parse(),
        }
    }
}

impl FromStr for Percentage {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        s.strip_suffix('%')
            .unwrap_or(s)
            .trim_end()
            .parse()
            .map(Percentage)
            .map_err(|_| format!("Invalid percentage: {:?}", s))
    }
}

impl std::fmt::Display for Percentage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

impl From<Percentage> for String {
    fn from(p: Percentage) -> String {
        p.to_string()
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("{} does not exist or is not a file", path.to_string_lossy());
        }
        let string_config = match fs::read_to_string(path) {
            Ok(sc) => sc,
            Err(e) => {
                bail!(
                    "Failed to read from config file {}: {}",
                    path.to_string_lossy(),
                    e
                );
            }
        };

        match Self::from_toml_str(&string_config) {
            Ok(c) => Ok(c),
            Err(e) => {
                bail!(
                    "Failed to parse config file {}: {}",
                    path.to_string_lossy(),
                    e
                );
            }
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
