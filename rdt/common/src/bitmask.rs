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

//! Cache bitmask representation and parsing utilities.
//!
//! This module provides the [`Bitmask`] type used for cache bitmasks (CBMs).
//! A bitmask has two textual forms: the compact range list ("0-3,5,7") and
//! the hexadecimal form the kernel uses in resctrl schemata ("af").

use std::collections::BTreeSet;
use std::ops::RangeInclusive;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Number of bits a [`Bitmask`] can hold.
pub const BITMASK_WIDTH: u32 = u64::BITS;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BitmaskError {
    #[error("Invalid token {1:?} in list {0:?}")]
    InvalidToken(String, String),
    #[error("Invalid range {1:?} in list {0:?}")]
    InvalidRange(String, String),
    #[error("Index {1} out of range in list {0:?}")]
    OutOfRange(String, u64),
    #[error("Invalid hex bitmask: {0:?}")]
    InvalidHex(String),
}

pub type Result<T> = std::result::Result<T, BitmaskError>;

/// A 64-bit set of bits where bit `i` stands for cache way `i`.
#[derive(
    Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize
)]
pub struct Bitmask(pub u64);

impl Bitmask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contiguous mask of `width` bits starting at bit `lsb`. Bits falling
    /// beyond [`BITMASK_WIDTH`] are dropped.
    pub fn from_range(lsb: u32, width: u32) -> Self {
        if width == 0 || lsb >= BITMASK_WIDTH {
            return Bitmask(0);
        }
        let ones = if width >= BITMASK_WIDTH {
            u64::MAX
        } else {
            (1u64 << width) - 1
        };
        Bitmask(ones << lsb)
    }

    /// Parse a range list such as "0-3,5". The empty string is the empty mask.
    pub fn from_range_list(s: &str) -> Result<Self> {
        let mut mask = 0u64;
        for_each_range(s, |range| {
            mask |= Self::from_range(*range.start(), range.end() - range.start() + 1).0
        })?;
        Ok(Bitmask(mask))
    }

    /// Parse the kernel's hex form, with or without a "0x" prefix.
    pub fn from_hex(s: &str) -> Result<Self> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.is_empty() {
            return Err(BitmaskError::InvalidHex(s.to_owned()));
        }
        u64::from_str_radix(digits, 16)
            .map(Bitmask)
            .map_err(|_| BitmaskError::InvalidHex(s.to_owned()))
    }

    /// Canonical range list: sorted, consecutive indices collapsed.
    pub fn range_list(&self) -> String {
        self.to_string()
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn count_ones(&self) -> u32 {
        self.0.count_ones()
    }

    /// Index of the lowest set bit.
    pub fn lsb_one(&self) -> Option<u32> {
        (!self.is_empty()).then(|| self.0.trailing_zeros())
    }

    /// Index of the highest set bit.
    pub fn msb_one(&self) -> Option<u32> {
        (!self.is_empty()).then(|| BITMASK_WIDTH - 1 - self.0.leading_zeros())
    }

    /// Set bit indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = u32> + '_ {
        (0..BITMASK_WIDTH).filter(move |i| self.0 & (1u64 << i) != 0)
    }
}

/// Parse a range list into the ascending, deduplicated list of indices it
/// names. Same grammar and failure modes as [`Bitmask::from_range_list`].
pub fn list_to_indices(s: &str) -> Result<Vec<u32>> {
    let mut indices = BTreeSet::new();
    for_each_range(s, |range| indices.extend(range))?;
    Ok(indices.into_iter().collect())
}

fn parse_index(list: &str, s: &str) -> Result<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BitmaskError::InvalidToken(list.to_owned(), s.to_owned()));
    }
    let index: u64 = s
        .parse()
        .map_err(|_| BitmaskError::InvalidToken(list.to_owned(), s.to_owned()))?;
    if index >= BITMASK_WIDTH as u64 {
        return Err(BitmaskError::OutOfRange(list.to_owned(), index));
    }
    Ok(index as u32)
}

/// Parse a single list token, either "x" or "lo-hi" with lo < hi.
fn parse_range(list: &str, s: &str) -> Result<RangeInclusive<u32>> {
    match s.split_once('-') {
        Some((lo, hi)) => {
            let lo = parse_index(list, lo)?;
            let hi = parse_index(list, hi)?;
            if lo >= hi {
                return Err(BitmaskError::InvalidRange(list.to_owned(), s.to_owned()));
            }
            Ok(lo..=hi)
        }
        None => {
            let index = parse_index(list, s)?;
            Ok(index..=index)
        }
    }
}

fn for_each_range<F>(s: &str, mut f: F) -> Result<()>
where
    F: FnMut(RangeInclusive<u32>),
{
    if s.is_empty() {
        return Ok(());
    }
    for token in s.split(',') {
        f(parse_range(s, token)?);
    }
    Ok(())
}

impl FromStr for Bitmask {
    type Err = BitmaskError;
    fn from_str(s: &str) -> Result<Self> {
        Self::from_range_list(s)
    }
}

impl std::fmt::Display for Bitmask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut rest = self.0;
        let mut first = true;
        while rest != 0 {
            let lo = rest.trailing_zeros();
            let run = (rest >> lo).trailing_ones();
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if run == 1 {
                write!(f, "{lo}")?;
            } else {
                write!(f, "{}-{}", lo, lo + run - 1)?;
            }
            rest &= !Self::from_range(lo, run).0;
        }
        Ok(())
    }
}

impl std::fmt::LowerHex for Bitmask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}
