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

use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::path::Path;
use std::path::PathBuf;

use crate::Error;
use crate::Result;

pub const DEFAULT_MOUNTS_FILE: &str = "/proc/mounts";

/// Mount option enabling Code and Data Prioritization on L3.
pub const MOUNT_OPT_CDP: &str = "cdp";
/// Mount option switching MB schemata to MBps instead of percentages.
pub const MOUNT_OPT_MBA_MBPS: &str = "mba_MBps";

/// A resctrl mount point and its options.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct MountInfo {
    pub path: PathBuf,
    pub options: Vec<String>,
}

impl MountInfo {
    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }
}

/// Undo the octal escaping /proc/mounts applies to whitespace and
/// backslashes in paths, e.g. "\040" for a space.
fn unescape_mount_path(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escaped = bytes[i] == b'\\'
            && i + 3 < bytes.len()
            && bytes[i + 1..i + 4].iter().all(|b| (b'0'..=b'7').contains(b));
        if escaped {
            let code = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + (b - b'0') as u32);
            out.push(code as u8);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the first resctrl mount listed in a file of /proc/mounts format.
pub fn find_mount(mounts_file: &Path) -> Result<MountInfo> {
    let file =
        File::open(mounts_file).map_err(|e| Error::IoError(mounts_file.to_path_buf(), e))?;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| Error::IoError(mounts_file.to_path_buf(), e))?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[2] != "resctrl" {
            continue;
        }
        return Ok(MountInfo {
            path: unescape_mount_path(fields[1]).into(),
            options: fields[3].split(',').map(str::to_owned).collect(),
        });
    }
    Err(Error::NoMount(mounts_file.to_path_buf()))
}
