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
use std::fs::create_dir_all;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use common::logutil::discard_logger;
use resctrlfs::ResctrlDir;
use tempfile::TempDir;

use crate::*;

mod fake_fs;

const PREFIX: &str = "rdt.";

/// Partitions and classes used throughout the tests, on a system with 20
/// cache ways per L3 domain.
const SAMPLE_CONFIG: &str = r#"
[options.l3]
optional = false
[options.mb]
optional = false

[partitions.priority]
l3_allocation = "60%"
mb_allocation = "100%"
[partitions.priority.classes.Guaranteed]
l3_schema = "100%"

[partitions.default]
l3_allocation = "40%"
mb_allocation = "100%"
[partitions.default.classes.Burstable]
l3_schema = "100%"
mb_schema = "66%"
[partitions.default.classes.BestEffort]
l3_schema = "66%"
mb_schema = "33%"
"#;

fn sample_config() -> config::Config {
    config::Config::from_toml_str(SAMPLE_CONFIG).expect("Failed to parse sample config")
}

fn config_from(s: &str) -> config::Config {
    config::Config::from_toml_str(s).expect("Failed to parse config")
}

/// A copy of a resctrl hierarchy in a temporary directory.
struct TestResctrlfs {
    tempdir: TempDir,
}

impl TestResctrlfs {
    fn new() -> TestResctrlfs {
        let tempdir = TempDir::new().expect("Failed to create tempdir");
        TestResctrlfs { tempdir }
    }

    fn path(&self) -> PathBuf {
        self.tempdir.path().to_path_buf()
    }

    fn create_child_dir<P: AsRef<Path>>(&self, p: P) -> PathBuf {
        let path = self.path().join(p);
        create_dir_all(&path)
            .unwrap_or_else(|_| panic!("Failed to create child dir {}", path.display()));
        path
    }

    fn create_file_with_content<P: AsRef<Path>>(&self, p: P, content: &str) {
        let path = self.path().join(p);
        create_dir_all(path.parent().unwrap()).unwrap();
        let mut file =
            File::create(&path).unwrap_or_else(|_| panic!("Failed to create {}", path.display()));
        file.write_all(content.as_bytes())
            .unwrap_or_else(|_| panic!("Failed to write to {}", path.display()));
    }

    fn read_content<P: AsRef<Path>>(&self, p: P) -> String {
        std::fs::read_to_string(self.path().join(p)).expect("Failed to read file")
    }

    fn exists<P: AsRef<Path>>(&self, p: P) -> bool {
        self.path().join(p).exists()
    }

    /// Info directory of a 4 domain system with 20 bit CBMs, MB and L3
    /// monitoring.
    fn initialize(&self) {
        self.initialize_info();
        self.create_file_with_content(
            "info/L3_MON/mon_features",
            "llc_occupancy\nmbm_total_bytes\nmbm_local_bytes\n",
        );
        self.create_file_with_content("info/L3_MON/num_rmids", "176\n");
    }

    /// Same as `initialize()` without monitoring support.
    fn initialize_info(&self) {
        self.create_file_with_content(
            "schemata",
            "    L3:0=fffff;1=fffff;2=fffff;3=fffff\n    MB:0=100;1=100;2=100;3=100\n",
        );
        self.create_file_with_content("info/L3/cbm_mask", "fffff\n");
        self.create_file_with_content("info/L3/min_cbm_bits", "1\n");
        self.create_file_with_content("info/L3/num_closids", "16\n");
        self.create_file_with_content("info/MB/min_bandwidth", "10\n");
        self.create_file_with_content("info/MB/bandwidth_gran", "10\n");
        self.create_file_with_content("info/MB/num_closids", "8\n");
    }

    /// Groups left behind by an earlier process, plus a group owned by
    /// someone else.
    fn create_existing_groups(&self) {
        self.create_child_dir("rdt.Guaranteed/mon_groups/rdt.predefined_group_live");
        self.create_child_dir("rdt.Stale");
        self.create_child_dir("other.Foo/mon_groups/rdt.foreign_mon");
        self.create_child_dir("mon_groups/rdt.root_mon");
        self.create_child_dir("mon_groups/unprefixed");
    }

    /// Counters of monitor group `mon_group` in `class`. Domain N counts
    /// 10 * N + 1, 2 and 3 for llc_occupancy, mbm_local_bytes and
    /// mbm_total_bytes.
    fn create_mon_data(&self, class: &str, mon_group: &str) {
        for domain in 0..4u64 {
            let dir = format!(
                "rdt.{}/mon_groups/rdt.{}/mon_data/mon_L3_{:02}",
                class, mon_group, domain
            );
            for (i, event) in ["llc_occupancy", "mbm_local_bytes", "mbm_total_bytes"]
                .iter()
                .enumerate()
            {
                let value = domain * 10 + i as u64 + 1;
                self.create_file_with_content(
                    format!("{}/{}", dir, event),
                    &format!("{}\n", value),
                );
            }
        }
    }

    fn fs(&self) -> Arc<dyn resctrlfs::ResctrlFs> {
        Arc::new(
            ResctrlDir::new(self.path(), false)
                .expect("Failed to open resctrl dir")
                .recursive_remove(true),
        )
    }

    fn rdt(&self) -> Rdt {
        let mut rdt = Rdt::new(discard_logger());
        rdt.initialize(PREFIX, self.fs())
            .expect("Failed to initialize rdt");
        rdt
    }
}

fn class_names(rdt: &Rdt) -> Vec<&str> {
    rdt.get_classes().iter().map(|c| c.name()).collect()
}

fn mon_group_names(class: &CtrlGroup) -> Vec<&str> {
    class.get_mon_groups().iter().map(|mg| mg.name()).collect()
}
