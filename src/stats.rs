//! Kernel same-page merging counters, as exposed under `/sys/kernel/mm/ksm`.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs;
use std::path::Path;

use anyhow::Context;
use glob::glob;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

pub const KSM_SYSFS_DIR: &str = "/sys/kernel/mm/ksm";

/// Snapshot of every numeric KSM counter.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct KsmStats {
    counters: BTreeMap<String, i64>,
}

impl Display for KsmStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        for (name, value) in self.counters.iter() {
            writeln!(f, "{}: {}", name, value.to_formatted_string(&Locale::en))?;
        }
        Ok(())
    }
}

impl KsmStats {
    /// Read the counters of the running kernel.
    pub fn read() -> Result<Self, anyhow::Error> {
        Self::read_from(Path::new(KSM_SYSFS_DIR))
    }

    /// Read every file in `dir` that holds a single integer.  Unreadable or non-numeric
    /// files are skipped.
    pub fn read_from(dir: &Path) -> Result<Self, anyhow::Error> {
        if !dir.is_dir() {
            anyhow::bail!("{} not found, is the kernel built with KSM?", dir.display());
        }
        let wildcard = format!("{}/*", dir.display());
        let mut counters = BTreeMap::new();
        for path in glob(wildcard.as_str()).context("invalid KSM directory")? {
            let path = path?;
            let value = match fs::read_to_string(&path) {
                Ok(contents) => match contents.trim().parse::<i64>() {
                    Ok(value) => value,
                    Err(_) => continue,
                },
                Err(_) => continue,
            };
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                counters.insert(name.to_owned(), value);
            }
        }
        Ok(KsmStats { counters })
    }

    pub fn get(&self, counter: &str) -> Option<i64> {
        self.counters.get(counter).copied()
    }

    /// Whether the merging daemon is scanning.
    pub fn is_running(&self) -> bool {
        self.get("run") == Some(1)
    }

    /// Memory currently saved by merging, in bytes.
    pub fn saved_bytes(&self, page_size: usize) -> Option<i64> {
        self.get("pages_sharing")
            .map(|pages| pages.saturating_mul(page_size as i64))
    }

    pub fn to_yaml(&self) -> Result<String, anyhow::Error> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::process;

    fn fake_sysfs(name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("ksmp-{}-{}", name, process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        for (file, contents) in files {
            fs::write(dir.join(file), contents).unwrap();
        }
        dir
    }

    #[test]
    fn reads_numeric_counters() {
        let dir = fake_sysfs(
            "numeric",
            &[
                ("run", "1\n"),
                ("pages_sharing", "1234567\n"),
                ("general_profit", "-4096\n"),
                ("merge_across_nodes", "1\n"),
                ("advisor_mode", "[none] scan-time\n"),
            ],
        );
        let stats = KsmStats::read_from(&dir).unwrap();
        assert!(stats.is_running());
        assert_eq!(stats.get("pages_sharing"), Some(1_234_567));
        assert_eq!(stats.get("general_profit"), Some(-4096));
        assert_eq!(stats.get("advisor_mode"), None);
        assert_eq!(stats.saved_bytes(4096), Some(1_234_567 * 4096));
        assert!(stats.to_string().contains("pages_sharing: 1,234,567"));
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn stopped_daemon() {
        let dir = fake_sysfs("stopped", &[("run", "0\n")]);
        let stats = KsmStats::read_from(&dir).unwrap();
        assert!(!stats.is_running());
        assert_eq!(stats.saved_bytes(4096), None);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn yaml_keeps_every_counter() {
        let dir = fake_sysfs("yaml", &[("run", "1"), ("pages_shared", "42")]);
        let stats = KsmStats::read_from(&dir).unwrap();
        let yaml = stats.to_yaml().unwrap();
        let parsed: KsmStats = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, stats);
        fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn missing_directory_is_an_error() {
        assert!(KsmStats::read_from(Path::new("/nonexistent/ksm")).is_err());
    }
}
