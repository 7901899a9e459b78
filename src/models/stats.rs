//! Aggregates reported by the `stats` and `diff` commands.

use serde::{Deserialize, Serialize};

/// Object count and total size of the local root.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct LocalStats {
    pub root: String,
    pub count: u64,
    pub bytes: u64,
}

/// Object count and total size of the replica bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CloudStats {
    pub bucket: String,
    pub count: u64,
    pub bytes: u64,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StatsReport {
    pub local: LocalStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<CloudStats>,
}

/// Paths present in only one of the two tiers.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiffReport {
    pub prefix: String,
    /// Local files with no cloud copy.
    pub missing_remote: Vec<String>,
    /// Cloud objects with no local file.
    pub missing_local: Vec<String>,
}

impl DiffReport {
    /// Merge two lexicographically sorted path lists.
    pub fn compare(prefix: impl Into<String>, local: &[String], remote: &[String]) -> Self {
        let mut report = DiffReport {
            prefix: prefix.into(),
            ..Default::default()
        };
        let (mut i, mut j) = (0, 0);
        while i < local.len() && j < remote.len() {
            match local[i].cmp(&remote[j]) {
                std::cmp::Ordering::Less => {
                    report.missing_remote.push(local[i].clone());
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    report.missing_local.push(remote[j].clone());
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        report.missing_remote.extend_from_slice(&local[i..]);
        report.missing_local.extend_from_slice(&remote[j..]);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn merge_diff_splits_both_sides() {
        let local = paths(&["a.txt", "b/c.txt", "d.txt", "z.txt"]);
        let remote = paths(&["a.txt", "b/x.txt", "d.txt"]);
        let report = DiffReport::compare("", &local, &remote);
        assert_eq!(report.missing_remote, paths(&["b/c.txt", "z.txt"]));
        assert_eq!(report.missing_local, paths(&["b/x.txt"]));
    }

    #[test]
    fn diff_against_empty_side() {
        let report = DiffReport::compare("p", &[], &paths(&["p/1", "p/2"]));
        assert!(report.missing_remote.is_empty());
        assert_eq!(report.missing_local, paths(&["p/1", "p/2"]));
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(DiffReport::compare("", &paths(&["a"]), &[])).unwrap();
        assert_eq!(json["missingRemote"][0], "a");
        assert!(json["missingLocal"].as_array().unwrap().is_empty());
    }
}
