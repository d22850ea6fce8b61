//! Directory rollup of deletion decisions.
//!
//! A prefix whose every inventoried blob is deletable is reported as a single
//! unit; anywhere else the decision falls through to the files themselves.
//! Units are for review. The executor still deletes object by object.

use super::PlanEntry;
use std::collections::{BTreeMap, HashMap};

/// A prefix (ending in `/`) or a single blob slated for deletion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionUnit {
    pub path: String,
    pub is_prefix: bool,
    /// Blobs covered
    pub objects: u64,
    pub bytes: u64,
}

#[derive(Default)]
struct PrefixCounts {
    total: u64,
    deletable: u64,
    deletable_bytes: u64,
}

impl PrefixCounts {
    fn uniformly_deletable(&self) -> bool {
        self.total > 0 && self.total == self.deletable
    }
}

/// Every directory prefix of `name`, shortest first: `a/b/c` yields `a/`, `a/b/`
fn ancestors(name: &str) -> impl Iterator<Item = &str> {
    name.match_indices('/').map(move |(i, _)| &name[..=i])
}

/// Deletion units covering exactly the `to_delete` entries, sorted by path
pub fn rollup(entries: &[PlanEntry]) -> Vec<DeletionUnit> {
    let mut counts: HashMap<&str, PrefixCounts> = HashMap::new();
    for entry in entries {
        for prefix in ancestors(entry.name()) {
            let c = counts.entry(prefix).or_default();
            c.total += 1;
            if entry.to_delete {
                c.deletable += 1;
                c.deletable_bytes += entry.blob.size;
            }
        }
    }

    let mut units: BTreeMap<&str, DeletionUnit> = BTreeMap::new();
    for entry in entries.iter().filter(|e| e.to_delete) {
        let covering = ancestors(entry.name())
            .find(|p| counts.get(p).is_some_and(PrefixCounts::uniformly_deletable));

        match covering {
            Some(prefix) => {
                units.entry(prefix).or_insert_with(|| {
                    let c = &counts[prefix];
                    DeletionUnit {
                        path: prefix.to_string(),
                        is_prefix: true,
                        objects: c.deletable,
                        bytes: c.deletable_bytes,
                    }
                });
            }
            None => {
                units.insert(
                    entry.name(),
                    DeletionUnit {
                        path: entry.name().to_string(),
                        is_prefix: false,
                        objects: 1,
                        bytes: entry.blob.size,
                    },
                );
            }
        }
    }

    units.into_values().collect()
}
