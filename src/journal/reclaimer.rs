//! Live-record accounting that decides which journal files can be reused.
//!
//! Each data file (keyed by sequence) counts its live positive records: adds,
//! updates, and records pinned by transactions that have not completed. A file
//! also remembers the files it depends on. A DELETE depends on every file still
//! holding a positive of the deleted id, and a COMMIT or ROLLBACK depends on
//! every file holding records of its transaction. Replaying a negative without
//! its positives is harmless; the reverse would resurrect dead records.

use std::collections::{BTreeMap, BTreeSet, HashMap};

#[derive(Debug, Default, Clone)]
struct FileUsage {
    live: usize,
    deps: BTreeSet<u64>,
}

#[derive(Debug, Default)]
pub(crate) struct ReclaimTracker {
    files: BTreeMap<u64, FileUsage>,
    /// Record id → sequences of the files holding its add and updates.
    positives: HashMap<u64, Vec<u64>>,
}

impl ReclaimTracker {
    pub fn add_file(&mut self, seq: u64) {
        self.files.entry(seq).or_default();
    }

    pub fn remove_file(&mut self, seq: u64) {
        self.files.remove(&seq);
    }

    pub fn contains_record(&self, id: u64) -> bool {
        self.positives.contains_key(&id)
    }

    pub fn record_count(&self) -> usize {
        self.positives.len()
    }

    pub fn live_in(&self, seq: u64) -> usize {
        self.files.get(&seq).map_or(0, |f| f.live)
    }

    pub fn pin(&mut self, seq: u64) {
        self.files.entry(seq).or_default().live += 1;
    }

    pub fn unpin(&mut self, seq: u64) {
        if let Some(file) = self.files.get_mut(&seq) {
            file.live = file.live.saturating_sub(1);
        }
    }

    pub fn add_dependency(&mut self, from: u64, to: u64) {
        if from == to {
            return;
        }
        self.files.entry(from).or_default().deps.insert(to);
    }

    pub fn add_record(&mut self, id: u64, seq: u64) {
        self.pin(seq);
        self.positives.entry(id).or_default().push(seq);
    }

    /// Returns false when the id is unknown.
    pub fn update_record(&mut self, id: u64, seq: u64) -> bool {
        match self.positives.get_mut(&id) {
            Some(files) => {
                files.push(seq);
                self.pin(seq);
                true
            }
            None => false,
        }
    }

    /// Drops every positive of `id`; the file holding the delete now depends on
    /// each file that held one. Returns false when the id is unknown.
    pub fn delete_record(&mut self, id: u64, delete_seq: u64) -> bool {
        let Some(files) = self.positives.remove(&id) else {
            return false;
        };
        for seq in files {
            self.unpin(seq);
            self.add_dependency(delete_seq, seq);
        }
        true
    }

    /// Files that can be released, in ascending order.
    ///
    /// A file qualifies when it is not `current`, holds no live positives, and
    /// every file it depends on is either gone or also qualifies.
    pub fn reclaimable(&self, current: Option<u64>) -> Vec<u64> {
        let mut chosen: BTreeSet<u64> = BTreeSet::new();
        loop {
            let before = chosen.len();
            for (&seq, usage) in &self.files {
                if chosen.contains(&seq) || Some(seq) == current || usage.live > 0 {
                    continue;
                }
                let deps_clear = usage
                    .deps
                    .iter()
                    .all(|dep| !self.files.contains_key(dep) || chosen.contains(dep));
                if deps_clear {
                    chosen.insert(seq);
                }
            }
            if chosen.len() == before {
                break;
            }
        }
        chosen.into_iter().collect()
    }
}
