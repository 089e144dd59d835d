//! Pending, active and completed repairs for one poll.

use crate::blocks::Url;
use crate::peer_id::Id;

use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairSource {
    Peer(Id),
    Publisher,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairStatus {
    Pending,
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairRecord {
    pub url: Url,
    pub source: RepairSource,
    pub status: RepairStatus,
}

/// Owned by the poll session; populated by tally verdicts, drained as
/// repairs complete. The whole queue serializes into the poll checkpoint so
/// outstanding repairs survive a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairQueue {
    pending: VecDeque<RepairRecord>,
    active: Vec<RepairRecord>,
    finished: Vec<RepairRecord>,
    /// Maximum simultaneously active repairs; 0 disables repairs, negative
    /// means unlimited.
    max_repairs: i64,
}

impl RepairQueue {
    pub fn new(max_repairs: i64) -> Self {
        RepairQueue { pending: VecDeque::new(), active: vec![], finished: vec![], max_repairs }
    }

    /// Queues a repair unless repairs are disabled or the URL is already
    /// tracked.
    pub fn offer(&mut self, url: Url, source: RepairSource) -> bool {
        if self.max_repairs == 0 {
            return false;
        }
        if self.contains(&url) {
            return false;
        }
        self.pending.push_back(RepairRecord { url, source, status: RepairStatus::Pending });
        true
    }

    fn contains(&self, url: &Url) -> bool {
        self.pending.iter().chain(self.active.iter()).chain(self.finished.iter())
            .any(|r| &r.url == url)
    }

    /// Moves the next pending repair to active, respecting the outstanding
    /// cap.
    pub fn start_next(&mut self) -> Option<RepairRecord> {
        if self.max_repairs > 0 && self.active.len() >= self.max_repairs as usize {
            return None;
        }
        let mut record = self.pending.pop_front()?;
        record.status = RepairStatus::Active;
        self.active.push(record.clone());
        Some(record)
    }

    pub fn active_source(&self, url: &Url) -> Option<RepairSource> {
        self.active.iter().find(|r| &r.url == url).map(|r| r.source)
    }

    pub fn complete(&mut self, url: &Url) {
        self.finish(url, RepairStatus::Completed)
    }

    pub fn fail(&mut self, url: &Url) {
        self.finish(url, RepairStatus::Failed)
    }

    fn finish(&mut self, url: &Url, status: RepairStatus) {
        if let Some(pos) = self.active.iter().position(|r| &r.url == url) {
            let mut record = self.active.remove(pos);
            record.status = status;
            self.finished.push(record);
        }
    }

    /// Moves active repairs back to pending, used when a restored poll must
    /// re-dispatch requests that were in flight at the crash.
    pub fn reset_active(&mut self) {
        while let Some(mut record) = self.active.pop() {
            record.status = RepairStatus::Pending;
            self.pending.push_front(record);
        }
    }

    /// Repairs not yet finished (pending or active).
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    pub fn completed(&self) -> Vec<&RepairRecord> {
        self.finished.iter().filter(|r| r.status == RepairStatus::Completed).collect()
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }
}
