use super::{finish, put_f32, put_i32, take_f32, take_i32, CodecError, JobId};
use super::reduce::Reducible;
use std::collections::BTreeMap;

/// Point update about one job: demand and priority at a given epoch.
/// Termination is encoded as `demand == 0 && priority == 0` at a fresh epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub job_id: JobId,
    pub epoch: i32,
    pub demand: i32,
    pub priority: f32,
}

impl Event {
    pub fn dominates(&self, other: &Event) -> bool {
        self.epoch > other.epoch
    }

    pub fn is_zero(&self) -> bool {
        self.demand == 0 && self.priority <= 0.0
    }
}

/// Dominance-maximal record of the latest event per job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventMap {
    entries: BTreeMap<JobId, Event>,
}

impl EventMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &BTreeMap<JobId, Event> {
        &self.entries
    }

    pub fn get(&self, job_id: JobId) -> Option<&Event> {
        self.entries.get(&job_id)
    }

    /// Insert unless an event of the same job with an equal or newer epoch
    /// (or identical payload) is already present.
    pub fn insert_if_novel(&mut self, ev: Event) -> bool {
        if ev.epoch < 0 {
            return false;
        }
        match self.entries.get(&ev.job_id) {
            Some(existing)
                if !ev.dominates(existing)
                    || (ev.demand == existing.demand && ev.priority == existing.priority) =>
            {
                false
            }
            _ => {
                self.entries.insert(ev.job_id, ev);
                true
            }
        }
    }

    /// Point-wise dominance merge; reports whether anything changed.
    pub fn update_by(&mut self, other: &EventMap) -> bool {
        let mut change = false;
        for ev in other.entries.values() {
            change |= self.insert_if_novel(*ev);
        }
        change
    }

    /// Drop entries already reflected (same or newer epoch) in `other`.
    pub fn filter_by(&mut self, other: &EventMap) {
        self.entries.retain(|job_id, ev| match other.entries.get(job_id) {
            Some(other_ev) => other_ev.epoch < ev.epoch,
            None => true,
        });
    }

    /// Remove termination markers; returns the affected job ids.
    pub fn remove_old_zeros(&mut self) -> Vec<JobId> {
        let removed: Vec<JobId> = self
            .entries
            .values()
            .filter(|ev| ev.is_zero())
            .map(|ev| ev.job_id)
            .collect();
        for job_id in &removed {
            self.entries.remove(job_id);
        }
        removed
    }
}

impl Reducible for EventMap {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.entries.len() * 16);
        for ev in self.entries.values() {
            put_i32(&mut buf, ev.job_id);
            put_i32(&mut buf, ev.epoch);
            put_i32(&mut buf, ev.demand);
            put_f32(&mut buf, ev.priority);
        }
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut map = EventMap::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let ev = Event {
                job_id: take_i32(bytes, &mut pos)?,
                epoch: take_i32(bytes, &mut pos)?,
                demand: take_i32(bytes, &mut pos)?,
                priority: take_f32(bytes, &mut pos)?,
            };
            map.entries.insert(ev.job_id, ev);
        }
        finish(bytes, pos)?;
        Ok(map)
    }

    fn merge(&mut self, other: &Self) {
        for (job_id, ev) in &other.entries {
            match self.entries.get(job_id) {
                Some(existing) if !ev.dominates(existing) => {}
                _ => {
                    self.entries.insert(*job_id, *ev);
                }
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
