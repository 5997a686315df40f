pub mod cutoff;
pub mod event_driven;

use crate::comm::{LocalFabric, MessageHandle};
use crate::data::reduce::ReduceError;
use crate::data::JobId;
use cutoff::CutoffBalancer;
use event_driven::EventDrivenBalancer;
use std::collections::BTreeMap;

/// One locally-rooted job participating in balancing.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceEntry {
    pub job_id: JobId,
    pub demand: i32,
    pub priority: f32,
}

/// This worker's contribution to a balancing round.
#[derive(Debug, Clone, Default)]
pub struct LocalLoad {
    pub entries: Vec<BalanceEntry>,
    pub busy: bool,
    /// Active jobs rooted here, including ones not yet able to participate.
    pub num_active_jobs: i32,
}

/// The two interchangeable volume-assignment algorithms. The control loop
/// drives whichever variant is active through this surface and never
/// inspects which one it is.
pub enum Balancer {
    Cutoff(CutoffBalancer),
    EventDriven(EventDrivenBalancer),
}

impl Balancer {
    pub fn is_balancing(&self) -> bool {
        match self {
            Self::Cutoff(b) => b.is_balancing(),
            Self::EventDriven(_) => false,
        }
    }

    /// Kick off (or, for the event-driven variant, feed) a balancing
    /// round; returns true when new volumes are already available.
    pub fn begin(
        &mut self,
        load: &LocalLoad,
        fabric: &mut LocalFabric,
        now: f32,
    ) -> Result<bool, ReduceError> {
        match self {
            Self::Cutoff(b) => b.begin(load, fabric),
            Self::EventDriven(b) => b.begin(load, fabric, now),
        }
    }

    /// Feed one balancing-related message; returns true when new volumes
    /// are available.
    pub fn handle_message(
        &mut self,
        handle: MessageHandle,
        fabric: &mut LocalFabric,
    ) -> Result<bool, ReduceError> {
        match self {
            Self::Cutoff(b) => b.handle_message(handle, fabric),
            Self::EventDriven(b) => b.handle_message(handle, fabric),
        }
    }

    pub fn result(&self) -> BTreeMap<JobId, i32> {
        match self {
            Self::Cutoff(b) => b.result(),
            Self::EventDriven(b) => b.result(),
        }
    }

    pub fn volume(&self, job_id: JobId) -> Option<i32> {
        match self {
            Self::Cutoff(b) => b.volume(job_id),
            Self::EventDriven(b) => b.volume(job_id),
        }
    }

    /// Record a volume learned through the job tree.
    pub fn update_volume(&mut self, job_id: JobId, volume: i32) {
        match self {
            Self::Cutoff(b) => b.update_volume(job_id, volume),
            Self::EventDriven(b) => b.update_volume(job_id, volume),
        }
    }

    /// The job terminated here; withdraw it from balancing.
    pub fn forget(
        &mut self,
        job_id: JobId,
        fabric: &mut LocalFabric,
        now: f32,
    ) -> Result<(), ReduceError> {
        match self {
            Self::Cutoff(b) => {
                b.forget(job_id);
                Ok(())
            }
            Self::EventDriven(b) => b.forget(job_id, fabric, now),
        }
    }
}

/// Deterministic local fair-share solver: the largest multiplier of the
/// priorities such that the clamped volumes fit into `total` workers.
/// Every job keeps at least one worker and never exceeds its demand.
pub fn fair_shares(entries: &[BalanceEntry], total: i32) -> BTreeMap<JobId, i32> {
    let mut out = BTreeMap::new();
    if entries.is_empty() || total <= 0 {
        return out;
    }

    let sum_demand: i64 = entries.iter().map(|e| e.demand.max(1) as i64).sum();
    if sum_demand <= total as i64 {
        for e in entries {
            out.insert(e.job_id, e.demand.max(1));
        }
        return out;
    }
    if entries.len() as i64 >= total as i64 {
        for e in entries {
            out.insert(e.job_id, 1);
        }
        return out;
    }

    let volume = |alpha: f64, e: &BalanceEntry| -> i64 {
        ((alpha * e.priority as f64).floor() as i64)
            .max(1)
            .min(e.demand.max(1) as i64)
    };
    let min_priority = entries
        .iter()
        .map(|e| e.priority as f64)
        .fold(f64::INFINITY, f64::min)
        .max(f64::EPSILON);

    let mut lo = 0.0;
    let mut hi = (total as f64 + 1.0) / min_priority;
    for _ in 0..64 {
        let mid = 0.5 * (lo + hi);
        let sum: i64 = entries.iter().map(|e| volume(mid, e)).sum();
        if sum <= total as i64 {
            lo = mid;
        } else {
            hi = mid;
        }
    }

    for e in entries {
        out.insert(e.job_id, volume(lo, e) as i32);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(job_id: JobId, demand: i32, priority: f32) -> BalanceEntry {
        BalanceEntry {
            job_id,
            demand,
            priority,
        }
    }

    #[test]
    fn single_job_takes_the_fleet() {
        let shares = fair_shares(&[entry(1, 4, 1.0)], 2);
        assert_eq!(shares[&1], 2);
    }

    #[test]
    fn volumes_proportional_to_priority() {
        // two jobs, priorities 1:3, four workers
        let shares = fair_shares(&[entry(1, 4, 1.0), entry(2, 4, 3.0)], 4);
        assert_eq!(shares[&1], 1);
        assert_eq!(shares[&2], 3);
    }

    #[test]
    fn demand_caps_the_share() {
        let shares = fair_shares(&[entry(1, 2, 10.0), entry(2, 8, 1.0)], 8);
        assert_eq!(shares[&1], 2);
        assert_eq!(shares[&2], 6);
    }

    #[test]
    fn every_job_keeps_one_worker() {
        let shares = fair_shares(&[entry(1, 4, 100.0), entry(2, 4, 0.001)], 4);
        assert!(shares[&2] >= 1);
        assert!(shares.values().sum::<i32>() <= 4);
    }

    #[test]
    fn never_oversubscribes() {
        for total in 1..=12 {
            let entries = [
                entry(1, 5, 0.3),
                entry(2, 7, 1.7),
                entry(3, 2, 2.9),
                entry(4, 9, 0.9),
            ];
            let shares = fair_shares(&entries, total);
            let sum: i32 = shares.values().sum();
            assert!(
                sum <= total.max(entries.len() as i32),
                "total {total}: sum {sum}"
            );
            assert!(shares.values().all(|&v| v >= 1));
        }
    }

    #[test]
    fn more_jobs_than_workers_degrades_to_ones() {
        let shares = fair_shares(&[entry(1, 3, 1.0), entry(2, 3, 1.0), entry(3, 3, 1.0)], 2);
        assert!(shares.values().all(|&v| v == 1));
    }
}
