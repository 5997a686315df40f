//! Synchronous cutoff-priority balancer.
//!
//! Every balance period the fleet computes one volume assignment in lock
//! step: (1) all-reduce of the aggregated weighted demand, (2) local
//! fractional fair shares, (3) all-reduce of a per-priority resource
//! histogram to settle how far each priority bucket is served, (4) global
//! rounding of the fractional remainders, by default through a bisection
//! over the merged remainder sequence.

use super::{BalanceEntry, LocalLoad};
use crate::comm::{LocalFabric, MessageHandle};
use crate::config::RoundingMode;
use crate::data::reduce::{ReduceError, Reducible, Reduction, SumVec};
use crate::data::{put_f32, put_f64, take_f32, take_f64, CodecError, JobId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, trace};

/// Remainders below this slack are flushed to zero.
const NEGLIGIBLE_RESOURCES: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Idle,
    DemandReduce,
    DemandBroadcast,
    ResourcesReduce,
    ResourcesBroadcast,
    RemaindersReduce,
    RemaindersBroadcast,
    RoundingReduce,
    RoundingBroadcast,
}

/// Per-priority histogram of unmet demand plus the total of resources
/// already assigned; buckets are sorted by descending priority.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceHistogram {
    pub buckets: Vec<(f32, f64)>,
    pub assigned: f64,
}

impl ResourceHistogram {
    fn add(&mut self, priority: f32, demanded: f64) {
        match self
            .buckets
            .binary_search_by(|(p, _)| priority.partial_cmp(p).expect("priorities are finite"))
        {
            Ok(i) => self.buckets[i].1 += demanded,
            Err(i) => self.buckets.insert(i, (priority, demanded)),
        }
    }
}

impl Reducible for ResourceHistogram {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.buckets.len() * 12);
        put_f64(&mut buf, self.assigned);
        for &(priority, demanded) in &self.buckets {
            put_f32(&mut buf, priority);
            put_f64(&mut buf, demanded);
        }
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let assigned = take_f64(bytes, &mut pos)?;
        let mut buckets = Vec::new();
        while pos < bytes.len() {
            let priority = take_f32(bytes, &mut pos)?;
            let demanded = take_f64(bytes, &mut pos)?;
            buckets.push((priority, demanded));
        }
        Ok(Self { buckets, assigned })
    }

    fn merge(&mut self, other: &Self) {
        self.assigned += other.assigned;
        for &(priority, demanded) in &other.buckets {
            self.add(priority, demanded);
        }
    }

    fn is_empty(&self) -> bool {
        self.buckets.is_empty() && self.assigned == 0.0
    }
}

/// Globally sorted sequence of fractional remainders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemainderSeq {
    pub values: Vec<f64>,
}

impl Reducible for RemainderSeq {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.values.len() * 8);
        for &v in &self.values {
            put_f64(&mut buf, v);
        }
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let mut values = Vec::new();
        while pos < bytes.len() {
            values.push(take_f64(bytes, &mut pos)?);
        }
        Ok(Self { values })
    }

    fn merge(&mut self, other: &Self) {
        self.values.extend_from_slice(&other.values);
        self.values
            .sort_by(|a, b| a.partial_cmp(b).expect("remainders are finite"));
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

pub struct CutoffBalancer {
    rank: usize,
    size: usize,
    load_factor: f32,
    rounding: RoundingMode,

    stage: Stage,
    demands: BTreeMap<JobId, i32>,
    priorities: BTreeMap<JobId, f32>,
    assignments: BTreeMap<JobId, f64>,
    total_avail: f64,

    demand_reduction: Option<Reduction<SumVec>>,
    resources_reduction: Option<Reduction<ResourceHistogram>>,
    remainder_reduction: Option<Reduction<RemainderSeq>>,
    rounding_reduction: Option<Reduction<SumVec>>,
    excluded: BTreeSet<usize>,
    remainders: Vec<f64>,

    lower: usize,
    upper: usize,
    rounding_iterations: u32,
    last_utilization: f64,
    best_remainder_idx: Option<usize>,
    best_utilization: f64,
    best_utilization_diff: f64,

    fresh_result: BTreeMap<JobId, i32>,
    volumes: BTreeMap<JobId, i32>,
    rng: StdRng,
}

impl CutoffBalancer {
    pub fn new(rank: usize, size: usize, load_factor: f32, rounding: RoundingMode) -> Self {
        Self {
            rank,
            size,
            load_factor,
            rounding,
            stage: Stage::Idle,
            demands: BTreeMap::new(),
            priorities: BTreeMap::new(),
            assignments: BTreeMap::new(),
            total_avail: 0.0,
            demand_reduction: None,
            resources_reduction: None,
            remainder_reduction: None,
            rounding_reduction: None,
            excluded: BTreeSet::new(),
            remainders: Vec::new(),
            lower: 0,
            upper: 0,
            rounding_iterations: 0,
            last_utilization: 0.0,
            best_remainder_idx: None,
            best_utilization: 0.0,
            best_utilization_diff: 0.0,
            fresh_result: BTreeMap::new(),
            volumes: BTreeMap::new(),
            rng: StdRng::seed_from_u64(rank as u64),
        }
    }

    pub fn is_balancing(&self) -> bool {
        self.stage != Stage::Idle
    }

    pub fn volume(&self, job_id: JobId) -> Option<i32> {
        self.volumes.get(&job_id).copied()
    }

    pub fn update_volume(&mut self, job_id: JobId, volume: i32) {
        if volume <= 0 {
            self.volumes.remove(&job_id);
        } else {
            self.volumes.insert(job_id, volume);
        }
    }

    pub fn forget(&mut self, job_id: JobId) {
        self.volumes.remove(&job_id);
    }

    /// Volumes computed by the last completed round.
    pub fn result(&self) -> BTreeMap<JobId, i32> {
        self.fresh_result.clone()
    }

    /// Stage 1: contribute local demands and kick off the aggregate
    /// all-reduce. Returns true if balancing already completed (single
    /// rank, nothing to do).
    pub fn begin(&mut self, load: &LocalLoad, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        debug_assert!(self.stage == Stage::Idle);
        self.demands.clear();
        self.priorities.clear();
        self.assignments.clear();
        self.excluded.clear();
        self.remainders.clear();
        self.fresh_result.clear();

        let mut aggregated = 0.0f64;
        for entry in &load.entries {
            let BalanceEntry {
                job_id,
                demand,
                priority,
            } = *entry;
            self.demands.insert(job_id, demand);
            self.priorities.insert(job_id, priority);
            aggregated += (demand as f64 - 1.0) * priority as f64;
            debug!(job = job_id, demand, priority, "balancing participant");
        }

        let contribution = SumVec::new(vec![
            aggregated,
            if load.busy { 1.0 } else { 0.0 },
            load.num_active_jobs as f64,
        ]);
        self.stage = Stage::DemandReduce;
        let mut reduction = Reduction::new(contribution, self.rank, self.size, BTreeSet::new());
        let done = reduction.start_reduction(fabric)?;
        self.demand_reduction = Some(reduction);
        if done {
            return self.demand_to_broadcast(fabric);
        }
        Ok(false)
    }

    /// Feed one `Collectives` message. Out-of-stage messages (a faster
    /// rank already in the next phase) are deferred.
    pub fn handle_message(
        &mut self,
        handle: MessageHandle,
        fabric: &mut LocalFabric,
    ) -> Result<bool, ReduceError> {
        let source = handle.source;
        let expecting = self.current_expectation();
        if expecting != Some(source) {
            trace!(source, stage = ?self.stage, "deferring out-of-stage contribution");
            fabric.defer(handle);
            return Ok(false);
        }

        match self.stage {
            Stage::DemandReduce => {
                let red = self.demand_reduction.as_mut().expect("reduction in flight");
                if red.advance_reduction(&handle.payload, source, fabric)? {
                    return self.demand_to_broadcast(fabric);
                }
            }
            Stage::DemandBroadcast => {
                let red = self.demand_reduction.as_mut().expect("reduction in flight");
                if red.advance_broadcast(&handle.payload, fabric)? {
                    return self.finish_demand(fabric);
                }
            }
            Stage::ResourcesReduce => {
                let red = self
                    .resources_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_reduction(&handle.payload, source, fabric)? {
                    return self.resources_to_broadcast(fabric);
                }
            }
            Stage::ResourcesBroadcast => {
                let red = self
                    .resources_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_broadcast(&handle.payload, fabric)? {
                    return self.finish_resources(fabric);
                }
            }
            Stage::RemaindersReduce => {
                let red = self
                    .remainder_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_reduction(&handle.payload, source, fabric)? {
                    return self.remainders_to_broadcast(fabric);
                }
            }
            Stage::RemaindersBroadcast => {
                let red = self
                    .remainder_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_broadcast(&handle.payload, fabric)? {
                    return self.finish_remainders(fabric);
                }
            }
            Stage::RoundingReduce => {
                let red = self
                    .rounding_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_reduction(&handle.payload, source, fabric)? {
                    return self.rounding_to_broadcast(fabric);
                }
            }
            Stage::RoundingBroadcast => {
                let red = self
                    .rounding_reduction
                    .as_mut()
                    .expect("reduction in flight");
                if red.advance_broadcast(&handle.payload, fabric)? {
                    return self.finish_rounding_iteration(fabric);
                }
            }
            Stage::Idle => unreachable!("expectation is None while idle"),
        }
        Ok(false)
    }

    fn current_expectation(&self) -> Option<usize> {
        match self.stage {
            Stage::Idle => None,
            Stage::DemandReduce | Stage::DemandBroadcast => self
                .demand_reduction
                .as_ref()
                .and_then(|r| r.expecting_from()),
            Stage::ResourcesReduce | Stage::ResourcesBroadcast => self
                .resources_reduction
                .as_ref()
                .and_then(|r| r.expecting_from()),
            Stage::RemaindersReduce | Stage::RemaindersBroadcast => self
                .remainder_reduction
                .as_ref()
                .and_then(|r| r.expecting_from()),
            Stage::RoundingReduce | Stage::RoundingBroadcast => self
                .rounding_reduction
                .as_ref()
                .and_then(|r| r.expecting_from()),
        }
    }

    fn demand_to_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        self.stage = Stage::DemandBroadcast;
        let red = self.demand_reduction.as_mut().expect("reduction in flight");
        if red.start_broadcast(fabric)? {
            return self.finish_demand(fabric);
        }
        Ok(false)
    }

    /// Stage 2: local fractional assignments from the global aggregate.
    fn finish_demand(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        let totals = self
            .demand_reduction
            .take()
            .expect("reduction in flight")
            .value;
        let aggregated = totals.values.first().copied().unwrap_or(0.0);
        let busy_nodes = totals.values.get(1).copied().unwrap_or(0.0);
        let num_jobs = totals.values.get(2).copied().unwrap_or(0.0);
        debug!(
            busy = busy_nodes,
            jobs = num_jobs,
            aggregated,
            "demand aggregation complete"
        );

        self.total_avail = self.size as f64 * self.load_factor as f64 - num_jobs;

        let mut histogram = ResourceHistogram::default();
        for (&job_id, &demand) in &self.demands {
            let priority = self.priorities[&job_id] as f64;
            let met_ratio = if aggregated > 0.0 {
                (self.total_avail * priority / aggregated).min(1.0)
            } else {
                1.0
            };
            let assignment = 1.0 + met_ratio * (demand as f64 - 1.0);
            trace!(job = job_id, assignment, "initial assignment");
            self.assignments.insert(job_id, assignment);
            histogram.assigned += assignment - 1.0;
            histogram.add(self.priorities[&job_id], demand as f64 - assignment);
        }

        self.stage = Stage::ResourcesReduce;
        let mut reduction = Reduction::new(histogram, self.rank, self.size, BTreeSet::new());
        let done = reduction.start_reduction(fabric)?;
        self.resources_reduction = Some(reduction);
        if done {
            return self.resources_to_broadcast(fabric);
        }
        Ok(false)
    }

    fn resources_to_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        self.stage = Stage::ResourcesBroadcast;
        let red = self
            .resources_reduction
            .as_mut()
            .expect("reduction in flight");
        if red.start_broadcast(fabric)? {
            return self.finish_resources(fabric);
        }
        Ok(false)
    }

    /// Stage 3: adjust the fractional assignments using the global
    /// per-priority histogram.
    fn finish_resources(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        let mut reduction = self
            .resources_reduction
            .take()
            .expect("reduction in flight");
        self.excluded = reduction.take_excluded();
        let histogram = reduction.value;

        if self.excluded.contains(&self.rank) && self.rounding == RoundingMode::Probabilistic {
            debug!("nothing contributed; balancing finished early");
            self.assignments.clear();
            self.stage = Stage::Idle;
            return Ok(true);
        }

        let mut remaining = self.total_avail - histogram.assigned;
        if remaining < NEGLIGIBLE_RESOURCES {
            remaining = 0.0;
        }
        debug!(remaining, "remaining resources after fair shares");

        // cumulative unmet demand of this bucket and all higher-priority ones
        let cumulative: Vec<f64> = histogram
            .buckets
            .iter()
            .scan(0.0, |acc, &(_, demanded)| {
                *acc += demanded;
                Some(*acc)
            })
            .collect();

        for (&job_id, &demand) in &self.demands {
            if demand == 1 {
                continue;
            }
            let priority = self.priorities[&job_id];
            let assignment = self
                .assignments
                .get_mut(&job_id)
                .expect("assignment exists for every participant");
            let Some(idx) = histogram.buckets.iter().position(|&(p, _)| p == priority) else {
                error!(job = job_id, priority, "priority missing from reduced histogram");
                continue;
            };
            let previous = if idx > 0 { cumulative[idx - 1] } else { 0.0 };
            if (*assignment - demand as f64).abs() < f64::EPSILON || cumulative[idx] <= remaining {
                // the whole bucket fits
                *assignment = demand as f64;
            } else if previous >= remaining {
                // higher-priority buckets already eat all the slack
            } else {
                let ratio = (remaining - previous) / (cumulative[idx] - previous);
                *assignment += ratio * (demand as f64 - *assignment);
            }
            trace!(job = job_id, assignment = *assignment, "adjusted assignment");
        }

        match self.rounding {
            RoundingMode::Probabilistic => self.complete(),
            RoundingMode::Bisection => {
                let mut seq = RemainderSeq::default();
                for &assignment in self.assignments.values() {
                    let remainder = assignment - assignment.floor();
                    if remainder > 0.0 && remainder < 1.0 {
                        seq.values.push(remainder);
                    }
                }
                seq.values
                    .sort_by(|a, b| a.partial_cmp(b).expect("remainders are finite"));

                self.stage = Stage::RemaindersReduce;
                let mut reduction =
                    Reduction::new(seq, self.rank, self.size, self.excluded.clone());
                let done = reduction.start_reduction(fabric)?;
                self.remainder_reduction = Some(reduction);
                if done {
                    return self.remainders_to_broadcast(fabric);
                }
                Ok(false)
            }
        }
    }

    fn remainders_to_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        self.stage = Stage::RemaindersBroadcast;
        let red = self
            .remainder_reduction
            .as_mut()
            .expect("reduction in flight");
        if red.start_broadcast(fabric)? {
            return self.finish_remainders(fabric);
        }
        Ok(false)
    }

    /// Stage 4: bisect the merged remainder sequence for the rounding
    /// threshold that best meets the utilization target.
    fn finish_remainders(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        self.remainders = self
            .remainder_reduction
            .take()
            .expect("reduction in flight")
            .value
            .values;
        self.lower = 0;
        self.upper = self.remainders.len();
        self.last_utilization = 0.0;
        self.best_remainder_idx = None;
        self.rounding_iterations = 0;
        self.next_rounding_iteration(fabric)
    }

    fn next_rounding_iteration(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        let idx = (self.lower + self.upper) / 2;
        let (_, local_sum) = self.rounded_assignments(idx);
        self.stage = Stage::RoundingReduce;
        let mut reduction = Reduction::new(
            SumVec::new(vec![local_sum as f64]),
            self.rank,
            self.size,
            BTreeSet::new(),
        );
        let done = reduction.start_reduction(fabric)?;
        self.rounding_reduction = Some(reduction);
        if done {
            return self.rounding_to_broadcast(fabric);
        }
        Ok(false)
    }

    fn rounding_to_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        self.stage = Stage::RoundingBroadcast;
        let red = self
            .rounding_reduction
            .as_mut()
            .expect("reduction in flight");
        if red.start_broadcast(fabric)? {
            return self.finish_rounding_iteration(fabric);
        }
        Ok(false)
    }

    fn finish_rounding_iteration(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        let utilization = self
            .rounding_reduction
            .take()
            .expect("reduction in flight")
            .value
            .values
            .first()
            .copied()
            .unwrap_or(0.0);
        self.rounding_iterations += 1;
        let target = self.size as f64 * self.load_factor as f64;
        let diff = target - utilization;
        let idx = (self.lower + self.upper) / 2;

        // Keep the best threshold so far: prefer not oversubscribing, then
        // the smallest absolute error.
        let oversubscribed = |d: f64| d <= -1.0;
        let take = match self.best_remainder_idx {
            None => true,
            Some(_) => {
                (!oversubscribed(diff) && oversubscribed(self.best_utilization_diff))
                    || (oversubscribed(diff)
                        && oversubscribed(self.best_utilization_diff)
                        && diff > self.best_utilization_diff)
                    || (!oversubscribed(diff) && diff.abs() < self.best_utilization_diff.abs())
            }
        };
        if take {
            self.best_remainder_idx = Some(idx);
            self.best_utilization = utilization;
            self.best_utilization_diff = diff;
        }

        trace!(
            iteration = self.rounding_iterations,
            lower = self.lower,
            upper = self.upper,
            idx,
            utilization,
            err = diff,
            "rounding step"
        );

        if utilization == self.last_utilization {
            // converged: apply the best threshold seen
            if let Some(best) = self.best_remainder_idx {
                let (rounded, _) = self.rounded_assignments(best);
                for (job_id, volume) in rounded {
                    self.assignments.insert(job_id, volume as f64);
                }
                debug!(
                    iterations = self.rounding_iterations,
                    utilization = self.best_utilization,
                    err = self.best_utilization_diff,
                    "rounding done"
                );
            }
            self.best_remainder_idx = None;
            self.rounding_iterations = 0;
            return self.complete();
        }

        if self.lower < self.upper {
            if utilization < target {
                self.upper = idx.saturating_sub(1);
            } else if utilization > target {
                self.lower = idx + 1;
            }
            if self.lower > self.upper {
                self.upper = self.lower;
            }
        }
        self.last_utilization = utilization;
        self.next_rounding_iteration(fabric)
    }

    /// Round local assignments against the remainder threshold at `idx`;
    /// also yields the rounded utilization of this rank's jobs.
    fn rounded_assignments(&self, idx: usize) -> (BTreeMap<JobId, i32>, i64) {
        let threshold = self.remainders.get(idx).copied().unwrap_or(1.0);
        let mut rounded = BTreeMap::new();
        let mut sum = 0i64;
        for (&job_id, &assignment) in &self.assignments {
            let fraction = assignment - assignment.floor();
            let volume = if fraction < threshold {
                assignment.floor() as i32
            } else {
                assignment.ceil() as i32
            };
            rounded.insert(job_id, volume);
            sum += volume as i64;
        }
        (rounded, sum)
    }

    /// Convert the (now settled) assignments into integer volumes.
    fn complete(&mut self) -> Result<bool, ReduceError> {
        let mut result = BTreeMap::new();
        for (&job_id, &assignment) in &self.assignments {
            let assignment = assignment.max(1.0);
            let fraction = assignment - assignment.floor();
            let mut volume = assignment.floor() as i32;
            if fraction > 0.0 && self.rng.gen::<f64>() < fraction {
                volume += 1;
            }
            debug!(job = job_id, assignment, volume, "final assignment");
            result.insert(job_id, volume.max(1));
        }
        self.volumes.extend(result.iter());
        self.fresh_result = result;
        self.stage = Stage::Idle;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::LocalLoad;

    fn drive(
        balancers: &mut [CutoffBalancer],
        fabrics: &mut [LocalFabric],
        loads: &[LocalLoad],
    ) -> Vec<bool> {
        let mut done = vec![false; balancers.len()];
        for rank in 0..balancers.len() {
            done[rank] = balancers[rank].begin(&loads[rank], &fabrics[rank]).unwrap();
        }
        for _ in 0..10_000 {
            if done.iter().all(|&d| d) {
                break;
            }
            for rank in 0..balancers.len() {
                fabrics[rank].cycle();
                while let Some(handle) = fabrics[rank].poll() {
                    if balancers[rank]
                        .handle_message(handle, &mut fabrics[rank])
                        .unwrap()
                    {
                        done[rank] = true;
                    }
                }
            }
        }
        done
    }

    fn load(entries: Vec<BalanceEntry>, busy: bool) -> LocalLoad {
        let num_active_jobs = entries.len() as i32;
        LocalLoad {
            entries,
            busy,
            num_active_jobs,
        }
    }

    #[test]
    fn single_job_on_two_workers_gets_volume_two() {
        let mut fabrics = LocalFabric::hub(2);
        let mut balancers: Vec<CutoffBalancer> = (0..2)
            .map(|r| CutoffBalancer::new(r, 2, 1.0, RoundingMode::Bisection))
            .collect();
        let loads = vec![
            load(
                vec![BalanceEntry {
                    job_id: 1,
                    demand: 4,
                    priority: 1.0,
                }],
                true,
            ),
            load(vec![], false),
        ];
        let done = drive(&mut balancers, &mut fabrics, &loads);
        assert!(done.iter().all(|&d| d));
        assert_eq!(balancers[0].result().get(&1), Some(&2));
    }

    #[test]
    fn volume_sum_never_oversubscribes() {
        let size = 4;
        let mut fabrics = LocalFabric::hub(size);
        let mut balancers: Vec<CutoffBalancer> = (0..size)
            .map(|r| CutoffBalancer::new(r, size, 1.0, RoundingMode::Bisection))
            .collect();
        let loads = vec![
            load(
                vec![BalanceEntry {
                    job_id: 1,
                    demand: 4,
                    priority: 1.0,
                }],
                true,
            ),
            load(
                vec![BalanceEntry {
                    job_id: 2,
                    demand: 4,
                    priority: 3.0,
                }],
                true,
            ),
            load(vec![], true),
            load(vec![], false),
        ];
        let done = drive(&mut balancers, &mut fabrics, &loads);
        assert!(done.iter().all(|&d| d));

        let mut volumes = BTreeMap::new();
        for balancer in &balancers {
            volumes.extend(balancer.result());
        }
        let sum: i32 = volumes.values().sum();
        assert!(sum <= 4, "oversubscribed: {volumes:?}");
        assert!(volumes.values().all(|&v| v >= 1));
        // higher priority never ends up below lower priority
        assert!(volumes[&2] >= volumes[&1]);
    }

    #[test]
    fn equal_jobs_split_the_fleet() {
        let size = 8;
        let mut fabrics = LocalFabric::hub(size);
        let mut balancers: Vec<CutoffBalancer> = (0..size)
            .map(|r| CutoffBalancer::new(r, size, 1.0, RoundingMode::Bisection))
            .collect();
        let mut loads = vec![load(vec![], true); size];
        loads[0] = load(
            vec![BalanceEntry {
                job_id: 1,
                demand: 8,
                priority: 1.0,
            }],
            true,
        );
        loads[3] = load(
            vec![BalanceEntry {
                job_id: 2,
                demand: 8,
                priority: 1.0,
            }],
            true,
        );
        let done = drive(&mut balancers, &mut fabrics, &loads);
        assert!(done.iter().all(|&d| d));
        assert_eq!(balancers[0].result().get(&1), Some(&4));
        assert_eq!(balancers[3].result().get(&2), Some(&4));
    }

    #[test]
    fn histogram_merge_sums_equal_priorities() {
        let mut a = ResourceHistogram::default();
        a.add(1.0, 2.0);
        a.add(3.0, 1.5);
        a.assigned = 2.5;
        let mut b = ResourceHistogram::default();
        b.add(1.0, 1.0);
        b.add(2.0, 4.0);
        b.assigned = 1.0;
        a.merge(&b);
        assert_eq!(a.assigned, 3.5);
        assert_eq!(a.buckets, vec![(3.0, 1.5), (2.0, 4.0), (1.0, 3.0)]);
    }

    #[test]
    fn histogram_round_trip() {
        let mut h = ResourceHistogram::default();
        h.add(2.0, 1.25);
        h.add(0.5, 3.0);
        h.assigned = 4.5;
        assert_eq!(ResourceHistogram::deserialize(&h.serialize()).unwrap(), h);
    }

    #[test]
    fn remainder_merge_keeps_order_and_duplicates() {
        let mut a = RemainderSeq {
            values: vec![0.25, 0.75],
        };
        let b = RemainderSeq {
            values: vec![0.25, 0.5],
        };
        a.merge(&b);
        assert_eq!(a.values, vec![0.25, 0.25, 0.5, 0.75]);
    }
}
