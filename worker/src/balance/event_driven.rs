//! Asynchronous event-driven balancer.
//!
//! Demand/priority changes travel as epoch-tagged events over two overlaid
//! reduction trees (one rooted at rank 0, one at rank P-1), so any change
//! reaches every rank in about 2*log2(P) messages no matter where it
//! originated. Each rank keeps the dominance-maximal event map and locally
//! recomputes all volumes whenever it changes.

use super::{fair_shares, BalanceEntry, LocalLoad};
use crate::comm::{LocalFabric, MessageHandle, Tag};
use crate::data::event_map::{Event, EventMap};
use crate::data::reduce::{ReduceError, Reducible};
use crate::data::{put_i32, take_i32, JobId};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace, warn};

/// Broadcasts remembered per tree to suppress re-circulation.
const RECENT_BROADCAST_MEMORY: usize = 3;

const NORMAL_TREE: i32 = 0;
const REVERSED_TREE: i32 = 1;

pub struct EventDrivenBalancer {
    rank: usize,
    size: usize,
    load_factor: f32,
    balance_period: f32,

    states: EventMap,
    diffs: EventMap,
    job_epochs: BTreeMap<JobId, i32>,
    time_of_termination: BTreeMap<JobId, f32>,
    recent_broadcasts: [VecDeque<EventMap>; 2],

    volumes: BTreeMap<JobId, i32>,
    fresh_result: BTreeMap<JobId, i32>,
    last_sweep: f32,
}

impl EventDrivenBalancer {
    pub fn new(rank: usize, size: usize, load_factor: f32, balance_period: f32) -> Self {
        Self {
            rank,
            size,
            load_factor,
            balance_period,
            states: EventMap::new(),
            diffs: EventMap::new(),
            job_epochs: BTreeMap::new(),
            time_of_termination: BTreeMap::new(),
            recent_broadcasts: [VecDeque::new(), VecDeque::new()],
            volumes: BTreeMap::new(),
            fresh_result: BTreeMap::new(),
            last_sweep: 0.0,
        }
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

    pub fn result(&self) -> BTreeMap<JobId, i32> {
        self.fresh_result.clone()
    }

    /// Register the current demands of locally rooted jobs; any change
    /// becomes an event at a fresh epoch and starts travelling both trees.
    pub fn begin(
        &mut self,
        load: &LocalLoad,
        fabric: &LocalFabric,
        now: f32,
    ) -> Result<bool, ReduceError> {
        for entry in &load.entries {
            self.emit(entry.job_id, entry.demand, entry.priority);
        }
        self.sweep_terminated(now);
        self.propagate(fabric)
    }

    /// The job ended here; circulate a zero event at a fresh epoch.
    pub fn forget(
        &mut self,
        job_id: JobId,
        fabric: &LocalFabric,
        now: f32,
    ) -> Result<(), ReduceError> {
        self.emit(job_id, 0, 0.0);
        self.time_of_termination.insert(job_id, now);
        self.volumes.remove(&job_id);
        self.propagate(fabric)?;
        Ok(())
    }

    fn emit(&mut self, job_id: JobId, demand: i32, priority: f32) {
        let known = self.states.get(job_id);
        if let Some(ev) = known {
            if ev.demand == demand && ev.priority == priority {
                return;
            }
        }
        let epoch = self
            .job_epochs
            .get(&job_id)
            .copied()
            .max(known.map(|e| e.epoch))
            .unwrap_or(0)
            + 1;
        self.job_epochs.insert(job_id, epoch);
        let ev = Event {
            job_id,
            epoch,
            demand,
            priority,
        };
        trace!(job = job_id, epoch, demand, priority, "emitting balancing event");
        self.diffs.insert_if_novel(ev);
    }

    /// Digest pending diffs locally and push them into both trees.
    fn propagate(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        if self.diffs.is_empty() {
            return Ok(false);
        }
        let diffs = std::mem::take(&mut self.diffs);
        let changed = self.states.update_by(&diffs);

        for tree in [NORMAL_TREE, REVERSED_TREE] {
            let mut diff = diffs.clone();
            for recent in &self.recent_broadcasts[tree as usize] {
                diff.filter_by(recent);
            }
            if diff.is_empty() {
                continue;
            }
            if self.is_root(tree) {
                self.broadcast(tree, diff, fabric)?;
            } else {
                self.send_map(self.parent_rank(tree), Tag::AnytimeReduction, tree, &diff, fabric)?;
            }
        }

        Ok(changed && self.recompute_volumes())
    }

    /// Feed one tree message; returns true when the volumes changed.
    pub fn handle_message(
        &mut self,
        handle: MessageHandle,
        fabric: &LocalFabric,
    ) -> Result<bool, ReduceError> {
        let (tree, map) = decode_tree_map(&handle.payload)?;
        let changed = match handle.tag {
            Tag::AnytimeReduction => {
                let changed = self.states.update_by(&map);
                let mut onward = map;
                for recent in &self.recent_broadcasts[tree as usize] {
                    onward.filter_by(recent);
                }
                if !onward.is_empty() {
                    if self.is_root(tree) {
                        self.broadcast(tree, onward, fabric)?;
                    } else {
                        self.send_map(
                            self.parent_rank(tree),
                            Tag::AnytimeReduction,
                            tree,
                            &onward,
                            fabric,
                        )?;
                    }
                }
                changed
            }
            Tag::AnytimeBroadcast => {
                let mut fresh = map;
                for recent in &self.recent_broadcasts[tree as usize] {
                    fresh.filter_by(recent);
                }
                let changed = self.states.update_by(&fresh);
                if !fresh.is_empty() {
                    self.broadcast(tree, fresh, fabric)?;
                }
                changed
            }
            other => {
                warn!(tag = ?other, "unexpected message tag for the event balancer");
                false
            }
        };

        Ok(changed && self.recompute_volumes())
    }

    fn broadcast(
        &mut self,
        tree: i32,
        map: EventMap,
        fabric: &LocalFabric,
    ) -> Result<(), ReduceError> {
        for child in self.child_ranks(tree) {
            self.send_map(child, Tag::AnytimeBroadcast, tree, &map, fabric)?;
        }
        let ring = &mut self.recent_broadcasts[tree as usize];
        ring.push_back(map);
        while ring.len() > RECENT_BROADCAST_MEMORY {
            ring.pop_front();
        }
        Ok(())
    }

    fn send_map(
        &self,
        dest: usize,
        tag: Tag,
        tree: i32,
        map: &EventMap,
        fabric: &LocalFabric,
    ) -> Result<(), ReduceError> {
        trace!(dest, ?tag, tree, events = map.entries().len(), "event propagation");
        let mut payload = Vec::new();
        put_i32(&mut payload, tree);
        payload.extend_from_slice(&map.serialize());
        fabric.send(dest, tag, payload)?;
        Ok(())
    }

    /// Recompute every volume from the steady-state map; returns whether
    /// any volume changed.
    fn recompute_volumes(&mut self) -> bool {
        let entries: Vec<BalanceEntry> = self
            .states
            .entries()
            .values()
            .filter(|ev| ev.demand > 0)
            .map(|ev| BalanceEntry {
                job_id: ev.job_id,
                demand: ev.demand,
                priority: ev.priority,
            })
            .collect();
        let total = (self.size as f32 * self.load_factor).ceil() as i32;
        let shares = fair_shares(&entries, total);
        if shares == self.volumes {
            return false;
        }
        debug!(volumes = ?shares, "recomputed volumes");
        self.volumes = shares.clone();
        self.fresh_result = shares;
        true
    }

    /// Garbage step: drop termination markers once per balance period,
    /// after they had a chance to circulate.
    fn sweep_terminated(&mut self, now: f32) {
        if now - self.last_sweep < self.balance_period {
            return;
        }
        self.last_sweep = now;
        for job_id in self.states.remove_old_zeros() {
            debug!(job = job_id, "dropping terminated job from balancing state");
            self.volumes.remove(&job_id);
            self.job_epochs.remove(&job_id);
            self.time_of_termination.remove(&job_id);
        }
    }

    fn position(&self, tree: i32) -> usize {
        if tree == NORMAL_TREE {
            self.rank
        } else {
            self.size - 1 - self.rank
        }
    }

    fn rank_at(&self, tree: i32, position: usize) -> usize {
        if tree == NORMAL_TREE {
            position
        } else {
            self.size - 1 - position
        }
    }

    fn is_root(&self, tree: i32) -> bool {
        self.position(tree) == 0
    }

    fn parent_rank(&self, tree: i32) -> usize {
        let pos = self.position(tree);
        self.rank_at(tree, (pos - 1) / 2)
    }

    fn child_ranks(&self, tree: i32) -> Vec<usize> {
        let pos = self.position(tree);
        [2 * pos + 1, 2 * pos + 2]
            .into_iter()
            .filter(|&c| c < self.size)
            .map(|c| self.rank_at(tree, c))
            .collect()
    }
}

fn decode_tree_map(payload: &[u8]) -> Result<(i32, EventMap), ReduceError> {
    let mut pos = 0;
    let tree = take_i32(payload, &mut pos)?;
    let map = EventMap::deserialize(&payload[pos..])?;
    Ok((tree.clamp(NORMAL_TREE, REVERSED_TREE), map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(size: usize, load_factor: f32) -> (Vec<EventDrivenBalancer>, Vec<LocalFabric>) {
        let balancers = (0..size)
            .map(|r| EventDrivenBalancer::new(r, size, load_factor, 0.1))
            .collect();
        (balancers, LocalFabric::hub(size))
    }

    /// Deliver tree messages until the fleet goes quiet.
    fn settle(balancers: &mut [EventDrivenBalancer], fabrics: &mut [LocalFabric]) {
        for _ in 0..10_000 {
            let mut progressed = false;
            for rank in 0..balancers.len() {
                while let Some(handle) = fabrics[rank].poll() {
                    progressed = true;
                    balancers[rank]
                        .handle_message(handle, &fabrics[rank])
                        .unwrap();
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("event propagation failed to settle");
    }

    fn entry(job_id: JobId, demand: i32, priority: f32) -> BalanceEntry {
        BalanceEntry {
            job_id,
            demand,
            priority,
        }
    }

    #[test]
    fn steady_state_volumes_follow_priorities() {
        // four workers, two jobs with priorities 1:3 and demand 4 each
        let (mut balancers, mut fabrics) = fleet(4, 1.0);
        let load0 = LocalLoad {
            entries: vec![entry(1, 4, 1.0)],
            busy: true,
            num_active_jobs: 1,
        };
        let load2 = LocalLoad {
            entries: vec![entry(2, 4, 3.0)],
            busy: true,
            num_active_jobs: 1,
        };
        balancers[0].begin(&load0, &fabrics[0], 0.0).unwrap();
        balancers[2].begin(&load2, &fabrics[2], 0.0).unwrap();
        settle(&mut balancers, &mut fabrics);

        for (rank, balancer) in balancers.iter().enumerate() {
            assert_eq!(balancer.volume(1), Some(1), "rank {rank}");
            assert_eq!(balancer.volume(2), Some(3), "rank {rank}");
        }
    }

    #[test]
    fn change_at_any_rank_reaches_every_rank() {
        let (mut balancers, mut fabrics) = fleet(5, 1.0);
        let load = LocalLoad {
            entries: vec![entry(7, 5, 1.0)],
            busy: true,
            num_active_jobs: 1,
        };
        // emitted at the last rank, which is the reversed tree's root
        balancers[4].begin(&load, &fabrics[4], 0.0).unwrap();
        settle(&mut balancers, &mut fabrics);
        for (rank, balancer) in balancers.iter().enumerate() {
            assert_eq!(balancer.volume(7), Some(5), "rank {rank}");
        }
    }

    #[test]
    fn newer_epoch_wins_over_circulating_old_event() {
        let (mut balancers, mut fabrics) = fleet(4, 1.0);
        let old = LocalLoad {
            entries: vec![entry(1, 2, 1.0)],
            busy: true,
            num_active_jobs: 1,
        };
        balancers[1].begin(&old, &fabrics[1], 0.0).unwrap();
        settle(&mut balancers, &mut fabrics);

        let newer = LocalLoad {
            entries: vec![entry(1, 4, 1.0)],
            busy: true,
            num_active_jobs: 1,
        };
        balancers[1].begin(&newer, &fabrics[1], 0.1).unwrap();
        settle(&mut balancers, &mut fabrics);

        for balancer in &balancers {
            let ev = balancer.states.get(1).unwrap();
            assert_eq!(ev.demand, 4);
            assert_eq!(ev.epoch, 2);
        }
    }

    #[test]
    fn termination_event_clears_the_job_everywhere() {
        let (mut balancers, mut fabrics) = fleet(4, 1.0);
        let load = LocalLoad {
            entries: vec![entry(3, 4, 1.0)],
            busy: true,
            num_active_jobs: 1,
        };
        balancers[2].begin(&load, &fabrics[2], 0.0).unwrap();
        settle(&mut balancers, &mut fabrics);
        assert!(balancers[0].volume(3).is_some());

        balancers[2].forget(3, &fabrics[2], 0.2).unwrap();
        settle(&mut balancers, &mut fabrics);
        for (rank, balancer) in balancers.iter().enumerate() {
            assert_eq!(balancer.volume(3), None, "rank {rank}");
            assert!(balancer.states.get(3).unwrap().is_zero());
        }

        // after a full balance period the zero entry is swept
        let idle = LocalLoad::default();
        balancers[2].begin(&idle, &fabrics[2], 1.0).unwrap();
        assert!(balancers[2].states.get(3).is_none());
    }
}
