//! Anytime gather/merge/broadcast of learned clauses within one job tree.
//!
//! Leaves push their clauses upward once per sharing epoch; internal nodes
//! wait for every existing child, merge with their own collection and push
//! on; the root merges and broadcasts the union back down. Buffers grow by
//! `BUFFER_GROWTH` per tree layer crossed.

use super::clauses;
use super::SatEngine;
use crate::comm::{LocalFabric, Tag};
use crate::data::job_transfer::{ClauseMsg, JobMessage};
use crate::data::job_tree::JobTree;
use crate::data::JobId;
use tracing::{debug, trace, warn};

/// Buffer budget for a leaf's collection, in buffer positions.
pub const BASE_BUFFER_LITS: usize = 1500;
/// Growth factor per tree layer a buffer has crossed.
pub const BUFFER_GROWTH: usize = 2;

#[derive(Debug)]
pub struct ClauseSharing {
    period: f32,
    epoch_of_buffers: i32,
    buffers: Vec<Vec<i32>>,
    num_child_sources: usize,
    last_shared_epoch: i32,
    last_distributed_epoch: i32,
    last_initiation: f32,
}

impl ClauseSharing {
    pub fn new(period: f32) -> Self {
        Self {
            period,
            epoch_of_buffers: -1,
            buffers: Vec::new(),
            num_child_sources: 0,
            last_shared_epoch: -1,
            last_distributed_epoch: -1,
            last_initiation: 0.0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.period > 0.0
    }

    pub fn current_epoch(&self, now: f32) -> i32 {
        (now / self.period) as i32
    }

    /// Leaf wake-up rule: at least half a period since activation and a
    /// full period since the last round, with a fresh epoch to share in.
    pub fn leaf_wants_round(&self, now: f32, activation: f32) -> bool {
        self.enabled()
            && now - activation >= 0.5 * self.period
            && now - self.last_initiation >= self.period
            && self.current_epoch(now) > self.last_shared_epoch
    }

    fn stash(&mut self, buffer: Vec<i32>, epoch: i32) {
        if !self.buffers.is_empty() && self.epoch_of_buffers != epoch {
            debug!(
                stale = self.epoch_of_buffers,
                epoch, "discarding clause buffers from an old sharing round"
            );
            self.buffers.clear();
            self.num_child_sources = 0;
        }
        self.epoch_of_buffers = epoch;
        self.buffers.push(buffer);
    }

    fn all_children_present(&self, num_children: usize) -> bool {
        self.num_child_sources == num_children
    }
}

impl SatEngine {
    /// Begin a sharing round at a leaf (or a childless root, which simply
    /// re-digests its own collection).
    pub fn initiate_sharing(
        &mut self,
        job_id: JobId,
        tree: &JobTree,
        fabric: &LocalFabric,
        now: f32,
    ) {
        let epoch = self.sharing.current_epoch(now);
        self.sharing.last_initiation = now;
        self.sharing.last_shared_epoch = epoch;

        let collected = self.collect_clauses(BASE_BUFFER_LITS);
        if tree.is_root() {
            if !collected.is_empty() {
                self.digest_clauses(&collected);
            }
            return;
        }

        let mut payload = collected;
        payload.push(0); // layers traversed so far
        trace!(
            job = job_id,
            epoch,
            to = tree.parent_rank(),
            size = payload.len(),
            "starting clause gather"
        );
        let msg = JobMessage {
            job_id,
            epoch,
            tag: ClauseMsg::Gather,
            payload,
        };
        if let Err(e) = fabric.send(tree.parent_rank(), Tag::JobCommunication, msg.serialize()) {
            warn!(job = job_id, "failed to push clauses upward: {e}");
        }
    }

    /// Handle one overlay message addressed to this worker's tree node.
    pub fn handle_sharing(
        &mut self,
        source: usize,
        mut msg: JobMessage,
        tree: &JobTree,
        fabric: &LocalFabric,
    ) {
        match msg.tag {
            ClauseMsg::Gather => {
                let Some(depth) = msg.payload.pop() else {
                    return;
                };
                trace!(
                    job = msg.job_id,
                    epoch = msg.epoch,
                    from = source,
                    depth,
                    "received gathered clauses"
                );

                if self.sharing.last_shared_epoch >= msg.epoch && !tree.is_root() {
                    // Already pushed upward this epoch: short-circuit into a
                    // downward broadcast of what arrived.
                    self.distribute(msg.job_id, msg.epoch, msg.payload, tree, fabric);
                    return;
                }

                self.sharing.stash(msg.payload, msg.epoch);
                self.sharing.num_child_sources += 1;

                if self.sharing.all_children_present(tree.num_children()) {
                    self.share_collected(msg.job_id, msg.epoch, depth, tree, fabric);
                }
            }
            ClauseMsg::Distribute => {
                if self.sharing.last_distributed_epoch >= msg.epoch {
                    // duplicate round
                    return;
                }
                self.distribute(msg.job_id, msg.epoch, msg.payload, tree, fabric);
            }
        }
    }

    fn share_collected(
        &mut self,
        job_id: JobId,
        epoch: i32,
        depth: i32,
        tree: &JobTree,
        fabric: &LocalFabric,
    ) {
        let max_lits = BASE_BUFFER_LITS * BUFFER_GROWTH.pow(depth.max(0) as u32);
        let own = self.collect_clauses(max_lits);
        self.sharing.stash(own, epoch);

        let sources: Vec<&[i32]> = self.sharing.buffers.iter().map(|b| b.as_slice()).collect();
        let merged = clauses::merge_buffers(&sources, max_lits * BUFFER_GROWTH);
        self.sharing.buffers.clear();
        self.sharing.num_child_sources = 0;
        self.sharing.last_shared_epoch = epoch;

        if tree.is_root() {
            trace!(job = job_id, epoch, "gather complete: broadcasting");
            self.distribute(job_id, epoch, merged, tree, fabric);
        } else {
            let mut payload = merged;
            payload.push(depth + 1);
            let msg = JobMessage {
                job_id,
                epoch,
                tag: ClauseMsg::Gather,
                payload,
            };
            trace!(
                job = job_id,
                epoch,
                to = tree.parent_rank(),
                "pushing merged clauses upward"
            );
            if let Err(e) = fabric.send(tree.parent_rank(), Tag::JobCommunication, msg.serialize())
            {
                warn!(job = job_id, "failed to push clauses upward: {e}");
            }
        }
    }

    /// Digest a broadcast buffer locally and forward it to both children.
    fn distribute(
        &mut self,
        job_id: JobId,
        epoch: i32,
        payload: Vec<i32>,
        tree: &JobTree,
        fabric: &LocalFabric,
    ) {
        self.sharing.last_distributed_epoch = epoch;
        let msg = JobMessage {
            job_id,
            epoch,
            tag: ClauseMsg::Distribute,
            payload,
        };
        let bytes = msg.serialize();
        for child in [tree.left_child_rank(), tree.right_child_rank()]
            .into_iter()
            .flatten()
        {
            trace!(job = job_id, epoch, to = child, "broadcasting clauses");
            if let Err(e) = fabric.send(child, Tag::JobCommunication, bytes.clone()) {
                warn!(job = job_id, "failed to broadcast clauses: {e}");
            }
        }
        if !msg.payload.is_empty() {
            self.digest_clauses(&msg.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::job_transfer::JobDescription;
    use std::time::Duration;

    fn engine_with_units(job_id: i32, units: &[i32]) -> SatEngine {
        let mut lits = Vec::new();
        for &u in units {
            lits.extend_from_slice(&[u, 0]);
        }
        let desc = JobDescription::new(job_id, 1.0, lits, Vec::new());
        let engine = SatEngine::start(&desc, 1, 0, 1.0);
        // solved means the level-zero units were derived and exported
        for _ in 0..500 {
            if engine.initialized() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        engine
    }

    #[test]
    fn gather_flows_up_and_broadcast_returns() {
        let mut fabrics = crate::comm::LocalFabric::hub(2);

        let mut root_tree = crate::data::job_tree::JobTree::new(2, 0, 1);
        root_tree.update(0, -1, 0);
        root_tree.set_left_child(1);
        let mut leaf_tree = crate::data::job_tree::JobTree::new(2, 1, 1);
        leaf_tree.update(1, 0, 0);

        let mut root = engine_with_units(1, &[3]);
        let mut leaf = engine_with_units(1, &[5]);
        std::thread::sleep(Duration::from_millis(20));

        // the leaf wakes up and pushes its clauses towards the root
        leaf.initiate_sharing(1, &leaf_tree, &fabrics[1], 2.5);
        let gather = fabrics[0].poll().expect("gather reached the root");
        assert_eq!(gather.tag, Tag::JobCommunication);
        let msg = JobMessage::deserialize(&gather.payload).unwrap();
        assert_eq!(msg.tag, ClauseMsg::Gather);

        // the root merges with its own collection and broadcasts down
        root.handle_sharing(1, msg, &root_tree, &fabrics[0]);
        let broadcast = fabrics[1].poll().expect("broadcast reached the leaf");
        let msg = JobMessage::deserialize(&broadcast.payload).unwrap();
        assert_eq!(msg.tag, ClauseMsg::Distribute);

        // digesting the broadcast twice is as good as once
        leaf.handle_sharing(0, msg.clone(), &leaf_tree, &fabrics[1]);
        leaf.handle_sharing(0, msg, &leaf_tree, &fabrics[1]);
        assert!(fabrics[1].poll().is_none(), "leaf has nobody to forward to");

        root.terminate();
        leaf.terminate();
    }

    #[test]
    fn leaf_round_timing() {
        let mut sharing = ClauseSharing::new(1.0);
        assert!(!sharing.leaf_wants_round(0.4, 0.0), "too soon after start");
        assert!(sharing.leaf_wants_round(1.6, 0.0));
        sharing.last_initiation = 1.6;
        sharing.last_shared_epoch = 1;
        assert!(!sharing.leaf_wants_round(2.4, 0.0), "within a period");
        assert!(sharing.leaf_wants_round(3.0, 0.0));
    }

    #[test]
    fn disabled_when_period_is_zero() {
        let sharing = ClauseSharing::new(0.0);
        assert!(!sharing.enabled());
        assert!(!sharing.leaf_wants_round(100.0, 0.0));
    }

    #[test]
    fn stale_buffers_dropped_on_epoch_change() {
        let mut sharing = ClauseSharing::new(1.0);
        sharing.stash(vec![0, 0, 1, 1, 2], 3);
        sharing.num_child_sources = 1;
        sharing.stash(vec![0], 4);
        assert_eq!(sharing.epoch_of_buffers, 4);
        assert_eq!(sharing.buffers.len(), 1);
    }
}
