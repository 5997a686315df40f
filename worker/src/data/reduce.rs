use super::{put_f64, take_f64, CodecError};
use crate::comm::{FabricError, LocalFabric, Tag};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::trace;

/// A value that can travel a reduction tree: serializable, mergeable,
/// with a notion of emptiness that removes silent contributors from the
/// subsequent broadcast.
pub trait Reducible: Sized {
    fn serialize(&self) -> Vec<u8>;
    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError>;
    fn merge(&mut self, other: &Self);
    fn is_empty(&self) -> bool;
}

#[derive(Error, Debug)]
pub enum ReduceError {
    #[error("malformed reduction payload")]
    Codec(#[from] CodecError),
    #[error("fabric send failed")]
    Fabric(#[from] FabricError),
}

/// Resumable reduce-then-broadcast over successive powers k = 2, 4, ...:
/// at step k, rank r sends to r-k/2 iff r % k == k/2, and receives from
/// r+k/2 iff r % k == 0 and the partner exists. The broadcast runs the
/// inverse tree. Single-shot: one reduction-then-broadcast per instance.
#[derive(Debug)]
pub struct Reduction<R: Reducible> {
    pub value: R,
    rank: usize,
    size: usize,
    power: usize,
    highest_power: usize,
    excluded: BTreeSet<usize>,
    expecting_from: Option<usize>,
}

impl<R: Reducible> Reduction<R> {
    pub fn new(value: R, rank: usize, size: usize, excluded: BTreeSet<usize>) -> Self {
        Self {
            value,
            rank,
            size,
            power: 0,
            highest_power: size.next_power_of_two().max(2),
            excluded,
            expecting_from: None,
        }
    }

    /// Source rank of the receive this reduction is currently blocked on.
    pub fn expecting_from(&self) -> Option<usize> {
        self.expecting_from
    }

    pub fn excluded(&self) -> &BTreeSet<usize> {
        &self.excluded
    }

    pub fn take_excluded(&mut self) -> BTreeSet<usize> {
        std::mem::take(&mut self.excluded)
    }

    /// Begin the reduction; returns true when this rank is already done
    /// (excluded, or nothing to send or receive).
    pub fn start_reduction(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        if self.excluded.contains(&self.rank) {
            return Ok(true);
        }
        self.power = 2;
        self.step_reduction(fabric)
    }

    /// Feed one received contribution; returns true when the reduction is
    /// complete at this rank.
    pub fn advance_reduction(
        &mut self,
        payload: &[u8],
        source: usize,
        fabric: &LocalFabric,
    ) -> Result<bool, ReduceError> {
        let received = R::deserialize(payload)?;
        if received.is_empty() {
            self.excluded.insert(source);
        }
        self.value.merge(&received);
        self.expecting_from = None;
        self.power *= 2;
        self.step_reduction(fabric)
    }

    fn step_reduction(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        while self.power <= self.highest_power {
            let half = self.power / 2;
            if self.rank % self.power == 0 && self.rank + half < self.size {
                let partner = self.rank + half;
                if !self.excluded.contains(&partner) {
                    trace!(k = self.power, from = partner, "reduction: receiving");
                    self.expecting_from = Some(partner);
                    return Ok(false);
                }
            } else if self.rank % self.power == half {
                let partner = self.rank - half;
                if !self.excluded.contains(&partner) {
                    trace!(k = self.power, to = partner, "reduction: sending");
                    fabric.send(partner, Tag::Collectives, self.value.serialize())?;
                }
            }
            self.power *= 2;
        }
        if self.value.is_empty() {
            self.excluded.insert(self.rank);
        }
        Ok(true)
    }

    /// Begin the broadcast of the reduced value down the inverse tree;
    /// `excluded` ranks are skipped on both sides.
    pub fn start_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        if self.excluded.contains(&self.rank) {
            return Ok(true);
        }
        self.power = self.highest_power;
        self.step_broadcast(fabric)
    }

    /// Feed the received broadcast value; overwrites the local one.
    pub fn advance_broadcast(
        &mut self,
        payload: &[u8],
        fabric: &LocalFabric,
    ) -> Result<bool, ReduceError> {
        self.value = R::deserialize(payload)?;
        self.expecting_from = None;
        self.power /= 2;
        self.step_broadcast(fabric)
    }

    fn step_broadcast(&mut self, fabric: &LocalFabric) -> Result<bool, ReduceError> {
        while self.power >= 2 {
            let half = self.power / 2;
            if self.rank % self.power == 0 && self.rank + half < self.size {
                let partner = self.rank + half;
                if !self.excluded.contains(&partner) {
                    trace!(k = self.power, to = partner, "broadcast: sending");
                    fabric.send(partner, Tag::Collectives, self.value.serialize())?;
                }
            } else if self.rank % self.power == half {
                trace!(k = self.power, from = self.rank - half, "broadcast: receiving");
                self.expecting_from = Some(self.rank - half);
                return Ok(false);
            }
            self.power /= 2;
        }
        Ok(true)
    }
}

/// Fixed-length float vector with element-wise sum as merge; the fleet-wide
/// all-reduce used for demand aggregation and rounding utilization.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SumVec {
    pub values: Vec<f64>,
}

impl SumVec {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }
}

impl Reducible for SumVec {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.values.len() * 8);
        for &v in &self.values {
            put_f64(&mut buf, v);
        }
        buf
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let mut values = Vec::with_capacity(bytes.len() / 8);
        while pos < bytes.len() {
            values.push(take_f64(bytes, &mut pos)?);
        }
        Ok(Self { values })
    }

    fn merge(&mut self, other: &Self) {
        if self.values.len() < other.values.len() {
            self.values.resize(other.values.len(), 0.0);
        }
        for (slot, v) in self.values.iter_mut().zip(other.values.iter()) {
            *slot += v;
        }
    }

    fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
