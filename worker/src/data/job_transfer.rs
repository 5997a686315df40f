use super::{
    decode_ints, encode_ints, finish, put_f32, put_i32, take_f32, take_i32, CodecError, JobId,
};

/// A placement request travelling the fabric until adopted or discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    pub job_id: JobId,
    pub root_rank: i32,
    pub requesting_rank: i32,
    pub requested_index: i32,
    pub time_of_birth: f32,
    pub num_hops: i32,
    pub revision: i32,
    pub full_transfer: bool,
}

impl JobRequest {
    pub fn new(
        job_id: JobId,
        root_rank: i32,
        requesting_rank: i32,
        requested_index: i32,
        time_of_birth: f32,
    ) -> Self {
        Self {
            job_id,
            root_rank,
            requesting_rank,
            requested_index,
            time_of_birth,
            num_hops: 0,
            revision: 0,
            full_transfer: false,
        }
    }

    pub fn is_root_request(&self) -> bool {
        self.requested_index == 0
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 * 4);
        put_i32(&mut buf, self.job_id);
        put_i32(&mut buf, self.root_rank);
        put_i32(&mut buf, self.requesting_rank);
        put_i32(&mut buf, self.requested_index);
        put_f32(&mut buf, self.time_of_birth);
        put_i32(&mut buf, self.num_hops);
        put_i32(&mut buf, self.revision);
        put_i32(&mut buf, self.full_transfer as i32);
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let req = Self {
            job_id: take_i32(bytes, &mut pos)?,
            root_rank: take_i32(bytes, &mut pos)?,
            requesting_rank: take_i32(bytes, &mut pos)?,
            requested_index: take_i32(bytes, &mut pos)?,
            time_of_birth: take_f32(bytes, &mut pos)?,
            num_hops: take_i32(bytes, &mut pos)?,
            revision: take_i32(bytes, &mut pos)?,
            full_transfer: take_i32(bytes, &mut pos)? != 0,
        };
        finish(bytes, pos)?;
        Ok(req)
    }
}

/// Advertisement of an upcoming description transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSignature {
    pub job_id: JobId,
    pub root_rank: i32,
    pub revision: i32,
    pub transfer_size: i32,
}

impl JobSignature {
    pub fn serialize(&self) -> Vec<u8> {
        encode_ints(&[self.job_id, self.root_rank, self.revision, self.transfer_size])
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let sig = Self {
            job_id: take_i32(bytes, &mut pos)?,
            root_rank: take_i32(bytes, &mut pos)?,
            revision: take_i32(bytes, &mut pos)?,
            transfer_size: take_i32(bytes, &mut pos)?,
        };
        finish(bytes, pos)?;
        Ok(sig)
    }
}

/// Intra-job message of the clause-sharing overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobMessage {
    pub job_id: JobId,
    pub epoch: i32,
    pub tag: ClauseMsg,
    pub payload: Vec<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ClauseMsg {
    Gather = 1,
    Distribute = 2,
}

impl JobMessage {
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + self.payload.len() * 4);
        put_i32(&mut buf, self.job_id);
        put_i32(&mut buf, self.epoch);
        put_i32(&mut buf, self.tag as i32);
        for &v in &self.payload {
            put_i32(&mut buf, v);
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let job_id = take_i32(bytes, &mut pos)?;
        let epoch = take_i32(bytes, &mut pos)?;
        let tag = match take_i32(bytes, &mut pos)? {
            1 => ClauseMsg::Gather,
            2 => ClauseMsg::Distribute,
            _ => return Err(CodecError::Truncated(pos)),
        };
        let payload = decode_ints(&bytes[pos..])?;
        Ok(Self {
            job_id,
            epoch,
            tag,
            payload,
        })
    }
}

/// One revision of a job's formula: appended clause literals plus the
/// assumptions under which this revision is solved.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobRevision {
    pub literals: Vec<i32>,
    pub assumptions: Vec<i32>,
}

/// Immutable payload of one job, revision 0 upward.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDescription {
    pub job_id: JobId,
    pub priority: f32,
    pub incremental: bool,
    pub revisions: Vec<JobRevision>,
}

impl JobDescription {
    pub fn new(job_id: JobId, priority: f32, literals: Vec<i32>, assumptions: Vec<i32>) -> Self {
        Self {
            job_id,
            priority,
            incremental: false,
            revisions: vec![JobRevision {
                literals,
                assumptions,
            }],
        }
    }

    pub fn revision(&self) -> i32 {
        self.revisions.len() as i32 - 1
    }

    /// All clause literals up to and including the current revision.
    pub fn formula(&self) -> Vec<i32> {
        let mut lits = Vec::new();
        for rev in &self.revisions {
            lits.extend_from_slice(&rev.literals);
        }
        lits
    }

    pub fn assumptions(&self) -> &[i32] {
        &self.revisions.last().expect("revision 0 always present").assumptions
    }

    pub fn num_literals(&self) -> usize {
        self.revisions.iter().map(|r| r.literals.len()).sum()
    }

    pub fn transfer_size(&self, first: i32, last: i32) -> i32 {
        self.serialize_range(first, last).len() as i32
    }

    pub fn serialize(&self) -> Vec<u8> {
        self.serialize_range(0, self.revision())
    }

    /// Wire format: job id, priority, incremental flag, then the revision
    /// range with per-revision length-prefixed literal and assumption blocks.
    pub fn serialize_range(&self, first: i32, last: i32) -> Vec<u8> {
        let mut buf = Vec::new();
        put_i32(&mut buf, self.job_id);
        put_f32(&mut buf, self.priority);
        put_i32(&mut buf, self.incremental as i32);
        put_i32(&mut buf, first);
        let range = &self.revisions[first as usize..=last as usize];
        put_i32(&mut buf, range.len() as i32);
        for rev in range {
            put_i32(&mut buf, rev.literals.len() as i32);
            for &lit in &rev.literals {
                put_i32(&mut buf, lit);
            }
            put_i32(&mut buf, rev.assumptions.len() as i32);
            for &a in &rev.assumptions {
                put_i32(&mut buf, a);
            }
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let job_id = take_i32(bytes, &mut pos)?;
        let priority = take_f32(bytes, &mut pos)?;
        let incremental = take_i32(bytes, &mut pos)? != 0;
        let _first = take_i32(bytes, &mut pos)?;
        let revisions = Self::take_revisions(bytes, &mut pos)?;
        finish(bytes, pos)?;
        Ok(Self {
            job_id,
            priority,
            incremental,
            revisions,
        })
    }

    /// Append the revisions of an amendment transfer to this description.
    pub fn apply_amendment(&mut self, bytes: &[u8]) -> Result<(), CodecError> {
        let mut pos = 0;
        let _job_id = take_i32(bytes, &mut pos)?;
        let _priority = take_f32(bytes, &mut pos)?;
        let _incremental = take_i32(bytes, &mut pos)?;
        let first = take_i32(bytes, &mut pos)?;
        let revisions = Self::take_revisions(bytes, &mut pos)?;
        finish(bytes, pos)?;
        self.revisions.truncate(first as usize);
        self.revisions.extend(revisions);
        Ok(())
    }

    fn take_revisions(bytes: &[u8], pos: &mut usize) -> Result<Vec<JobRevision>, CodecError> {
        let count = take_i32(bytes, pos)?.max(0) as usize;
        let mut revisions = Vec::with_capacity(count);
        for _ in 0..count {
            let n_lits = take_i32(bytes, pos)?.max(0) as usize;
            let mut literals = Vec::with_capacity(n_lits);
            for _ in 0..n_lits {
                literals.push(take_i32(bytes, pos)?);
            }
            let n_assumptions = take_i32(bytes, pos)?.max(0) as usize;
            let mut assumptions = Vec::with_capacity(n_assumptions);
            for _ in 0..n_assumptions {
                assumptions.push(take_i32(bytes, pos)?);
            }
            revisions.push(JobRevision {
                literals,
                assumptions,
            });
        }
        Ok(revisions)
    }
}

/// Outcome of one job at one revision, shipped root -> client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub job_id: JobId,
    pub revision: i32,
    /// 10 = SAT, 20 = UNSAT, 0 = UNKNOWN (solver exit-code convention).
    pub result_code: i32,
    /// Model literals for SAT, failed assumptions for UNSAT.
    pub solution: Vec<i32>,
}

impl JobResult {
    pub fn transfer_size(&self) -> i32 {
        (3 + self.solution.len()) as i32 * 4
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.transfer_size() as usize);
        put_i32(&mut buf, self.job_id);
        put_i32(&mut buf, self.revision);
        put_i32(&mut buf, self.result_code);
        for &lit in &self.solution {
            put_i32(&mut buf, lit);
        }
        buf
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut pos = 0;
        let job_id = take_i32(bytes, &mut pos)?;
        let revision = take_i32(bytes, &mut pos)?;
        let result_code = take_i32(bytes, &mut pos)?;
        let solution = decode_ints(&bytes[pos..])?;
        Ok(Self {
            job_id,
            revision,
            result_code,
            solution,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_request_round_trip() {
        let req = JobRequest {
            job_id: 7,
            root_rank: 3,
            requesting_rank: 0,
            requested_index: 4,
            time_of_birth: 12.5,
            num_hops: 9,
            revision: 1,
            full_transfer: true,
        };
        assert_eq!(JobRequest::deserialize(&req.serialize()).unwrap(), req);
    }

    #[test]
    fn job_message_round_trip() {
        let msg = JobMessage {
            job_id: 3,
            epoch: 11,
            tag: ClauseMsg::Gather,
            payload: vec![1, -2, 0, 5],
        };
        assert_eq!(JobMessage::deserialize(&msg.serialize()).unwrap(), msg);
    }

    #[test]
    fn description_round_trip_and_amendment() {
        let mut desc = JobDescription::new(9, 0.5, vec![1, 2, 0, -1, 0], vec![2]);
        desc.incremental = true;
        let shipped = JobDescription::deserialize(&desc.serialize()).unwrap();
        assert_eq!(shipped, desc);

        desc.revisions.push(JobRevision {
            literals: vec![3, 0],
            assumptions: vec![-3],
        });
        let amendment = desc.serialize_range(1, 1);
        let mut stale = shipped;
        stale.apply_amendment(&amendment).unwrap();
        assert_eq!(stale, desc);
        assert_eq!(stale.revision(), 1);
        assert_eq!(stale.formula(), vec![1, 2, 0, -1, 0, 3, 0]);
        assert_eq!(stale.assumptions(), &[-3]);
    }

    #[test]
    fn result_round_trip() {
        let result = JobResult {
            job_id: 2,
            revision: 0,
            result_code: 10,
            solution: vec![1, -2, 3],
        };
        assert_eq!(JobResult::deserialize(&result.serialize()).unwrap(), result);
    }
}
