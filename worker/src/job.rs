use crate::comm::LocalFabric;
use crate::data::job_transfer::{JobDescription, JobMessage, JobRequest, JobResult};
use crate::data::job_tree::JobTree;
use crate::data::JobId;
use crate::sat::SatEngine;
use tracing::{info, warn};

/// Lifecycle of a job on one worker. PAST is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    None,
    Committed,
    Initializing,
    Active,
    /// Interrupted and waiting, e.g. for the next revision of an
    /// incremental job.
    Standby,
    Suspended,
    Past,
}

/// Application behind a job; the scheduler only sees the capability
/// surface below.
pub enum JobKind {
    Sat(SatEngine),
}

/// Per-job growth schedule and limits, carved out of the run options.
#[derive(Debug, Clone)]
pub struct JobParams {
    pub growth_period: f32,
    pub continuous_growth: bool,
    pub max_demand: i32,
    pub threads_per_job: usize,
    pub share_period: f32,
    pub solver_lits_per_process: i64,
}

pub struct Job {
    pub id: JobId,
    pub state: JobState,
    pub tree: JobTree,
    pub commitment: Option<JobRequest>,
    pub description: Option<JobDescription>,
    pub priority: f32,
    pub time_of_arrival: f32,
    pub time_of_activation: f32,
    pub time_of_abort: f32,
    pub last_volume: i32,
    pub result: Option<JobResult>,
    kind: Option<JobKind>,
    params: JobParams,
    threads: usize,
    comm_size: usize,
    state_before_commit: JobState,
}

impl Job {
    pub fn new(id: JobId, comm_size: usize, my_rank: usize, params: JobParams, now: f32) -> Self {
        Self {
            id,
            state: JobState::None,
            tree: JobTree::new(comm_size, my_rank, id),
            commitment: None,
            description: None,
            priority: 0.0,
            time_of_arrival: now,
            time_of_activation: 0.0,
            time_of_abort: 0.0,
            last_volume: 0,
            result: None,
            kind: None,
            threads: params.threads_per_job,
            params,
            comm_size,
            state_before_commit: JobState::None,
        }
    }

    pub fn has_description(&self) -> bool {
        self.description.is_some()
    }

    pub fn revision(&self) -> i32 {
        self.description.as_ref().map_or(0, |d| d.revision())
    }

    pub fn age(&self, now: f32) -> f32 {
        if self.time_of_activation > 0.0 {
            now - self.time_of_activation
        } else {
            0.0
        }
    }

    /// Promise this worker to the requested tree position.
    pub fn commit(&mut self, req: &JobRequest) {
        debug_assert!(!matches!(self.state, JobState::Active | JobState::Past));
        self.state_before_commit = self.state;
        self.state = JobState::Committed;
        self.tree
            .update(req.requested_index, req.root_rank, req.requesting_rank);
        self.commitment = Some(req.clone());
    }

    pub fn uncommit(&mut self) {
        debug_assert!(self.state == JobState::Committed);
        self.commitment = None;
        self.state = self.state_before_commit;
    }

    /// Begin computing on a freshly received description.
    pub fn start(&mut self, desc: JobDescription) {
        debug_assert!(self.state == JobState::Committed);
        self.commitment = None;
        self.priority = desc.priority;

        // Solver literal threshold: shrink the portfolio rather than blow
        // the memory budget on a huge formula.
        let slpp = self.params.solver_lits_per_process;
        if slpp > 0 && (self.threads * desc.num_literals()) as i64 > slpp {
            let cut = ((slpp as usize) / desc.num_literals().max(1)).max(1);
            info!(job = self.id, threads = cut, "literal threshold exceeded, cutting down portfolio");
            self.threads = cut;
        }

        let engine = SatEngine::start(
            &desc,
            self.threads,
            self.tree.index(),
            self.params.share_period,
        );
        self.description = Some(desc);
        self.kind = Some(JobKind::Sat(engine));
        self.state = JobState::Initializing;
    }

    /// The solver portfolio finished starting up.
    pub fn initialized(&self) -> bool {
        match &self.kind {
            Some(JobKind::Sat(engine)) => engine.initialized(),
            None => false,
        }
    }

    pub fn activate(&mut self, now: f32) {
        debug_assert!(self.state == JobState::Initializing);
        self.state = JobState::Active;
        if self.time_of_activation <= 0.0 {
            self.time_of_activation = now;
        }
        self.last_volume = self.last_volume.max(1);
    }

    /// Resume a suspended job at a (possibly new) tree position.
    pub fn resume(&mut self, index: i32, root_rank: i32, parent_rank: i32, now: f32) {
        self.commitment = None;
        self.tree.update(index, root_rank, parent_rank);
        match self.state {
            JobState::Committed | JobState::Suspended => {}
            other => {
                warn!(job = self.id, state = ?other, "resume from unexpected state");
            }
        }
        if let Some(JobKind::Sat(engine)) = &self.kind {
            engine.resume();
        }
        self.state = JobState::Active;
        if self.time_of_activation <= 0.0 {
            self.time_of_activation = now;
        }
    }

    pub fn suspend(&mut self) {
        debug_assert!(self.state == JobState::Active);
        if let Some(JobKind::Sat(engine)) = &self.kind {
            engine.suspend();
        }
        self.state = JobState::Suspended;
        info!(job = self.id, "suspended solvers");
    }

    /// Interrupt the current computation but keep the job resident.
    pub fn stop(&mut self) {
        if let Some(JobKind::Sat(engine)) = &self.kind {
            engine.interrupt();
        }
        self.state = JobState::Standby;
    }

    pub fn terminate(&mut self, now: f32) {
        if let Some(JobKind::Sat(engine)) = &self.kind {
            engine.terminate();
        }
        self.tree.unset_left_child();
        self.tree.unset_right_child();
        self.state = JobState::Past;
        self.time_of_abort = now;
        info!(job = self.id, "terminated");
    }

    /// A PAST job may be forgotten once its solver threads are gone.
    pub fn is_destructible(&mut self) -> bool {
        match self.kind.as_mut() {
            Some(JobKind::Sat(engine)) => {
                let done = engine.is_destructible();
                if done {
                    engine.join_finished();
                }
                done
            }
            None => true,
        }
    }

    /// Number of workers this job would accept, per its growth schedule.
    pub fn demand(&self, prev_volume: i32, now: f32) -> i32 {
        if self.state != JobState::Active {
            return prev_volume.max(1);
        }
        let comm_size = self.comm_size as i32;
        let mut demand = if self.params.growth_period <= 0.0 {
            comm_size
        } else if self.time_of_activation <= 0.0 {
            1
        } else {
            let periods = (now - self.time_of_activation) / self.params.growth_period;
            if self.params.continuous_growth {
                // d(0) = 1; d doubles-plus-one every growth period
                let grown = 2f32.powf(periods + 1.0) - 1.0;
                comm_size.min(grown as i32)
            } else {
                let periods = periods.floor() as u32;
                comm_size.min((1i32 << (periods + 1).min(30)) - 1)
            }
        };
        if self.params.max_demand > 0 {
            demand = demand.min(self.params.max_demand);
        }
        demand.max(1)
    }

    /// Whether this node wants to start a clause-sharing round now.
    pub fn wants_to_communicate(&self, now: f32) -> bool {
        if self.state != JobState::Active || !self.tree.is_leaf() {
            return false;
        }
        match &self.kind {
            Some(JobKind::Sat(engine)) => {
                engine.initialized()
                    && engine.sharing.leaf_wants_round(now, self.time_of_activation)
            }
            None => false,
        }
    }

    pub fn communicate(&mut self, fabric: &LocalFabric, now: f32) {
        let id = self.id;
        if let Some(JobKind::Sat(engine)) = self.kind.as_mut() {
            engine.initiate_sharing(id, &self.tree, fabric, now);
        }
    }

    pub fn handle_communication(&mut self, source: usize, msg: JobMessage, fabric: &LocalFabric) {
        if self.state != JobState::Active {
            return;
        }
        if let Some(JobKind::Sat(engine)) = self.kind.as_mut() {
            engine.handle_sharing(source, msg, &self.tree, fabric);
        }
    }

    /// One cooperative check for a finished solver; never blocks.
    pub fn poll_result(&mut self) -> Option<JobResult> {
        if self.state != JobState::Active {
            return None;
        }
        let id = self.id;
        if let Some(JobKind::Sat(engine)) = self.kind.as_mut() {
            let (result_code, solution, revision) = engine.poll_result()?;
            let result = JobResult {
                job_id: id,
                revision,
                result_code,
                solution,
            };
            self.result = Some(result.clone());
            return Some(result);
        }
        None
    }

    /// Feed an amendment transfer into the running portfolio.
    pub fn apply_amendment(&mut self, bytes: &[u8]) -> Result<i32, crate::data::CodecError> {
        let desc = self.description.as_mut().expect("amending without description");
        desc.apply_amendment(bytes)?;
        let revision = desc.revision();
        if let Some(JobKind::Sat(engine)) = &mut self.kind {
            engine.amend(desc);
        }
        self.result = None;
        self.state = JobState::Active;
        Ok(revision)
    }

    pub fn dump_stats(&self) {
        if let Some(JobKind::Sat(engine)) = &self.kind {
            engine.dump_stats(self.id);
        }
    }
}
