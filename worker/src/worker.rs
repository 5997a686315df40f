use crate::balance::cutoff::CutoffBalancer;
use crate::balance::event_driven::EventDrivenBalancer;
use crate::balance::{BalanceEntry, Balancer, LocalLoad};
use crate::comm::{LocalFabric, MessageHandle, Tag};
use crate::config::{BalancerMode, Options};
use crate::data::job_transfer::{JobDescription, JobMessage, JobRequest, JobResult, JobSignature};
use crate::data::{decode_ints, encode_ints, JobId};
use crate::intake::Intake;
use crate::job::{Job, JobParams, JobState};
use crate::util::permutation::RankPermutation;
use crate::util::Clock;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const STATS_CHECK_PERIOD: f32 = 1.0;
const JOB_CHECK_PERIOD: f32 = 0.05;
const MAX_IDLE_SLEEP_MICROS: u64 = 10_000;

/// One ranked peer of the fleet: a single-threaded control loop owning the
/// local job database, the request router and the balancer endpoint.
/// Solver work happens on threads owned by the hosted job.
pub struct Worker {
    pub(crate) rank: usize,
    pub(crate) size: usize,
    opts: Options,
    clock: Clock,
    pub(crate) fabric: LocalFabric,

    pub(crate) jobs: BTreeMap<JobId, Job>,
    pub(crate) commitments: BTreeMap<JobId, JobRequest>,
    /// Latest adoption-offer birth time per (job, index), for obsolescence.
    recent_offers: BTreeMap<(JobId, i32), f32>,
    pub(crate) volumes: BTreeMap<JobId, i32>,
    cpu_time_used: BTreeMap<JobId, f32>,
    last_limit_check: BTreeMap<JobId, f32>,

    pub(crate) current_job: Option<JobId>,
    pub(crate) load: u8,
    last_load_change: f32,

    balancer: Balancer,
    pub(crate) epoch: i32,
    last_balance: f32,

    bounce_alternatives: Vec<usize>,
    pub(crate) intake: Option<Intake>,
    exit_sent: bool,
    pub(crate) exiting: bool,

    last_stats_check: f32,
    last_job_check: f32,
    sleep_micros: u64,
    heartbeat: Arc<AtomicU64>,
    rng: StdRng,
}

impl Worker {
    pub fn new(
        fabric: LocalFabric,
        opts: Options,
        clock: Clock,
        intake: Option<Intake>,
        heartbeat: Arc<AtomicU64>,
    ) -> Self {
        let rank = fabric.rank();
        let size = fabric.num_ranks();
        let balancer = match opts.balancer {
            BalancerMode::EventDriven => Balancer::EventDriven(EventDrivenBalancer::new(
                rank,
                size,
                opts.load_factor,
                opts.balance_period,
            )),
            BalancerMode::CutoffPriority => Balancer::Cutoff(CutoffBalancer::new(
                rank,
                size,
                opts.load_factor,
                opts.rounding,
            )),
        };

        let mut worker = Self {
            rank,
            size,
            opts,
            clock,
            fabric,
            jobs: BTreeMap::new(),
            commitments: BTreeMap::new(),
            recent_offers: BTreeMap::new(),
            volumes: BTreeMap::new(),
            cpu_time_used: BTreeMap::new(),
            last_limit_check: BTreeMap::new(),
            current_job: None,
            load: 0,
            last_load_change: 0.0,
            balancer,
            epoch: 0,
            last_balance: 0.0,
            bounce_alternatives: Vec::new(),
            intake,
            exit_sent: false,
            exiting: false,
            last_stats_check: 0.0,
            last_job_check: 0.0,
            sleep_micros: 0,
            heartbeat,
            rng: StdRng::seed_from_u64(0xb0 ^ rank as u64),
        };
        worker.init();
        worker
    }

    /// Derive bounce alternatives from the global permutation and warm up
    /// the routes if asked to.
    fn init(&mut self) {
        if !self.opts.derandomize {
            return;
        }
        let k = self.opts.bounce_alternatives as isize;
        let perm = RankPermutation::new(self.size, 1);
        let position = perm.position_of(self.rank) as isize;
        let n = self.size as isize;
        for offset in (-k / 2..0).chain(1..=k / 2) {
            let neighbor = (position + offset).rem_euclid(n) as usize;
            self.bounce_alternatives.push(perm.get(neighbor));
        }
        debug!(alternatives = ?self.bounce_alternatives, "bounce alternatives");

        if self.opts.warmup {
            let payload = encode_ints(&[1, 2, 3, 4, 5, 6, 7, 8]);
            for _ in 0..5 {
                for &dest in &self.bounce_alternatives {
                    if let Err(e) = self.fabric.send(dest, Tag::Warmup, payload.clone()) {
                        warn!(dest, "warmup send failed: {e}");
                    }
                }
            }
        }
    }

    fn check_terminate(&self, now: f32) -> bool {
        if self.exiting {
            return true;
        }
        if self.opts.global_timeout > 0.0 && now > self.opts.global_timeout {
            info!("global timeout: terminating");
            return true;
        }
        false
    }

    /// The main program of this worker; returns on exit signal or global
    /// timeout.
    pub fn run(&mut self) {
        info!(rank = self.rank, "worker entering main loop");
        loop {
            let now = self.clock.elapsed();
            if self.check_terminate(now) {
                break;
            }
            let handled_messages = self.tick();
            if handled_messages {
                self.sleep_micros = 0;
            } else {
                if self.opts.sleep_on_idle {
                    self.sleep_micros += 100;
                    std::thread::sleep(std::time::Duration::from_micros(
                        self.sleep_micros.min(MAX_IDLE_SLEEP_MICROS),
                    ));
                }
                if self.opts.yield_on_idle {
                    std::thread::yield_now();
                }
            }
        }
        self.shutdown();
    }

    /// One control-loop cycle; returns whether any message was processed.
    pub fn tick(&mut self) -> bool {
        let now = self.clock.elapsed();
        self.heartbeat
            .store((now * 1000.0) as u64, Ordering::Relaxed);
        self.fabric.cycle();

        if now - self.last_stats_check > STATS_CHECK_PERIOD {
            self.last_stats_check = now;
            if let Some(id) = self.current_job {
                if let Some(job) = self.jobs.get(&id) {
                    job.dump_stats();
                }
            }
            self.check_memory_bounds();
            self.forget_old_jobs(now);
        }

        if !self.balancer.is_balancing() && now - self.last_balance >= self.opts.balance_period {
            self.rebalance(now);
        }

        if let Some(id) = self.current_job {
            if let Some(job) = self.jobs.get_mut(&id) {
                if job.wants_to_communicate(now) {
                    job.communicate(&self.fabric, now);
                }
            }
        }

        if now - self.last_job_check >= JOB_CHECK_PERIOD {
            self.last_job_check = now;
            self.check_current_job(now);
        }

        if let Some(intake) = &mut self.intake {
            if let Err(e) = intake.tick(self.rank, self.size, now, &self.fabric) {
                error!("job intake failed: {e}");
            }
            if intake.all_done() && !self.exit_sent {
                info!("all jobs processed; broadcasting exit");
                self.exit_sent = true;
                for dest in 0..self.size {
                    if let Err(e) = self.fabric.send(dest, Tag::Exit, Vec::new()) {
                        warn!(dest, "exit broadcast failed: {e}");
                    }
                }
            }
        }

        debug_assert_eq!(self.fabric.pending_sends(), 0);

        let mut handled = false;
        while let Some(handle) = self.fabric.poll() {
            handled = true;
            self.dispatch(handle, now);
            if self.exiting {
                break;
            }
        }
        handled
    }

    fn dispatch(&mut self, handle: MessageHandle, now: f32) {
        trace!(source = handle.source, tag = ?handle.tag, "processing message");
        match handle.tag {
            Tag::FindNode => self.handle_find_node(handle, now),
            Tag::QueryVolume => self.handle_query_volume(handle),
            Tag::RequestBecomeChild => self.handle_request_become_child(handle),
            Tag::AcceptBecomeChild => self.handle_accept_become_child(handle, now),
            Tag::RejectBecomeChild => self.handle_reject_become_child(handle),
            Tag::AckAcceptBecomeChild => self.handle_ack_accept_become_child(handle),
            Tag::SendJobDescription => self.handle_send_job_description(handle, now),
            Tag::UpdateVolume => self.handle_update_volume(handle, now),
            Tag::JobCommunication => self.handle_job_communication(handle),
            Tag::WorkerFoundResult => self.handle_worker_found_result(handle, now),
            Tag::ForwardClientRank => self.handle_forward_client_rank(handle),
            Tag::QueryJobResult => self.handle_query_job_result(handle),
            Tag::SendJobResult => self.handle_send_job_result(handle, now),
            Tag::JobDone => self.handle_job_done(handle),
            Tag::Terminate => self.interrupt_job(&handle, now, true, false),
            Tag::Interrupt => self.interrupt_job(&handle, now, false, false),
            Tag::Abort => self.handle_abort(handle, now),
            Tag::WorkerDefecting => self.handle_worker_defecting(handle, now),
            Tag::NotifyJobRevision => self.handle_notify_job_revision(handle),
            Tag::QueryJobRevisionDetails => self.handle_query_job_revision_details(handle),
            Tag::SendJobRevisionDetails => self.handle_send_job_revision_details(handle),
            Tag::AckJobRevisionDetails => self.handle_ack_job_revision_details(handle),
            Tag::SendJobRevisionData => self.handle_send_job_revision_data(handle),
            Tag::Collectives => self.handle_collectives(handle, now),
            Tag::AnytimeReduction | Tag::AnytimeBroadcast => self.handle_anytime(handle, now),
            Tag::Warmup => trace!(source = handle.source, "warmup message"),
            Tag::Exit => {
                info!(source = handle.source, "received exit signal");
                self.exiting = true;
            }
        }
    }

    // ---- placement and routing ----

    fn job_params(&self) -> JobParams {
        JobParams {
            growth_period: self.opts.growth_period,
            continuous_growth: self.opts.continuous_growth,
            max_demand: self.opts.max_demand,
            threads_per_job: self.opts.threads_per_job,
            share_period: self.opts.share_period,
            solver_lits_per_process: self.opts.solver_lits_per_process,
        }
    }

    fn max_job_hops(&self, root_request: bool) -> i32 {
        if root_request {
            (self.size / 2) as i32
        } else {
            (self.size * 2) as i32
        }
    }

    fn is_request_obsolete(&self, req: &JobRequest) -> bool {
        self.recent_offers
            .get(&(req.job_id, req.requested_index))
            .is_some_and(|&birth| birth > req.time_of_birth)
    }

    fn handle_find_node(&mut self, handle: MessageHandle, now: f32) {
        let Ok(req) = JobRequest::deserialize(&handle.payload) else {
            warn!(source = handle.source, "malformed placement request");
            return;
        };

        if self.is_request_obsolete(&req) {
            debug!(
                job = req.job_id,
                index = req.requested_index,
                "discarding obsolete request"
            );
            return;
        }
        if self
            .jobs
            .get(&req.job_id)
            .is_some_and(|j| j.state == JobState::Past)
        {
            debug!(job = req.job_id, "discarding request: job already finished here");
            return;
        }

        let max_hops = self.max_job_hops(req.is_root_request());
        let mut adopts = self.load == 0 && self.commitments.is_empty();

        if !adopts && req.num_hops > max_hops {
            if !req.is_root_request() {
                debug!(
                    job = req.job_id,
                    index = req.requested_index,
                    hops = req.num_hops,
                    "discarding request beyond hop limit"
                );
                return;
            }
            // Root request starving: displace an active non-root leaf.
            if self.commitments.is_empty()
                && !self
                    .jobs
                    .get(&req.job_id)
                    .is_some_and(|j| matches!(j.state, JobState::Active | JobState::Initializing))
            {
                if let Some(current_id) = self.current_job {
                    let displaceable = self.jobs.get(&current_id).is_some_and(|job| {
                        job.state == JobState::Active
                            && !job.tree.is_root()
                            && job.tree.is_leaf()
                    });
                    if displaceable {
                        info!(
                            displaced = current_id,
                            starving = req.job_id,
                            "suspending leaf to adopt starving root"
                        );
                        let job = self.jobs.get_mut(&current_id).expect("job checked above");
                        let payload = encode_ints(&[current_id, job.tree.index()]);
                        if let Err(e) =
                            self.fabric
                                .send(job.tree.parent_rank(), Tag::WorkerDefecting, payload)
                        {
                            warn!("defection notice failed: {e}");
                        }
                        job.suspend();
                        self.set_load(0, current_id, now);
                        adopts = true;
                    }
                }
            }
        }

        if !adopts {
            self.bounce_job_request(req, handle.source);
            return;
        }

        // Adoption: commit and offer ourselves to the requester.
        info!(
            job = req.job_id,
            index = req.requested_index,
            hops = req.num_hops,
            source = handle.source,
            "adopting request"
        );
        debug_assert!(self.load == 0, "adopting while busy");
        let mut req = req;
        let params = self.job_params();
        let job = self
            .jobs
            .entry(req.job_id)
            .or_insert_with(|| Job::new(req.job_id, self.size, self.rank, params, now));
        req.full_transfer = !job.has_description();
        job.commit(&req);
        self.recent_offers
            .insert((req.job_id, req.requested_index), req.time_of_birth);
        if let Err(e) = self.fabric.send(
            req.requesting_rank as usize,
            Tag::RequestBecomeChild,
            req.serialize(),
        ) {
            warn!("adoption offer failed: {e}");
        }
        self.commitments.insert(req.job_id, req);
    }

    /// Forward an unfilled request along the random walk.
    fn bounce_job_request(&mut self, mut req: JobRequest, sender: usize) {
        req.num_hops += 1;
        let hops = req.num_hops;
        if hops >= 512 && (hops & (hops - 1)) == 0 {
            warn!(job = req.job_id, index = req.requested_index, hops, "request keeps hopping");
        }

        let excluded = |rank: usize| {
            rank == self.rank
                || rank == req.requesting_rank as usize
                || rank == sender
        };
        let next = if !self.bounce_alternatives.is_empty() {
            let mut next = self.bounce_alternatives[self.rng.gen_range(0..self.bounce_alternatives.len())];
            for _ in 0..self.bounce_alternatives.len() * 2 {
                if !excluded(next) {
                    break;
                }
                next = self.bounce_alternatives[self.rng.gen_range(0..self.bounce_alternatives.len())];
            }
            next
        } else {
            let perm = RankPermutation::new(
                self.size,
                RankPermutation::request_seed(req.job_id, req.requested_index, req.requesting_rank),
            );
            let mut idx = req.num_hops as usize % self.size;
            let mut next = perm.get(idx);
            let mut attempts = 0;
            while excluded(next) && attempts < self.size {
                idx = (idx + 1) % self.size;
                next = perm.get(idx);
                attempts += 1;
            }
            next
        };
        if next == self.rank {
            // tiny fleet with nothing else to try; drop and let the
            // requester re-emit
            debug!(job = req.job_id, "no bounce destination available");
            return;
        }
        trace!(job = req.job_id, index = req.requested_index, next, "bouncing request");
        if let Err(e) = self.fabric.send(next, Tag::FindNode, req.serialize()) {
            warn!("bounce failed: {e}");
        }
    }

    fn handle_query_volume(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let Some(&job_id) = payload.first() else {
            return;
        };
        // no volume known (yet?): ignore
        if let Some(volume) = self.balancer.volume(job_id) {
            debug!(job = job_id, volume, to = handle.source, "answering volume query");
            let response = encode_ints(&[job_id, volume]);
            if let Err(e) = self.fabric.send(handle.source, Tag::UpdateVolume, response) {
                warn!("volume answer failed: {e}");
            }
        }
    }

    fn handle_request_become_child(&mut self, handle: MessageHandle) {
        let Ok(req) = JobRequest::deserialize(&handle.payload) else {
            return;
        };

        // client role: offers for roots of jobs submitted here
        if req.is_root_request() {
            if let Some(intake) = &mut self.intake {
                if intake.is_client_job(req.job_id) {
                    if let Err(e) = intake.handle_root_offer(&req, handle.source, &self.fabric) {
                        warn!("root offer handling failed: {e}");
                    }
                    return;
                }
            }
        }

        let Some(job) = self.jobs.get_mut(&req.job_id) else {
            debug!(job = req.job_id, "rejecting adoption offer for unknown job");
            let _ = self
                .fabric
                .send(handle.source, Tag::RejectBecomeChild, req.serialize());
            return;
        };

        let obsolete = self
            .recent_offers
            .get(&(req.job_id, req.requested_index))
            .is_some_and(|&birth| birth > req.time_of_birth);
        let reject = if obsolete {
            debug!(job = req.job_id, "rejecting obsolete adoption offer");
            true
        } else if !matches!(job.state, JobState::Active | JobState::Initializing) {
            debug!(job = req.job_id, state = ?job.state, "rejecting offer: job not active");
            true
        } else if req.requested_index == job.tree.left_child_index() && job.tree.has_left_child() {
            debug!(job = req.job_id, "rejecting offer: left child already set");
            true
        } else if req.requested_index == job.tree.right_child_index() && job.tree.has_right_child()
        {
            debug!(job = req.job_id, "rejecting offer: right child already set");
            true
        } else {
            false
        };

        if reject {
            if let Err(e) = self
                .fabric
                .send(handle.source, Tag::RejectBecomeChild, req.serialize())
            {
                warn!("rejection failed: {e}");
            }
            return;
        }

        let transfer_size = job
            .description
            .as_ref()
            .map_or(0, |d| d.serialize().len() as i32);
        let signature = JobSignature {
            job_id: req.job_id,
            root_rank: job.tree.root_rank() as i32,
            revision: job.revision(),
            transfer_size,
        };
        if let Err(e) = self.fabric.send(
            handle.source,
            Tag::AcceptBecomeChild,
            signature.serialize(),
        ) {
            warn!("acceptance failed: {e}");
            return;
        }
        if req.full_transfer {
            info!(job = req.job_id, index = req.requested_index, to = handle.source, "will send description");
        } else {
            info!(job = req.job_id, index = req.requested_index, to = handle.source, "resuming child");
        }
        if req.requested_index == job.tree.left_child_index() {
            job.tree.set_left_child(handle.source);
        } else if req.requested_index == job.tree.right_child_index() {
            job.tree.set_right_child(handle.source);
        }
    }

    fn handle_accept_become_child(&mut self, handle: MessageHandle, now: f32) {
        let Ok(sig) = JobSignature::deserialize(&handle.payload) else {
            return;
        };
        let Some(req) = self.commitments.get(&sig.job_id).cloned() else {
            debug!(job = sig.job_id, "acceptance for an uncommitted job");
            return;
        };

        if req.full_transfer {
            debug!(job = req.job_id, size = sig.transfer_size, "will receive description");
            if let Err(e) =
                self.fabric
                    .send(handle.source, Tag::AckAcceptBecomeChild, req.serialize())
            {
                warn!("acceptance ack failed: {e}");
            }
            return;
        }

        // description already resident: resume directly
        self.commitments.remove(&sig.job_id);
        let mut resumed = false;
        if let Some(job) = self.jobs.get_mut(&req.job_id) {
            if job.state != JobState::Past {
                info!(job = req.job_id, index = req.requested_index, "resuming hosted job");
                job.resume(req.requested_index, req.root_rank, req.requesting_rank, now);
                resumed = true;
            }
        }
        if resumed {
            self.set_load(1, req.job_id, now);
            let parent = req.requesting_rank as usize;
            if let Err(e) = self
                .fabric
                .send(parent, Tag::QueryVolume, encode_ints(&[req.job_id]))
            {
                warn!("volume query failed: {e}");
            }
        }
    }

    fn handle_reject_become_child(&mut self, handle: MessageHandle) {
        let Ok(req) = JobRequest::deserialize(&handle.payload) else {
            return;
        };
        self.commitments.remove(&req.job_id);
        if let Some(job) = self.jobs.get_mut(&req.job_id) {
            if job.state == JobState::Committed {
                debug!(job = req.job_id, "rejected; uncommitting");
                job.uncommit();
            }
        }
    }

    fn handle_ack_accept_become_child(&mut self, handle: MessageHandle) {
        let Ok(req) = JobRequest::deserialize(&handle.payload) else {
            return;
        };

        // client role: ship the description of a job submitted here
        if req.is_root_request() {
            if let Some(intake) = &mut self.intake {
                if intake.is_client_job(req.job_id) {
                    if let Err(e) = intake.handle_root_ack(&req, handle.source, &self.fabric) {
                        warn!("description transfer failed: {e}");
                    }
                    return;
                }
            }
        }

        let Some(job) = self.jobs.get_mut(&req.job_id) else {
            return;
        };
        let description = match &job.description {
            // a terminated job only advertises its id, prompting uncommit
            Some(desc) if job.state != JobState::Past => desc.serialize(),
            _ => encode_ints(&[req.job_id]),
        };
        if let Err(e) = self
            .fabric
            .send(handle.source, Tag::SendJobDescription, description)
        {
            warn!("description send failed: {e}");
            return;
        }
        debug!(job = req.job_id, to = handle.source, "sent job description");

        if job.state == JobState::Past {
            let payload = encode_ints(&[req.job_id, req.requested_index]);
            let _ = self.fabric.send(handle.source, Tag::Terminate, payload);
            return;
        }

        if req.requested_index == job.tree.left_child_index() {
            job.tree.set_left_child(handle.source);
        } else if req.requested_index == job.tree.right_child_index() {
            job.tree.set_right_child(handle.source);
        }
        if matches!(job.state, JobState::Active | JobState::Initializing) {
            if let Some(volume) = self.balancer.volume(req.job_id) {
                debug!(volume, to = handle.source, "propagating volume to new child");
                let payload = encode_ints(&[req.job_id, volume]);
                let _ = self.fabric.send(handle.source, Tag::UpdateVolume, payload);
            }
        }
    }

    fn handle_send_job_description(&mut self, handle: MessageHandle, now: f32) {
        let Ok(job_id) = crate::data::take_i32(&handle.payload, &mut 0) else {
            return;
        };
        self.commitments.remove(&job_id);
        let Some(job) = self.jobs.get_mut(&job_id) else {
            warn!(job = job_id, "description for an unknown job");
            return;
        };

        if handle.payload.len() <= 4 {
            debug!(job = job_id, "received empty description; uncommitting");
            if job.state == JobState::Committed {
                job.uncommit();
            }
            return;
        }

        let Ok(desc) = JobDescription::deserialize(&handle.payload) else {
            warn!(job = job_id, "malformed job description");
            return;
        };
        debug!(job = job_id, bytes = handle.payload.len(), "initializing from description");
        job.start(desc);
        self.cpu_time_used.entry(job_id).or_insert(0.0);
        self.set_load(1, job_id, now);
    }

    fn handle_update_volume(&mut self, handle: MessageHandle, now: f32) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, volume] = payload[..] else {
            return;
        };
        if !self.jobs.contains_key(&job_id) {
            warn!(job = job_id, "volume update for unknown job");
            return;
        }
        self.balancer.update_volume(job_id, volume);
        self.update_volume(job_id, volume, now);
    }

    fn handle_job_communication(&mut self, handle: MessageHandle) {
        let Ok(msg) = JobMessage::deserialize(&handle.payload) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&msg.job_id) else {
            warn!(job = msg.job_id, "job message for unknown job");
            return;
        };
        job.handle_communication(handle.source, msg, &self.fabric);
    }

    fn handle_worker_found_result(&mut self, handle: MessageHandle, now: f32) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, revision, _result_code] = payload[..] else {
            return;
        };
        let Some(job) = self.jobs.get(&job_id) else {
            warn!(job = job_id, "result report for unknown job");
            return;
        };
        if !job.tree.is_root() {
            warn!(job = job_id, "result report reached a non-root node");
            return;
        }
        if job.state == JobState::Past {
            debug!(job = job_id, "discarding result for finished job");
            return;
        }
        if job.revision() > revision {
            debug!(job = job_id, revision, "discarding result for old revision");
            return;
        }
        info!(job = job_id, source = handle.source, "result found");

        let client = job.tree.parent_rank();
        let incremental = job.description.as_ref().is_some_and(|d| d.incremental);
        if handle.source == self.rank {
            self.inform_client(job_id, client);
        } else {
            let payload = encode_ints(&[job_id, client as i32]);
            if let Err(e) = self
                .fabric
                .send(handle.source, Tag::ForwardClientRank, payload)
            {
                warn!("client rank forwarding failed: {e}");
            }
        }

        // incremental jobs only pause for the next revision
        self.interrupt_job(&handle, now, !incremental, false);
    }

    fn handle_forward_client_rank(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, client_rank] = payload[..] else {
            return;
        };
        self.inform_client(job_id, client_rank.max(0) as usize);
    }

    /// Advertise the finished job to its client.
    fn inform_client(&mut self, job_id: JobId, client_rank: usize) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let Some(result) = &job.result else {
            warn!(job = job_id, "asked to inform client without a result");
            return;
        };
        debug!(job = job_id, client = client_rank, "sending job-done notice");
        let payload = encode_ints(&[job_id, result.transfer_size()]);
        if let Err(e) = self.fabric.send(client_rank, Tag::JobDone, payload) {
            warn!("job-done notice failed: {e}");
        }
    }

    fn handle_query_job_result(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let Some(&job_id) = payload.first() else {
            return;
        };
        let Some(result) = self.jobs.get(&job_id).and_then(|j| j.result.as_ref()) else {
            return;
        };
        debug!(job = job_id, to = handle.source, "sending full result");
        if let Err(e) = self
            .fabric
            .send(handle.source, Tag::SendJobResult, result.serialize())
        {
            warn!("result delivery failed: {e}");
        }
    }

    fn handle_send_job_result(&mut self, handle: MessageHandle, now: f32) {
        let Ok(result) = JobResult::deserialize(&handle.payload) else {
            return;
        };
        if let Some(intake) = &mut self.intake {
            intake.handle_result(result, now);
        }
    }

    fn handle_job_done(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let Some(&job_id) = payload.first() else {
            return;
        };
        if let Some(intake) = &mut self.intake {
            if let Err(e) = intake.handle_job_done(job_id, handle.source, &self.fabric) {
                warn!("result query failed: {e}");
            }
        }
    }

    fn handle_abort(&mut self, handle: MessageHandle, now: f32) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let Some(&job_id) = payload.first() else {
            return;
        };

        // the root forwards the abort notice towards the client
        if let Some(job) = self.jobs.get(&job_id) {
            if job.tree.is_root() && job.state != JobState::Past {
                let _ = self.fabric.send(
                    job.tree.parent_rank(),
                    Tag::Abort,
                    handle.payload.clone(),
                );
            }
        }
        if let Some(intake) = &mut self.intake {
            intake.handle_abort(job_id, now);
        }

        self.interrupt_job(&handle, now, true, true);
    }

    fn handle_worker_defecting(&mut self, handle: MessageHandle, now: f32) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, index] = payload[..] else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.tree.left_child_index() == index {
            job.tree.unset_left_child();
        } else if job.tree.right_child_index() == index {
            job.tree.unset_right_child();
        } else {
            error!(job = job_id, index, "unknown child is defecting");
            return;
        }
        let root_rank = job.tree.root_rank() as i32;

        // look for a replacement for the defected child
        let next = if !self.bounce_alternatives.is_empty() {
            self.bounce_alternatives[self.rng.gen_range(0..self.bounce_alternatives.len())]
        } else {
            let mut next = self.rng.gen_range(0..self.size);
            while next == self.rank && self.size > 1 {
                next = self.rng.gen_range(0..self.size);
            }
            next
        };
        debug!(job = job_id, index, next, "replacing defected child");
        let req = JobRequest::new(job_id, root_rank, self.rank as i32, index, now);
        if let Err(e) = self.fabric.send(next, Tag::FindNode, req.serialize()) {
            warn!("replacement request failed: {e}");
        }
    }

    // ---- incremental revisions ----

    fn handle_notify_job_revision(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, revision] = payload[..] else {
            return;
        };
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let last_known = job.revision();
        if revision > last_known {
            debug!(job = job_id, revision, last_known, "revision update");
            let request = encode_ints(&[job_id, last_known + 1, revision]);
            let _ = self
                .fabric
                .send(handle.source, Tag::QueryJobRevisionDetails, request);
        } else {
            warn!(job = job_id, revision, last_known, "useless revision update");
        }
    }

    fn handle_query_job_revision_details(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, first, last] = payload[..] else {
            return;
        };
        let Some(desc) = self.jobs.get(&job_id).and_then(|j| j.description.as_ref()) else {
            return;
        };
        let response = encode_ints(&[job_id, first, last, desc.transfer_size(first, last)]);
        let _ = self
            .fabric
            .send(handle.source, Tag::SendJobRevisionDetails, response);
    }

    fn handle_send_job_revision_details(&mut self, handle: MessageHandle) {
        let _ = self.fabric.send(
            handle.source,
            Tag::AckJobRevisionDetails,
            handle.payload.clone(),
        );
    }

    fn handle_ack_job_revision_details(&mut self, handle: MessageHandle) {
        let Ok(payload) = decode_ints(&handle.payload) else {
            return;
        };
        let [job_id, first, last, _size] = payload[..] else {
            return;
        };
        let Some(desc) = self.jobs.get(&job_id).and_then(|j| j.description.as_ref()) else {
            return;
        };
        let _ = self.fabric.send(
            handle.source,
            Tag::SendJobRevisionData,
            desc.serialize_range(first, last),
        );
    }

    fn handle_send_job_revision_data(&mut self, handle: MessageHandle) {
        let Ok(job_id) = crate::data::take_i32(&handle.payload, &mut 0) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        match job.apply_amendment(&handle.payload) {
            Ok(revision) => {
                info!(job = job_id, revision, "computing on new revision");
                let notice = encode_ints(&[job_id, revision]);
                for child in [job.tree.left_child_rank(), job.tree.right_child_rank()]
                    .into_iter()
                    .flatten()
                {
                    let _ = self
                        .fabric
                        .send(child, Tag::NotifyJobRevision, notice.clone());
                }
            }
            Err(e) => warn!(job = job_id, "malformed revision data: {e}"),
        }
    }

    // ---- balancing ----

    fn handle_collectives(&mut self, handle: MessageHandle, now: f32) {
        if matches!(self.balancer, Balancer::Cutoff(_)) && !self.balancer.is_balancing() {
            // a faster rank is already in the next epoch
            self.fabric.defer(handle);
            return;
        }
        match self.balancer.handle_message(handle, &mut self.fabric) {
            Ok(true) => self.finish_balancing(now),
            Ok(false) => {}
            Err(e) => error!("balancing failed: {e}"),
        }
    }

    fn handle_anytime(&mut self, handle: MessageHandle, now: f32) {
        if matches!(self.balancer, Balancer::Cutoff(_)) {
            warn!(tag = ?handle.tag, "event-tree message in cutoff mode; dropping");
            return;
        }
        match self.balancer.handle_message(handle, &mut self.fabric) {
            Ok(true) => self.finish_balancing(now),
            Ok(false) => {}
            Err(e) => error!("balancing failed: {e}"),
        }
    }

    fn local_load(&self, now: f32) -> LocalLoad {
        let mut load = LocalLoad {
            busy: self.load == 1,
            ..Default::default()
        };
        for (&job_id, job) in &self.jobs {
            if !job.tree.is_root() {
                continue;
            }
            let active_root = matches!(
                job.state,
                JobState::Active | JobState::Standby | JobState::Initializing
            );
            if !active_root {
                continue;
            }
            load.num_active_jobs += 1;
            let participates = matches!(job.state, JobState::Active | JobState::Standby)
                || (job.state == JobState::Initializing && job.has_description());
            if participates {
                let prev_volume = self.volumes.get(&job_id).copied().unwrap_or(1);
                load.entries.push(BalanceEntry {
                    job_id,
                    demand: job.demand(prev_volume, now),
                    priority: job.priority,
                });
            } else {
                // implicit demand of one, not an actual participant
                debug!(job = job_id, "root not ready; implicit assignment of one");
            }
        }
        load
    }

    fn rebalance(&mut self, now: f32) {
        let load = self.local_load(now);
        self.last_balance = now;
        match self.balancer.begin(&load, &mut self.fabric, now) {
            Ok(true) => self.finish_balancing(now),
            Ok(false) => {}
            Err(e) => error!("balancing failed: {e}"),
        }
    }

    fn finish_balancing(&mut self, now: f32) {
        self.epoch += 1;
        trace!(epoch = self.epoch, "balancing completed");
        let result = self.balancer.result();
        for (job_id, volume) in result {
            if self
                .jobs
                .get(&job_id)
                .is_some_and(|j| j.last_volume != volume)
            {
                info!(job = job_id, volume, "volume update");
            }
            self.update_volume(job_id, volume, now);
        }
        self.last_balance = now;
    }

    /// Propagate a fresh volume down the job tree, growing or pruning
    /// children, and suspend this node if it fell outside the volume.
    fn update_volume(&mut self, job_id: JobId, volume: i32, now: f32) {
        self.volumes.insert(job_id, volume);
        let has_commitment = self.commitments.contains_key(&job_id);
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        job.last_volume = volume;
        if !matches!(job.state, JobState::Active | JobState::Initializing) {
            return;
        }

        let payload = encode_ints(&[job_id, volume]);
        if job.tree.is_root() {
            debug!(job = job_id, volume, "root adopting new volume");
        }

        for side in [Side::Left, Side::Right] {
            let (index, child) = match side {
                Side::Left => (job.tree.left_child_index(), job.tree.left_child_rank()),
                Side::Right => (job.tree.right_child_index(), job.tree.right_child_rank()),
            };
            match child {
                Some(child_rank) => {
                    if let Err(e) = self
                        .fabric
                        .send(child_rank, Tag::UpdateVolume, payload.clone())
                    {
                        warn!("volume propagation failed: {e}");
                    }
                    if index >= volume {
                        debug!(job = job_id, index, "pruning child outside volume");
                        match side {
                            Side::Left => job.tree.unset_left_child(),
                            Side::Right => job.tree.unset_right_child(),
                        }
                    }
                }
                None => {
                    if job.has_description() && index < volume && !has_commitment {
                        let req = JobRequest::new(
                            job_id,
                            job.tree.root_rank() as i32,
                            self.rank as i32,
                            index,
                            now,
                        );
                        let dest = job.tree.prospective_rank(index);
                        trace!(job = job_id, index, dest, "growing towards new child");
                        if let Err(e) = self.fabric.send(dest, Tag::FindNode, req.serialize()) {
                            warn!("growth request failed: {e}");
                        }
                    }
                }
            }
        }

        // shrink: this node fell outside the job's volume
        let must_suspend =
            job.tree.index() > 0 && job.tree.index() >= volume && job.state == JobState::Active;
        if must_suspend {
            job.suspend();
            self.set_load(0, job_id, now);
        }
    }

    // ---- lifecycle ----

    fn check_current_job(&mut self, now: f32) {
        let Some(job_id) = self.current_job else {
            return;
        };
        let is_root = self
            .jobs
            .get(&job_id)
            .is_some_and(|j| j.tree.is_root());
        if is_root && self.check_computation_limits(job_id, now) {
            self.timeout_job(job_id, now);
            return;
        }

        enum Step {
            Activated { root: bool, parent: usize },
            Found(JobResult),
            Nothing,
        }
        let step = {
            let Some(job) = self.jobs.get_mut(&job_id) else {
                return;
            };
            match job.state {
                JobState::Initializing if job.initialized() => {
                    job.activate(now);
                    Step::Activated {
                        root: job.tree.is_root(),
                        parent: job.tree.parent_rank(),
                    }
                }
                JobState::Active => match job.poll_result() {
                    Some(result) => Step::Found(result),
                    None => Step::Nothing,
                },
                _ => Step::Nothing,
            }
        };

        match step {
            Step::Activated { root, parent } => {
                if root {
                    if let Some(volume) = self.balancer.volume(job_id) {
                        self.update_volume(job_id, volume, now);
                    }
                } else {
                    let _ = self
                        .fabric
                        .send(parent, Tag::QueryVolume, encode_ints(&[job_id]));
                }
            }
            Step::Found(result) => {
                let root = self.jobs[&job_id].tree.root_rank();
                info!(
                    job = job_id,
                    result = result.result_code,
                    root,
                    "sending finished info to root"
                );
                let payload = encode_ints(&[job_id, result.revision, result.result_code]);
                if let Err(e) = self.fabric.send(root, Tag::WorkerFoundResult, payload) {
                    warn!("result report failed: {e}");
                }
            }
            Step::Nothing => {}
        }
    }

    /// CPU-seconds and wall-clock budget check for a locally rooted job.
    fn check_computation_limits(&mut self, job_id: JobId, now: f32) -> bool {
        let Some(job) = self.jobs.get(&job_id) else {
            return false;
        };
        if !job.tree.is_root() {
            return false;
        }
        let Some(&last_check) = self.last_limit_check.get(&job_id) else {
            self.last_limit_check.insert(job_id, now);
            self.cpu_time_used.entry(job_id).or_insert(0.0);
            return false;
        };

        let elapsed = (now - last_check).max(0.0);
        let volume = self.volumes.get(&job_id).copied().unwrap_or(1);
        let used = self.cpu_time_used.entry(job_id).or_insert(0.0);
        *used += volume as f32 * self.opts.threads_per_job as f32 * elapsed;

        let cpu_limit = self.opts.cpuh_per_instance * 3600.0;
        let mut terminate = false;
        if cpu_limit > 0.0 && *used > cpu_limit {
            info!(job = job_id, "cpu limit exceeded: aborting");
            terminate = true;
        } else if self.opts.time_per_instance > 0.0 && job.age(now) > self.opts.time_per_instance {
            info!(job = job_id, "wall-clock limit exceeded: aborting");
            terminate = true;
        }

        if terminate {
            self.last_limit_check.remove(&job_id);
        } else {
            self.last_limit_check.insert(job_id, now);
        }
        terminate
    }

    /// Self-dispatched abort of a job that ran over its limits.
    fn timeout_job(&mut self, job_id: JobId, now: f32) {
        let revision = self.jobs.get(&job_id).map_or(0, |j| j.revision());
        let handle = MessageHandle {
            source: self.rank,
            tag: Tag::Abort,
            payload: encode_ints(&[job_id, revision]),
        };
        self.handle_abort(handle, now);
    }

    /// Stop a job and propagate the terminal signal through current and
    /// past children. Deferred while the description is still in flight.
    fn interrupt_job(&mut self, handle: &MessageHandle, now: f32, terminate: bool, reckless: bool) {
        let Ok(job_id) = crate::data::take_i32(&handle.payload, &mut 0) else {
            return;
        };
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };

        if !reckless && job.state == JobState::Committed {
            // the description should still arrive; revisit afterwards
            debug!(job = job_id, "deferring interruption until description arrives");
            self.fabric.defer(handle.clone());
            return;
        }

        let accept = !matches!(job.state, JobState::None | JobState::Past);
        let tag = match (terminate, reckless) {
            (true, true) => Tag::Abort,
            (true, false) => Tag::Terminate,
            (false, _) => Tag::Interrupt,
        };

        let mut targets = Vec::new();
        if accept {
            targets.extend(job.tree.left_child_rank());
            targets.extend(job.tree.right_child_rank());
        }
        targets.extend(job.tree.past_children().iter().copied());
        job.tree.clear_past_children();
        for target in targets {
            trace!(job = job_id, target, ?tag, "propagating interruption");
            if let Err(e) = self.fabric.send(target, tag, handle.payload.clone()) {
                warn!("interruption propagation failed: {e}");
            }
        }

        if !accept {
            return;
        }
        if matches!(
            job.state,
            JobState::Initializing | JobState::Active | JobState::Standby | JobState::Suspended
        ) {
            info!(job = job_id, state = ?job.state, terminate, "interrupting");
            let was_root = job.tree.is_root();
            job.stop();
            if terminate {
                job.terminate(now);
                let was_current = self.current_job == Some(job_id);
                if was_current {
                    self.set_load(0, job_id, now);
                }
                self.balancer.update_volume(job_id, 0);
                if was_root {
                    if let Err(e) = self.balancer.forget(job_id, &mut self.fabric, now) {
                        error!("balancer forget failed: {e}");
                    }
                }
            }
        }
    }

    fn set_load(&mut self, load: u8, job_id: JobId, now: f32) {
        debug_assert!(load + self.load == 1, "load flag must flip");
        self.load = load;
        self.last_load_change = now;
        if load == 1 {
            debug_assert!(self.current_job.is_none());
            info!(job = job_id, "LOAD 1");
            self.current_job = Some(job_id);
        } else {
            debug_assert_eq!(self.current_job, Some(job_id));
            info!(job = job_id, "LOAD 0");
            self.current_job = None;
        }
    }

    // ---- housekeeping ----

    /// Rough resident-memory pressure check; only picks and reports an
    /// eviction candidate, the forget itself stays with the PAST sweep.
    fn check_memory_bounds(&mut self) {
        if self.opts.memory_budget_gib <= 0.0 {
            return;
        }
        let descriptions_gib = self
            .jobs
            .values()
            .filter_map(|j| j.description.as_ref())
            .map(|d| d.num_literals() * 4)
            .sum::<usize>() as f32
            / (1 << 30) as f32;
        if descriptions_gib > 0.9 * self.opts.memory_budget_gib {
            if let Some(job_id) = self.pick_job_to_forget() {
                warn!(
                    job = job_id,
                    resident_gib = descriptions_gib,
                    "memory bound hit; largest inactive leaf would be evicted"
                );
            }
        }
    }

    /// An inactive non-root leaf with the largest description, if any.
    fn pick_job_to_forget(&self) -> Option<JobId> {
        self.jobs
            .values()
            .filter(|job| {
                matches!(job.state, JobState::Suspended | JobState::Past)
                    && job.has_description()
                    && !job.tree.is_root()
                    && job.tree.is_leaf()
            })
            .max_by_key(|job| job.description.as_ref().map_or(0, |d| d.num_literals()))
            .map(|job| job.id)
    }

    /// Drop PAST jobs whose solvers are gone and that stayed quiet for a
    /// full balance period.
    fn forget_old_jobs(&mut self, now: f32) {
        let period = self.opts.balance_period;
        let forgettable: Vec<JobId> = self
            .jobs
            .iter_mut()
            .filter_map(|(&job_id, job)| {
                let past = job.state == JobState::Past && now - job.time_of_abort > period;
                // uncommitted shells whose description never arrived
                let never_started = job.state == JobState::None
                    && job.commitment.is_none()
                    && now - job.time_of_arrival > period;
                ((past || never_started) && job.is_destructible()).then_some(job_id)
            })
            .collect();
        for job_id in forgettable {
            debug!(job = job_id, "forgetting job");
            self.jobs.remove(&job_id);
            self.commitments.remove(&job_id);
            self.volumes.remove(&job_id);
            self.cpu_time_used.remove(&job_id);
            self.last_limit_check.remove(&job_id);
            self.recent_offers.retain(|&(j, _), _| j != job_id);
        }
    }

    fn shutdown(&mut self) {
        let now = self.clock.elapsed();
        info!(rank = self.rank, "worker shutting down");
        for job in self.jobs.values_mut() {
            if job.state != JobState::Past {
                job.terminate(now);
            }
        }
        // give solver threads a moment to notice and leave
        for _ in 0..1000 {
            if self.jobs.values_mut().all(|j| j.is_destructible()) {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        if let Some(intake) = self.intake.take() {
            if let Err(e) = intake.close() {
                error!("failed to close the result sink: {e}");
            }
        }
    }
}

enum Side {
    Left,
    Right,
}

#[cfg(test)]
mod worker_test;
