pub mod dimacs;

use crate::comm::{FabricError, LocalFabric, Tag};
use crate::config::JobManifest;
use crate::data::job_transfer::{JobDescription, JobRequest, JobResult, JobSignature};
use crate::data::{encode_ints, JobId};
use crate::results::{JobRecord, ResultSink, Satisfiability, SinkError};
use dimacs::DimacsError;
use ignore::WalkBuilder;
use itertools::Itertools;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("failed to parse instance")]
    Dimacs(#[from] DimacsError),
    #[error("manifest matched no instance files")]
    NoInstances,
}

/// One job waiting for its arrival offset.
#[derive(Debug)]
struct Submission {
    name: String,
    path: PathBuf,
    description: JobDescription,
    priority: f32,
    arrival: f32,
    wallclock_limit: Option<f32>,
}

/// A submitted job tracked on the client side until its result returns.
#[derive(Debug)]
struct ClientJob {
    name: String,
    description: JobDescription,
    submitted_at: f32,
    root_rank: Option<usize>,
    wallclock_limit: Option<f32>,
    done: bool,
}

/// The client role of the client-facing worker: expands the manifest into
/// concrete jobs, injects them into the fleet, and collects results.
pub struct Intake {
    pending: Vec<Submission>,
    active: BTreeMap<JobId, ClientJob>,
    sink: ResultSink,
    rng: StdRng,
}

impl Intake {
    /// Expand every manifest entry into per-file submissions, parsing the
    /// instances up front so defects surface before the fleet runs.
    pub fn from_manifest(manifest: &JobManifest) -> Result<Self, IntakeError> {
        let mut pending = Vec::new();
        let mut next_job_id: JobId = 1;

        for (name, spec) in &manifest.jobs {
            let glob = globset::GlobBuilder::new(spec.glob.as_str())
                .build()?
                .compile_matcher();

            let Some((first, others)) = spec.paths.split_first() else {
                continue;
            };
            let mut builder = WalkBuilder::new(first.as_str());
            for path in others {
                builder.add(path.as_str());
            }
            let files = builder
                .build()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("failed to search for instances of {name}: {e}");
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_some_and(|t| t.is_file()))
                .map(|entry| entry.into_path())
                .filter(|path| glob.is_match(path))
                .sorted()
                .collect_vec();

            if files.is_empty() {
                error!("jobs.{name} matched no instance files");
                continue;
            }
            let multiple = files.len() > 1;
            for path in files {
                let cnf = dimacs::parse_file(&path)?;
                let job_id = next_job_id;
                next_job_id += 1;

                let mut description =
                    JobDescription::new(job_id, spec.priority, cnf.literals, spec.assumptions.clone());
                description.incremental = spec.incremental;

                let job_name = if multiple {
                    format!(
                        "{name}/{}",
                        path.file_stem().unwrap_or_default().to_string_lossy()
                    )
                } else {
                    name.to_string()
                };
                debug!(
                    job = job_id,
                    name = %job_name,
                    vars = cnf.num_vars,
                    clauses = cnf.num_clauses,
                    "queued instance"
                );
                pending.push(Submission {
                    name: job_name,
                    path,
                    description,
                    priority: spec.priority,
                    arrival: spec.arrival,
                    wallclock_limit: spec.wallclock_limit,
                });
            }
        }

        if pending.is_empty() {
            return Err(IntakeError::NoInstances);
        }
        pending.sort_by(|a, b| a.arrival.total_cmp(&b.arrival));
        Ok(Self {
            pending,
            active: BTreeMap::new(),
            sink: ResultSink::load(manifest.report.clone()),
            rng: StdRng::seed_from_u64(42),
        })
    }

    pub fn is_client_job(&self, job_id: JobId) -> bool {
        self.active.contains_key(&job_id)
    }

    pub fn all_done(&self) -> bool {
        self.pending.is_empty() && self.active.values().all(|j| j.done)
    }

    /// Submit due jobs and police per-job wall-clock limits.
    pub fn tick(
        &mut self,
        my_rank: usize,
        num_ranks: usize,
        now: f32,
        fabric: &LocalFabric,
    ) -> Result<(), FabricError> {
        while self.pending.first().is_some_and(|s| s.arrival <= now) {
            let submission = self.pending.remove(0);
            let job_id = submission.description.job_id;
            let request = JobRequest::new(job_id, -1, my_rank as i32, 0, now);
            let dest = if num_ranks > 1 {
                // start the walk anywhere but here
                let mut dest = self.rng.gen_range(0..num_ranks);
                while dest == my_rank {
                    dest = self.rng.gen_range(0..num_ranks);
                }
                dest
            } else {
                my_rank
            };
            info!(
                job = job_id,
                name = %submission.name,
                file = %submission.path.display(),
                priority = submission.priority,
                dest,
                "submitting job"
            );
            fabric.send(dest, Tag::FindNode, request.serialize())?;
            self.active.insert(
                job_id,
                ClientJob {
                    name: submission.name,
                    description: submission.description,
                    submitted_at: now,
                    root_rank: None,
                    wallclock_limit: submission.wallclock_limit,
                    done: false,
                },
            );
        }

        for (&job_id, job) in self.active.iter() {
            if job.done {
                continue;
            }
            let Some(limit) = job.wallclock_limit else {
                continue;
            };
            if now - job.submitted_at > limit {
                if let Some(root) = job.root_rank {
                    info!(job = job_id, "client-side wall-clock limit hit, aborting");
                    fabric.send(root, Tag::Abort, encode_ints(&[job_id, 0]))?;
                }
            }
        }
        Ok(())
    }

    /// A worker offers to adopt the root of one of our jobs.
    pub fn handle_root_offer(
        &mut self,
        req: &JobRequest,
        source: usize,
        fabric: &LocalFabric,
    ) -> Result<(), FabricError> {
        let Some(job) = self.active.get_mut(&req.job_id) else {
            return Ok(());
        };
        if job.done {
            debug!(job = req.job_id, "rejecting root offer for a finished job");
            return fabric.send(source, Tag::RejectBecomeChild, req.serialize());
        }
        job.root_rank = Some(source);
        let signature = JobSignature {
            job_id: req.job_id,
            root_rank: source as i32,
            revision: job.description.revision(),
            transfer_size: job.description.serialize().len() as i32,
        };
        debug!(job = req.job_id, root = source, "accepting root adoption");
        fabric.send(source, Tag::AcceptBecomeChild, signature.serialize())
    }

    /// The adopter acknowledged; ship the full description.
    pub fn handle_root_ack(
        &mut self,
        req: &JobRequest,
        source: usize,
        fabric: &LocalFabric,
    ) -> Result<(), FabricError> {
        let Some(job) = self.active.get(&req.job_id) else {
            return Ok(());
        };
        debug!(job = req.job_id, to = source, "sending job description");
        fabric.send(source, Tag::SendJobDescription, job.description.serialize())
    }

    /// Root advertised a finished job; ask for the full result.
    pub fn handle_job_done(
        &mut self,
        job_id: JobId,
        source: usize,
        fabric: &LocalFabric,
    ) -> Result<(), FabricError> {
        if self.active.get(&job_id).is_some_and(|j| !j.done) {
            fabric.send(source, Tag::QueryJobResult, encode_ints(&[job_id]))?;
        }
        Ok(())
    }

    /// Full result arrived; record it and release the job.
    pub fn handle_result(&mut self, result: JobResult, now: f32) {
        let Some(job) = self.active.get_mut(&result.job_id) else {
            return;
        };
        if job.done {
            return;
        }
        job.done = true;
        self.sink.record(JobRecord {
            name: job.name.clone(),
            job_id: result.job_id,
            satisfiable: Satisfiability::from_result_code(result.result_code),
            revision: result.revision,
            response_time: now - job.submitted_at,
            solution_literals: result.solution.len(),
        });
    }

    /// The job was aborted fleet-side (limits, errors).
    pub fn handle_abort(&mut self, job_id: JobId, now: f32) {
        let Some(job) = self.active.get_mut(&job_id) else {
            return;
        };
        if job.done {
            return;
        }
        job.done = true;
        self.sink.record(JobRecord {
            name: job.name.clone(),
            job_id,
            satisfiable: Satisfiability::Unknown,
            revision: 0,
            response_time: now - job.submitted_at,
            solution_literals: 0,
        });
    }

    pub fn close(self) -> Result<(), SinkError> {
        info!(records = self.sink.num_records(), "closing result sink");
        self.sink.close()
    }
}
