use cowstr::CowStr;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read the job manifest")]
    ManifestIo(#[from] std::io::Error),
    #[error("failed to parse the job manifest")]
    ManifestFormat(#[from] serde_yaml::Error),
    #[error("globs were invalid")]
    InvalidGlobs(#[from] globset::Error),
    #[error("config contains one or more errors, see previous error messages")]
    PreflightFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerMode {
    CutoffPriority,
    EventDriven,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundingMode {
    Bisection,
    Probabilistic,
}

/// Resolved run options of one fleet, shared by every worker.
#[derive(Debug, Clone)]
pub struct Options {
    pub num_workers: usize,
    pub load_factor: f32,
    /// Global wall-clock timeout in seconds; 0 = unlimited.
    pub global_timeout: f32,
    pub balance_period: f32,
    pub threads_per_job: usize,
    pub time_per_instance: f32,
    pub cpuh_per_instance: f32,
    pub balancer: BalancerMode,
    pub rounding: RoundingMode,
    pub growth_period: f32,
    pub continuous_growth: bool,
    pub max_demand: i32,
    pub bounce_alternatives: usize,
    pub derandomize: bool,
    pub warmup: bool,
    pub share_period: f32,
    pub solver_lits_per_process: i64,
    /// GiB of resident memory before inactive leaf jobs are considered
    /// for eviction; 0 = unbounded.
    pub memory_budget_gib: f32,
    pub sleep_on_idle: bool,
    pub yield_on_idle: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            num_workers: 4,
            load_factor: 1.0,
            global_timeout: 0.0,
            balance_period: 0.1,
            threads_per_job: 2,
            time_per_instance: 0.0,
            cpuh_per_instance: 0.0,
            balancer: BalancerMode::CutoffPriority,
            rounding: RoundingMode::Bisection,
            growth_period: 0.0,
            continuous_growth: false,
            max_demand: 0,
            bounce_alternatives: 4,
            derandomize: false,
            warmup: false,
            share_period: 1.0,
            solver_lits_per_process: 0,
            memory_budget_gib: 0.0,
            sleep_on_idle: true,
            yield_on_idle: false,
        }
    }
}

impl Options {
    /// Catch every option error at once instead of piece-by-piece.
    pub fn preflight_checks(&self) -> bool {
        let mut contains_error = false;
        if self.num_workers == 0 {
            error!("a fleet needs at least one worker");
            contains_error = true;
        }
        if !(self.load_factor > 0.0 && self.load_factor <= 1.0) {
            error!("load factor must lie in (0, 1]");
            contains_error = true;
        }
        if self.threads_per_job == 0 {
            error!("threads-per-job cannot be 0");
            contains_error = true;
        }
        if self.balance_period <= 0.0 {
            error!("balance period must be positive");
            contains_error = true;
        }
        if self.derandomize {
            if self.bounce_alternatives % 2 != 0 {
                error!("bounce-alternatives must be even");
                contains_error = true;
            }
            if self.bounce_alternatives >= self.num_workers {
                error!("there must be more workers than bounce alternatives per worker");
                contains_error = true;
            }
        }
        contains_error
    }
}

/// One named entry of the job manifest: which CNF files to submit, and how.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub path: Option<CowStr>,
    #[serde(default)]
    pub paths: Vec<CowStr>,
    /// Glob filter applied while walking the given paths.
    #[serde(default = "default_glob")]
    pub glob: CowStr,
    #[serde(default = "default_priority")]
    pub priority: f32,
    /// Submission offset from fleet start, seconds.
    #[serde(default)]
    pub arrival: f32,
    pub max_demand: Option<i32>,
    pub wallclock_limit: Option<f32>,
    #[serde(default)]
    pub incremental: bool,
    #[serde(default)]
    pub assumptions: Vec<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct JobManifest {
    pub jobs: BTreeMap<CowStr, JobSpec>,
    /// Where to write the result report; log-only when absent.
    #[serde(default)]
    pub report: Option<PathBuf>,
}

fn default_priority() -> f32 {
    1.0
}

fn default_glob() -> CowStr {
    CowStr::from("*.cnf")
}

impl JobManifest {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Validate the whole manifest, reporting every defect before failing.
    pub fn preflight_checks(&mut self) -> bool {
        let mut contains_error = false;

        if self.jobs.is_empty() {
            error!("no jobs defined, nothing to schedule");
            contains_error = true;
        }

        for (name, spec) in self.jobs.iter_mut() {
            if spec.priority <= 0.0 {
                error!("jobs.{name}.priority must be positive");
                contains_error = true;
            }
            if let Some(limit) = spec.wallclock_limit {
                if limit <= 0.0 {
                    error!("jobs.{name}.wallclock_limit must be positive when given");
                    contains_error = true;
                }
            }
            if let Some(md) = spec.max_demand {
                if md < 1 {
                    error!("jobs.{name}.max_demand must be at least 1");
                    contains_error = true;
                }
            }
            if spec.path.is_none() && spec.paths.is_empty() {
                error!("jobs.{name} contains neither 'path' nor 'paths', a job can't be a NOP");
                contains_error = true;
            } else if let Some(ref path) = spec.path {
                if !spec.paths.is_empty() {
                    tracing::warn!(
                        "jobs.{name} contains both 'path' and 'paths', treating 'path' as a member of 'paths'"
                    );
                }
                spec.paths.push(path.clone());
            }
            if let Err(e) = globset::GlobBuilder::new(spec.glob.as_str()).build() {
                error!("jobs.{name}.glob failed to compile: {e}");
                contains_error = true;
            }
        }

        contains_error
    }
}
