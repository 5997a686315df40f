mod balance;
mod comm;
mod config;
mod data;
mod intake;
mod job;
mod results;
mod sat;
mod util;
mod worker;

use clap::{crate_name, crate_version, Parser, ValueEnum};
use comm::LocalFabric;
use config::{BalancerMode, ConfigError, JobManifest, Options, RoundingMode};
use intake::Intake;
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tracing_unwrap::ResultExt;
use util::Clock;
use worker::Worker;

/// A fabric send or receive that stalls this long marks the fleet as
/// failed and aborts the process.
const STALL_LIMIT_SECS: f32 = 60.0;

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BalancerArg {
    /// synchronous cutoff-priority balancing
    Cutoff,
    /// asynchronous event-driven balancing
    Ed,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum RoundingArg {
    Bisection,
    Probabilistic,
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        short = 'n',
        long = "workers",
        default_value_t = 4,
        help = "Number of worker ranks in the fleet"
    )]
    workers: usize,

    #[arg(
        short = 'j',
        long = "jobs",
        value_name = "MANIFEST",
        value_hint = clap::ValueHint::FilePath,
        help = "Path to the job manifest",
        default_value = "jobs.yml",
    )]
    jobs: PathBuf,

    #[arg(short = 'l', long = "load-factor", default_value_t = 1.0, help = "Target load factor in (0, 1]")]
    load_factor: f32,

    #[arg(
        short = 'T',
        long = "timeout",
        default_value_t = 0.0,
        help = "Global wall-clock timeout in seconds; 0 = unlimited"
    )]
    timeout: f32,

    #[arg(short = 'p', long = "balance-period", default_value_t = 0.1, help = "Seconds between balancing rounds")]
    balance_period: f32,

    #[arg(short = 't', long = "threads-per-job", default_value_t = 2, help = "Solver threads per hosted job")]
    threads: usize,

    #[arg(long = "time-per-instance", default_value_t = 0.0, help = "Per-job wall-clock limit; 0 = unlimited")]
    time_per_instance: f32,

    #[arg(long = "cpuh-per-instance", default_value_t = 0.0, help = "Per-job CPU-hour limit; 0 = unlimited")]
    cpuh_per_instance: f32,

    #[arg(long = "bm", value_enum, default_value = "cutoff", help = "Balancing mode")]
    balancer: BalancerArg,

    #[arg(short = 'r', long = "rounding", value_enum, default_value = "bisection", help = "Volume rounding mode")]
    rounding: RoundingArg,

    #[arg(short = 'g', long = "growth-period", default_value_t = 0.0, help = "Seconds per job-tree growth step; 0 = immediate")]
    growth_period: f32,

    #[arg(long = "cg", help = "Grow demand continuously instead of stepwise")]
    continuous_growth: bool,

    #[arg(long = "md", default_value_t = 0, help = "Demand cap per job; 0 = fleet size")]
    max_demand: i32,

    #[arg(long = "ba", default_value_t = 4, help = "Bounce alternatives per worker (even)")]
    bounce_alternatives: usize,

    #[arg(long = "derandomize", help = "Bounded-degree request routing")]
    derandomize: bool,

    #[arg(long = "warmup", help = "Pre-exchange warmup messages along bounce routes")]
    warmup: bool,

    #[arg(short = 's', long = "share-period", default_value_t = 1.0, help = "Seconds between clause sharing rounds; 0 = off")]
    share_period: f32,

    #[arg(long = "slpp", default_value_t = 0, help = "Solver literal threshold per process; 0 = unlimited")]
    solver_lits_per_process: i64,

    #[arg(long = "mem", default_value_t = 0.0, help = "GiB memory budget; 0 = unbounded")]
    mem: f32,

    #[arg(long = "sleep", help = "Sleep when the control loop is idle")]
    sleep: bool,

    #[arg(long = "yield", help = "Yield the control thread when idle")]
    yield_when_idle: bool,
}

impl Cli {
    fn options(&self) -> Options {
        Options {
            num_workers: self.workers,
            load_factor: self.load_factor,
            global_timeout: self.timeout,
            balance_period: self.balance_period,
            threads_per_job: self.threads,
            time_per_instance: self.time_per_instance,
            cpuh_per_instance: self.cpuh_per_instance,
            balancer: match self.balancer {
                BalancerArg::Cutoff => BalancerMode::CutoffPriority,
                BalancerArg::Ed => BalancerMode::EventDriven,
            },
            rounding: match self.rounding {
                RoundingArg::Bisection => RoundingMode::Bisection,
                RoundingArg::Probabilistic => RoundingMode::Probabilistic,
            },
            growth_period: self.growth_period,
            continuous_growth: self.continuous_growth,
            max_demand: self.max_demand,
            bounce_alternatives: self.bounce_alternatives,
            derandomize: self.derandomize,
            warmup: self.warmup,
            share_period: self.share_period,
            solver_lits_per_process: self.solver_lits_per_process,
            memory_budget_gib: self.mem,
            sleep_on_idle: self.sleep,
            yield_on_idle: self.yield_when_idle,
        }
    }
}

fn setup_global_subscriber() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap(),
        )
        .with(
            fmt::layer()
                // thread ids distinguish the per-rank control loops
                .with_thread_ids(true)
                .with_thread_names(false)
                .compact(),
        )
        .init();
}

/// Watchdog: aborts the whole process when any live control loop stops
/// ticking, treating the fabric as fail-stop at that point.
fn stall_monitor(
    clock: Clock,
    heartbeats: Vec<Arc<AtomicU64>>,
    fleet_done: Arc<AtomicBool>,
) {
    while !fleet_done.load(Ordering::Relaxed) {
        let now_millis = (clock.elapsed() * 1000.0) as u64;
        for (rank, beat) in heartbeats.iter().enumerate() {
            let last = beat.load(Ordering::Relaxed);
            if last == u64::MAX {
                continue; // worker exited cleanly
            }
            if now_millis.saturating_sub(last) > (STALL_LIMIT_SECS * 1000.0) as u64 {
                error!(rank, "control loop stalled for over {STALL_LIMIT_SECS}s - aborting");
                exit(1);
            }
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
    }
}

fn main() -> Result<(), ConfigError> {
    let cli = Cli::parse();
    setup_global_subscriber();
    info!("{} {}", crate_name!(), crate_version!());

    let opts = cli.options();
    if opts.preflight_checks() {
        error!("options contain one or more errors, see previous error messages");
        exit(1);
    }

    let mut manifest = match JobManifest::load(&cli.jobs) {
        Ok(manifest) => manifest,
        Err(error) => {
            error!(error = ?error, path = %cli.jobs.display(), "failed to load the job manifest: {error}");
            exit(1);
        }
    };
    if manifest.preflight_checks() {
        error!("manifest contains one or more errors, see previous error messages");
        exit(1);
    }
    let intake = match Intake::from_manifest(&manifest) {
        Ok(intake) => intake,
        Err(error) => {
            error!(error = ?error, "failed to expand the job manifest: {error}");
            exit(1);
        }
    };

    let clock = Clock::system();
    let fabrics = LocalFabric::hub(opts.num_workers);
    let heartbeats: Vec<Arc<AtomicU64>> = (0..opts.num_workers)
        .map(|_| Arc::new(AtomicU64::new(0)))
        .collect();

    let fleet_done = Arc::new(AtomicBool::new(false));
    let monitor = {
        let clock = clock.clone();
        let heartbeats = heartbeats.clone();
        let fleet_done = fleet_done.clone();
        std::thread::Builder::new()
            .name("stall-monitor".into())
            .spawn(move || stall_monitor(clock, heartbeats, fleet_done))
            .expect_or_log("spawning the stall monitor")
    };

    let mut intake = Some(intake);
    let handles: Vec<_> = fabrics
        .into_iter()
        .map(|fabric| {
            let rank = fabric.rank();
            let opts = opts.clone();
            let clock = clock.clone();
            let heartbeat = heartbeats[rank].clone();
            let intake = if rank == 0 { intake.take() } else { None };
            std::thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn(move || {
                    let mut worker = Worker::new(fabric, opts, clock, intake, heartbeat.clone());
                    worker.run();
                    heartbeat.store(u64::MAX, Ordering::Relaxed);
                })
                .expect_or_log("spawning a worker thread")
        })
        .collect();

    let mut failed = false;
    for handle in handles {
        if handle.join().is_err() {
            failed = true;
        }
    }
    fleet_done.store(true, Ordering::Relaxed);
    if monitor.join().is_err() {
        failed = true;
    }

    if failed {
        error!("one or more workers failed");
        exit(1);
    }
    info!("fleet finished");
    Ok(())
}
