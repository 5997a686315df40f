use super::*;
use crate::util;
use std::io::Write;
use std::path::PathBuf;

struct TestFleet {
    workers: Vec<Worker>,
    clock_micros: Arc<AtomicU64>,
}

impl TestFleet {
    fn new(size: usize, opts: Options, manifest_yaml: Option<String>) -> Self {
        let (clock, clock_micros) = Clock::manual();
        let fabrics = LocalFabric::hub(size);
        let workers = fabrics
            .into_iter()
            .map(|fabric| {
                let intake = match (&manifest_yaml, fabric.rank()) {
                    (Some(yaml), 0) => {
                        let mut manifest: crate::config::JobManifest =
                            serde_yaml::from_str(yaml).unwrap();
                        assert!(!manifest.preflight_checks());
                        Some(Intake::from_manifest(&manifest).unwrap())
                    }
                    _ => None,
                };
                Worker::new(
                    fabric,
                    opts.clone(),
                    clock.clone(),
                    intake,
                    Arc::new(AtomicU64::new(0)),
                )
            })
            .collect();
        Self {
            workers,
            clock_micros,
        }
    }

    /// Advance virtual time and tick every worker until `goal` holds.
    fn pump_until<F: Fn(&[Worker]) -> bool>(&mut self, ticks: usize, goal: F) -> bool {
        for _ in 0..ticks {
            if goal(&self.workers) {
                return true;
            }
            util::advance(&self.clock_micros, 0.02);
            for worker in self.workers.iter_mut() {
                worker.tick();
            }
            // let solver threads breathe
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        goal(&self.workers)
    }

    fn shutdown(&mut self) {
        for worker in self.workers.iter_mut() {
            worker.shutdown();
        }
    }
}

fn test_opts(size: usize) -> Options {
    Options {
        num_workers: size,
        threads_per_job: 1,
        balance_period: 0.05,
        growth_period: 0.0,
        share_period: 0.0,
        sleep_on_idle: false,
        ..Options::default()
    }
}

/// Options for router-only tests: balancing pushed out of the way so the
/// only traffic is the walk under test.
fn router_opts(size: usize) -> Options {
    Options {
        balance_period: 1000.0,
        ..test_opts(size)
    }
}

fn write_instance(tag: &str, content: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hivesat-worker-{tag}"));
    std::fs::remove_dir_all(&dir).ok();
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("instance.cnf");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

/// Pigeonhole instance; unsatisfiable and hard enough to keep a small
/// DPLL portfolio busy for the duration of a test.
fn pigeonhole(pigeons: usize, holes: usize) -> String {
    let var = |p: usize, h: usize| (p * holes + h + 1) as i32;
    let mut out = format!("p cnf {} 0\n", pigeons * holes);
    for p in 0..pigeons {
        for h in 0..holes {
            out.push_str(&format!("{} ", var(p, h)));
        }
        out.push_str("0\n");
    }
    for h in 0..holes {
        for p1 in 0..pigeons {
            for p2 in p1 + 1..pigeons {
                out.push_str(&format!("-{} -{} 0\n", var(p1, h), var(p2, h)));
            }
        }
    }
    out
}

fn manifest_yaml(path: &std::path::Path, priority: f32) -> String {
    format!(
        "jobs:\n  test:\n    path: {}\n    glob: \"*.cnf\"\n    priority: {priority}\n",
        path.display()
    )
}

#[test]
fn job_grows_to_its_balanced_volume() {
    // one long-running job on two workers: after a balance round both
    // workers compute on it and agree on volume two
    let path = write_instance("grow", &pigeonhole(8, 7));
    let mut fleet = TestFleet::new(2, test_opts(2), Some(manifest_yaml(&path, 1.0)));

    let reached = fleet.pump_until(600, |workers| {
        workers.iter().all(|w| {
            w.load == 1
                && w.volumes.get(&1) == Some(&2)
                && w.jobs.get(&1).is_some_and(|j| j.state == JobState::Active)
        })
    });
    assert!(reached, "job never grew to volume 2 on both workers");

    let root_count = fleet
        .workers
        .iter()
        .filter(|w| w.jobs.get(&1).is_some_and(|j| j.tree.is_root()))
        .count();
    assert_eq!(root_count, 1, "exactly one root");

    fleet.shutdown();
    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn finished_job_leaves_no_ghosts() {
    // a trivially satisfiable job: the result must reach the client and
    // every rank must forget the job within a balance period
    let path = write_instance("ghost", "p cnf 1 1\n1 0\n");
    let mut fleet = TestFleet::new(2, test_opts(2), Some(manifest_yaml(&path, 1.0)));

    let finished = fleet.pump_until(600, |workers| {
        workers[0]
            .intake
            .as_ref()
            .is_some_and(|intake| intake.all_done())
    });
    assert!(finished, "result never reached the client");

    let forgotten = fleet.pump_until(600, |workers| {
        workers.iter().all(|w| w.jobs.is_empty() && w.load == 0)
    });
    assert!(forgotten, "job not forgotten everywhere");
    assert!(fleet.workers.iter().all(|w| w.exiting), "exit not broadcast");

    fleet.shutdown();
    std::fs::remove_dir_all(path.parent().unwrap()).ok();
}

#[test]
fn request_walks_to_the_single_idle_worker() {
    // four workers, ranks 0, 1 and 3 are unavailable; a request for
    // (job 7, index 3) must reach rank 2 within three hops
    let mut fleet = TestFleet::new(4, router_opts(4), None);
    for rank in [0usize, 1, 3] {
        let blocker = JobRequest::new(99, 0, 0, 1, 0.0);
        fleet.workers[rank].commitments.insert(99, blocker);
    }

    let req = JobRequest::new(7, 0, 0, 3, 0.0);
    fleet.workers[0]
        .fabric
        .send(0, Tag::FindNode, req.serialize())
        .unwrap();

    let adopted = fleet.pump_until(50, |workers| workers[2].commitments.contains_key(&7));
    assert!(adopted, "request not adopted by the idle worker");
    let commitment = &fleet.workers[2].commitments[&7];
    assert_eq!(commitment.requested_index, 3);
    assert!(
        commitment.num_hops <= 3,
        "took {} hops",
        commitment.num_hops
    );
    for rank in [0usize, 1, 3] {
        assert!(!fleet.workers[rank].commitments.contains_key(&7));
    }
}

#[test]
fn starving_root_displaces_an_active_leaf() {
    let mut fleet = TestFleet::new(4, router_opts(4), None);

    // rank 1 hosts an active non-root leaf of job 5
    {
        let worker = &mut fleet.workers[1];
        let params = worker.job_params();
        let mut job = Job::new(5, 4, 1, params, 0.0);
        job.commit(&JobRequest::new(5, 0, 0, 2, 0.0));
        job.state = JobState::Active;
        worker.jobs.insert(5, job);
        worker.current_job = Some(5);
        worker.load = 1;
    }

    // a root request past its hop limit arrives
    let mut req = JobRequest::new(9, -1, 0, 0, 0.0);
    req.num_hops = 3; // > size/2
    fleet.workers[1]
        .fabric
        .send(1, Tag::FindNode, req.serialize())
        .unwrap();
    let displaced = fleet.pump_until(10, |workers| workers[1].commitments.contains_key(&9));
    assert!(displaced, "root request not adopted by displacement");

    let worker = &fleet.workers[1];
    assert_eq!(worker.jobs[&5].state, JobState::Suspended);
    assert_eq!(worker.load, 0, "load freed until the description arrives");

    // the parent of the displaced leaf was told about the defection
    let defection = fleet.workers[0]
        .fabric
        .poll()
        .expect("parent got a message");
    assert_eq!(defection.tag, Tag::WorkerDefecting);
    assert_eq!(decode_ints(&defection.payload).unwrap(), vec![5, 2]);
}

#[test]
fn nonroot_requests_die_at_the_hop_limit() {
    let mut fleet = TestFleet::new(2, router_opts(2), None);
    // both workers busy
    for rank in 0..2 {
        let blocker = JobRequest::new(99, 0, 0, 1, 0.0);
        fleet.workers[rank].commitments.insert(99, blocker);
    }
    let mut req = JobRequest::new(7, 0, 0, 3, 0.0);
    req.num_hops = 5; // > 2 * size
    fleet.workers[1]
        .fabric
        .send(1, Tag::FindNode, req.serialize())
        .unwrap();
    fleet.pump_until(10, |_| false);
    // discarded: nobody committed, no message still in flight
    for worker in fleet.workers.iter_mut() {
        assert!(!worker.commitments.contains_key(&7));
        assert!(worker.fabric.poll().is_none());
    }
}

#[test]
fn termination_of_committed_job_waits_for_the_description() {
    let mut fleet = TestFleet::new(2, router_opts(2), None);

    // rank 0 committed to job 4 and is waiting for the description
    {
        let worker = &mut fleet.workers[0];
        let params = worker.job_params();
        let mut job = Job::new(4, 2, 0, params, 0.0);
        let req = JobRequest::new(4, -1, 1, 0, 0.0);
        job.commit(&req);
        worker.jobs.insert(4, job);
        worker.commitments.insert(4, req);
    }

    fleet.workers[0]
        .fabric
        .send(0, Tag::Terminate, encode_ints(&[4]))
        .unwrap();
    fleet.pump_until(3, |_| false);
    assert_eq!(
        fleet.workers[0].jobs[&4].state,
        JobState::Committed,
        "termination must wait for the description"
    );

    // the description arrives; the deferred terminate must now apply
    let desc = JobDescription::new(4, 1.0, vec![1, 0], vec![]);
    fleet.workers[0]
        .fabric
        .send(0, Tag::SendJobDescription, desc.serialize())
        .unwrap();
    let terminated = fleet.pump_until(50, |workers| {
        workers[0]
            .jobs
            .get(&4)
            .map_or(true, |j| j.state == JobState::Past)
    });
    assert!(terminated, "deferred termination never applied");
    assert_eq!(fleet.workers[0].load, 0);
    fleet.shutdown();
}

#[test]
fn obsolete_requests_are_discarded() {
    let mut fleet = TestFleet::new(2, router_opts(2), None);
    // a fresher offer for (7, 1) was already seen at rank 0
    let fresh = JobRequest::new(7, 0, 1, 1, 5.0);
    fleet.workers[0]
        .fabric
        .send(0, Tag::FindNode, fresh.serialize())
        .unwrap();
    fleet.pump_until(3, |workers| workers[0].commitments.contains_key(&7));

    let stale = JobRequest::new(7, 0, 1, 1, 1.0);
    let obsolete = fleet.workers[0].is_request_obsolete(&stale);
    assert!(obsolete);
    let current = JobRequest::new(7, 0, 1, 1, 6.0);
    assert!(!fleet.workers[0].is_request_obsolete(&current));
}
