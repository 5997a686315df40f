use super::event_map::{Event, EventMap};
use super::reduce::{Reducible, Reduction, SumVec};
use crate::comm::LocalFabric;
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Reducing,
    Broadcasting,
    Done,
}

/// Drive a full reduce-then-broadcast over an in-process fleet and return
/// each rank's final value together with its exclusion verdict.
fn all_reduce<R: Reducible>(
    contributions: Vec<R>,
    excluded: BTreeSet<usize>,
) -> Vec<(R, bool)> {
    let size = contributions.len();
    let mut fabrics = LocalFabric::hub(size);
    let mut phases = vec![Phase::Reducing; size];
    let mut reductions: Vec<Reduction<R>> = contributions
        .into_iter()
        .enumerate()
        .map(|(rank, value)| Reduction::new(value, rank, size, excluded.clone()))
        .collect();

    for rank in 0..size {
        if reductions[rank].start_reduction(&fabrics[rank]).unwrap() {
            phases[rank] = match reductions[rank].start_broadcast(&fabrics[rank]).unwrap() {
                true => Phase::Done,
                false => Phase::Broadcasting,
            };
        }
    }

    loop {
        let mut progressed = false;
        for rank in 0..size {
            while let Some(handle) = fabrics[rank].poll() {
                progressed = true;
                match phases[rank] {
                    Phase::Reducing => {
                        assert_eq!(reductions[rank].expecting_from(), Some(handle.source));
                        if reductions[rank]
                            .advance_reduction(&handle.payload, handle.source, &fabrics[rank])
                            .unwrap()
                        {
                            phases[rank] =
                                match reductions[rank].start_broadcast(&fabrics[rank]).unwrap() {
                                    true => Phase::Done,
                                    false => Phase::Broadcasting,
                                };
                        }
                    }
                    Phase::Broadcasting => {
                        if reductions[rank]
                            .advance_broadcast(&handle.payload, &fabrics[rank])
                            .unwrap()
                        {
                            phases[rank] = Phase::Done;
                        }
                    }
                    Phase::Done => panic!("rank {rank} got a message after finishing"),
                }
            }
        }
        if !progressed {
            break;
        }
    }

    assert!(phases.iter().all(|&p| p == Phase::Done));
    reductions
        .into_iter()
        .enumerate()
        .map(|(rank, r)| {
            let excluded = r.excluded().contains(&rank);
            (r, excluded)
        })
        .map(|(r, e)| (r.value, e))
        .collect()
}

#[test]
pub fn butterfly_sum_on_five_ranks() {
    let contributions = (1..=5).map(|v| SumVec::new(vec![v as f64])).collect();
    let results = all_reduce(contributions, BTreeSet::new());
    for (value, excluded) in &results {
        assert!(!excluded);
        assert_eq!(value.values, vec![15.0]);
    }
}

#[test]
pub fn butterfly_sum_on_power_of_two_fleet() {
    let contributions = (0..8).map(|v| SumVec::new(vec![v as f64, 1.0])).collect();
    let results = all_reduce(contributions, BTreeSet::new());
    for (value, _) in &results {
        assert_eq!(value.values, vec![28.0, 8.0]);
    }
}

#[test]
pub fn single_rank_reduction_is_immediate() {
    let results = all_reduce(vec![SumVec::new(vec![3.0])], BTreeSet::new());
    assert_eq!(results[0].0.values, vec![3.0]);
}

#[test]
pub fn event_maps_reduce_to_global_dominance_maximum() {
    let ev = |job_id, epoch, demand, priority| Event {
        job_id,
        epoch,
        demand,
        priority,
    };
    let mut maps = vec![EventMap::new(), EventMap::new(), EventMap::new(), EventMap::new()];
    maps[0].insert_if_novel(ev(1, 1, 2, 1.0));
    maps[1].insert_if_novel(ev(1, 2, 5, 1.0));
    maps[1].insert_if_novel(ev(2, 1, 3, 2.0));
    maps[3].insert_if_novel(ev(3, 1, 1, 0.5));
    // rank 2 contributes nothing and is excluded from the broadcast

    let results = all_reduce(maps, BTreeSet::new());
    let expected = {
        let mut m = EventMap::new();
        m.insert_if_novel(ev(1, 2, 5, 1.0));
        m.insert_if_novel(ev(2, 1, 3, 2.0));
        m.insert_if_novel(ev(3, 1, 1, 0.5));
        m
    };
    for (rank, (value, excluded)) in results.iter().enumerate() {
        if rank == 2 {
            assert!(excluded);
        } else {
            assert!(!excluded, "rank {rank} wrongly excluded");
            assert_eq!(value, &expected, "rank {rank} diverges");
        }
    }
}

#[test]
pub fn pre_excluded_ranks_are_skipped() {
    let contributions = (1..=6).map(|v| SumVec::new(vec![v as f64])).collect();
    let excluded = BTreeSet::from([3usize]);
    let results = all_reduce(contributions, excluded);
    for (rank, (value, _)) in results.iter().enumerate() {
        if rank == 3 {
            continue;
        }
        // rank 3's contribution (4.0) never enters the sum
        assert_eq!(value.values, vec![17.0], "rank {rank}");
    }
}
