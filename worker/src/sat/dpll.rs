//! Built-in portfolio solver core.
//!
//! A deliberately small DPLL engine behind the black-box solver contract:
//! literal loading, assumption solving, cooperative interrupt/suspend via
//! the shared control, learned-clause import and level-zero unit export.

use super::{SolverControl, SolverSignal};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;

pub const RESULT_UNKNOWN: i32 = 0;
pub const RESULT_SAT: i32 = 10;
pub const RESULT_UNSAT: i32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    Sat(Vec<i32>),
    Unsat(BTreeSet<i32>),
    Unknown,
}

impl SolveOutcome {
    pub fn code(&self) -> i32 {
        match self {
            Self::Sat(_) => RESULT_SAT,
            Self::Unsat(_) => RESULT_UNSAT,
            Self::Unknown => RESULT_UNKNOWN,
        }
    }
}

pub struct DpllSolver {
    num_vars: usize,
    clauses: Vec<Vec<i32>>,
    /// Dedup set over every clause ever added, keeps digestion idempotent.
    known: BTreeSet<Vec<i32>>,
    current: Vec<i32>,
    /// Preferred phase per variable, from diversification.
    phases: Vec<bool>,
    random_phases: bool,
    rng: StdRng,
    steps_between_checks: u32,
}

impl DpllSolver {
    pub fn new(seed: u64) -> Self {
        Self {
            num_vars: 0,
            clauses: Vec::new(),
            known: BTreeSet::new(),
            current: Vec::new(),
            phases: Vec::new(),
            random_phases: false,
            rng: StdRng::seed_from_u64(seed),
            steps_between_checks: 256,
        }
    }

    /// Add one literal of the permanent formula; zero terminates a clause.
    pub fn add_literal(&mut self, lit: i32) {
        if lit == 0 {
            let clause = std::mem::take(&mut self.current);
            self.insert_clause(clause);
        } else {
            self.register_var(lit);
            self.current.push(lit);
        }
    }

    /// Learned clauses may arrive from any portfolio peer; duplicates are
    /// dropped so repeated digestion of one buffer is a no-op.
    pub fn add_learned_clause(&mut self, clause: &[i32]) {
        if clause.is_empty() || clause.iter().any(|&l| l == 0) {
            return;
        }
        for &lit in clause {
            self.register_var(lit);
        }
        self.insert_clause(clause.to_vec());
    }

    pub fn set_phase(&mut self, var: usize, phase: bool) {
        if var == 0 {
            return;
        }
        if self.phases.len() < var {
            self.phases.resize(var, true);
        }
        self.phases[var - 1] = phase;
    }

    pub fn set_random_phases(&mut self) {
        self.random_phases = true;
    }

    pub fn num_vars(&self) -> usize {
        self.num_vars
    }

    fn register_var(&mut self, lit: i32) {
        let var = lit.unsigned_abs() as usize;
        if var > self.num_vars {
            self.num_vars = var;
            if self.phases.len() < var {
                self.phases.resize(var, true);
            }
        }
    }

    fn insert_clause(&mut self, mut clause: Vec<i32>) {
        clause.sort_unstable();
        clause.dedup();
        if self.known.insert(clause.clone()) {
            self.clauses.push(clause);
        }
    }

    /// Solve under the given assumptions, yielding to `control` between
    /// bounded batches of work. Unit facts derived at decision level zero
    /// are handed to `on_learned` for export.
    pub fn solve(
        &mut self,
        assumptions: &[i32],
        control: &SolverControl,
        on_learned: &mut dyn FnMut(&[i32]),
    ) -> SolveOutcome {
        let n = self.num_vars;
        // 0 unset, 1 true, -1 false
        let mut assignment = vec![0i8; n + 1];
        // (literal, is_decision, already_flipped)
        let mut trail: Vec<(i32, bool, bool)> = Vec::new();

        for &a in assumptions {
            let var = a.unsigned_abs() as usize;
            if var == 0 || var > n {
                continue;
            }
            match assignment[var] as i32 * var as i32 {
                v if v == -a => return SolveOutcome::Unsat(assumptions.iter().copied().collect()),
                v if v == a => {}
                _ => {
                    assignment[var] = a.signum() as i8;
                    trail.push((a, false, false));
                }
            }
        }
        let num_assumptions = trail.len();

        let mut steps = 0u32;
        loop {
            steps += 1;
            if steps % self.steps_between_checks == 0 {
                match control.pause_point() {
                    SolverSignal::Proceed => {}
                    SolverSignal::Stop => return SolveOutcome::Unknown,
                }
            }

            match self.propagate(&mut assignment, &mut trail, num_assumptions, on_learned) {
                Propagation::Conflict => {
                    if !Self::backtrack(&mut assignment, &mut trail, num_assumptions) {
                        let failed = trail[..num_assumptions.min(trail.len())]
                            .iter()
                            .map(|&(lit, _, _)| lit)
                            .collect();
                        return SolveOutcome::Unsat(failed);
                    }
                }
                Propagation::Stable => match self.decide(&assignment) {
                    Some(lit) => {
                        assignment[lit.unsigned_abs() as usize] = lit.signum() as i8;
                        trail.push((lit, true, false));
                    }
                    None => {
                        let model = (1..=n as i32)
                            .map(|v| if assignment[v as usize] >= 0 { v } else { -v })
                            .collect();
                        return SolveOutcome::Sat(model);
                    }
                },
            }
        }
    }

    fn propagate(
        &mut self,
        assignment: &mut [i8],
        trail: &mut Vec<(i32, bool, bool)>,
        num_assumptions: usize,
        on_learned: &mut dyn FnMut(&[i32]),
    ) -> Propagation {
        let at_level_zero =
            |trail: &[(i32, bool, bool)]| trail.iter().all(|&(_, decision, _)| !decision);
        loop {
            let mut changed = false;
            for ci in 0..self.clauses.len() {
                let mut unassigned = 0i32;
                let mut num_unassigned = 0;
                let mut satisfied = false;
                for &lit in &self.clauses[ci] {
                    match assignment[lit.unsigned_abs() as usize] as i32 * lit.signum() as i32 {
                        0 => {
                            unassigned = lit;
                            num_unassigned += 1;
                        }
                        v if v > 0 => {
                            satisfied = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if satisfied {
                    continue;
                }
                match num_unassigned {
                    0 => return Propagation::Conflict,
                    1 => {
                        assignment[unassigned.unsigned_abs() as usize] =
                            unassigned.signum() as i8;
                        trail.push((unassigned, false, false));
                        if num_assumptions == 0 && at_level_zero(trail) {
                            on_learned(&[unassigned]);
                        }
                        changed = true;
                    }
                    _ => {}
                }
            }
            if !changed {
                return Propagation::Stable;
            }
        }
    }

    /// Undo up to the most recent unflipped decision and flip it.
    /// Returns false when no decision is left (UNSAT at this level).
    fn backtrack(
        assignment: &mut [i8],
        trail: &mut Vec<(i32, bool, bool)>,
        num_assumptions: usize,
    ) -> bool {
        while trail.len() > num_assumptions {
            let (lit, decision, flipped) = trail.pop().expect("trail is non-empty");
            assignment[lit.unsigned_abs() as usize] = 0;
            if decision && !flipped {
                assignment[lit.unsigned_abs() as usize] = -lit.signum() as i8;
                trail.push((-lit, true, true));
                return true;
            }
        }
        false
    }

    fn decide(&mut self, assignment: &[i8]) -> Option<i32> {
        let var = (1..=self.num_vars).find(|&v| assignment[v] == 0)?;
        let phase = if self.random_phases {
            self.rng.gen_bool(0.5)
        } else {
            self.phases[var - 1]
        };
        Some(if phase { var as i32 } else { -(var as i32) })
    }
}

enum Propagation {
    Conflict,
    Stable,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sat::SolverControl;

    fn load(solver: &mut DpllSolver, clauses: &[&[i32]]) {
        for clause in clauses {
            for &lit in *clause {
                solver.add_literal(lit);
            }
            solver.add_literal(0);
        }
    }

    #[test]
    fn solves_satisfiable_formula() {
        let control = SolverControl::new();
        let mut solver = DpllSolver::new(0);
        load(&mut solver, &[&[1, 2], &[-1, 2], &[-2, 3]]);
        match solver.solve(&[], &control, &mut |_| {}) {
            SolveOutcome::Sat(model) => {
                assert!(model.contains(&2));
                assert!(model.contains(&3));
            }
            other => panic!("expected SAT, got {other:?}"),
        }
    }

    #[test]
    fn refutes_unsatisfiable_formula() {
        let control = SolverControl::new();
        let mut solver = DpllSolver::new(0);
        load(&mut solver, &[&[1, 2], &[1, -2], &[-1, 2], &[-1, -2]]);
        assert_eq!(solver.solve(&[], &control, &mut |_| {}).code(), RESULT_UNSAT);
    }

    #[test]
    fn failed_assumptions_reported() {
        let control = SolverControl::new();
        let mut solver = DpllSolver::new(0);
        load(&mut solver, &[&[1], &[-1, 2]]);
        match solver.solve(&[-2], &control, &mut |_| {}) {
            SolveOutcome::Unsat(failed) => assert!(failed.contains(&-2)),
            other => panic!("expected UNSAT under assumption, got {other:?}"),
        }
    }

    #[test]
    fn exports_level_zero_units() {
        let control = SolverControl::new();
        let mut solver = DpllSolver::new(0);
        load(&mut solver, &[&[1], &[-1, 2], &[-2, -3, 4]]);
        let mut exported = Vec::new();
        let _ = solver.solve(&[], &control, &mut |cls| exported.push(cls.to_vec()));
        assert!(exported.contains(&vec![1]) || exported.contains(&vec![2]));
    }

    #[test]
    fn digesting_same_clause_twice_changes_nothing() {
        let mut solver = DpllSolver::new(0);
        load(&mut solver, &[&[1, 2]]);
        solver.add_learned_clause(&[2, 3]);
        let clauses_after_first = solver.clauses.len();
        solver.add_learned_clause(&[2, 3]);
        solver.add_learned_clause(&[3, 2]);
        assert_eq!(solver.clauses.len(), clauses_after_first);
    }
}
