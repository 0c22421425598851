// src/miner/scheduler.rs
//! Weighted capacity assignment
//!
//! Splits each backend kind's capacity limit among the eligible workers in
//! proportion to their weights. A worker is eligible while it has a job and
//! its pool link is healthy; a (worker, kind) pairing whose backend failed is
//! excluded. Whatever an ineligible worker would have received is spread
//! over the remaining ones, so capacity only idles when nobody can use it.

use crate::miner::backend::BackendKind;
use std::collections::{HashMap, HashSet};

/// Per-worker input to capacity planning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerSlot {
    /// Configured weight
    pub weight: f64,
    /// Whether the worker can currently use capacity
    pub eligible: bool,
}

/// Capacity fraction per (worker index, backend kind) pairing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    fractions: HashMap<(usize, BackendKind), f64>,
}

impl Assignment {
    /// Fraction assigned to a pairing (0 when absent)
    pub fn fraction(&self, worker: usize, kind: BackendKind) -> f64 {
        self.fractions.get(&(worker, kind)).copied().unwrap_or(0.0)
    }

    /// Sum of fractions assigned for `kind`
    pub fn total(&self, kind: BackendKind) -> f64 {
        self.fractions
            .iter()
            .filter(|((_, k), _)| *k == kind)
            .map(|(_, f)| f)
            .sum()
    }

    /// Sum of fractions assigned to `worker` across kinds
    pub fn worker_total(&self, worker: usize) -> f64 {
        self.fractions
            .iter()
            .filter(|((w, _), _)| *w == worker)
            .map(|(_, f)| f)
            .sum()
    }

    /// True when `worker` receives any capacity
    pub fn is_active(&self, worker: usize) -> bool {
        self.worker_total(worker) > 0.0
    }
}

/// Capacity planner holding the configured limit of every backend kind
#[derive(Debug, Clone)]
pub struct Scheduler {
    limits: HashMap<BackendKind, f64>,
}

impl Scheduler {
    /// Creates a planner with the session-level limits
    ///
    /// # Arguments
    /// * `cpu_limit` - Fraction of the CPU to use (0..=1)
    /// * `batch_limit` - Fraction of the batch resource to use (0..=1)
    pub fn new(cpu_limit: f64, batch_limit: f64) -> Self {
        let mut scheduler = Scheduler {
            limits: HashMap::new(),
        };
        scheduler.set_limit(BackendKind::Cpu, cpu_limit);
        scheduler.set_limit(BackendKind::Batch, batch_limit);
        scheduler
    }

    /// Changes the limit of one kind
    pub fn set_limit(&mut self, kind: BackendKind, limit: f64) {
        self.limits
            .insert(kind, crate::miner::backend::clamp_fraction(limit));
    }

    /// Configured limit of one kind
    pub fn limit(&self, kind: BackendKind) -> f64 {
        self.limits.get(&kind).copied().unwrap_or(0.0)
    }

    /// Kinds with a non-zero limit
    pub fn enabled_kinds(&self) -> Vec<BackendKind> {
        [BackendKind::Cpu, BackendKind::Batch]
            .into_iter()
            .filter(|kind| self.limit(*kind) > 0.0)
            .collect()
    }

    /// Plans the capacity of every pairing
    ///
    /// # Arguments
    /// * `workers` - Weight and eligibility, indexed like the session's workers
    /// * `excluded` - Pairings whose backend failed
    ///
    /// # Returns
    /// For each kind with eligible pairings, fractions summing to the kind's
    /// limit, proportional to weight.
    pub fn assign(
        &self,
        workers: &[WorkerSlot],
        excluded: &HashSet<(usize, BackendKind)>,
    ) -> Assignment {
        let mut assignment = Assignment::default();
        for kind in self.enabled_kinds() {
            let limit = self.limit(kind);
            let candidates: Vec<(usize, f64)> = workers
                .iter()
                .enumerate()
                .filter(|(i, slot)| {
                    slot.eligible && slot.weight > 0.0 && !excluded.contains(&(*i, kind))
                })
                .map(|(i, slot)| (i, slot.weight))
                .collect();
            let total_weight: f64 = candidates.iter().map(|(_, w)| w).sum();
            if total_weight <= 0.0 {
                continue;
            }
            for (worker, weight) in candidates {
                assignment
                    .fractions
                    .insert((worker, kind), limit * weight / total_weight);
            }
        }
        assignment
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(weight: f64, eligible: bool) -> WorkerSlot {
        WorkerSlot { weight, eligible }
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn capacity_is_conserved_and_weighted() {
        let scheduler = Scheduler::new(0.8, 0.5);
        let workers = [slot(1.0, true), slot(3.0, true), slot(4.0, true)];
        let plan = scheduler.assign(&workers, &HashSet::new());

        assert!(close(plan.total(BackendKind::Cpu), 0.8));
        assert!(close(plan.total(BackendKind::Batch), 0.5));
        assert!(close(plan.fraction(0, BackendKind::Cpu), 0.1));
        assert!(close(plan.fraction(1, BackendKind::Cpu), 0.3));
        assert!(close(plan.fraction(2, BackendKind::Batch), 0.25));
    }

    #[test]
    fn ineligible_worker_capacity_moves_to_others() {
        let scheduler = Scheduler::new(1.0, 0.0);
        let workers = [slot(1.0, true), slot(1.0, false), slot(2.0, true)];
        let plan = scheduler.assign(&workers, &HashSet::new());

        assert!(close(plan.total(BackendKind::Cpu), 1.0));
        assert_eq!(plan.fraction(1, BackendKind::Cpu), 0.0);
        assert!(!plan.is_active(1));
        assert!(close(plan.fraction(0, BackendKind::Cpu), 1.0 / 3.0));
        assert!(close(plan.fraction(2, BackendKind::Cpu), 2.0 / 3.0));
        assert_eq!(plan.total(BackendKind::Batch), 0.0);
    }

    #[test]
    fn excluded_pairing_rebalances_only_its_kind() {
        let scheduler = Scheduler::new(1.0, 1.0);
        let workers = [slot(1.0, true), slot(1.0, true)];
        let excluded = HashSet::from([(0, BackendKind::Batch)]);
        let plan = scheduler.assign(&workers, &excluded);

        assert!(close(plan.fraction(0, BackendKind::Cpu), 0.5));
        assert_eq!(plan.fraction(0, BackendKind::Batch), 0.0);
        assert!(close(plan.fraction(1, BackendKind::Batch), 1.0));
        assert!(close(plan.worker_total(1), 1.5));
    }

    #[test]
    fn nobody_eligible_leaves_capacity_unassigned() {
        let scheduler = Scheduler::new(1.0, 1.0);
        let plan = scheduler.assign(&[slot(1.0, false)], &HashSet::new());
        assert_eq!(plan, Assignment::default());
    }

    #[test]
    fn limits_are_clamped() {
        let mut scheduler = Scheduler::new(3.0, -1.0);
        assert_eq!(scheduler.limit(BackendKind::Cpu), 1.0);
        assert_eq!(scheduler.limit(BackendKind::Batch), 0.0);
        assert_eq!(scheduler.enabled_kinds(), vec![BackendKind::Cpu]);
        scheduler.set_limit(BackendKind::Batch, 0.4);
        assert_eq!(scheduler.enabled_kinds(), vec![BackendKind::Cpu, BackendKind::Batch]);
    }
}
