use crate::dag::{FunctionDag, StageMap};
use crate::features::ScheduleFeatures;
use crate::params::MachineParams;

use auto_impl::auto_impl;
use log::trace;
use rayon::prelude::*;
use std::cell::Cell;
use std::rc::Rc;

pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// The predicted cost of a schedule, filled in once its batch is evaluated.
#[derive(Clone, Debug, Default)]
pub struct CostHandle(Rc<Cell<Option<f64>>>);

impl CostHandle {
    /// The cost, or `None` if not yet evaluated.
    pub fn get(&self) -> Option<f64> {
        self.0.get()
    }

    fn set(&self, cost: f64) {
        self.0.set(Some(cost));
    }
}

/// Predicts the cost of schedules from their features.
///
/// Requests are queued with [CostModel::enqueue] and answered together by
/// [CostModel::evaluate_costs].
#[auto_impl(&mut, Box)]
pub trait CostModel {
    fn enqueue(&mut self, dag: &FunctionDag, features: &StageMap<ScheduleFeatures>) -> CostHandle;

    /// Fill in every pending [CostHandle].
    fn evaluate_costs(&mut self);

    /// Drop pending requests without evaluating them.
    fn reset(&mut self);
}

#[derive(Clone, Debug)]
struct StageInput {
    ops_per_point: f64,
    dimensions: usize,
    features: ScheduleFeatures,
}

/// A hand-tuned throughput model: compute, cache misses on loads and
/// stores, allocations, and working-set pressure, summed over stages.
pub struct AnalyticCostModel {
    params: MachineParams,
    batch_size: usize,
    pending: Vec<Vec<StageInput>>,
    handles: Vec<CostHandle>,
    evaluated: usize,
}

impl AnalyticCostModel {
    pub fn new(params: MachineParams) -> Self {
        Self::with_batch_size(params, DEFAULT_BATCH_SIZE)
    }

    pub fn with_batch_size(params: MachineParams, batch_size: usize) -> Self {
        AnalyticCostModel {
            params,
            batch_size: batch_size.max(1),
            pending: Vec::with_capacity(batch_size),
            handles: Vec::with_capacity(batch_size),
            evaluated: 0,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Number of schedules evaluated so far.
    pub fn evaluated(&self) -> usize {
        self.evaluated
    }
}

impl CostModel for AnalyticCostModel {
    fn enqueue(&mut self, dag: &FunctionDag, features: &StageMap<ScheduleFeatures>) -> CostHandle {
        let stages = features
            .iter()
            .map(|(key, f)| StageInput {
                ops_per_point: dag.stage(*key).ops_per_point,
                dimensions: dag.nodes[key.node].dimensions,
                features: f.clone(),
            })
            .collect();
        let handle = CostHandle::default();
        self.pending.push(stages);
        self.handles.push(handle.clone());
        if self.pending.len() >= self.batch_size {
            self.evaluate_costs();
        }
        handle
    }

    fn evaluate_costs(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let params = &self.params;
        let costs = self
            .pending
            .par_iter()
            .map(|stages| stages.iter().map(|s| stage_cost(params, s)).sum::<f64>())
            .collect::<Vec<_>>();
        self.evaluated += costs.len();
        for (handle, cost) in self.handles.drain(..).zip(costs) {
            handle.set(cost);
        }
        self.pending.clear();
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.handles.clear();
    }
}

fn stage_cost(params: &MachineParams, stage: &StageInput) -> f64 {
    let feat = &stage.features;

    let mut compute_cost = stage.ops_per_point * feat.points_computed_total;

    // Inlining saves the load from the producer.
    let cost_of_memcpy = 1.0 + 2.0 * stage.dimensions as f64;
    let inlined_ops = (stage.ops_per_point - cost_of_memcpy).max(0.0);
    compute_cost += inlined_ops * feat.inlined_calls;

    if feat.vector_size > 0.0 {
        let idle_simd_lanes = feat.native_vector_size / feat.vector_size;
        compute_cost *= idle_simd_lanes;
    }

    if feat.inner_parallelism > 0.0 && feat.outer_parallelism > 0.0 {
        // Tasks finish staggered, idling about half a core each at the
        // end. Capped, since tasks start synchronized.
        let num_tasks = feat.inner_parallelism;
        let num_cores = params.parallelism as f64 / feat.outer_parallelism;
        let mut idle_core_wastage = ((0.5 * num_cores + num_tasks) / num_tasks).min(1.2);
        // A partial last wave of tasks costs as much as a full one.
        idle_core_wastage *= (num_tasks / num_cores).ceil() * (num_cores / num_tasks);
        compute_cost *= idle_core_wastage;
    }

    let mut memory_load_cost = 0.0;
    let mut memory_store_cost = 0.0;
    if feat.inlined_calls == 0.0 {
        // Cold misses are dominated by lines, thanks to prefetching.
        let cold_cache_misses = (feat.unique_lines_read_per_realization
            + feat.unique_bytes_read_per_realization * 1e-3)
            * feat.num_realizations;
        let cost_of_cold_miss = feat.allocation_bytes_read_per_realization * params.balance * 1e-6;

        let capacity_cache_misses =
            feat.num_vectors * (feat.vector_loads_per_vector + feat.scalar_loads_per_vector) * 1e-2;
        let cost_of_capacity_miss = feat.unique_bytes_read_per_realization * params.balance * 1e-6;

        memory_load_cost =
            cold_cache_misses * cost_of_cold_miss + capacity_cache_misses * cost_of_capacity_miss;

        let lines_written_per_realization = if feat.innermost_bytes_at_realization > 0.0 {
            (feat.bytes_at_realization / feat.innermost_bytes_at_realization).trunc()
        } else {
            0.0
        };
        let cache_misses = (1e1 * lines_written_per_realization + feat.bytes_at_realization * 1e-2)
            * feat.num_realizations;
        let cost_of_miss = feat.bytes_at_production * params.balance * 2e-6;
        memory_store_cost = cache_misses * cost_of_miss;
    }

    // Partial cache line writes. A line is two native vectors.
    if feat.innermost_pure_loop_extent > 0.0 {
        let native_cache_line_size = feat.native_vector_size * 2.0;
        memory_store_cost *= (native_cache_line_size / feat.innermost_pure_loop_extent).max(1.0);
    }

    let cost_of_mallocs = feat.num_realizations * 1e2;

    let ws = 1e-6 * feat.working_set;
    let cost_of_working_set = ws * ws * ws * params.balance * feat.num_realizations;

    trace!(
        "{compute_cost} + {memory_load_cost} + {memory_store_cost} + {cost_of_mallocs} + {cost_of_working_set}"
    );
    compute_cost + memory_load_cost + memory_store_cost + cost_of_mallocs + cost_of_working_set
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::featurize;
    use crate::loop_nest::LoopNest;
    use crate::pipelines;

    fn featurized_blur() -> (FunctionDag, StageMap<ScheduleFeatures>) {
        let dag = pipelines::blur(64, 64);
        let params = MachineParams::default();
        let root = LoopNest::default();
        let root = (*root.compute_in_tiles(&dag, 0, None, &params, 0, false)[0]).clone();
        let features = featurize(&dag, &params, &root);
        (dag, features)
    }

    #[test]
    fn test_handles_fill_on_flush() {
        let (dag, features) = featurized_blur();
        let mut model = AnalyticCostModel::new(MachineParams::default());
        let a = model.enqueue(&dag, &features);
        let b = model.enqueue(&dag, &features);
        assert_eq!(a.get(), None);
        assert_eq!(model.pending(), 2);
        model.evaluate_costs();
        assert_eq!(model.pending(), 0);
        assert_eq!(model.evaluated(), 2);
        let cost = a.get().unwrap();
        assert!(cost.is_finite() && cost > 0.0);
        assert_eq!(b.get(), Some(cost));
    }

    #[test]
    fn test_full_batch_flushes() {
        let (dag, features) = featurized_blur();
        let mut model = AnalyticCostModel::with_batch_size(MachineParams::default(), 2);
        let a = model.enqueue(&dag, &features);
        assert_eq!(a.get(), None);
        let b = model.enqueue(&dag, &features);
        assert!(a.get().is_some() && b.get().is_some());
        assert_eq!(model.pending(), 0);
    }

    #[test]
    fn test_reset_drops_requests() {
        let (dag, features) = featurized_blur();
        let mut model = AnalyticCostModel::new(MachineParams::default());
        let a = model.enqueue(&dag, &features);
        model.reset();
        model.evaluate_costs();
        assert_eq!(a.get(), None);
    }

    #[test]
    fn test_boxed_model() {
        let (dag, features) = featurized_blur();
        let mut model: Box<dyn CostModel> = Box::new(AnalyticCostModel::new(MachineParams::default()));
        let a = model.enqueue(&dag, &features);
        model.evaluate_costs();
        assert!(a.get().is_some());
    }

    #[test]
    fn test_more_work_costs_more() {
        let params = MachineParams::default();
        let cost_of = |dag: &FunctionDag| {
            let root = LoopNest::default();
            let root = (*root.compute_in_tiles(dag, 0, None, &params, 0, false)[0]).clone();
            let features = featurize(dag, &params, &root);
            let mut model = AnalyticCostModel::new(params.clone());
            let h = model.enqueue(dag, &features);
            model.evaluate_costs();
            h.get().unwrap()
        };
        let small = cost_of(&pipelines::pointwise_chain(1, 1 << 10));
        let large = cost_of(&pipelines::pointwise_chain(1, 1 << 16));
        assert!(large > small);
    }
}
