use crate::dag::{FunctionDag, StageMap};
use crate::features::{featurize, ScheduleFeatures};
use crate::loop_nest::LoopNest;
use crate::params::MachineParams;

use log::debug;
use std::fmt;

/// Stages may compute at most this many times the points they need.
const MAX_RECOMPUTE_RATIO: f64 = 8.0;

/// Schedules inlining any node at least this many times are rejected.
const MAX_INLINED_CALLS: i64 = 256;

/// Why a schedule was rejected.
#[derive(Clone, Debug, PartialEq)]
pub enum PruneReason {
    /// The named stage computes too much redundantly.
    Recompute(String),
    Inlining,
    Memory { used: f64, limit: u64 },
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PruneReason::Recompute(stage) => write!(f, "{stage} computes too much redundantly"),
            PruneReason::Inlining => write!(f, "too many inlined calls"),
            PruneReason::Memory { used, limit } => {
                write!(f, "uses {used} bytes, over the {limit} byte limit")
            }
        }
    }
}

/// Whether `root` should be rejected without asking the cost model.
pub fn is_prunable(
    dag: &FunctionDag,
    params: &MachineParams,
    root: &LoopNest,
    memory_limit: Option<u64>,
) -> bool {
    let features = featurize(dag, params, root);
    match prune_reason(dag, root, &features, memory_limit) {
        Some(reason) => {
            debug!("Pruned: {reason}");
            true
        }
        None => false,
    }
}

/// Check an already-featurized schedule.
pub fn prune_reason(
    dag: &FunctionDag,
    root: &LoopNest,
    features: &StageMap<ScheduleFeatures>,
    memory_limit: Option<u64>,
) -> Option<PruneReason> {
    for (key, feat) in features {
        let node = &dag.nodes[key.node];
        if node.is_wrapper {
            continue;
        }
        if feat.points_computed_total + feat.inlined_calls
            > MAX_RECOMPUTE_RATIO * feat.points_computed_minimum
        {
            return Some(PruneReason::Recompute(dag.stage(*key).name.clone()));
        }
    }

    if root.max_inlined_calls() >= MAX_INLINED_CALLS {
        return Some(PruneReason::Inlining);
    }

    if let Some(limit) = memory_limit {
        // Inputs and outputs aren't allocated by the pipeline.
        let used: f64 = features
            .iter()
            .filter(|(k, _)| k.stage == 0)
            .filter(|(k, _)| {
                let n = &dag.nodes[k.node];
                !n.is_input && !n.is_output
            })
            .map(|(_, f)| f.bytes_at_production)
            .sum();
        if used > limit as f64 {
            return Some(PruneReason::Memory { used, limit });
        }
    }
    None
}
