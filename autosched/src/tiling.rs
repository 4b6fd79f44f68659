use crate::dag::Loop;

use divrem::DivCeil;
use std::cmp::Ordering;

/// Most tilings a parallel loop may be split into, as a multiple of the
/// target parallelism.
const MAX_TASKS_PER_CORE: i64 = 16;

/// Above this idle-core wastage, the full-subtile regime stops exploring
/// further parallel tilings.
pub const MAX_IDLE_CORE_WASTAGE: f64 = 1.2;

/// Generate candidate tilings of the box `s`, as per-dimension outer
/// extents, logarithmically spaced by `factor`.
///
/// If `allow_splits` is false, every dimension is either one or its full
/// extent. The trivial all-ones and all-full tilings are never produced.
pub fn generate_tilings(s: &[i64], factor: i64, allow_splits: bool) -> Vec<Vec<i64>> {
    tilings_of_prefix(s, s.len(), factor, allow_splits)
}

fn tilings_of_prefix(s: &[i64], len: usize, mut factor: i64, allow_splits: bool) -> Vec<Vec<i64>> {
    if len == 0 {
        return vec![vec![]];
    }
    let d = len - 1;
    let v = tilings_of_prefix(s, d, factor, allow_splits);

    // Search outer dimensions more coarsely when the inner ones already
    // produced many candidates.
    while v.len() as i64 > factor * 100 {
        factor *= 2;
    }

    let mut result = vec![];
    for mut t in v {
        let (mut is_one, mut is_full) = (false, false);
        if len == s.len() {
            is_one = t.iter().all(|&x| x == 1);
            is_full = t.iter().zip(s).all(|(&x, &e)| x == e);
        }
        let extent = s[d];
        t.push(0);
        if !allow_splits {
            if !is_one {
                t[d] = 1;
                result.push(t.clone());
            }
            if extent != 1 && !is_full {
                t[d] = extent;
                result.push(t);
            }
            continue;
        }

        let mut max_inner = 0;
        let mut inner = 1;
        while inner < extent {
            let outer = DivCeil::div_ceil(extent, inner);
            if !(is_one && outer == 1) && !(is_full && outer == extent) {
                // Stop when the rounded-up tiles recompute too much.
                if inner > 1 && inner * outer * 7 > extent * 8 {
                    break;
                }
                max_inner = inner;
                t[d] = outer;
                result.push(t.clone());
            }
            inner *= factor;
        }

        let mut outer = 1;
        while outer <= extent {
            let inner = DivCeil::div_ceil(extent, outer);
            if !(is_one && outer == 1) && !(is_full && outer == extent) {
                // Stop when the loop above already covered these.
                if outer > 1 && inner < max_inner * 2 {
                    break;
                }
                if inner * outer * 7 > extent * 8 {
                    break;
                }
                t[d] = outer;
                result.push(t.clone());
            }
            outer *= factor;
        }

        // Inner tiles of 3 suit gemm-like loops using 12 vector registers.
        let inner3 = 3;
        let outer3 = DivCeil::div_ceil(extent, inner3);
        if factor == 2
            && inner3 < extent
            && outer3 < extent
            && outer3 > 1
            && inner3 * outer3 * 7 <= extent * 8
        {
            t[d] = outer3;
            result.push(t);
        }
    }
    result
}

/// A candidate split of a node's root-level loops across cores.
#[derive(Clone, Debug, PartialEq)]
pub struct ParallelTilingOption {
    /// Number of tiles per pure dimension.
    pub tiling: Vec<i64>,
    pub idle_core_wastage: f64,
    /// Whether this is the option that makes every iteration its own task.
    pub entire: bool,
    pub min_total: i64,
    pub max_total: i64,
}

/// Enumerate and filter parallel tilings of a node with the given pure
/// loop extents, sorted by ascending idle-core wastage.
///
/// `stage_loops` holds the loops of each root-level child of the node.
pub fn parallel_tiling_options(
    pure_size: &[i64],
    stage_loops: &[&[Loop]],
    parallelism: i64,
) -> Vec<ParallelTilingOption> {
    let mut tilings = generate_tilings(pure_size, 2, true);
    tilings.push(vec![1; pure_size.len()]);
    let entire_index = tilings.len() - 1;

    let mut options = vec![];
    for (i, mut tiling) in tilings.into_iter().enumerate() {
        for (t, &s) in tiling.iter_mut().zip(pure_size) {
            *t = DivCeil::div_ceil(s, *t);
        }

        let mut min_total = 0;
        let mut max_total = 0;
        let mut idle_core_wastage = 1.0f64;
        for loops in stage_loops {
            let total: i64 = loops
                .iter()
                .filter_map(|l| l.pure_dim)
                .map(|d| tiling[d])
                .product();
            min_total = if min_total != 0 {
                min_total.min(total)
            } else {
                total
            };
            max_total = max_total.max(total);
            let tasks_per_core = total as f64 / parallelism as f64;
            idle_core_wastage = idle_core_wastage.max(tasks_per_core.ceil() / tasks_per_core);
        }

        let option = ParallelTilingOption {
            tiling,
            idle_core_wastage,
            entire: i == entire_index,
            min_total,
            max_total,
        };
        if (option.entire || min_total >= parallelism)
            && max_total <= parallelism * MAX_TASKS_PER_CORE
        {
            options.push(option);
        }
    }
    options.sort_by(|a, b| {
        a.idle_core_wastage
            .partial_cmp(&b.idle_core_wastage)
            .unwrap_or(Ordering::Equal)
    });
    options
}

/// The older scheduler's parallel tiling of a loop with the given sizes.
///
/// Walks from the outermost loop inwards, keeping loops parallel until
/// the task count reaches `parallelism`, and halves any factor that would
/// push the count over eight tasks per core. Impure loops are never split.
pub fn legacy_parallel_tiling(size: &[i64], pure: &[bool], parallelism: i64) -> Vec<i64> {
    let mut tiling = size.to_vec();
    let mut total = 1;
    for i in (0..size.len()).rev() {
        if !pure[i] || total >= parallelism {
            tiling[i] = 1;
        }
        while tiling[i] > 1 && total * tiling[i] > parallelism * 8 {
            tiling[i] /= 2;
        }
        total *= tiling[i];
    }
    tiling
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{Access, DagBuilder, FuncDef, Index, StageDef, Var};
    use proptest::prelude::*;

    fn pure_loops(dims: usize) -> Vec<Loop> {
        let dag = DagBuilder::new()
            .add(FuncDef::input("in", dims))
            .add(
                FuncDef::output("out", &vec![(0, 8); dims])
                    .stage(StageDef::new().reads(Access::pointwise("in", dims))),
            )
            .build()
            .unwrap();
        dag.nodes[0].stages[0].loops.clone()
    }

    #[test]
    fn test_generate_tilings_1d() {
        assert_eq!(generate_tilings(&[8], 2, true), vec![vec![4], vec![2], vec![3]]);
    }

    #[test]
    fn test_generate_tilings_without_splits() {
        let mut t = generate_tilings(&[4, 6], 2, false);
        t.sort();
        assert_eq!(t, vec![vec![1, 6], vec![4, 1]]);
    }

    #[test]
    fn test_generate_tilings_of_unit_extent() {
        assert!(generate_tilings(&[1], 2, true).is_empty());
        assert_eq!(generate_tilings(&[], 2, true), vec![Vec::<i64>::new()]);
    }

    #[test]
    fn test_parallel_filter_1024_by_8() {
        let loops = pure_loops(1);
        let options = parallel_tiling_options(&[1024], &[&loops], 8);
        assert!(!options.is_empty());
        for o in &options {
            assert!(o.entire || o.min_total >= 8, "{o:?}");
            assert!(o.max_total <= 128, "{o:?}");
        }
        for w in options.windows(2) {
            assert!(w[0].idle_core_wastage <= w[1].idle_core_wastage);
        }
    }

    #[test]
    fn test_parallel_filter_keeps_entire_loop_below_parallelism() {
        let loops = pure_loops(1);
        let options = parallel_tiling_options(&[4], &[&loops], 8);
        assert_eq!(options.len(), 1);
        assert!(options[0].entire);
        assert_eq!(options[0].tiling, vec![4]);
        assert_eq!(options[0].min_total, 4);
        assert_eq!(options[0].idle_core_wastage, 2.0);
    }

    #[test]
    fn test_parallel_filter_can_reject_everything() {
        // A histogram-style update has no pure loops, so it contributes a
        // single task and only the entire-loop option can pass, which is
        // itself too fine-grained here.
        let dag = DagBuilder::new()
            .add(FuncDef::input("in", 1))
            .add(
                FuncDef::output("hist", &[(0, 1024)])
                    .stage(StageDef::new())
                    .stage(StageDef::new().rvar("r", 0, 4095).rvars_only().reads(
                        Access::new("in", vec![Index::var(Var::Reduction(0))]),
                    )),
            )
            .build()
            .unwrap();
        let stages = &dag.nodes[0].stages;
        let options =
            parallel_tiling_options(&[128], &[&stages[1].loops, &stages[0].loops], 4);
        assert!(options.is_empty());
    }

    #[test]
    fn test_legacy_tiling_halves_outer_loop() {
        assert_eq!(legacy_parallel_tiling(&[8, 64], &[true, true], 4), vec![1, 32]);
    }

    #[test]
    fn test_legacy_tiling_spills_into_inner_loop() {
        // 3 tasks on the outer loop is below the target, so the inner loop
        // is split too, then halved to stay within 8 tasks per core.
        assert_eq!(legacy_parallel_tiling(&[64, 3], &[true, true], 8), vec![16, 3]);
    }

    #[test]
    fn test_legacy_tiling_never_splits_impure_loops() {
        assert_eq!(legacy_parallel_tiling(&[16, 2], &[true, false], 4), vec![16, 1]);
    }

    proptest! {
        #[test]
        fn test_legacy_tiling_bounds(
            size in proptest::collection::vec(1i64..300, 1..4), parallelism in 1i64..32
        ) {
            let pure = vec![true; size.len()];
            let tiling = legacy_parallel_tiling(&size, &pure, parallelism);
            let total: i64 = tiling.iter().product();
            prop_assert!(tiling.iter().zip(&size).all(|(t, s)| *t >= 1 && t <= s));
            prop_assert!(total <= parallelism * 8);
        }

        #[test]
        fn test_tilings_never_trivial(size in proptest::collection::vec(1i64..200, 1..3)) {
            for t in generate_tilings(&size, 2, true) {
                prop_assert_eq!(t.len(), size.len());
                prop_assert!(t.iter().any(|&x| x != 1));
                prop_assert!(t.iter().zip(&size).any(|(x, s)| x != s));
            }
        }
    }
}
