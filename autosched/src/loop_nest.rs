use crate::bounds::{Bound, BoundContents, Span};
use crate::dag::{FunctionDag, StageKey, StageMap};
use crate::params::{MachineParams, TilingRegime};
use crate::tiling::generate_tilings;

use divrem::DivCeil;
use log::warn;
use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Tilings of a parallel loop leaving more than this fraction of cores idle
/// are not explored.
const MAX_IDLE_CORES: f64 = 1.1;

/// One loop level of a schedule.
///
/// Trees are persistent: children are shared between schedules through
/// [Rc], and a schedule is changed by cloning the path to the loop being
/// changed (see [Rc::make_mut]). The root has no node.
#[derive(Clone, Debug, Default)]
pub struct LoopNest {
    /// Extent of each loop of the stage, innermost first.
    pub size: Vec<i64>,
    pub children: Vec<Rc<LoopNest>>,
    /// Nodes inlined here, with the number of calls to each.
    pub inlined: BTreeMap<usize, i64>,
    /// Nodes whose storage is allocated at this loop.
    pub store_at: BTreeSet<usize>,
    bounds: RefCell<HashMap<usize, Bound>>,
    pub node: Option<usize>,
    pub stage: Option<usize>,
    pub innermost: bool,
    /// Whether this loop may be split further.
    pub tileable: bool,
    pub parallel: bool,
    /// The storage dimension of the node that is vectorized.
    pub vector_dim: Option<usize>,
    /// The loop of the stage that is vectorized.
    pub vectorized_loop_index: Option<usize>,
}

/// The loops at which a stage is computed, stored, and so on.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sites<'a> {
    pub compute: Option<&'a LoopNest>,
    pub store: Option<&'a LoopNest>,
    pub produce: Option<&'a LoopNest>,
    pub innermost: Option<&'a LoopNest>,
    pub task: Option<&'a LoopNest>,
    pub inlined: bool,
}

impl LoopNest {
    pub fn is_root(&self) -> bool {
        self.node.is_none()
    }

    pub fn stage_key(&self) -> Option<StageKey> {
        Some(StageKey::new(self.node?, self.stage?))
    }

    pub(crate) fn expect_stage_key(&self) -> StageKey {
        self.stage_key()
            .expect("loop should be over a stage, not the root")
    }

    pub fn name<'d>(&self, dag: &'d FunctionDag) -> &'d str {
        match self.node {
            Some(n) => &dag.nodes[n].name,
            None => "root",
        }
    }

    fn set_bounds(&self, f: usize, b: BoundContents) -> Bound {
        let b = Rc::new(b);
        self.bounds.borrow_mut().insert(f, Rc::clone(&b));
        b
    }

    /// The region of `f` required at this loop, the region computed if `f`
    /// were scheduled here, and the loops that would compute it.
    pub fn get_bounds(&self, dag: &FunctionDag, f: usize) -> Bound {
        if let Some(b) = self.bounds.borrow().get(&f) {
            return Rc::clone(b);
        }
        let node = &dag.nodes[f];
        let mut bound = node.make_bound();

        if node.is_output && self.is_root() {
            bound.region_required = node.estimated_region_required.clone();
        } else {
            assert!(
                !node.outgoing_edges.is_empty(),
                "No consumers of {} at loop over {}",
                node.name,
                self.name(dag)
            );
            for &ei in &node.outgoing_edges {
                let e = &dag.edges[ei];
                // Consumers outside of this loop don't count.
                if let Some(key) = self.stage_key() {
                    if key != e.consumer && !dag.stage(key).downstream_of(e.consumer.node) {
                        continue;
                    }
                }
                let c_bounds = self.get_bounds(dag, e.consumer.node);
                e.expand_footprint(&c_bounds.loops[e.consumer.stage], &mut bound.region_required);
            }
        }

        bound.region_computed = node.required_to_computed(&bound.region_required);
        bound.loops = (0..node.stages.len())
            .map(|s| node.loop_nest_for_region(s, &bound.region_computed))
            .collect();
        self.set_bounds(f, bound)
    }

    /// Whether anything inside this loop reads `f`.
    pub fn calls(&self, dag: &FunctionDag, f: usize) -> bool {
        if self.children.iter().any(|c| c.calls(dag, f)) {
            return true;
        }
        let key = self.stage_key();
        dag.nodes[f].outgoing_edges.iter().any(|&ei| {
            let e = &dag.edges[ei];
            Some(e.consumer) == key || self.inlined.contains_key(&e.consumer.node)
        })
    }

    /// Whether `f` is computed (or inlined) somewhere inside this loop.
    pub fn computes(&self, f: usize) -> bool {
        self.node == Some(f)
            || self.inlined.contains_key(&f)
            || self.children.iter().any(|c| c.computes(f))
    }

    /// The largest number of calls to any one inlined node.
    pub fn max_inlined_calls(&self) -> i64 {
        self.inlined
            .values()
            .copied()
            .chain(self.children.iter().map(|c| c.max_inlined_calls()))
            .max()
            .unwrap_or(0)
    }

    /// Inline `f` into every consumer inside this loop.
    pub fn inline_func(&mut self, dag: &FunctionDag, f: usize) {
        for child in &mut self.children {
            if child.calls(dag, f) {
                Rc::make_mut(child).inline_func(dag, f);
            }
        }

        if self.innermost {
            let key = self.stage_key();
            let mut calls = 0;
            for &ei in &dag.nodes[f].outgoing_edges {
                let e = &dag.edges[ei];
                if let Some(c) = self.inlined.get(&e.consumer.node) {
                    calls += c * e.calls;
                }
                if Some(e.consumer) == key {
                    calls += e.calls;
                }
            }
            if calls != 0 {
                self.inlined.insert(f, calls);
            }
        }
    }

    /// Compute every stage of `f` at this loop, vectorized over dimension `v`.
    pub fn compute_here(&mut self, dag: &FunctionDag, f: usize, tileable: bool, v: usize, regime: TilingRegime) {
        let bounds = self.get_bounds(dag, f);
        let node = &dag.nodes[f];

        if !regime.may_subtile() {
            // Nothing computed here may be tiled further.
            self.tileable = false;
        }

        for s in (0..node.stages.len()).rev() {
            let stage = &node.stages[s];
            let loop_dim = stage.loops.len();
            let mut n = LoopNest {
                size: vec![0; loop_dim],
                node: Some(f),
                stage: Some(s),
                innermost: true,
                tileable: tileable && (self.is_root() || regime.may_subtile()),
                vector_dim: Some(v),
                ..Default::default()
            };

            // The region is still the full one, but the loops inside are a
            // single representative point.
            let mut single_point = (*bounds).clone();
            let mut vector_size = 1;
            for i in 0..loop_dim {
                let l = *bounds.loops(s, i);
                assert!(
                    l.max() >= l.min(),
                    "Empty loop {i} of {}: [{}, {}]",
                    stage.name,
                    l.min(),
                    l.max()
                );
                n.size[i] = l.extent();
                let p = single_point.loops_mut(s, i);
                *p = Span::new(l.min(), l.min(), true);

                if node.dimensions > 0 && n.size[i] >= 1 && stage.loops[i].pure_dim == Some(v) {
                    n.vectorized_loop_index = Some(i);
                    vector_size = stage.vector_size;
                    p.set_extent(vector_size);
                    n.size[i] = DivCeil::div_ceil(n.size[i], vector_size);
                    // Use the middle-most vector.
                    p.translate(vector_size * (n.size[i] / 2));
                } else {
                    p.translate(n.size[i] / 2);
                }
            }
            n.set_bounds(f, single_point);

            if let Some(vli) = n.vectorized_loop_index {
                // Split off a single vector as the innermost loop.
                n.innermost = false;
                let mut b = (*n.get_bounds(dag, f)).clone();
                b.loops_mut(s, vli).set_extent(1);
                let mut one_vector = LoopNest {
                    size: vec![1; loop_dim],
                    node: Some(f),
                    stage: Some(s),
                    innermost: true,
                    vector_dim: Some(v),
                    vectorized_loop_index: Some(vli),
                    ..Default::default()
                };
                one_vector.size[vli] = vector_size;
                one_vector.set_bounds(f, b);
                n.children.push(Rc::new(one_vector));
            }
            self.children.push(Rc::new(n));
        }
    }

    /// A copy of `self` with the same node and flags, but an empty body.
    fn tile_of(&self, size: Vec<i64>, tileable: bool) -> LoopNest {
        LoopNest {
            size,
            node: self.node,
            stage: self.stage,
            tileable,
            vector_dim: self.vector_dim,
            vectorized_loop_index: self.vectorized_loop_index,
            ..Default::default()
        }
    }

    /// Split this loop into a parallel outer loop with `tiling[d]`
    /// iterations along each pure dimension `d` and a serial inner loop.
    /// Reduction loops stay entirely inside.
    pub fn parallelize_in_tiles(
        &self,
        dag: &FunctionDag,
        regime: TilingRegime,
        tiling: &[i64],
        parent: &LoopNest,
    ) -> Rc<LoopNest> {
        let key = self.expect_stage_key();
        let stage = dag.stage(key);

        let mut inner = self.tile_of(vec![1; self.size.len()], self.tileable && regime.may_subtile());
        inner.innermost = self.innermost;
        inner.children = self.children.clone();
        inner.inlined = self.inlined.clone();
        inner.bounds = self.bounds.clone();
        inner.store_at = self.store_at.clone();
        let mut outer = self.tile_of(self.size.clone(), regime.may_subtile());
        outer.parallel = true;

        let mut b = (*inner.get_bounds(dag, key.node)).clone();
        let parent_bounds = parent.get_bounds(dag, key.node);
        for (i, l) in stage.loops.iter().enumerate() {
            let mut outer_extent = match l.pure_dim {
                Some(d) => {
                    assert!(d < tiling.len(), "Tiling {tiling:?} has no dimension {d}");
                    tiling[d]
                }
                None => 1,
            };
            inner.size[i] = DivCeil::div_ceil(outer.size[i], outer_extent);
            // Round the outer extent to the chosen inner size.
            outer_extent = DivCeil::div_ceil(outer.size[i], inner.size[i]);
            outer.size[i] = outer_extent;

            let p = parent_bounds.loops(key.stage, i);
            let extent = DivCeil::div_ceil(p.extent(), outer_extent);
            let min = p.min() + (outer_extent / 2) * extent;
            let constant_extent = p.constant_extent() || (outer_extent > 1 && l.is_pure());
            *b.loops_mut(key.stage, i) = Span::new(min, min + extent - 1, constant_extent);
        }
        outer.set_bounds(key.node, b);
        outer.children.push(Rc::new(inner));
        Rc::new(outer)
    }

    /// Every way to compute `f` somewhere within this loop nest, vectorized
    /// over dimension `v`. Each result replaces `self`.
    ///
    /// If `in_realization` is set, storage for `f` has already been placed
    /// outside this loop.
    pub fn compute_in_tiles(
        &self,
        dag: &FunctionDag,
        f: usize,
        parent: Option<&LoopNest>,
        params: &MachineParams,
        v: usize,
        in_realization: bool,
    ) -> Vec<Rc<LoopNest>> {
        let node = &dag.nodes[f];
        let regime = params.tiling_regime;
        let mut result = vec![];

        if let Some(parent) = parent {
            let here = self.get_bounds(dag, f);
            let at_parent = parent.get_bounds(dag, f);

            // Don't descend into loops that break vectorization we could
            // have had one level up.
            if node.dimensions > 0 {
                let e = here.region_computed[v].extent();
                let ep = at_parent.region_computed[v].extent();
                if ep >= node.vector_size && e < node.vector_size {
                    return result;
                }
            }

            // Nor into loops over which the region computed doesn't shrink.
            let total_here: i64 = here.region_computed.iter().map(Span::extent).product();
            let total_at_parent: i64 = at_parent.region_computed.iter().map(Span::extent).product();
            if total_here >= total_at_parent {
                return result;
            }
        }

        let mut child = None;
        let mut called_by_multiple_children = false;
        for (i, c) in self.children.iter().enumerate() {
            if c.calls(dag, f) {
                called_by_multiple_children |= child.is_some();
                child = Some(i);
            }
        }

        // Place the computation directly inside this loop, unless this is
        // a SIMD loop.
        let serial_vector_dim = match self.vector_dim {
            Some(vd) => self.size.get(vd).map_or(true, |&s| s == 1),
            None => true,
        };
        if !self.innermost && (!in_realization || self.size.is_empty() || serial_vector_dim) {
            let mut r = self.clone();
            r.compute_here(dag, f, true, v, regime);
            if !in_realization {
                r.store_at.insert(f);
            } else {
                r.tileable = false;
            }
            result.push(Rc::new(r));
        }

        if node.is_output {
            // Outputs are always computed at the root.
            return result;
        }

        if self.tileable {
            let parent = parent.expect("the root is never tileable");
            let key = self.expect_stage_key();
            let stage = dag.stage(key);

            let tilings = generate_tilings(&self.size, 2, !in_realization);
            if tilings.len() > 10000 {
                warn!("Lots of tilings of {}: {}", stage.name, tilings.len());
            }

            for t in tilings {
                if self.parallel {
                    // Skip root-level tilings that would leave too many
                    // cores idle.
                    let total: i64 = t
                        .iter()
                        .zip(&stage.loops)
                        .filter(|(_, l)| l.is_pure())
                        .map(|(&s, _)| s)
                        .product();
                    let tasks_per_core = total as f64 / params.parallelism as f64;
                    let idle_cores = tasks_per_core.ceil() / tasks_per_core;
                    if idle_cores > MAX_IDLE_CORES {
                        continue;
                    }
                }

                // Tile this loop and place the computation at some coarser
                // granularity.
                let may_subtile = regime.may_subtile();
                let mut inner = self.tile_of(vec![1; self.size.len()], self.tileable && may_subtile);
                inner.innermost = self.innermost;
                inner.children = self.children.clone();
                inner.inlined = self.inlined.clone();
                inner.bounds = self.bounds.clone();
                inner.store_at = self.store_at.clone();
                let mut outer = self.tile_of(t.clone(), self.tileable && may_subtile);
                outer.parallel = self.parallel;

                let mut b = (*inner.get_bounds(dag, key.node)).clone();
                let parent_bounds = parent.get_bounds(dag, key.node);
                for (i, &outer_extent) in t.iter().enumerate() {
                    inner.size[i] = DivCeil::div_ceil(self.size[i], outer_extent);
                    let p = parent_bounds.loops(key.stage, i);
                    let inner_extent = DivCeil::div_ceil(p.extent(), outer_extent);
                    // Pick a more representative iteration.
                    let min = p.min() + (outer_extent / 2) * inner_extent;
                    let constant_extent = (p.constant_extent() || outer_extent > 1)
                        && (inner_extent == 1 || outer_extent == 1 || key.stage == 0);
                    *b.loops_mut(key.stage, i) =
                        Span::new(min, min + inner_extent - 1, constant_extent);
                }
                outer.set_bounds(key.node, b);

                if !in_realization {
                    outer.store_at.insert(f);
                }
                let inner = Rc::new(inner);
                outer.children.push(Rc::clone(&inner));

                if !in_realization && node.stages.len() == 1 {
                    // Store here, but compute further in.
                    for n in inner.compute_in_tiles(dag, f, Some(&outer), params, v, true) {
                        let mut r = outer.clone();
                        r.children.pop();
                        r.children.push(n);
                        result.push(Rc::new(r));
                    }
                }

                outer.compute_here(dag, f, true, v, regime);
                outer.tileable &= !in_realization;
                result.push(Rc::new(outer));
            }
        }

        if let Some(ci) = child {
            if !called_by_multiple_children
                && !in_realization
                && (regime.may_subtile() || self.is_root())
            {
                // Push the computation further inwards. Root loops are
                // parallelized later, so we can't slide over them.
                let c = &self.children[ci];
                let num_ones = c.size.iter().filter(|&&s| s == 1).count();
                let may_slide = (params.parallelism == 1 || !self.is_root())
                    && num_ones + 1 == c.size.len()
                    && node.stages.len() == 1
                    && c.vectorized_loop_index.map_or(true, |i| c.size[i] == 1);

                for store_here in [false, true] {
                    if store_here && !may_slide {
                        continue;
                    }
                    if self.is_root() && num_ones == c.size.len() && params.parallelism > 1 {
                        // Fusing into a serial loop would make f impossible
                        // to parallelize.
                        continue;
                    }
                    for n in c.compute_in_tiles(dag, f, Some(self), params, v, store_here) {
                        let mut r = self.clone();
                        if store_here {
                            r.store_at.insert(f);
                        }
                        r.children[ci] = n;
                        result.push(Rc::new(r));
                    }
                }
            }
        }

        result
    }

    /// Record the compute, store, production, innermost and task sites of
    /// every stage scheduled within this loop.
    pub fn get_sites<'a>(
        &'a self,
        dag: &FunctionDag,
        sites: &mut StageMap<Sites<'a>>,
        task: Option<&'a LoopNest>,
        parent: Option<&'a LoopNest>,
    ) {
        let task = match task {
            None if !self.is_root() => Some(self),
            t => t,
        };
        for c in &self.children {
            c.get_sites(dag, sites, task, Some(self));
        }
        if let (Some(parent), Some(key)) = (parent, self.stage_key()) {
            if self.node != parent.node {
                let s = sites.entry(key).or_default();
                s.compute = Some(parent);
                s.produce = Some(self);
                s.task = task;
            }
        }
        for &f in &self.store_at {
            for s in 0..dag.nodes[f].stages.len() {
                sites.entry(StageKey::new(f, s)).or_default().store = Some(self);
            }
        }
        for &f in self.inlined.keys() {
            let s = sites.entry(StageKey::new(f, 0)).or_default();
            s.inlined = true;
            s.compute = Some(self);
            s.store = Some(self);
            s.produce = Some(self);
            s.innermost = Some(self);
            s.task = task;
        }
        if self.innermost {
            if let Some(key) = self.stage_key() {
                sites.entry(key).or_default().innermost = Some(self);
            }
        }
    }

    /// Hash the loop structure and sizes down to `depth`.
    ///
    /// At depth 0 only what is stored, computed and inlined at this level
    /// counts. Depth 1 adds whether each child loop is longer than one,
    /// depth 2 their exact sizes, and deeper levels recurse.
    pub fn structural_hash(&self, depth: i32) -> u64 {
        let mut h = DefaultHasher::new();
        self.hash_structure(&mut h, depth);
        h.finish()
    }

    fn hash_structure<H: Hasher>(&self, h: &mut H, depth: i32) {
        if depth < 0 {
            return;
        }
        self.store_at.iter().for_each(|n| n.hash(h));
        (-1i64).hash(h);
        for c in &self.children {
            c.stage_key().hash(h);
        }
        // Separates the last compute_at from the first inlined.
        (-1i64).hash(h);
        self.inlined.keys().for_each(|n| n.hash(h));
        (-1i64).hash(h);

        if depth > 0 {
            for c in &self.children {
                for &s in &c.size {
                    if depth == 1 {
                        (s > 1).hash(h);
                    } else {
                        s.hash(h);
                    }
                }
            }
            self.vectorized_loop_index.hash(h);
        }
        if depth > 1 {
            for c in &self.children {
                c.hash_structure(h, depth - 2);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines;

    fn root_with_output(dag: &FunctionDag, params: &MachineParams) -> LoopNest {
        let root = LoopNest::default();
        let opts = root.compute_in_tiles(dag, 0, None, params, 0, false);
        assert_eq!(opts.len(), 1);
        (*opts[0]).clone()
    }

    #[test]
    fn test_output_bounds_at_root_are_the_estimate() {
        let dag = pipelines::pointwise_chain(1, 1000);
        let root = LoopNest::default();
        let b = root.get_bounds(&dag, 0);
        assert_eq!(b.region_required, vec![Span::new(0, 999, true)]);
        assert_eq!(b.region_computed, b.region_required);
        assert_eq!(b.loops[0], vec![Span::new(0, 999, true)]);
    }

    #[test]
    fn test_stencil_bounds_at_root_grow() {
        let dag = pipelines::blur(64, 32);
        let root = root_with_output(&dag, &MachineParams::default());
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        let input = dag.node_by_name("input").unwrap().id;
        let b = root.get_bounds(&dag, blur_x);
        assert_eq!(b.region_required, vec![Span::new(0, 63, true), Span::new(-1, 32, true)]);
        let b = root.get_bounds(&dag, input);
        assert_eq!(b.region_required[0], Span::new(-1, 64, true));
    }

    #[test]
    fn test_output_is_vectorized_at_root() {
        let dag = pipelines::pointwise_chain(1, 1000);
        let params = MachineParams::default();
        let root = root_with_output(&dag, &params);
        assert!(root.store_at.contains(&0));
        assert_eq!(root.children.len(), 1);
        let c = &root.children[0];
        assert_eq!(c.node, Some(0));
        assert_eq!(c.size, vec![125]);
        assert_eq!(c.vectorized_loop_index, Some(0));
        assert!(!c.innermost);
        assert_eq!(c.children[0].size, vec![8]);
        assert!(c.children[0].innermost);
        assert!(root.computes(0));
        assert!(root.calls(&dag, 1));
        assert!(!root.calls(&dag, 2));
    }

    #[test]
    fn test_inline_func_counts_calls_through_inlined_consumers() {
        let dag = pipelines::pointwise_chain(2, 64);
        let params = MachineParams::default();
        let mut root = root_with_output(&dag, &params);
        root.inline_func(&dag, 1);
        root.inline_func(&dag, 2);
        let innermost = &root.children[0].children[0];
        assert_eq!(innermost.inlined.get(&1), Some(&1));
        assert_eq!(innermost.inlined.get(&2), Some(&1));
        assert_eq!(root.max_inlined_calls(), 1);
        assert!(root.computes(2));
        assert!(root.calls(&dag, 3));
    }

    #[test]
    fn test_inlining_a_stencil_multiplies_calls() {
        let dag = pipelines::blur(64, 64);
        let params = MachineParams::default();
        let mut root = root_with_output(&dag, &params);
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        let input = dag.node_by_name("input").unwrap().id;
        root.inline_func(&dag, blur_x);
        root.inline_func(&dag, input);
        assert_eq!(root.max_inlined_calls(), 9);
    }

    #[test]
    fn test_inline_func_leaves_original_untouched() {
        let dag = pipelines::pointwise_chain(1, 64);
        let params = MachineParams::default();
        let root = root_with_output(&dag, &params);
        let mut inlined = root.clone();
        inlined.inline_func(&dag, 1);
        assert!(!root.computes(1));
        assert!(inlined.computes(1));
    }

    #[test]
    fn test_parallelize_in_tiles() {
        let dag = pipelines::pointwise_chain(1, 1024);
        let params = MachineParams::default();
        let root = root_with_output(&dag, &params);
        let c = &root.children[0];
        let tiled = c.parallelize_in_tiles(&dag, params.tiling_regime, &[16], &root);
        assert!(tiled.parallel);
        assert_eq!(tiled.size, vec![16]);
        assert_eq!(tiled.children[0].size, vec![8]);
        let b = tiled.get_bounds(&dag, 0);
        assert_eq!(b.loops[0][0].extent(), 64);
        assert!(b.loops[0][0].constant_extent());
    }

    #[test]
    fn test_compute_in_tiles_offers_fusion() {
        let dag = pipelines::blur(256, 256);
        let params = MachineParams::default().with_parallelism(1);
        let root = root_with_output(&dag, &params);
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        let opts = root.compute_in_tiles(&dag, blur_x, None, &params, 0, false);
        assert!(opts.len() > 1);
        assert!(opts.iter().all(|r| r.computes(blur_x)));
        // The first option is compute_root.
        assert!(opts[0].store_at.contains(&blur_x));
        assert_eq!(opts[0].children.len(), 2);
        assert!(opts[1..].iter().any(|r| r.children.len() == 1));
    }

    #[test]
    fn test_legacy_regime_does_not_subtile() {
        let dag = pipelines::blur(256, 256);
        let params = MachineParams::default()
            .with_parallelism(1)
            .with_regime(TilingRegime::Legacy);
        let root = root_with_output(&dag, &params);
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        fn any_tileable(l: &LoopNest) -> bool {
            l.tileable || l.children.iter().any(|c| any_tileable(c))
        }
        let opts = root.compute_in_tiles(&dag, blur_x, None, &params, 0, false);
        assert!(!opts.is_empty());
        for r in opts {
            assert!(r.children.iter().all(|c| !c.children.iter().any(|g| any_tileable(g))));
        }
    }

    #[test]
    fn test_get_sites() {
        let dag = pipelines::pointwise_chain(1, 64);
        let params = MachineParams::default();
        let mut root = root_with_output(&dag, &params);
        root.inline_func(&dag, 1);
        let mut sites = StageMap::default();
        root.get_sites(&dag, &mut sites, None, None);
        let out = sites[&StageKey::new(0, 0)];
        assert!(std::ptr::eq(out.compute.unwrap(), &root));
        assert!(std::ptr::eq(out.store.unwrap(), &root));
        assert!(std::ptr::eq(out.produce.unwrap(), &*root.children[0]));
        assert!(std::ptr::eq(out.innermost.unwrap(), &*root.children[0].children[0]));
        let f = sites[&StageKey::new(1, 0)];
        assert!(f.inlined);
        assert!(std::ptr::eq(f.task.unwrap(), &*root.children[0]));
    }

    #[test]
    fn test_structural_hash() {
        let dag = pipelines::pointwise_chain(1, 64);
        let params = MachineParams::default();
        let root = root_with_output(&dag, &params);
        let again = root_with_output(&dag, &params);
        assert_eq!(root.structural_hash(4), again.structural_hash(4));
        let mut inlined = root.clone();
        inlined.inline_func(&dag, 1);
        // The inlined call sits two loop levels below the root.
        assert_eq!(root.structural_hash(2), inlined.structural_hash(2));
        assert_ne!(root.structural_hash(4), inlined.structural_hash(4));
    }
}
