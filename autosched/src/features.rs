use crate::bounds::Span;
use crate::dag::{FunctionDag, LoadJacobian, Node, StageKey, StageMap};
use crate::loop_nest::{LoopNest, Sites};
use crate::params::MachineParams;

use by_address::ByThinAddress;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

/// Innermost loops at most this long are assumed to be unrolled.
const UNROLL_LIMIT: f64 = 12.0;

/// Per-stage features of a (possibly partial) schedule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleFeatures {
    /// Number of times storage for this stage is allocated.
    pub num_realizations: f64,
    /// Number of times a tile of this stage is computed.
    pub num_productions: f64,
    pub points_computed_per_realization: f64,
    pub points_computed_per_production: f64,
    pub points_computed_total: f64,
    /// What the stage would compute if scheduled with no redundancy.
    pub points_computed_minimum: f64,
    pub innermost_loop_extent: f64,
    pub innermost_pure_loop_extent: f64,
    pub unrolled_loop_extent: f64,
    pub inner_parallelism: f64,
    pub outer_parallelism: f64,
    pub bytes_at_realization: f64,
    pub bytes_at_production: f64,
    pub bytes_at_root: f64,
    pub innermost_bytes_at_realization: f64,
    pub innermost_bytes_at_production: f64,
    pub innermost_bytes_at_root: f64,
    /// Calls to this stage from the consumers it is inlined into.
    pub inlined_calls: f64,
    pub unique_bytes_read_per_realization: f64,
    pub unique_lines_read_per_realization: f64,
    pub allocation_bytes_read_per_realization: f64,
    pub working_set: f64,
    pub vector_size: f64,
    pub native_vector_size: f64,
    pub num_vectors: f64,
    pub num_scalars: f64,
    pub scalar_loads_per_vector: f64,
    pub vector_loads_per_vector: f64,
    pub scalar_loads_per_scalar: f64,
    pub bytes_at_task: f64,
    pub innermost_bytes_at_task: f64,
    pub unique_bytes_read_per_vector: f64,
    pub unique_lines_read_per_vector: f64,
    pub unique_bytes_read_per_task: f64,
    pub unique_lines_read_per_task: f64,
    pub working_set_at_task: f64,
    pub working_set_at_production: f64,
    pub working_set_at_realization: f64,
    pub working_set_at_root: f64,
}

/// One stage's features, as written by [save_featurization].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub node: String,
    pub stage: usize,
    pub features: ScheduleFeatures,
}

/// Compute features of every stage scheduled so far.
///
/// Stages that have not been scheduled yet are given the deepest site they
/// could possibly be computed at, so partial schedules can still be scored.
pub fn featurize(
    dag: &FunctionDag,
    params: &MachineParams,
    root: &LoopNest,
) -> StageMap<ScheduleFeatures> {
    let mut sites = StageMap::default();
    root.get_sites(dag, &mut sites, None, None);

    // Inputs and unscheduled outputs are computed and stored at the root.
    for n in dag.nodes.iter().filter(|n| n.is_input || n.is_output) {
        for s in 0..n.stages.len() {
            let site = sites.entry(StageKey::new(n.id, s)).or_default();
            if site.compute.is_none() {
                site.compute = Some(root);
                site.store = Some(root);
            }
        }
    }

    let parents = loop_nest_parents(root);
    for n in &dag.nodes {
        if sites.contains_key(&StageKey::new(n.id, 0)) {
            continue;
        }
        let mut deepest: Option<&LoopNest> = None;
        for &ei in &n.outgoing_edges {
            let e = &dag.edges[ei];
            let consumer_site = sites.get(&e.consumer).copied().unwrap_or_default();
            let l = consumer_site
                .innermost
                .or(consumer_site.compute)
                .unwrap_or_else(|| {
                    panic!(
                        "{} -> {} has no consumer site",
                        n.name,
                        dag.stage(e.consumer).name
                    )
                });
            deepest = Some(match deepest {
                Some(prev) => deepest_common_ancestor(&parents, l, prev),
                None => l,
            });
        }
        let site = deepest.unwrap_or_else(|| {
            panic!("Could not compute plausible site for unscheduled {}", n.name)
        });
        for s in 0..n.stages.len() {
            let entry = sites.entry(StageKey::new(n.id, s)).or_default();
            entry.compute = Some(site);
            entry.store = Some(site);
        }
    }

    let mut features = StageMap::default();
    let mut working_set = 0.0;
    root.compute_features(
        dag,
        params,
        &sites,
        1,
        1,
        None,
        None,
        root,
        &mut working_set,
        &mut features,
    );
    features.sort_keys();
    features
}

/// Write one bincode record per featurized stage, for training a cost model
/// offline. Stages are written consumers first, updates before pure
/// definitions.
pub fn save_featurization<W: Write>(
    dag: &FunctionDag,
    features: &StageMap<ScheduleFeatures>,
    mut writer: W,
) -> Result<(), bincode::Error> {
    let mut records = vec![];
    for n in dag.nodes.iter().filter(|n| !n.is_input) {
        for s in (0..n.stages.len()).rev() {
            if let Some(f) = features.get(&StageKey::new(n.id, s)) {
                records.push(FeatureRecord {
                    node: n.name.clone(),
                    stage: s,
                    features: f.clone(),
                });
            }
        }
    }
    bincode::serialize_into(&mut writer, &(records.len() as u64))?;
    for r in &records {
        bincode::serialize_into(&mut writer, r)?;
    }
    Ok(())
}

pub fn load_featurization<R: Read>(mut reader: R) -> Result<Vec<FeatureRecord>, bincode::Error> {
    let count: u64 = bincode::deserialize_from(&mut reader)?;
    (0..count)
        .map(|_| bincode::deserialize_from(&mut reader))
        .collect()
}

type Parents<'a> = HashMap<ByThinAddress<&'a LoopNest>, (&'a LoopNest, usize)>;

fn loop_nest_parents(root: &LoopNest) -> Parents<'_> {
    fn visit<'a>(parents: &mut Parents<'a>, here: &'a LoopNest, depth: usize) {
        for c in &here.children {
            parents.insert(ByThinAddress(&**c), (here, depth));
            visit(parents, c, depth + 1);
        }
    }
    let mut parents = HashMap::new();
    visit(&mut parents, root, 0);
    parents
}

fn deepest_common_ancestor<'a>(
    parents: &Parents<'a>,
    mut a: &'a LoopNest,
    mut b: &'a LoopNest,
) -> &'a LoopNest {
    if a.is_root() {
        return a;
    }
    if b.is_root() {
        return b;
    }
    if std::ptr::eq(a, b) {
        return a;
    }
    let depth_of = |l: &'a LoopNest| parents.get(&ByThinAddress(l)).map_or(0, |p| p.1 + 1);
    let parent_of = |l: &'a LoopNest| {
        parents
            .get(&ByThinAddress(l))
            .expect("every non-root loop should have a parent")
            .0
    };
    let (mut depth_a, mut depth_b) = (depth_of(a), depth_of(b));
    while depth_a > depth_b {
        a = parent_of(a);
        depth_a -= 1;
    }
    while depth_b > depth_a {
        b = parent_of(b);
        depth_b -= 1;
    }
    while !std::ptr::eq(a, b) {
        a = parent_of(a);
        b = parent_of(b);
    }
    a
}

fn region_bytes(node: &Node, region: &[Span]) -> f64 {
    region
        .iter()
        .fold(node.bytes_per_point as f64, |acc, p| acc * p.extent() as f64)
}

/// Bytes of one row of storage along dimension `v`.
fn innermost_bytes(node: &Node, region: &[Span], v: Option<usize>) -> f64 {
    let extent = match v {
        Some(v) if v < node.dimensions => region[v].extent(),
        _ => 1,
    };
    (node.bytes_per_point * extent) as f64
}

#[derive(Default)]
struct LoadCounts {
    dense: f64,
    broadcasts: f64,
    gathers: f64,
    stride_2: f64,
    stride_3: f64,
    stride_4: f64,
    total: f64,
}

impl LoadCounts {
    /// Classify `n` loads of the given Jacobian by their stride along the
    /// vectorized loop.
    fn add(
        &mut self,
        jac: &LoadJacobian,
        n: f64,
        vectorized_loop_index: Option<usize>,
        producer_innermost_dim: Option<usize>,
        producer_has_been_scheduled: bool,
    ) {
        let dims = jac.producer_dims();
        let mut broadcast = true;
        let mut strided = [true; 4];
        if let Some(vli) = vectorized_loop_index {
            if !producer_has_been_scheduled {
                // See if any storage layout would make for a good load.
                let mut count = [0usize; 5];
                for i in 0..dims {
                    if let Some(s @ 0..=4) = jac.get(i, vli) {
                        count[s as usize] += 1;
                    }
                }
                broadcast = count[0] == dims;
                for (k, s) in strided.iter_mut().enumerate() {
                    *s = count[0] + 1 == dims && count[k + 1] == 1;
                }
            } else {
                for i in 0..dims {
                    let stride = jac.get(i, vli);
                    broadcast &= stride == Some(0);
                    for (k, s) in strided.iter_mut().enumerate() {
                        if Some(i) == producer_innermost_dim {
                            *s &= stride == Some(k as i64 + 1);
                        } else {
                            *s &= stride == Some(0);
                        }
                    }
                }
            }
        }

        self.total += n;
        if broadcast {
            self.broadcasts += n;
        } else if strided[0] {
            self.dense += n;
        } else if strided[1] {
            self.stride_2 += n;
        } else if strided[2] {
            self.stride_3 += n;
        } else if strided[3] {
            self.stride_4 += n;
        } else {
            self.gathers += n;
        }
    }
}

impl LoopNest {
    /// Walk this loop nest, accumulating features of every stage computed
    /// within it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn compute_features<'a>(
        &'a self,
        dag: &FunctionDag,
        params: &MachineParams,
        sites: &StageMap<Sites<'a>>,
        instances: i64,
        parallelism: i64,
        parent: Option<&'a LoopNest>,
        grandparent: Option<&'a LoopNest>,
        root: &'a LoopNest,
        working_set: &mut f64,
        features: &mut StageMap<ScheduleFeatures>,
    ) {
        let mut working_set_here = 0.0;

        let mut loop_instances = 1i64;
        let mut parallel_tasks = 1i64;
        if let Some(key) = self.stage_key() {
            let stage = dag.stage(key);
            let parent_is_root = parent.map_or(false, LoopNest::is_root);
            let mut in_impure = false;
            for idx in (0..self.size.len()).rev() {
                let i = self.size[idx];
                loop_instances *= i;
                if stage.loops[idx].is_pure() && !in_impure {
                    if params.parallelism > 1
                        && (self.parallel || (parent_is_root && parallel_tasks < params.parallelism))
                    {
                        // Until the parallel tiling is chosen, assume the
                        // outer loops will be split to about 8 tasks per core.
                        parallel_tasks *= i;
                        if !self.parallel && parallel_tasks > params.parallelism * 8 {
                            parallel_tasks = params.parallelism * 8;
                        }
                    }
                } else if i != 1 {
                    in_impure = true;
                }
            }
        }
        let subinstances = instances * loop_instances;

        // Features at the store_at level.
        for &n in &self.store_at {
            let node = &dag.nodes[n];
            assert!(!node.is_input, "Input {} cannot be stored", node.name);
            let bounds = self.get_bounds(dag, n);
            for (s, stage) in node.stages.iter().enumerate() {
                let key = StageKey::new(n, s);
                let produce = sites.get(&key).and_then(|site| site.produce);
                let feat = features.entry(key).or_default();

                feat.num_realizations = subinstances as f64;
                feat.points_computed_per_realization = 1.0;
                feat.num_scalars = subinstances as f64;
                feat.num_vectors = subinstances as f64;
                let mut vectorized = false;
                for i in 0..stage.loops.len() {
                    let extent = bounds.loops(s, i).extent();
                    feat.points_computed_per_realization *= extent as f64;
                    if produce.and_then(|p| p.vectorized_loop_index) == Some(i) {
                        feat.num_vectors *= (extent / stage.vector_size) as f64;
                        feat.num_scalars *= (extent % stage.vector_size) as f64;
                        vectorized = true;
                    } else {
                        feat.num_vectors *= extent as f64;
                        feat.num_scalars *= extent as f64;
                    }
                }
                if !vectorized {
                    feat.num_vectors = 0.0;
                }
                feat.points_computed_total =
                    feat.points_computed_per_realization * feat.num_realizations;

                feat.bytes_at_realization = region_bytes(node, &bounds.region_computed);
                let v = produce.and_then(|p| p.vector_dim);
                feat.innermost_bytes_at_realization =
                    innermost_bytes(node, &bounds.region_computed, v);

                if !self.is_root() {
                    feat.bytes_at_task = feat.bytes_at_realization;
                    feat.innermost_bytes_at_task = feat.innermost_bytes_at_realization;
                }
            }
        }

        let Some(key) = self.stage_key() else {
            for c in &self.children {
                c.compute_features(
                    dag,
                    params,
                    sites,
                    subinstances,
                    parallelism,
                    Some(self),
                    parent,
                    root,
                    &mut working_set_here,
                    features,
                );
            }
            self.record_working_sets(&mut working_set_here, features);
            self.compute_root_features(dag, sites, root, working_set_here, features);
            return;
        };

        let stage = dag.stage(key);
        let node = &dag.nodes[key.node];
        let parent = parent.expect("a loop over a stage should have a parent");
        let subparallelism = parallel_tasks * parallelism;
        assert!(!node.is_input, "Input {} cannot be computed", node.name);

        {
            let feat = features.entry(key).or_default();
            if self.innermost {
                feat.vector_size = match self.vectorized_loop_index {
                    Some(i) if i < self.size.len() => self.size[i] as f64,
                    _ => 1.0,
                };
                if feat.vector_size == 1.0 {
                    feat.num_scalars += feat.num_vectors;
                    feat.num_vectors = 0.0;
                }
            } else {
                // Overwritten at every level down to just outside the
                // innermost loop.
                feat.innermost_loop_extent = 1.0;
                feat.innermost_pure_loop_extent = 1.0;
                for (l, &s) in stage.loops.iter().zip(&self.size) {
                    feat.innermost_loop_extent *= s as f64;
                    if l.is_pure() {
                        feat.innermost_pure_loop_extent *= s as f64;
                    }
                }
            }
        }

        let at_task = parent.is_root();
        let at_production = parent.node != self.node;
        let at_pure_production = at_production && key.stage == 0;

        if at_task {
            self.compute_task_features(dag, params, sites, key, features);
        }

        if at_production {
            let bounds = parent.get_bounds(dag, key.node);
            let feat = features.entry(key).or_default();
            feat.num_productions = instances as f64;
            feat.inner_parallelism = parallel_tasks as f64;
            feat.outer_parallelism = parallelism as f64;
            feat.native_vector_size = stage.vector_size as f64;
            feat.bytes_at_production = region_bytes(node, &bounds.region_computed);
            let v = self.vector_dim.filter(|_| node.dimensions > 0);
            feat.innermost_bytes_at_production = innermost_bytes(node, &bounds.region_computed, v);
        }

        for c in &self.children {
            c.compute_features(
                dag,
                params,
                sites,
                subinstances,
                subparallelism,
                Some(self),
                Some(parent),
                root,
                &mut working_set_here,
                features,
            );
        }
        self.record_working_sets(&mut working_set_here, features);

        if at_task {
            self.set_working_set_at_task_feature(working_set_here, features);
        }
        if at_production {
            features.entry(key).or_default().working_set = working_set_here;
        }

        if self.innermost {
            let innermost_pure_loop_extent = features[&key].innermost_pure_loop_extent;
            let mut parent_unrolled =
                innermost_pure_loop_extent <= UNROLL_LIMIT && parent.node == self.node;
            if parent_unrolled {
                let grandparent =
                    grandparent.expect("a loop nested in a loop over a stage should have a grandparent");
                let parent_key = parent.expect_stage_key();
                let grandparent_bounds = grandparent.get_bounds(dag, key.node);
                for i in 0..parent.size.len() {
                    if stage.loops[i].is_pure() {
                        parent_unrolled &= grandparent_bounds
                            .loops(parent_key.stage, i)
                            .constant_extent();
                    }
                }
            }
            features.entry(key).or_default().unrolled_loop_extent = if parent_unrolled {
                innermost_pure_loop_extent
            } else {
                1.0
            };
        }

        *working_set += working_set_here;

        // Analyze every memory dependency of this stage, looking through
        // any nodes inlined into it.
        let mut bytes_loaded = 0i64;
        let mut lines_loaded = 0i64;
        let mut allocation_bytes_loaded = 0i64;
        let mut loads = LoadCounts::default();
        if self.innermost || at_production {
            let consumer_site = sites.get(&key).copied().unwrap_or_default();
            let consumer_store_site = if self.innermost {
                parent
            } else {
                consumer_site
                    .store
                    .expect("a produced stage should have a store site")
            };
            let consumer_instances = if self.innermost {
                instances
            } else {
                features[&key].num_realizations as i64
            };
            let unrolled_loop_extent = features[&key].unrolled_loop_extent;

            let mut pending = vec![key];
            let mut jacobians: Vec<(LoadJacobian, usize)> = vec![];
            let mut done = HashSet::new();
            while let Some(p) = pending.pop() {
                for &ei in &dag.stage(p).incoming_edges {
                    let e = &dag.edges[ei];
                    let producer = &dag.nodes[e.producer];
                    let producer_key = StageKey::new(e.producer, 0);
                    let site = *sites
                        .get(&producer_key)
                        .unwrap_or_else(|| panic!("No site found for {}", producer.name));
                    let producer_has_been_scheduled = producer.is_input || site.produce.is_some();

                    if self.innermost {
                        if e.consumer == key {
                            jacobians.extend(e.load_jacobians.iter().map(|j| (j.clone(), e.producer)));
                        } else {
                            // The consumer was inlined. Multiply the
                            // Jacobians to look through it.
                            jacobians = jacobians
                                .into_iter()
                                .flat_map(|(j1, n)| {
                                    if n == e.consumer.node {
                                        e.load_jacobians
                                            .iter()
                                            .map(|j2| (j2.compose(&j1), e.producer))
                                            .collect::<Vec<_>>()
                                    } else {
                                        vec![(j1, n)]
                                    }
                                })
                                .collect();
                        }
                    }

                    if site.inlined {
                        pending.push(producer_key);
                        continue;
                    }

                    let producer_compute_site = site
                        .compute
                        .expect("every producer should have a compute site");
                    let producer_store_site = site
                        .store
                        .expect("every producer should have a store site");
                    if producer.is_input {
                        debug_assert!(producer_store_site.is_root());
                        debug_assert!(producer_compute_site.is_root());
                    }

                    if self.innermost {
                        let producer_innermost_dim = if producer.is_input {
                            // Inputs have the default storage layout.
                            Some(0)
                        } else {
                            site.produce.and_then(|p| p.vector_dim)
                        };
                        for (jac, n) in &jacobians {
                            if *n != e.producer {
                                continue;
                            }
                            // Loads invariant over an unrolled loop get
                            // hoisted out of it.
                            let mut amortization = 1i64;
                            if unrolled_loop_extent > 1.0 {
                                for (idx, l) in stage.loops.iter().enumerate() {
                                    let invariant = (0..producer.dimensions)
                                        .all(|i| jac.get(i, idx) == Some(0));
                                    if l.is_pure() && invariant {
                                        amortization *= parent.size[idx];
                                    }
                                }
                            }
                            loads.add(
                                jac,
                                jac.count() as f64 / amortization as f64,
                                self.vectorized_loop_index,
                                producer_innermost_dim,
                                producer_has_been_scheduled,
                            );
                        }
                    }

                    if !done.insert(e.producer) {
                        continue;
                    }

                    // The shapes of the regions read from the producer at
                    // various sites.
                    let bounds = consumer_store_site.get_bounds(dag, e.producer);
                    let compute_bounds = producer_compute_site.get_bounds(dag, e.producer);
                    let store_bounds = producer_store_site.get_bounds(dag, e.producer);

                    let mut footprint = producer.bytes_per_point;
                    let mut compute_footprint = footprint;
                    let mut store_footprint = footprint;
                    let mut line_footprint = 1i64;
                    let mut store_line_footprint = 1i64;
                    let mut max_extent = 1i64;
                    let mut max_store_extent = 1i64;
                    for i in 0..producer.dimensions {
                        let extent = bounds.region_required[i].extent();
                        let compute_extent = compute_bounds.region_computed[i].extent();
                        let store_extent = store_bounds.region_required[i].extent();
                        max_extent = max_extent.max(extent);
                        max_store_extent = max_store_extent.max(store_extent);
                        footprint *= extent;
                        compute_footprint *= compute_extent;
                        store_footprint *= store_extent;

                        let dense = (producer.is_input && i == 0)
                            || site.produce.and_then(|p| p.vector_dim) == Some(i);
                        if !dense {
                            line_footprint *= extent;
                            store_line_footprint *= store_extent;
                        }
                    }
                    if !producer_has_been_scheduled {
                        // Optimistically assume it gets vectorized along
                        // whichever dimension is largest.
                        line_footprint /= max_extent;
                        store_line_footprint /= max_store_extent;
                    }

                    let mut store_instances_per_consumption = 1;
                    if producer_has_been_scheduled && !producer.is_input {
                        let producer_store_instances =
                            features.entry(producer_key).or_default().num_realizations as i64;
                        if consumer_instances > 0 && producer_store_instances > consumer_instances {
                            // The producer's realization is nested inside
                            // this stage's.
                            store_instances_per_consumption =
                                producer_store_instances / consumer_instances;
                        }
                    }

                    allocation_bytes_loaded += compute_footprint;
                    if store_instances_per_consumption > 1 {
                        bytes_loaded += store_footprint;
                        lines_loaded += store_line_footprint;
                    } else {
                        bytes_loaded += footprint;
                        lines_loaded += line_footprint;
                    }
                }
            }
        }

        let feat = features.entry(key).or_default();
        if at_production {
            feat.allocation_bytes_read_per_realization = allocation_bytes_loaded as f64;
            feat.unique_bytes_read_per_realization = bytes_loaded as f64;
            feat.unique_lines_read_per_realization = lines_loaded as f64;
            if !at_pure_production {
                // Assume an update reads everything produced so far.
                feat.unique_bytes_read_per_realization += feat.bytes_at_production;
                if feat.innermost_bytes_at_production > 0.0 {
                    feat.unique_lines_read_per_realization +=
                        feat.bytes_at_production / feat.innermost_bytes_at_production;
                }
                feat.allocation_bytes_read_per_realization += feat.bytes_at_production;
            }
        }

        if self.innermost {
            if feat.num_productions > 0.0 {
                feat.points_computed_per_production = subinstances as f64 / feat.num_productions;
            }
            // Small strides become a dense load and a shuffle.
            feat.vector_loads_per_vector =
                loads.dense + 2.0 * loads.stride_2 + 3.0 * loads.stride_3 + 4.0 * loads.stride_4;
            feat.scalar_loads_per_vector = loads.broadcasts + feat.vector_size * loads.gathers;
            feat.scalar_loads_per_scalar = loads.total;
            if key.stage > 0 {
                // Updates load their own previous value.
                feat.vector_loads_per_vector += 1.0;
                feat.scalar_loads_per_scalar += 1.0;
            }
            feat.unique_bytes_read_per_vector = bytes_loaded as f64;
            feat.unique_lines_read_per_vector = lines_loaded as f64;
        }

        let (num_vectors, num_scalars, vector_size, innermost_pure_loop_extent) = (
            feat.num_vectors,
            feat.num_scalars,
            feat.vector_size,
            feat.innermost_pure_loop_extent,
        );
        for (&f, &calls) in &self.inlined {
            let inlined = features.entry(StageKey::new(f, 0)).or_default();
            inlined.inlined_calls += (calls * subinstances) as f64;
            inlined.num_vectors += calls as f64 * num_vectors;
            inlined.num_scalars += calls as f64 * num_scalars;
            inlined.native_vector_size = stage.vector_size as f64;
            inlined.vector_size = if inlined.vector_size > 0.0 {
                inlined.vector_size.min(stage.vector_size as f64)
            } else {
                vector_size
            };
            inlined.innermost_pure_loop_extent = if inlined.innermost_pure_loop_extent > 0.0 {
                inlined
                    .innermost_pure_loop_extent
                    .min(innermost_pure_loop_extent)
            } else {
                innermost_pure_loop_extent
            };
            inlined.inner_parallelism = 1.0;
            inlined.outer_parallelism = parallelism as f64;
        }
    }

    /// Account for storage allocated at this loop.
    fn record_working_sets(&self, working_set_here: &mut f64, features: &mut StageMap<ScheduleFeatures>) {
        for &n in &self.store_at {
            *working_set_here += features[&StageKey::new(n, 0)].bytes_at_production;
        }
        for (k, feat) in features.iter_mut() {
            if self.store_at.contains(&k.node) {
                feat.working_set_at_realization = *working_set_here;
            }
        }
        for c in &self.children {
            if c.node != self.node {
                if let Some(k) = c.stage_key() {
                    features.entry(k).or_default().working_set_at_production = *working_set_here;
                }
            }
        }
    }

    fn set_working_set_at_task_feature(&self, working_set: f64, features: &mut StageMap<ScheduleFeatures>) {
        for c in &self.children {
            c.set_working_set_at_task_feature(working_set, features);
            if let Some(k) = c.stage_key() {
                features.entry(k).or_default().working_set_at_task = working_set;
            }
        }
    }

    /// Features of a parallel loop at the root: how much data each task
    /// streams in from outside it.
    fn compute_task_features(
        &self,
        dag: &FunctionDag,
        params: &MachineParams,
        sites: &StageMap<Sites<'_>>,
        key: StageKey,
        features: &mut StageMap<ScheduleFeatures>,
    ) {
        let stage = dag.stage(key);
        let node = &dag.nodes[key.node];

        let (bytes_at_task, innermost_bytes_at_task) = if self.parallel {
            let bounds = self.get_bounds(dag, key.node);
            let mut bytes = node.bytes_per_point as f64;
            let mut innermost_storage_extent = 1;
            for i in 0..node.dimensions {
                let outer = stage
                    .loops
                    .iter()
                    .position(|l| l.pure_dim == Some(i))
                    .map_or(1, |l| self.size[l]);
                let extent = bounds.region_computed[i].extent() / outer;
                bytes *= extent as f64;
                if Some(i) == self.vector_dim {
                    innermost_storage_extent = extent;
                }
            }
            (bytes, (node.bytes_per_point * innermost_storage_extent) as f64)
        } else {
            // The parallel split isn't decided yet. Be optimistic.
            let feat = features.entry(key).or_default();
            let p = params.parallelism as f64;
            let bytes = (feat.bytes_at_realization + p - 1.0) / p;
            (bytes, bytes.min(feat.innermost_bytes_at_realization))
        };

        let mut unique_bytes = 0i64;
        let mut unique_lines = 0i64;
        let mut pending = stage.incoming_edges.clone();
        let mut done = HashSet::new();
        while let Some(ei) = pending.pop() {
            let e = &dag.edges[ei];
            if !done.insert(e.producer) {
                continue;
            }
            let producer = &dag.nodes[e.producer];
            let site = sites
                .get(&StageKey::new(e.producer, 0))
                .copied()
                .unwrap_or_default();
            if site.store.map_or(false, LoopNest::is_root) {
                let b = self.get_bounds(dag, e.producer);
                let mut bytes = producer.bytes_per_point;
                let mut lines = 1i64;
                let mut max_extent = 1i64;
                let vector_dim = if producer.is_input {
                    Some(0)
                } else {
                    site.produce.and_then(|p| p.vector_dim)
                };
                for i in 0..producer.dimensions {
                    let extent = b.region_required[i].extent();
                    max_extent = max_extent.max(extent);
                    bytes *= extent;
                    if Some(i) != vector_dim {
                        lines *= extent;
                    }
                }
                if !producer.is_input && site.produce.is_none() {
                    // Unknown layout, so assume the best case.
                    lines /= max_extent;
                }
                unique_bytes += bytes;
                unique_lines += lines;
            } else if site.produce.is_some() {
                // Computed inside this task or inlined into it.
                for s in &producer.stages {
                    pending.extend(&s.incoming_edges);
                }
            }
        }

        let feat = features.entry(key).or_default();
        feat.bytes_at_task = bytes_at_task;
        feat.innermost_bytes_at_task = innermost_bytes_at_task;
        feat.unique_bytes_read_per_task = unique_bytes as f64;
        feat.unique_lines_read_per_task = unique_lines as f64;
    }

    /// Root-level features of every stage featurized so far.
    fn compute_root_features(
        &self,
        dag: &FunctionDag,
        sites: &StageMap<Sites<'_>>,
        root: &LoopNest,
        working_set_here: f64,
        features: &mut StageMap<ScheduleFeatures>,
    ) {
        // Consumers have lower ids, so their minimums are ready before
        // their producers need them.
        features.sort_keys();
        for idx in 0..features.len() {
            let Some((&key, _)) = features.get_index(idx) else {
                continue;
            };
            let node = &dag.nodes[key.node];
            let stage = dag.stage(key);
            let root_bounds = root.get_bounds(dag, key.node);

            let innermost_bytes_at_root = match sites.get(&key).and_then(|s| s.produce) {
                Some(p) => innermost_bytes(node, &root_bounds.region_computed, p.vector_dim),
                None => 0.0,
            };
            let mut points_computed_minimum = (0..stage.loops.len())
                .map(|i| root_bounds.loops(key.stage, i).extent() as f64)
                .product::<f64>();
            if node.stages.len() == 1 && !node.is_output {
                let if_inlined: f64 = node
                    .outgoing_edges
                    .iter()
                    .map(|&ei| {
                        let e = &dag.edges[ei];
                        features
                            .get(&e.consumer)
                            .map_or(0.0, |f| f.points_computed_minimum)
                            * e.calls as f64
                    })
                    .sum();
                points_computed_minimum = points_computed_minimum.min(if_inlined);
            }

            let Some((_, feat)) = features.get_index_mut(idx) else {
                continue;
            };
            feat.bytes_at_root = region_bytes(node, &root_bounds.region_computed);
            feat.working_set_at_root = working_set_here;
            feat.innermost_bytes_at_root = innermost_bytes_at_root;
            feat.points_computed_minimum = points_computed_minimum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines;

    fn scheduled_output(dag: &FunctionDag, params: &MachineParams) -> LoopNest {
        let root = LoopNest::default();
        let opts = root.compute_in_tiles(dag, 0, None, params, 0, false);
        (*opts[0]).clone()
    }

    #[test]
    fn test_output_at_root() {
        let dag = pipelines::pointwise_chain(1, 1024);
        let params = MachineParams::default();
        let root = scheduled_output(&dag, &params);
        let features = featurize(&dag, &params, &root);
        let out = &features[&StageKey::new(0, 0)];
        assert_eq!(out.num_realizations, 1.0);
        assert_eq!(out.num_productions, 1.0);
        assert_eq!(out.points_computed_total, 1024.0);
        assert_eq!(out.points_computed_minimum, 1024.0);
        assert_eq!(out.bytes_at_production, 4096.0);
        assert_eq!(out.bytes_at_root, 4096.0);
        assert_eq!(out.innermost_bytes_at_root, 4096.0);
        assert_eq!(out.vector_size, 8.0);
        assert_eq!(out.num_vectors, 128.0);
        assert_eq!(out.num_scalars, 0.0);
        assert_eq!(out.working_set_at_root, 4096.0);
        // The unscheduled interior node is not featurized yet.
        assert!(!features.contains_key(&StageKey::new(1, 0)));
    }

    #[test]
    fn test_inlined_calls_are_counted() {
        let dag = pipelines::blur(64, 64);
        let params = MachineParams::default();
        let mut root = scheduled_output(&dag, &params);
        let blur_x = dag.node_by_name("blur_x").unwrap().id;
        root.inline_func(&dag, blur_x);
        let features = featurize(&dag, &params, &root);
        let f = &features[&StageKey::new(blur_x, 0)];
        // Three calls per output point.
        assert_eq!(f.inlined_calls, 3.0 * 64.0 * 64.0);
        assert_eq!(f.inner_parallelism, 1.0);
        assert_eq!(f.native_vector_size, 8.0);
        let out = &features[&StageKey::new(0, 0)];
        assert!(f.points_computed_minimum <= 3.0 * out.points_computed_minimum);
    }

    #[test]
    fn test_features_are_sorted_by_stage() {
        let dag = pipelines::matmul(32);
        let params = MachineParams::default();
        let root = scheduled_output(&dag, &params);
        let features = featurize(&dag, &params, &root);
        let keys = features.keys().copied().collect::<Vec<_>>();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(features.contains_key(&StageKey::new(0, 1)));
        let update = &features[&StageKey::new(0, 1)];
        // The update reads its own previous value.
        assert!(update.scalar_loads_per_scalar >= 1.0);
        assert_eq!(update.points_computed_minimum, 32.0 * 32.0 * 32.0);
    }

    #[test]
    fn test_save_and_load_featurization() {
        let dag = pipelines::blur(32, 32);
        let params = MachineParams::default();
        let root = scheduled_output(&dag, &params);
        let features = featurize(&dag, &params, &root);

        let mut file = tempfile::tempfile().unwrap();
        save_featurization(&dag, &features, &mut file).unwrap();
        use std::io::{Seek, SeekFrom};
        file.seek(SeekFrom::Start(0)).unwrap();
        let records = load_featurization(&mut file).unwrap();
        assert_eq!(records.len(), features.len());
        assert_eq!(records[0].node, "output");
        assert_eq!(records[0].features, features[&StageKey::new(0, 0)]);
    }

    #[test]
    fn test_deepest_common_ancestor() {
        let dag = pipelines::pointwise_chain(1, 64);
        let params = MachineParams::default();
        let root = scheduled_output(&dag, &params);
        let parents = loop_nest_parents(&root);
        let out_loop = &*root.children[0];
        let one_vector = &*out_loop.children[0];
        assert!(std::ptr::eq(
            deepest_common_ancestor(&parents, one_vector, out_loop),
            out_loop
        ));
        assert!(std::ptr::eq(
            deepest_common_ancestor(&parents, one_vector, &root),
            &root
        ));
    }
}
