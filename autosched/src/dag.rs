use crate::bounds::{BoundContents, Span};

use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifies one stage of one node: `(node id, stage index)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Deserialize, Serialize)]
pub struct StageKey {
    pub node: usize,
    pub stage: usize,
}

impl StageKey {
    pub fn new(node: usize, stage: usize) -> Self {
        StageKey { node, stage }
    }
}

/// Per-stage data, in insertion order.
pub type StageMap<T> = IndexMap<StageKey, T>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum DagError {
    #[error("The pipeline has no functions")]
    Empty,
    #[error("Function {0} is defined more than once")]
    DuplicateFunc(String),
    #[error("Function {consumer} reads undefined function {producer}")]
    UnknownProducer { consumer: String, producer: String },
    #[error("Stage {stage} of {consumer} reads {producer} more than once")]
    DuplicateAccess {
        consumer: String,
        stage: usize,
        producer: String,
    },
    #[error("Access from {consumer} to {producer} has {got} indices; expected {expected}")]
    FootprintArity {
        consumer: String,
        producer: String,
        expected: usize,
        got: usize,
    },
    #[error("Access from {consumer} refers to a loop variable that stage {stage} does not have")]
    LoopOutOfRange { consumer: String, stage: usize },
    #[error("Output {0} has no estimate for every dimension")]
    MissingEstimate(String),
    #[error("Output {output} is read by {consumer}; outputs that feed other functions are unsupported")]
    ConsumedOutput { output: String, consumer: String },
    #[error("Input {0} cannot read other functions or have update stages")]
    InputWithDefinition(String),
    #[error("Function {0} is neither an output nor read by any other function")]
    Unconsumed(String),
    #[error("Cyclic dependency among {0:?}")]
    Cycle(Vec<String>),
}

/// One side of the footprint of an [Edge] along one producer dimension.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BoundExpr {
    Constant(i64),
    /// `coeff * (consumer_loop[loop_index].min or .max) + constant`
    Affine {
        loop_index: usize,
        uses_max: bool,
        coeff: i64,
        constant: i64,
    },
}

impl BoundExpr {
    fn eval(&self, consumer_loop: &[Span], constant_extent: &mut bool) -> i64 {
        match *self {
            BoundExpr::Constant(c) => c,
            BoundExpr::Affine {
                loop_index,
                uses_max,
                coeff,
                constant,
            } => {
                let src = &consumer_loop[loop_index];
                *constant_extent &= src.constant_extent();
                let v = if uses_max { src.max() } else { src.min() };
                v * coeff + constant
            }
        }
    }
}

/// Strides of a load with respect to each loop of the consuming stage.
///
/// Entry `(i, l)` is the change in producer coordinate `i` per iteration of
/// consumer loop `l`, or `None` when the access is data-dependent.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LoadJacobian {
    producer_dims: usize,
    consumer_loops: usize,
    coeffs: Vec<Option<i64>>,
    count: i64,
}

impl LoadJacobian {
    pub fn new(producer_dims: usize, consumer_loops: usize, count: i64) -> Self {
        LoadJacobian {
            producer_dims,
            consumer_loops,
            coeffs: vec![Some(0); producer_dims * consumer_loops],
            count,
        }
    }

    pub fn get(&self, producer_dim: usize, consumer_loop: usize) -> Option<i64> {
        self.coeffs[producer_dim * self.consumer_loops + consumer_loop]
    }

    fn set(&mut self, producer_dim: usize, consumer_loop: usize, v: Option<i64>) {
        self.coeffs[producer_dim * self.consumer_loops + consumer_loop] = v;
    }

    pub fn count(&self) -> i64 {
        self.count
    }

    pub fn producer_dims(&self) -> usize {
        self.producer_dims
    }

    pub fn consumer_loops(&self) -> usize {
        self.consumer_loops
    }

    /// Compose with the Jacobian of an inlined consumer: `self` maps the
    /// inlined node's coordinates to this producer's, `inner` maps the
    /// outer stage's loops to the inlined node's coordinates.
    pub fn compose(&self, inner: &LoadJacobian) -> LoadJacobian {
        debug_assert_eq!(self.consumer_loops, inner.producer_dims);
        let mut result = LoadJacobian::new(
            self.producer_dims,
            inner.consumer_loops,
            self.count * inner.count,
        );
        for i in 0..self.producer_dims {
            for l in 0..inner.consumer_loops {
                let mut acc = Some(0i64);
                for k in 0..self.consumer_loops {
                    let term = match (self.get(i, k), inner.get(k, l)) {
                        (Some(0), _) | (_, Some(0)) => Some(0),
                        (Some(a), Some(b)) => Some(a * b),
                        _ => None,
                    };
                    acc = acc.zip(term).map(|(a, t)| a + t);
                }
                result.set(i, l, acc);
            }
        }
        result
    }
}

#[derive(Clone, Debug)]
pub struct Edge {
    pub producer: usize,
    pub consumer: StageKey,
    pub calls: i64,
    /// `(min, max)` of the region required, per producer dimension.
    pub bounds: Vec<(BoundExpr, BoundExpr)>,
    pub load_jacobians: Vec<LoadJacobian>,
}

impl Edge {
    /// Expand the producer's required region to cover what the consumer
    /// reads over the given concrete consumer loop bounds.
    pub fn expand_footprint(&self, consumer_loop: &[Span], producer_required: &mut [Span]) {
        for (i, (lo, hi)) in self.bounds.iter().enumerate() {
            let mut constant_extent = true;
            let a = lo.eval(consumer_loop, &mut constant_extent);
            let b = hi.eval(consumer_loop, &mut constant_extent);
            producer_required[i].union_with(&Span::new(a, b, constant_extent));
        }
    }
}

#[derive(Clone, Debug)]
pub struct Loop {
    pub var: String,
    /// The node dimension this loop iterates over, or `None` for a
    /// reduction variable.
    pub pure_dim: Option<usize>,
    /// Bounds of a reduction variable.
    rvar_bounds: (i64, i64),
}

impl Loop {
    pub fn is_pure(&self) -> bool {
        self.pure_dim.is_some()
    }

    pub fn is_rvar(&self) -> bool {
        self.pure_dim.is_none()
    }
}

#[derive(Clone, Debug)]
pub struct Stage {
    pub key: StageKey,
    pub name: String,
    /// Loops, innermost first.
    pub loops: Vec<Loop>,
    pub vector_size: i64,
    pub incoming_edges: Vec<usize>,
    /// Arithmetic operations per point computed.
    pub ops_per_point: f64,
    dependencies: Vec<bool>,
}

impl Stage {
    pub fn index(&self) -> usize {
        self.key.stage
    }

    /// Whether this stage transitively reads node `n`.
    pub fn downstream_of(&self, n: usize) -> bool {
        self.dependencies[n]
    }
}

/// How the region computed of one dimension follows from the region required.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RegionComputed {
    EqualsRequired,
    /// Histograms and scans always compute at least a fixed range.
    UnionWithConstant { min: i64, max: i64 },
}

#[derive(Clone, Debug)]
pub struct Node {
    pub id: usize,
    pub name: String,
    pub dimensions: usize,
    pub bytes_per_point: i64,
    pub vector_size: i64,
    pub stages: Vec<Stage>,
    pub outgoing_edges: Vec<usize>,
    pub region_computed: Vec<RegionComputed>,
    /// Only set on outputs.
    pub estimated_region_required: Vec<Span>,
    /// Stride constraints of the output buffer, where known.
    pub output_strides: Vec<Option<i64>>,
    pub is_input: bool,
    pub is_output: bool,
    pub is_pointwise: bool,
    pub is_wrapper: bool,
    pub is_boundary_condition: bool,
}

impl Node {
    pub fn make_bound(&self) -> BoundContents {
        BoundContents {
            region_required: vec![Span::empty(); self.dimensions],
            region_computed: vec![Span::empty(); self.dimensions],
            loops: self
                .stages
                .iter()
                .map(|s| vec![Span::empty(); s.loops.len()])
                .collect(),
        }
    }

    pub fn required_to_computed(&self, required: &[Span]) -> Vec<Span> {
        required
            .iter()
            .zip(&self.region_computed)
            .map(|(r, rule)| match *rule {
                RegionComputed::EqualsRequired => *r,
                RegionComputed::UnionWithConstant { min, max } => {
                    Span::new(r.min().min(min), r.max().max(max), false)
                }
            })
            .collect()
    }

    pub fn loop_nest_for_region(&self, stage: usize, computed: &[Span]) -> Vec<Span> {
        self.stages[stage]
            .loops
            .iter()
            .map(|l| match l.pure_dim {
                Some(d) => computed[d],
                None => Span::new(l.rvar_bounds.0, l.rvar_bounds.1, true),
            })
            .collect()
    }
}

#[derive(Clone, Debug)]
pub struct FunctionDag {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl FunctionDag {
    pub fn stage(&self, key: StageKey) -> &Stage {
        &self.nodes[key.node].stages[key.stage]
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn num_stages(&self) -> usize {
        self.nodes.iter().map(|n| n.stages.len()).sum()
    }
}

impl fmt::Display for FunctionDag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for n in &self.nodes {
            writeln!(f, "Node {}: {}", n.id, n.name)?;
            writeln!(
                f,
                "  pointwise: {} boundary condition: {} wrapper: {} input: {} output: {}",
                n.is_pointwise as u8,
                n.is_boundary_condition as u8,
                n.is_wrapper as u8,
                n.is_input as u8,
                n.is_output as u8
            )?;
            for s in &n.stages {
                writeln!(
                    f,
                    "  Stage {}: loops [{}]",
                    s.index(),
                    s.loops.iter().map(|l| l.var.as_str()).join(", ")
                )?;
            }
        }
        for e in &self.edges {
            writeln!(
                f,
                "Edge: {} -> {}.{} ({} calls)",
                self.nodes[e.producer].name,
                self.nodes[e.consumer.node].name,
                e.consumer.stage,
                e.calls
            )?;
        }
        Ok(())
    }
}

/// A loop variable of the stage making an access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Var {
    Pure(usize),
    Reduction(usize),
}

/// The index expression used along one producer dimension.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Index {
    /// `coeff * var + o` for every `o` in `offset_min..=offset_max`.
    Var {
        var: Var,
        coeff: i64,
        offset_min: i64,
        offset_max: i64,
    },
    Const(i64),
    /// A data-dependent index known only to lie within a range.
    Within(i64, i64),
}

impl Index {
    pub fn var(var: Var) -> Self {
        Index::Var {
            var,
            coeff: 1,
            offset_min: 0,
            offset_max: 0,
        }
    }

    pub fn stencil(var: Var, offset_min: i64, offset_max: i64) -> Self {
        Index::Var {
            var,
            coeff: 1,
            offset_min,
            offset_max,
        }
    }

    pub fn scaled(var: Var, coeff: i64) -> Self {
        Index::Var {
            var,
            coeff,
            offset_min: 0,
            offset_max: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Access {
    producer: String,
    indices: Vec<Index>,
    calls: i64,
}

impl Access {
    pub fn new(producer: &str, indices: Vec<Index>) -> Self {
        Access {
            producer: producer.to_owned(),
            indices,
            calls: 1,
        }
    }

    /// An access to `producer` at exactly the consumer's own coordinates.
    pub fn pointwise(producer: &str, dimensions: usize) -> Self {
        Access::new(
            producer,
            (0..dimensions).map(|d| Index::var(Var::Pure(d))).collect(),
        )
    }

    pub fn calls(mut self, calls: i64) -> Self {
        self.calls = calls;
        self
    }

    fn is_identity(&self, dimensions: usize) -> bool {
        self.indices.len() == dimensions
            && self
                .indices
                .iter()
                .enumerate()
                .all(|(d, idx)| *idx == Index::var(Var::Pure(d)))
    }
}

#[derive(Clone, Debug)]
pub struct StageDef {
    rvars: Vec<(String, i64, i64)>,
    accesses: Vec<Access>,
    ops_per_point: Option<f64>,
    pure_loops: bool,
}

impl Default for StageDef {
    fn default() -> Self {
        StageDef {
            rvars: vec![],
            accesses: vec![],
            ops_per_point: None,
            pure_loops: true,
        }
    }
}

impl StageDef {
    pub fn new() -> Self {
        Self::default()
    }

    /// An update stage that loops only over its reduction variables, such
    /// as a histogram scattering into data-dependent bins.
    pub fn rvars_only(mut self) -> Self {
        self.pure_loops = false;
        self
    }

    /// Add a reduction variable over `min..=max`. Reduction variables are
    /// inside the pure loops, first-added innermost.
    pub fn rvar(mut self, name: &str, min: i64, max: i64) -> Self {
        self.rvars.push((name.to_owned(), min, max));
        self
    }

    pub fn reads(mut self, access: Access) -> Self {
        self.accesses.push(access);
        self
    }

    pub fn ops(mut self, ops_per_point: f64) -> Self {
        self.ops_per_point = Some(ops_per_point);
        self
    }
}

#[derive(Clone, Debug)]
enum FuncKind {
    Input,
    Internal,
    Output { estimates: Vec<(i64, i64)> },
}

/// A declarative description of one function in a pipeline.
#[derive(Clone, Debug)]
pub struct FuncDef {
    name: String,
    dimensions: usize,
    bytes_per_point: i64,
    vector_size: i64,
    kind: FuncKind,
    stages: Vec<StageDef>,
    region_computed: Vec<RegionComputed>,
    output_strides: Option<Vec<Option<i64>>>,
    boundary_condition: bool,
}

impl FuncDef {
    fn with_kind(name: &str, dimensions: usize, kind: FuncKind) -> Self {
        FuncDef {
            name: name.to_owned(),
            dimensions,
            bytes_per_point: 4,
            vector_size: 8,
            kind,
            stages: vec![],
            region_computed: vec![RegionComputed::EqualsRequired; dimensions],
            output_strides: None,
            boundary_condition: false,
        }
    }

    pub fn input(name: &str, dimensions: usize) -> Self {
        FuncDef::with_kind(name, dimensions, FuncKind::Input)
    }

    pub fn func(name: &str, dimensions: usize) -> Self {
        FuncDef::with_kind(name, dimensions, FuncKind::Internal)
    }

    /// An output with the given `(min, extent)` estimate per dimension.
    pub fn output(name: &str, estimates: &[(i64, i64)]) -> Self {
        FuncDef::with_kind(
            name,
            estimates.len(),
            FuncKind::Output {
                estimates: estimates.to_vec(),
            },
        )
    }

    pub fn stage(mut self, stage: StageDef) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn bytes_per_point(mut self, bytes: i64) -> Self {
        self.bytes_per_point = bytes;
        self
    }

    pub fn vector_size(mut self, lanes: i64) -> Self {
        self.vector_size = lanes;
        self
    }

    pub fn computed_union_with(mut self, dim: usize, min: i64, max: i64) -> Self {
        self.region_computed[dim] = RegionComputed::UnionWithConstant { min, max };
        self
    }

    /// Override the output buffer's stride constraints. By default only
    /// dimension 0 is known to be dense.
    pub fn output_strides(mut self, strides: Vec<Option<i64>>) -> Self {
        self.output_strides = Some(strides);
        self
    }

    /// Mark this function as a clamping boundary condition on its input.
    pub fn boundary_condition(mut self) -> Self {
        self.boundary_condition = true;
        self
    }
}

#[derive(Default)]
pub struct DagBuilder {
    funcs: IndexMap<String, FuncDef>,
    errors: Vec<DagError>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, func: FuncDef) -> Self {
        if self.funcs.contains_key(&func.name) {
            self.errors.push(DagError::DuplicateFunc(func.name.clone()));
        } else {
            self.funcs.insert(func.name.clone(), func);
        }
        self
    }

    pub fn build(mut self) -> Result<FunctionDag, DagError> {
        if let Some(e) = self.errors.drain(..).next() {
            return Err(e);
        }
        if self.funcs.is_empty() {
            return Err(DagError::Empty);
        }
        for f in self.funcs.values_mut() {
            if f.stages.is_empty() {
                f.stages.push(StageDef::new());
            }
        }
        self.validate()?;
        let order = self.order()?;
        Ok(self.assemble(&order))
    }

    fn validate(&self) -> Result<(), DagError> {
        for f in self.funcs.values() {
            if let FuncKind::Output { estimates } = &f.kind {
                if estimates.len() != f.dimensions {
                    return Err(DagError::MissingEstimate(f.name.clone()));
                }
            }
            if matches!(f.kind, FuncKind::Input)
                && (f.stages.len() > 1 || f.stages.iter().any(|s| !s.accesses.is_empty()))
            {
                return Err(DagError::InputWithDefinition(f.name.clone()));
            }
            for (si, s) in f.stages.iter().enumerate() {
                let mut seen = HashSet::new();
                for a in &s.accesses {
                    let Some(producer) = self.funcs.get(&a.producer) else {
                        return Err(DagError::UnknownProducer {
                            consumer: f.name.clone(),
                            producer: a.producer.clone(),
                        });
                    };
                    if !seen.insert(a.producer.as_str()) {
                        return Err(DagError::DuplicateAccess {
                            consumer: f.name.clone(),
                            stage: si,
                            producer: a.producer.clone(),
                        });
                    }
                    if a.producer != f.name && matches!(producer.kind, FuncKind::Output { .. }) {
                        return Err(DagError::ConsumedOutput {
                            output: a.producer.clone(),
                            consumer: f.name.clone(),
                        });
                    }
                    if a.indices.len() != producer.dimensions {
                        return Err(DagError::FootprintArity {
                            consumer: f.name.clone(),
                            producer: a.producer.clone(),
                            expected: producer.dimensions,
                            got: a.indices.len(),
                        });
                    }
                    let in_range = a.indices.iter().all(|idx| match idx {
                        Index::Var {
                            var: Var::Pure(d), ..
                        } => s.pure_loops && *d < f.dimensions,
                        Index::Var {
                            var: Var::Reduction(r),
                            ..
                        } => *r < s.rvars.len(),
                        _ => true,
                    });
                    if !in_range {
                        return Err(DagError::LoopOutOfRange {
                            consumer: f.name.clone(),
                            stage: si,
                        });
                    }
                }
            }
        }

        let read: HashSet<&str> = self
            .funcs
            .values()
            .flat_map(|f| {
                f.stages
                    .iter()
                    .flat_map(|s| &s.accesses)
                    .filter(move |a| a.producer != f.name)
                    .map(|a| a.producer.as_str())
            })
            .collect();
        if let Some(f) = self
            .funcs
            .values()
            .find(|f| matches!(f.kind, FuncKind::Internal) && !read.contains(f.name.as_str()))
        {
            return Err(DagError::Unconsumed(f.name.clone()));
        }
        Ok(())
    }

    /// Order functions consumers-first. Among ready functions, the most
    /// recently defined goes first, so a producers-first definition order
    /// is reversed exactly.
    fn order(&self) -> Result<Vec<usize>, DagError> {
        let n = self.funcs.len();
        let mut consumers: Vec<HashSet<usize>> = vec![HashSet::new(); n];
        for (ci, f) in self.funcs.values().enumerate() {
            for a in f.stages.iter().flat_map(|s| &s.accesses) {
                let pi = self.funcs.get_index_of(&a.producer).unwrap_or(ci);
                if pi != ci {
                    consumers[pi].insert(ci);
                }
            }
        }
        let mut placed = vec![false; n];
        let mut order = Vec::with_capacity(n);
        while order.len() < n {
            let ready = (0..n)
                .rev()
                .find(|&i| !placed[i] && consumers[i].iter().all(|&c| placed[c]));
            match ready {
                Some(i) => {
                    placed[i] = true;
                    order.push(i);
                }
                None => {
                    let stuck = (0..n)
                        .filter(|&i| !placed[i])
                        .map(|i| self.funcs[i].name.clone())
                        .collect();
                    return Err(DagError::Cycle(stuck));
                }
            }
        }
        Ok(order)
    }

    fn assemble(&self, order: &[usize]) -> FunctionDag {
        let mut id_of = vec![0; order.len()];
        for (id, &def_idx) in order.iter().enumerate() {
            id_of[def_idx] = id;
        }

        let mut nodes = Vec::with_capacity(order.len());
        let mut edges = vec![];
        for (id, &def_idx) in order.iter().enumerate() {
            let f = &self.funcs[def_idx];
            let mut stages = Vec::with_capacity(f.stages.len());
            for (si, sdef) in f.stages.iter().enumerate() {
                let key = StageKey::new(id, si);
                let mut loops: Vec<Loop> = sdef
                    .rvars
                    .iter()
                    .map(|(name, min, max)| Loop {
                        var: name.clone(),
                        pure_dim: None,
                        rvar_bounds: (*min, *max),
                    })
                    .collect();
                if sdef.pure_loops {
                    loops.extend((0..f.dimensions).map(|d| Loop {
                        var: format!("v{d}"),
                        pure_dim: Some(d),
                        rvar_bounds: (0, 0),
                    }));
                }
                let loop_index = |v: Var| match v {
                    Var::Pure(d) => sdef.rvars.len() + d,
                    Var::Reduction(r) => r,
                };

                let mut incoming_edges = vec![];
                for a in &sdef.accesses {
                    if a.producer == f.name {
                        // Self-references in update stages are not edges.
                        continue;
                    }
                    let producer_def = self.funcs.get_index_of(&a.producer).unwrap_or(def_idx);
                    let mut jacobian = LoadJacobian::new(a.indices.len(), loops.len(), a.calls);
                    let bounds = a
                        .indices
                        .iter()
                        .enumerate()
                        .map(|(pd, idx)| match *idx {
                            Index::Var {
                                var,
                                coeff,
                                offset_min,
                                offset_max,
                            } => {
                                let loop_index = loop_index(var);
                                jacobian.set(pd, loop_index, Some(coeff));
                                let affine = |uses_max, constant| BoundExpr::Affine {
                                    loop_index,
                                    uses_max,
                                    coeff,
                                    constant,
                                };
                                if coeff >= 0 {
                                    (affine(false, offset_min), affine(true, offset_max))
                                } else {
                                    (affine(true, offset_min), affine(false, offset_max))
                                }
                            }
                            Index::Const(c) => (BoundExpr::Constant(c), BoundExpr::Constant(c)),
                            Index::Within(lo, hi) => {
                                for l in 0..loops.len() {
                                    jacobian.set(pd, l, None);
                                }
                                (BoundExpr::Constant(lo), BoundExpr::Constant(hi))
                            }
                        })
                        .collect();
                    incoming_edges.push(edges.len());
                    edges.push(Edge {
                        producer: id_of[producer_def],
                        consumer: key,
                        calls: a.calls,
                        bounds,
                        load_jacobians: vec![jacobian],
                    });
                }

                let default_ops = 1.0 + sdef.accesses.iter().map(|a| a.calls).sum::<i64>() as f64;
                stages.push(Stage {
                    key,
                    name: if si == 0 {
                        f.name.clone()
                    } else {
                        format!("{}.update({})", f.name, si - 1)
                    },
                    loops,
                    vector_size: f.vector_size,
                    incoming_edges,
                    ops_per_point: sdef.ops_per_point.unwrap_or(default_ops),
                    dependencies: vec![],
                });
            }

            let is_input = matches!(f.kind, FuncKind::Input);
            let is_output = matches!(f.kind, FuncKind::Output { .. });
            let is_pointwise = f.stages.len() == 1
                && f.stages[0].rvars.is_empty()
                && f.stages[0]
                    .accesses
                    .iter()
                    .all(|a| a.is_identity(f.dimensions));
            let is_wrapper = is_pointwise
                && !is_input
                && f.stages[0].accesses.len() == 1
                && f.stages[0].accesses[0].calls == 1;
            let (estimated_region_required, output_strides) = match &f.kind {
                FuncKind::Output { estimates } => (
                    estimates
                        .iter()
                        .map(|&(min, extent)| Span::new(min, min + extent - 1, true))
                        .collect(),
                    f.output_strides.clone().unwrap_or_else(|| {
                        (0..f.dimensions)
                            .map(|d| if d == 0 { Some(1) } else { None })
                            .collect()
                    }),
                ),
                _ => (vec![], vec![]),
            };
            nodes.push(Node {
                id,
                name: f.name.clone(),
                dimensions: f.dimensions,
                bytes_per_point: f.bytes_per_point,
                vector_size: f.vector_size,
                stages,
                outgoing_edges: vec![],
                region_computed: f.region_computed.clone(),
                estimated_region_required,
                output_strides,
                is_input,
                is_output,
                is_pointwise,
                is_wrapper,
                is_boundary_condition: f.boundary_condition && is_pointwise,
            });
        }

        for (ei, e) in edges.iter().enumerate() {
            nodes[e.producer].outgoing_edges.push(ei);
        }

        // Producers have higher ids than their consumers, so walking ids
        // downwards sees every producer's dependencies first.
        let num_nodes = nodes.len();
        for id in (0..num_nodes).rev() {
            for si in 0..nodes[id].stages.len() {
                let mut deps = vec![false; num_nodes];
                for &ei in &nodes[id].stages[si].incoming_edges {
                    let p = edges[ei].producer;
                    deps[p] = true;
                    for ps in &nodes[p].stages {
                        for (d, &flag) in deps.iter_mut().zip(&ps.dependencies) {
                            *d |= flag;
                        }
                    }
                }
                nodes[id].stages[si].dependencies = deps;
            }
        }

        FunctionDag { nodes, edges }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> FunctionDag {
        DagBuilder::new()
            .add(FuncDef::input("in", 1))
            .add(FuncDef::func("f", 1).stage(StageDef::new().reads(Access::pointwise("in", 1))))
            .add(
                FuncDef::output("out", &[(0, 100)])
                    .stage(StageDef::new().reads(Access::pointwise("f", 1))),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_nodes_are_ordered_consumers_first() {
        let dag = chain();
        let names = dag.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["out", "f", "in"]);
        for e in &dag.edges {
            assert!(e.producer > e.consumer.node);
        }
    }

    #[test]
    fn test_flags() {
        let dag = chain();
        let out = dag.node_by_name("out").unwrap();
        let f = dag.node_by_name("f").unwrap();
        let input = dag.node_by_name("in").unwrap();
        assert!(out.is_output && out.is_pointwise && !out.is_input);
        assert!(f.is_pointwise && f.is_wrapper);
        assert!(input.is_input && input.is_pointwise && !input.is_wrapper);
        assert_eq!(out.output_strides, vec![Some(1)]);
    }

    #[test]
    fn test_downstream_of_is_transitive() {
        let dag = chain();
        let out = dag.node_by_name("out").unwrap();
        let f = dag.node_by_name("f").unwrap();
        let input = dag.node_by_name("in").unwrap();
        assert!(out.stages[0].downstream_of(f.id));
        assert!(out.stages[0].downstream_of(input.id));
        assert!(!f.stages[0].downstream_of(out.id));
    }

    #[test]
    fn test_stencil_footprint_expands() {
        let dag = DagBuilder::new()
            .add(FuncDef::input("in", 1))
            .add(FuncDef::output("out", &[(0, 10)]).stage(StageDef::new().reads(
                Access::new("in", vec![Index::stencil(Var::Pure(0), -1, 1)]).calls(3),
            )))
            .build()
            .unwrap();
        let e = &dag.edges[0];
        let mut req = vec![Span::empty()];
        e.expand_footprint(&[Span::new(0, 9, true)], &mut req);
        assert_eq!(req[0], Span::new(-1, 10, true));
        assert!(!dag.nodes[0].is_pointwise);
    }

    #[test]
    fn test_strided_footprint_scales() {
        let dag = DagBuilder::new()
            .add(FuncDef::input("in", 1))
            .add(FuncDef::output("out", &[(0, 10)]).stage(
                StageDef::new().reads(Access::new("in", vec![Index::scaled(Var::Pure(0), 2)])),
            ))
            .build()
            .unwrap();
        let e = &dag.edges[0];
        let mut req = vec![Span::empty()];
        e.expand_footprint(&[Span::new(0, 9, true)], &mut req);
        assert_eq!(req[0], Span::new(0, 18, true));
        assert_eq!(e.load_jacobians[0].get(0, 0), Some(2));
        assert!(!dag.nodes[0].is_pointwise);
    }

    #[test]
    fn test_reduction_loops_are_innermost() {
        let dag = DagBuilder::new()
            .add(FuncDef::input("a", 2))
            .add(
                FuncDef::output("sum", &[(0, 16)])
                    .stage(StageDef::new())
                    .stage(StageDef::new().rvar("r", 0, 31).reads(Access::new(
                        "a",
                        vec![Index::var(Var::Reduction(0)), Index::var(Var::Pure(0))],
                    ))),
            )
            .build()
            .unwrap();
        let update = &dag.nodes[0].stages[1];
        assert!(update.loops[0].is_rvar());
        assert_eq!(update.loops[1].pure_dim, Some(0));
        let loops = dag.nodes[0].loop_nest_for_region(1, &[Span::new(0, 15, true)]);
        assert_eq!(loops[0], Span::new(0, 31, true));
        assert!(!dag.nodes[0].is_pointwise);
    }

    #[test]
    fn test_build_errors() {
        let unknown = DagBuilder::new()
            .add(FuncDef::output("out", &[(0, 4)]).stage(StageDef::new().reads(Access::pointwise("nope", 1))))
            .build();
        assert!(matches!(unknown, Err(DagError::UnknownProducer { .. })));

        let dup = DagBuilder::new()
            .add(FuncDef::input("a", 1))
            .add(FuncDef::input("a", 1))
            .build();
        assert_eq!(dup.unwrap_err(), DagError::DuplicateFunc("a".to_owned()));

        let cyclic = DagBuilder::new()
            .add(FuncDef::func("p", 1).stage(StageDef::new().reads(Access::pointwise("q", 1))))
            .add(FuncDef::func("q", 1).stage(StageDef::new().reads(Access::pointwise("p", 1))))
            .build();
        assert!(matches!(cyclic, Err(DagError::Cycle(_))));

        let arity = DagBuilder::new()
            .add(FuncDef::input("in", 2))
            .add(FuncDef::output("out", &[(0, 4)]).stage(StageDef::new().reads(Access::pointwise("in", 1))))
            .build();
        assert!(matches!(arity, Err(DagError::FootprintArity { .. })));

        let dead = DagBuilder::new()
            .add(FuncDef::input("in", 1))
            .add(FuncDef::func("dead", 1).stage(StageDef::new().reads(Access::pointwise("in", 1))))
            .add(FuncDef::output("out", &[(0, 4)]).stage(StageDef::new().reads(Access::pointwise("in", 1))))
            .build();
        assert_eq!(dead.unwrap_err(), DagError::Unconsumed("dead".to_owned()));

        assert_eq!(DagBuilder::new().build().unwrap_err(), DagError::Empty);
    }

    #[test]
    fn test_jacobian_compose() {
        let mut outer = LoadJacobian::new(1, 2, 2);
        outer.set(0, 1, Some(1));
        let mut inlined = LoadJacobian::new(1, 1, 3);
        inlined.set(0, 0, Some(2));
        let j = inlined.compose(&outer);
        assert_eq!(j.count(), 6);
        assert_eq!(j.get(0, 0), Some(0));
        assert_eq!(j.get(0, 1), Some(2));
    }
}
