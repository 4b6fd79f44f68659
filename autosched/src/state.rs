use crate::cost_model::{CostHandle, CostModel};
use crate::dag::{FunctionDag, Loop};
use crate::features::featurize;
use crate::loop_nest::LoopNest;
use crate::params::{MachineParams, Phase, TilingRegime};
use crate::pprint::pprint_string;
use crate::pruning::{self, prune_reason};
use crate::tiling::{legacy_parallel_tiling, parallel_tiling_options, MAX_IDLE_CORE_WASTAGE};

use log::{debug, log_enabled, warn, Level};
use rand::seq::SliceRandom;
use rand::Rng;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

/// The kind of decision an [Action] makes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum::Display)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum ScheduleAction {
    /// Skip an input, which needs no scheduling.
    Input,
    Inline,
    /// Store and compute a node somewhere, vectorized over some dimension.
    Vectorize,
    /// Leave a node serial.
    Parallelize,
    /// Split a node's root-level loops into parallel tasks.
    Tile,
    /// Leave a node serial because no parallel tiling was good enough.
    ComputeRoot,
}

/// One candidate decision: the schedule that results from it.
#[derive(Clone, Debug)]
pub struct Action {
    pub kind: ScheduleAction,
    pub root: Rc<LoopNest>,
}

impl Action {
    pub fn new(kind: ScheduleAction, root: Rc<LoopNest>) -> Self {
        Action { kind, root }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)
    }
}

/// A partial schedule in the search, along with the best cost seen below
/// it.
///
/// Nodes are decided in the order of their ids, each twice: once to place
/// its realization and once to parallelize it. [TilingRegime] decides how
/// the two phases interleave.
#[derive(Clone)]
pub struct State {
    dag: Rc<FunctionDag>,
    params: Rc<MachineParams>,
    model: Rc<RefCell<dyn CostModel>>,
    root: Rc<LoopNest>,
    n_decisions_made: u32,
    memory_limit: Option<u64>,
    /// Set when produced by inlining, which can't introduce the excesses
    /// pruning looks for.
    prepruned: bool,
    minimum_cost: f64,
    maximum_depth: u32,
}

impl State {
    /// The initial state, with nothing scheduled.
    pub fn new(
        dag: Rc<FunctionDag>,
        params: Rc<MachineParams>,
        model: Rc<RefCell<dyn CostModel>>,
        memory_limit: Option<u64>,
    ) -> Self {
        State {
            dag,
            params,
            model,
            root: Rc::new(LoopNest::default()),
            n_decisions_made: 0,
            memory_limit,
            prepruned: false,
            minimum_cost: f64::INFINITY,
            maximum_depth: 0,
        }
    }

    pub fn dag(&self) -> &FunctionDag {
        &self.dag
    }

    pub fn params(&self) -> &MachineParams {
        &self.params
    }

    pub fn root(&self) -> &Rc<LoopNest> {
        &self.root
    }

    pub fn n_decisions_made(&self) -> u32 {
        self.n_decisions_made
    }

    pub fn is_prepruned(&self) -> bool {
        self.prepruned
    }

    pub fn minimum_cost(&self) -> f64 {
        self.minimum_cost
    }

    pub fn is_terminal(&self) -> bool {
        self.n_decisions_made as usize == 2 * self.dag.nodes.len()
    }

    /// Enumerate every legal next decision.
    ///
    /// Empty if the state is terminal. Otherwise, empty only at a dead end,
    /// which is logged.
    ///
    /// # Panics
    /// Panics if the node to decide has a consumer not yet scheduled, which
    /// means the DAG's node order is broken.
    pub fn generate_actions(&self) -> Vec<Action> {
        if self.is_terminal() {
            return vec![];
        }

        let dag = &*self.dag;
        let (f, phase) = self
            .params
            .tiling_regime
            .decision_target(self.n_decisions_made, dag.nodes.len());
        let node = &dag.nodes[f];

        if node.is_input {
            return vec![Action::new(ScheduleAction::Input, Rc::clone(&self.root))];
        }

        for &e in &node.outgoing_edges {
            let consumer = dag.edges[e].consumer.node;
            assert!(
                self.root.computes(consumer),
                "Partially scheduled code doesn't compute {}, which is one of the consumers of {}",
                dag.nodes[consumer].name,
                node.name
            );
        }
        if !node.outgoing_edges.is_empty() && !self.root.calls(dag, f) {
            self.dump();
            panic!("Pipeline so far doesn't use next func: {}", node.name);
        }

        let actions = match phase {
            Phase::Realize => self.generate_realizations(f),
            Phase::Parallelize => self.generate_parallel_tilings(f),
        };
        if actions.is_empty() {
            warn!(
                "Found no legal way to schedule {} in the following state:\n{}",
                node.name,
                pprint_string(dag, &self.root)
            );
        }
        actions
    }

    fn generate_realizations(&self, f: usize) -> Vec<Action> {
        let dag = &*self.dag;
        let node = &dag.nodes[f];
        let mut actions = vec![];

        if node.stages.len() == 1 && !node.is_output {
            let mut new_root = (*self.root).clone();
            new_root.inline_func(dag, f);
            if !self.rejects(&new_root) {
                actions.push(Action::new(ScheduleAction::Inline, Rc::new(new_root)));
            }
        }

        // Long chains of pointwise funcs are inlined without branching.
        let must_inline = node.is_pointwise
            && !actions.is_empty()
            && node.outgoing_edges.len() == 1
            && node.stages[0]
                .incoming_edges
                .iter()
                .all(|&e| dag.nodes[dag.edges[e].producer].is_pointwise)
            && node.outgoing_edges.iter().all(|&e| {
                let consumer = &dag.nodes[dag.edges[e].consumer.node];
                consumer.is_pointwise || consumer.is_boundary_condition
            });
        if must_inline {
            return actions;
        }

        let mut vector_dims = vec![];
        if !node.is_input && !node.is_output {
            let bounds = self.root.get_bounds(dag, f);
            vector_dims.extend(
                (0..node.dimensions)
                    .filter(|&v| bounds.region_computed[v].extent() >= node.vector_size),
            );
        }
        // We don't control the storage of outputs, so vectorize over
        // whichever dimensions are dense. There may be several if some
        // have extent one.
        if node.is_output {
            vector_dims.extend(
                node.output_strides
                    .iter()
                    .enumerate()
                    .filter(|(_, stride)| **stride == Some(1))
                    .map(|(d, _)| d),
            );
        }
        if vector_dims.is_empty() {
            // A full reduction to a scalar still needs some dimension.
            vector_dims = (0..node.dimensions.max(1)).collect();
        }

        for v in vector_dims {
            for candidate in self
                .root
                .compute_in_tiles(dag, f, None, &self.params, v, false)
            {
                if !self.rejects(&candidate) {
                    actions.push(Action::new(ScheduleAction::Vectorize, candidate));
                }
            }
        }
        actions
    }

    fn generate_parallel_tilings(&self, f: usize) -> Vec<Action> {
        let dag = &*self.dag;
        let params = &*self.params;
        let node = &dag.nodes[f];

        let mut pure_size = None;
        let mut should_parallelize = false;
        if params.parallelism > 1 && node.dimensions > 0 {
            for c in &self.root.children {
                if c.node == Some(f) {
                    if c.stage == Some(0) {
                        pure_size = Some(&c.size);
                    }
                    should_parallelize = true;
                }
            }
        }
        if !should_parallelize {
            return vec![Action::new(ScheduleAction::Parallelize, Rc::clone(&self.root))];
        }
        let pure_size =
            pure_size.expect("a node computed at the root should have its pure stage there");

        let stage_loops = self
            .root
            .children
            .iter()
            .filter(|c| c.node == Some(f))
            .map(|c| dag.stage(c.expect_stage_key()).loops.as_slice())
            .collect::<Vec<_>>();
        let options = parallel_tiling_options(pure_size, &stage_loops, params.parallelism);
        if options.is_empty() {
            debug!("No parallel tiling of {} is good enough", node.name);
            return vec![Action::new(ScheduleAction::ComputeRoot, Rc::clone(&self.root))];
        }

        let regime = params.tiling_regime;
        let mut actions = vec![];
        for option in &options {
            if !actions.is_empty()
                && (option.idle_core_wastage > MAX_IDLE_CORE_WASTAGE
                    || regime.explores_single_parallel_tiling())
            {
                break;
            }

            let mut new_root = (*self.root).clone();
            for i in 0..new_root.children.len() {
                let c = &new_root.children[i];
                if c.node != Some(f) {
                    continue;
                }
                let tiled = match regime {
                    TilingRegime::FullSubtile => {
                        c.parallelize_in_tiles(dag, regime, &option.tiling, &new_root)
                    }
                    TilingRegime::Legacy => {
                        let pure = dag
                            .stage(c.expect_stage_key())
                            .loops
                            .iter()
                            .map(Loop::is_pure)
                            .collect::<Vec<_>>();
                        let tiling = legacy_parallel_tiling(&c.size, &pure, params.parallelism);
                        c.parallelize_in_tiles(dag, regime, &tiling, &new_root)
                    }
                };
                new_root.children[i] = tiled;
            }

            if !self.rejects(&new_root) {
                actions.push(Action::new(ScheduleAction::Tile, Rc::new(new_root)));
            }
        }
        actions
    }

    fn rejects(&self, root: &LoopNest) -> bool {
        pruning::is_prunable(&self.dag, &self.params, root, self.memory_limit)
    }

    pub fn take_action(&self, action: &Action) -> State {
        State {
            dag: Rc::clone(&self.dag),
            params: Rc::clone(&self.params),
            model: Rc::clone(&self.model),
            root: Rc::clone(&action.root),
            n_decisions_made: self.n_decisions_made + 1,
            memory_limit: self.memory_limit,
            prepruned: action.kind == ScheduleAction::Inline,
            minimum_cost: f64::INFINITY,
            maximum_depth: 0,
        }
    }

    /// Featurize and queue this state with the cost model. `None` if the
    /// schedule is pruned.
    fn enqueue(&self) -> Option<CostHandle> {
        let features = featurize(&self.dag, &self.params, &self.root);
        if !self.prepruned {
            if let Some(reason) =
                prune_reason(&self.dag, &self.root, &features, self.memory_limit)
            {
                debug!("Pruned: {reason}");
                return None;
            }
        }
        Some(self.model.borrow_mut().enqueue(&self.dag, &features))
    }

    /// The predicted cost of this schedule. Infinite if it is pruned.
    pub fn calculate_cost(&self) -> f64 {
        let Some(handle) = self.enqueue() else {
            return f64::INFINITY;
        };
        self.model.borrow_mut().evaluate_costs();
        handle
            .get()
            .expect("cost should be filled in once evaluated")
    }

    /// Like [State::calculate_cost] for each state, evaluated as one batch.
    pub fn calculate_costs(states: &[State]) -> Vec<f64> {
        let handles = states.iter().map(State::enqueue).collect::<Vec<_>>();
        for s in states {
            s.model.borrow_mut().evaluate_costs();
        }
        handles
            .into_iter()
            .map(|h| match h {
                Some(h) => h.get().expect("cost should be filled in once evaluated"),
                None => f64::INFINITY,
            })
            .collect()
    }

    /// Record the cost of a schedule reached from this state. Returns
    /// whether it improved on the best seen, and so should be propagated
    /// further up.
    pub fn update(&mut self, cost: f64) -> bool {
        if cost < self.minimum_cost {
            self.minimum_cost = cost;
            return true;
        }
        false
    }

    /// Like [State::update], but a cost from deeper in the search always
    /// replaces one from shallower.
    pub fn update_at_depth(&mut self, cost: f64, depth: u32) -> bool {
        if depth > self.maximum_depth {
            self.minimum_cost = cost;
            self.maximum_depth = depth;
            true
        } else if depth == self.maximum_depth {
            self.update(cost)
        } else {
            false
        }
    }

    /// The deepest depth passed to [State::update_at_depth].
    pub fn stored_depth(&self) -> u32 {
        self.maximum_depth
    }

    /// The search maximizes value, so this is the negated cost.
    pub fn get_value(&self) -> f64 {
        -self.minimum_cost
    }

    /// Take uniformly random actions until reaching a terminal state or a
    /// dead end.
    pub fn random_rollout<R: Rng + ?Sized>(&self, rng: &mut R) -> State {
        let mut state = self.clone();
        while let Some(action) = state.generate_actions().choose(rng) {
            state = state.take_action(action);
        }
        state
    }

    pub fn structural_hash(&self, depth: i32) -> u64 {
        self.root.structural_hash(depth)
    }

    /// Log the schedule so far at debug level.
    pub fn dump(&self) {
        if log_enabled!(Level::Debug) {
            debug!(
                "State with {} decisions made:\n{}",
                self.n_decisions_made,
                pprint_string(&self.dag, &self.root)
            );
        }
    }
}
