use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::cell::RefCell;
use std::hint::black_box;
use std::rc::Rc;

use autosched::cost_model::AnalyticCostModel;
use autosched::params::MachineParams;
use autosched::pipelines;
use autosched::state::State;

/// The blur with its output realized and parallelized, so the next
/// decision places the intermediate stage.
fn blur_state() -> State {
    let params = MachineParams::default();
    let model = Rc::new(RefCell::new(AnalyticCostModel::new(params.clone())));
    let mut state = State::new(Rc::new(pipelines::blur(512, 512)), Rc::new(params), model, None);
    for _ in 0..2 {
        let actions = state.generate_actions();
        state = state.take_action(&actions[0]);
    }
    state
}

#[library_benchmark]
#[bench::blur(blur_state())]
fn generate_realizations(state: State) {
    black_box(state.generate_actions());
}

#[library_benchmark]
fn generate_output_parallel_tilings() {
    let params = MachineParams::default();
    let model = Rc::new(RefCell::new(AnalyticCostModel::new(params.clone())));
    let state = State::new(Rc::new(pipelines::matmul(512)), Rc::new(params), model, None);
    let actions = state.generate_actions();
    let state = state.take_action(&actions[0]);
    black_box(state.generate_actions());
}

library_benchmark_group!(
    name = generate_actions_group;
    benchmarks = generate_realizations, generate_output_parallel_tilings
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = generate_actions_group
);
