#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::info;
use rand::rngs::StdRng;
use rand::SeedableRng;

use std::cell::RefCell;
use std::fs::File;
use std::io::BufWriter;
use std::path;
use std::rc::Rc;

use autosched::cost_model::{AnalyticCostModel, DEFAULT_BATCH_SIZE};
use autosched::features::{featurize, save_featurization};
use autosched::params::{MachineParams, TilingRegime};
use autosched::pipelines;
use autosched::pprint::pprint;
use autosched::state::State;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Pipeline to schedule
    #[arg(long, value_enum, default_value_t = Pipeline::Blur)]
    pipeline: Pipeline,

    /// Extent of each dimension of the pipeline's output
    #[arg(long, default_value_t = 1024)]
    size: i64,

    /// Number of cores to target
    #[arg(long, short, default_value_t = MachineParams::default().parallelism)]
    parallelism: i64,

    /// Ratio of memory cost to compute cost
    #[arg(long, default_value_t = MachineParams::default().balance)]
    balance: f64,

    /// Reject schedules allocating more than this many bytes
    #[arg(long)]
    memory_limit: Option<u64>,

    /// Tiling regime. Defaults to the AUTOSCHED_NO_SUBTILING environment
    /// variable.
    #[arg(long, value_enum, conflicts_with = "no_subtiling")]
    regime: Option<TilingRegime>,

    /// Shorthand for `--regime legacy`
    #[arg(long, default_value_t = false)]
    no_subtiling: bool,

    /// Number of random rollouts to try after the greedy descent
    #[arg(long, default_value_t = 0)]
    rollouts: usize,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Number of schedules per cost model batch
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,

    /// Write the featurization of the best schedule to this file
    #[arg(long)]
    save_features: Option<path::PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Pipeline {
    Chain,
    Blur,
    Matmul,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let dag = match args.pipeline {
        Pipeline::Chain => pipelines::pointwise_chain(4, args.size),
        Pipeline::Blur => pipelines::blur(args.size, args.size),
        Pipeline::Matmul => pipelines::matmul(args.size),
    };
    info!("Scheduling:\n{dag}");

    let tiling_regime = match (args.regime, args.no_subtiling) {
        (Some(r), _) => r,
        (None, true) => TilingRegime::Legacy,
        (None, false) => TilingRegime::from_env(),
    };
    let params = MachineParams {
        parallelism: args.parallelism,
        balance: args.balance,
        tiling_regime,
        ..MachineParams::default()
    };
    let model = Rc::new(RefCell::new(AnalyticCostModel::with_batch_size(
        params.clone(),
        args.batch_size,
    )));
    let initial = State::new(
        Rc::new(dag),
        Rc::new(params),
        model.clone(),
        args.memory_limit,
    );

    let (mut best, mut best_cost) = greedy_descent(&initial)?;
    info!("Greedy descent found a schedule costing {best_cost}");

    let mut rng = StdRng::seed_from_u64(args.seed);
    for i in 0..args.rollouts {
        let end = initial.random_rollout(&mut rng);
        if !end.is_terminal() {
            info!("Rollout {i} reached a dead end");
            continue;
        }
        let cost = end.calculate_cost();
        info!("Rollout {i} costs {cost}");
        if cost < best_cost {
            best = end;
            best_cost = cost;
        }
    }

    pprint(best.dag(), best.root());
    println!("Cost: {best_cost}");
    info!("Evaluated {} schedules", model.borrow().evaluated());

    if let Some(path) = &args.save_features {
        write_features(&best, path)?;
    }
    Ok(())
}

/// Repeatedly take the cheapest next decision, then propagate the final
/// cost back along the path.
fn greedy_descent(initial: &State) -> Result<(State, f64)> {
    let mut path = vec![initial.clone()];
    loop {
        let state = path.last().expect("path should never be empty");
        if state.is_terminal() {
            break;
        }
        let actions = state.generate_actions();
        if actions.is_empty() {
            bail!(
                "Dead end after {} decisions; see the log for the schedule",
                state.n_decisions_made()
            );
        }
        let children = actions.iter().map(|a| state.take_action(a)).collect::<Vec<_>>();
        let costs = State::calculate_costs(&children);
        let (i, cost) = costs
            .iter()
            .copied()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .expect("actions should be non-empty");
        info!(
            "Decision {}: {} of {} options, cost {cost}",
            state.n_decisions_made(),
            actions[i],
            actions.len()
        );
        let next = children
            .into_iter()
            .nth(i)
            .expect("index should be in range");
        path.push(next);
    }

    let last = path.pop().expect("path should never be empty");
    let cost = last.calculate_cost();
    for s in path.iter_mut().rev() {
        if !s.update(cost) {
            break;
        }
    }
    if let Some(first) = path.first() {
        info!("Initial state value: {}", first.get_value());
    }
    Ok((last, cost))
}

fn write_features(state: &State, path: &path::Path) -> Result<()> {
    let dag = state.dag();
    let features = featurize(dag, state.params(), state.root());
    let file = File::create(path).with_context(|| format!("Could not create {}", path.display()))?;
    save_featurization(dag, &features, BufWriter::new(file))?;
    info!("Wrote features to {}", path.display());
    Ok(())
}
