pub mod bounds;
pub mod cost_model;
pub mod dag;
pub mod features;
pub mod loop_nest;
pub mod params;
pub mod pipelines;
pub mod pprint;
pub mod pruning;
pub mod state;
pub mod tiling;
