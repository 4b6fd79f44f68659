use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;

/// Environment variable which, when set to `1`, selects [TilingRegime::Legacy].
pub const NO_SUBTILING_ENV: &str = "AUTOSCHED_NO_SUBTILING";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MachineParams {
    /// Number of cores to target.
    pub parallelism: i64,
    pub last_level_cache_size: i64,
    /// Ratio of memory cost to compute cost.
    pub balance: f64,
    pub tiling_regime: TilingRegime,
}

impl Default for MachineParams {
    fn default() -> Self {
        MachineParams {
            parallelism: 16,
            last_level_cache_size: 16 * 1024 * 1024,
            balance: 40.0,
            tiling_regime: TilingRegime::FullSubtile,
        }
    }
}

impl MachineParams {
    pub fn with_parallelism(mut self, parallelism: i64) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn with_regime(mut self, tiling_regime: TilingRegime) -> Self {
        self.tiling_regime = tiling_regime;
        self
    }
}

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ParamsError {
    #[error("Expected three comma-separated fields, got {0}")]
    FieldCount(usize),
    #[error("Could not parse {field} from {value:?}")]
    BadField { field: &'static str, value: String },
    #[error("Parallelism must be at least 1, got {0}")]
    NonPositiveParallelism(i64),
}

impl FromStr for MachineParams {
    type Err = ParamsError;

    /// Parses `"parallelism,last_level_cache_size,balance"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = s.split(',').map(str::trim).collect::<Vec<_>>();
        if fields.len() != 3 {
            return Err(ParamsError::FieldCount(fields.len()));
        }
        let bad = |field, value: &str| ParamsError::BadField {
            field,
            value: value.to_owned(),
        };
        let parallelism = fields[0]
            .parse::<i64>()
            .map_err(|_| bad("parallelism", fields[0]))?;
        if parallelism < 1 {
            return Err(ParamsError::NonPositiveParallelism(parallelism));
        }
        let last_level_cache_size = fields[1]
            .parse::<i64>()
            .map_err(|_| bad("last_level_cache_size", fields[1]))?;
        let balance = fields[2]
            .parse::<f64>()
            .map_err(|_| bad("balance", fields[2]))?;
        Ok(MachineParams {
            parallelism,
            last_level_cache_size,
            balance,
            tiling_regime: TilingRegime::default(),
        })
    }
}

impl fmt::Display for MachineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{},{},{}",
            self.parallelism, self.last_level_cache_size, self.balance
        )
    }
}

/// Which phase of scheduling a node a decision belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Debug, strum::Display)]
pub enum Phase {
    /// Choose where the node is stored and computed, or inline it.
    Realize,
    /// Choose how the node's root-level loop is split across cores.
    Parallelize,
}

/// The two tiling regimes the search supports.
///
/// [TilingRegime::Legacy] reproduces an older scheduler, for ablations:
/// every node is realized before any is parallelized, loops are never
/// subtiled once something is computed inside them, and only the best
/// parallel tiling is explored, sized by halving.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TilingRegime {
    #[default]
    FullSubtile,
    Legacy,
}

impl TilingRegime {
    pub fn from_env() -> Self {
        match env::var(NO_SUBTILING_ENV) {
            Ok(v) if v == "1" => TilingRegime::Legacy,
            _ => TilingRegime::FullSubtile,
        }
    }

    pub fn may_subtile(self) -> bool {
        self == TilingRegime::FullSubtile
    }

    /// Map a decision count to the node to decide and the phase of that
    /// decision.
    pub fn decision_target(self, n_decisions_made: u32, num_nodes: usize) -> (usize, Phase) {
        let n = n_decisions_made as usize;
        let (node, phase) = match self {
            TilingRegime::FullSubtile => (n / 2, n % 2),
            TilingRegime::Legacy => (n % num_nodes, n / num_nodes),
        };
        let phase = if phase == 0 {
            Phase::Realize
        } else {
            Phase::Parallelize
        };
        (node, phase)
    }

    pub fn explores_single_parallel_tiling(self) -> bool {
        self == TilingRegime::Legacy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_machine_params() {
        let p: MachineParams = "8, 1048576, 20.5".parse().unwrap();
        assert_eq!(p.parallelism, 8);
        assert_eq!(p.last_level_cache_size, 1048576);
        assert_eq!(p.balance, 20.5);
        assert_eq!(p.to_string(), "8,1048576,20.5");
    }

    #[test]
    fn test_parse_machine_params_errors() {
        assert_eq!(
            "8,1".parse::<MachineParams>(),
            Err(ParamsError::FieldCount(2))
        );
        assert!(matches!(
            "x,1,1".parse::<MachineParams>(),
            Err(ParamsError::BadField { field: "parallelism", .. })
        ));
        assert_eq!(
            "0,1,1".parse::<MachineParams>(),
            Err(ParamsError::NonPositiveParallelism(0))
        );
    }

    #[test]
    fn test_full_subtile_alternates_phases() {
        let r = TilingRegime::FullSubtile;
        assert_eq!(r.decision_target(0, 3), (0, Phase::Realize));
        assert_eq!(r.decision_target(1, 3), (0, Phase::Parallelize));
        assert_eq!(r.decision_target(4, 3), (2, Phase::Realize));
    }

    #[test]
    fn test_legacy_realizes_everything_first() {
        let r = TilingRegime::Legacy;
        assert_eq!(r.decision_target(0, 3), (0, Phase::Realize));
        assert_eq!(r.decision_target(2, 3), (2, Phase::Realize));
        assert_eq!(r.decision_target(3, 3), (0, Phase::Parallelize));
        assert_eq!(r.decision_target(5, 3), (2, Phase::Parallelize));
    }

    proptest! {
        #[test]
        fn test_every_node_gets_both_phases_once(regime: TilingRegime, num_nodes in 1usize..12) {
            let mut seen = vec![[0u8; 2]; num_nodes];
            for n in 0..(2 * num_nodes) as u32 {
                let (node, phase) = regime.decision_target(n, num_nodes);
                seen[node][phase as usize] += 1;
            }
            prop_assert!(seen.iter().all(|s| *s == [1, 1]));
        }
    }
}
