use std::path::PathBuf;

use clap::{Parser, ValueEnum};
pub use driver::{Pric3, Pric3Outcome};
pub use error::{Pric3Error, Result};
pub use probability::{Probability, StateId};

pub mod error;
pub mod generalize;
pub mod logger;
pub mod model;
pub mod obligations;
pub mod oracle;
pub mod probability;
pub mod probability_solver;
pub mod smt;
pub mod statistics;

mod driver;

use obligations::{NaiveRepushingQueue, ObligationQueue, PlainQueue, RepushingQueue};
use oracle::OracleStrategy;

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Pric3Options {
    /// Path to the model file.
    #[arg(short, long)]
    pub model: String,

    /// Threshold on the reachability probability, e.g. `1/3` or `0.25`.
    #[arg(short, long)]
    pub lambda: Probability,

    /// How the initial probability estimates are obtained.
    #[arg(short, long, value_enum, default_value_t = OracleKind::Exact)]
    pub oracle: OracleKind,

    /// Snapshot to load when the file oracle is selected.
    #[arg(long)]
    pub oracle_file: Option<PathBuf>,

    /// Estimate for states the oracle knows nothing about.
    #[arg(long, default_value = "0")]
    pub default_oracle_value: Probability,

    /// Exploration depth for the bounded oracles.
    #[arg(long, default_value_t = 10)]
    pub unroll_depth: usize,

    /// Number of random walks for the simulation oracle.
    #[arg(long, default_value_t = 10000)]
    pub simulations: usize,

    /// Step limit per random walk.
    #[arg(long, default_value_t = 100)]
    pub max_steps: usize,

    /// Seed for the simulation oracle.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    /// Iteration limit for the value-iteration oracle.
    #[arg(long, default_value_t = 1000)]
    pub value_iteration_steps: usize,

    /// Obligation scheduling policy.
    #[arg(short, long, value_enum, default_value_t = QueueKind::Repushing)]
    pub queue: QueueKind,

    /// Generalize discharged obligations to interval facts.
    #[arg(short, long, value_enum)]
    pub generalize: Option<GeneralizationMethod>,

    /// Counterexamples to generalization tolerated per attempt.
    #[arg(long, default_value_t = 2)]
    pub max_ctgs: usize,

    /// Interval splits the hybrid generalizer may spend.
    #[arg(long, default_value_t = 4)]
    pub split_limit: usize,

    /// Attempt generalization even without a similar visited state.
    #[arg(long, default_value_t = false)]
    pub ignore_same_kind: bool,

    /// Encode integer variables as reals with integrality enforced
    /// through cutting planes.
    #[arg(long, default_value_t = false)]
    pub int_to_real: bool,

    /// Re-check the inductive frame after a proof.
    #[arg(long, default_value_t = false)]
    pub check_inductiveness: bool,

    /// Skip pushing learned facts to later frames. Fixed points are no
    /// longer detected, so only refutations terminate.
    #[arg(long, default_value_t = false)]
    pub no_propagate: bool,

    /// Write run statistics to this file as JSON.
    #[arg(long)]
    pub save_stats: Option<PathBuf>,

    /// Write the oracle's final estimates to this file as JSON.
    #[arg(long)]
    pub save_oracle: Option<PathBuf>,
}

impl Default for Pric3Options {
    fn default() -> Self {
        Pric3Options {
            model: "".into(),
            lambda: Probability::one(),
            oracle: OracleKind::Exact,
            oracle_file: None,
            default_oracle_value: Probability::zero(),
            unroll_depth: 10,
            simulations: 10000,
            max_steps: 100,
            seed: 0,
            value_iteration_steps: 1000,
            queue: QueueKind::Repushing,
            generalize: None,
            max_ctgs: 2,
            split_limit: 4,
            ignore_same_kind: false,
            int_to_real: false,
            check_inductiveness: false,
            no_propagate: false,
            save_stats: None,
            save_oracle: None,
        }
    }
}

impl Pric3Options {
    pub fn new(model: impl Into<String>, lambda: Probability) -> Self {
        Pric3Options {
            model: model.into(),
            lambda,
            ..Default::default()
        }
    }

    pub fn oracle_strategy(&self) -> Result<OracleStrategy> {
        Ok(match self.oracle {
            OracleKind::Exact => OracleStrategy::Exact,
            OracleKind::BoundedExact => OracleStrategy::BoundedExact {
                depth: self.unroll_depth,
            },
            OracleKind::BoundedNumeric => OracleStrategy::BoundedNumeric {
                depth: self.unroll_depth,
            },
            OracleKind::Simulation => OracleStrategy::Simulation {
                runs: self.simulations,
                max_steps: self.max_steps,
                seed: self.seed,
            },
            OracleKind::ValueIteration => OracleStrategy::ValueIteration {
                iterations: self.value_iteration_steps,
            },
            OracleKind::File => OracleStrategy::File {
                path: self.oracle_file.clone().ok_or_else(|| {
                    Pric3Error::Model("the file oracle needs --oracle-file".into())
                })?,
            },
        })
    }

    pub fn build_queue(&self) -> Box<dyn ObligationQueue> {
        match self.queue {
            QueueKind::Plain => Box::new(PlainQueue::default()),
            QueueKind::Repushing => Box::new(RepushingQueue::new(0)),
            QueueKind::NaiveRepushing => Box::new(NaiveRepushingQueue::new(0)),
        }
    }
}

/// Describes the available oracle initializations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum OracleKind {
    Exact,
    BoundedExact,
    BoundedNumeric,
    Simulation,
    ValueIteration,
    File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum QueueKind {
    Plain,
    Repushing,
    NaiveRepushing,
}

/// Describes how discharged obligations are widened to interval facts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab_case")]
pub enum GeneralizationMethod {
    /// Constant or linear bounds over one variable's interval.
    Linear,
    /// Lagrange-interpolated polynomial bounds.
    Polynomial,
    /// Polynomial bounds, split into verified pieces when a single
    /// polynomial does not fit.
    Hybrid,
}
