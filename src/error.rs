use thiserror::Error;

/// Failures that abort a run. Expected outcomes of the search
/// (refutation, infeasible probability splits, generalization giving up)
/// are ordinary return values, not errors.
#[derive(Error, Debug)]
pub enum Pric3Error {
    /// The SMT solver answered `unknown`. The frame encoding is decidable
    /// linear real arithmetic, so this points at a resource limit rather
    /// than something we can recover from.
    #[error("solver returned unknown while deciding frame {frame}")]
    SolverUnknown { frame: usize },

    /// The oracle refinement system over the visited states has no
    /// solution, which means the model itself is contradictory.
    #[error("oracle refinement is infeasible over {states} states")]
    OracleInconsistent { states: usize },

    #[error("solver returned unknown during oracle refinement")]
    OracleUnknown,

    #[error("solver returned unknown while splitting an obligation")]
    SplitUnknown,

    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    #[error("invalid model: {0}")]
    Model(String),

    #[error("threshold must lie in [0, 1], got {0}")]
    InvalidThreshold(String),

    #[error("cannot parse probability '{0}'")]
    ParseProbability(String),

    #[error("solver model has no value for {0}")]
    MissingModelValue(String),

    #[error("numeral {0} is not representable")]
    Numeral(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Pric3Error>;
