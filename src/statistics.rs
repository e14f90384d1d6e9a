//! Counters and timers collected over a run, dumpable as JSON.

use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use log::info;
use serde::Serialize;

use crate::error::Result;

#[derive(Debug, Default, Serialize)]
pub struct Statistics {
    pub outcome: Option<String>,
    pub frames: usize,
    pub inductive_frame: Option<usize>,
    pub inductiveness_verified: bool,

    pub obligations_popped: usize,
    pub inductiveness_checks: usize,
    pub failed_inductiveness_checks: usize,
    pub propagated_facts: usize,
    pub learned_facts: usize,
    pub generalization_attempts: usize,
    pub generalized_facts: usize,
    pub oracle_refinements: usize,
    pub refutation_checks: usize,
    pub probability_queries: usize,
    pub probability_cache_hits: usize,
    pub proportional_splits: usize,
    pub visited_states: usize,

    #[serde(serialize_with = "as_seconds")]
    pub total_time: Duration,
    #[serde(serialize_with = "as_seconds")]
    pub strengthen_time: Duration,
    #[serde(serialize_with = "as_seconds")]
    pub propagation_time: Duration,
    #[serde(serialize_with = "as_seconds")]
    pub oracle_time: Duration,
    #[serde(serialize_with = "as_seconds")]
    pub refutation_time: Duration,
}

fn as_seconds<S: serde::Serializer>(
    duration: &Duration,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Measures one phase; add the elapsed time onto the matching counter
/// with [`Statistics::record`].
pub struct Stopwatch(Instant);

impl Stopwatch {
    pub fn start() -> Self {
        Stopwatch(Instant::now())
    }

    pub fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

impl Statistics {
    pub fn record(target: &mut Duration, watch: Stopwatch) {
        *target += watch.elapsed();
    }

    pub fn log_summary(&self) {
        info!(
            "outcome: {} after {:.3}s and {} frames",
            self.outcome.as_deref().unwrap_or("unknown"),
            self.total_time.as_secs_f64(),
            self.frames
        );
        info!(
            "obligations: {} popped, {}/{} inductiveness checks failed, {} facts learned ({} generalized)",
            self.obligations_popped,
            self.failed_inductiveness_checks,
            self.inductiveness_checks,
            self.learned_facts,
            self.generalized_facts
        );
        info!(
            "oracle: {} refinements, {} refutation checks, {} visited states",
            self.oracle_refinements, self.refutation_checks, self.visited_states
        );
        info!(
            "probability splits: {} queries, {} cache hits, {} proportional",
            self.probability_queries, self.probability_cache_hits, self.proportional_splits
        );
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_durations_as_seconds() {
        let stats = Statistics {
            total_time: Duration::from_millis(1500),
            ..Default::default()
        };
        let json: serde_json::Value = serde_json::from_str(&serde_json::to_string(&stats).unwrap()).unwrap();
        assert_eq!(json["total_time"], serde_json::json!(1.5));
        assert_eq!(json["obligations_popped"], serde_json::json!(0));
    }
}
