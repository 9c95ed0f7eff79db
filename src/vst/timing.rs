//! Phase checkpoints of a run

use std::time::Instant;

use serde::{Deserialize, Serialize};

pub const START: &str = "start";
pub const MODEL_FIT_DONE: &str = "modelFitDone";
pub const REGULARIZE_DONE: &str = "regularizeDone";
pub const RESIDUALS_DONE: &str = "residualsDone";
pub const DONE: &str = "done";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub name: String,
    /// Seconds since `start`
    pub elapsed: f64,
}

/// Append-only list of named checkpoints, timed on the calling thread
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimingRecord {
    #[serde(skip)]
    origin: Option<Instant>,
    checkpoints: Vec<Checkpoint>,
}

impl TimingRecord {
    /// New record with the `start` checkpoint at zero
    pub fn start() -> Self {
        Self {
            origin: Some(Instant::now()),
            checkpoints: vec![Checkpoint {
                name: START.to_string(),
                elapsed: 0.0,
            }],
        }
    }

    pub fn checkpoint(&mut self, name: &str) {
        let elapsed = self.origin.map(|o| o.elapsed().as_secs_f64()).unwrap_or(0.0);
        log::debug!("checkpoint {} at {:.3}s", name, elapsed);
        self.checkpoints.push(Checkpoint {
            name: name.to_string(),
            elapsed,
        });
    }

    pub fn checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    pub fn names(&self) -> Vec<&str> {
        self.checkpoints.iter().map(|c| c.name.as_str()).collect()
    }

    /// Elapsed seconds at the first checkpoint called `name`
    pub fn elapsed(&self, name: &str) -> Option<f64> {
        self.checkpoints.iter().find(|c| c.name == name).map(|c| c.elapsed)
    }

    /// Time between consecutive checkpoints, labelled by the later one
    pub fn phase_durations(&self) -> Vec<(String, f64)> {
        self.checkpoints
            .windows(2)
            .map(|w| (w[1].name.clone(), w[1].elapsed - w[0].elapsed))
            .collect()
    }

    pub fn total(&self) -> f64 {
        self.checkpoints.last().map(|c| c.elapsed).unwrap_or(0.0)
    }
}
