use serde::{Deserialize, Serialize};

use crate::error::DataError;

/// Mean loss and accuracy of one pass over a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub loss: f64,
    pub accuracy: f64,
    pub examples: usize,
}

/// Loss and correct-prediction sums for the pass in progress.
#[derive(Debug, Clone, Default)]
pub struct RunningMetrics {
    loss_sum: f64,
    correct: u64,
    seen: usize,
}

impl RunningMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// `batch_loss` is the mean over the batch, so it is weighted back up by the batch size.
    pub fn update(&mut self, batch_loss: f64, batch_size: usize, correct: u64) {
        self.loss_sum += batch_loss * batch_size as f64;
        self.correct += correct;
        self.seen += batch_size;
    }

    pub fn finalize(&self) -> Result<EpochSummary, DataError> {
        if self.seen == 0 {
            return Err(DataError::EmptyEpoch);
        }
        let total = self.seen as f64;

        Ok(EpochSummary {
            loss: self.loss_sum / total,
            accuracy: self.correct as f64 / total,
            examples: self.seen,
        })
    }
}
