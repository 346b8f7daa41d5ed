//! Training metrics for monitoring meta-training progress
//!
//! Only a bounded window of recent steps stays in memory. Every step is
//! appended to a CSV file when the pending rows are flushed.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::Duration;

use crate::error::Result;

/// Recent steps kept for moving averages by default
pub const DEFAULT_HISTORY: usize = 1000;

/// Losses and scores of one meta-training step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    /// Epoch (1-based)
    pub epoch: usize,
    /// Batch within the epoch (1-based)
    pub batch: usize,
    /// Dataset index of the video
    pub video: usize,
    pub loss_e_g: f64,
    pub loss_d: f64,
    /// Mean discriminator score of the real frame
    pub r_x: f64,
    /// Mean discriminator score of the generated frame
    pub r_x_hat: f64,
    pub duration_ms: f64,
}

/// Metrics collected during training
#[derive(Debug, Clone)]
pub struct TrainingMetrics {
    history: usize,
    recent: VecDeque<BatchRecord>,
    pending: Vec<BatchRecord>,
    total: usize,
    epoch: usize,
    epoch_steps: usize,
    epoch_duration_ms: f64,
}

impl Default for TrainingMetrics {
    fn default() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }
}

impl TrainingMetrics {
    /// Create new empty metrics
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` recent steps in memory
    pub fn with_history(history: usize) -> Self {
        let history = history.max(1);
        Self {
            history,
            recent: VecDeque::with_capacity(history),
            pending: Vec::new(),
            total: 0,
            epoch: 0,
            epoch_steps: 0,
            epoch_duration_ms: 0.0,
        }
    }

    /// Reset the per-epoch timing totals
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.epoch_steps = 0;
        self.epoch_duration_ms = 0.0;
    }

    /// Record one step
    pub fn record(&mut self, record: BatchRecord) {
        if record.epoch != self.epoch {
            self.start_epoch(record.epoch);
        }
        self.epoch_steps += 1;
        self.epoch_duration_ms += record.duration_ms;
        self.total += 1;

        if self.recent.len() == self.history {
            self.recent.pop_front();
        }
        self.recent.push_back(record.clone());
        self.pending.push(record);
    }

    /// Number of steps recorded over the whole run
    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Steps still held in memory, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &BatchRecord> {
        self.recent.iter()
    }

    /// Steps not yet written by [`Self::flush_csv`]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn latest(&self) -> Option<&BatchRecord> {
        self.recent.back()
    }

    /// Moving average of the embedder/generator loss
    pub fn loss_e_g_ma(&self, window: usize) -> f64 {
        moving_average(self.recent.iter().map(|r| r.loss_e_g), window)
    }

    /// Moving average of the discriminator loss
    pub fn loss_d_ma(&self, window: usize) -> f64 {
        moving_average(self.recent.iter().map(|r| r.loss_d), window)
    }

    /// Average step duration of the current epoch, `None` before its first step
    pub fn avg_batch_time(&self) -> Option<Duration> {
        if self.epoch_steps == 0 {
            return None;
        }
        let mean_ms = self.epoch_duration_ms / self.epoch_steps as f64;
        Some(Duration::from_secs_f64(mean_ms / 1000.0))
    }

    /// Whether the discriminator separates real from generated frames with a wide margin
    ///
    /// A hinge loss near zero together with a score gap beyond the hinge
    /// margin means the generator no longer gets useful gradients.
    pub fn discriminator_dominates(&self, window: usize) -> bool {
        if window == 0 || self.recent.len() < window {
            return false;
        }
        let gap = moving_average(self.recent.iter().map(|r| r.r_x - r.r_x_hat), window);
        self.loss_d_ma(window) < 0.05 && gap > 2.0
    }

    /// Append pending steps to a CSV file, writing the header for a new file
    pub fn flush_csv(&mut self, path: impl AsRef<Path>) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let path = path.as_ref();
        let is_new = std::fs::metadata(path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for record in &self.pending {
            writer.serialize(record)?;
        }
        writer.flush()?;
        self.pending.clear();
        Ok(())
    }

    /// Read every step of a metrics CSV file
    pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<BatchRecord>> {
        let mut reader = csv::Reader::from_path(path)?;
        let records = reader
            .deserialize()
            .collect::<std::result::Result<Vec<BatchRecord>, _>>()?;
        Ok(records)
    }
}

/// Mean of the last `window` values
fn moving_average(values: impl DoubleEndedIterator<Item = f64>, window: usize) -> f64 {
    let recent: Vec<f64> = values.rev().take(window).collect();
    if recent.is_empty() {
        return 0.0;
    }
    recent.iter().sum::<f64>() / recent.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn record(epoch: usize, batch: usize, loss_d: f64, r_x: f64, r_x_hat: f64) -> BatchRecord {
        BatchRecord {
            epoch,
            batch,
            video: batch - 1,
            loss_e_g: 10.0 * batch as f64,
            loss_d,
            r_x,
            r_x_hat,
            duration_ms: 100.0 * batch as f64,
        }
    }

    #[test]
    fn test_moving_averages() {
        let mut metrics = TrainingMetrics::new();
        for b in 1..=4 {
            metrics.record(record(1, b, 1.0, 0.0, 0.0));
        }

        assert_eq!(metrics.len(), 4);
        assert_relative_eq!(metrics.loss_e_g_ma(2), 35.0);
        assert_relative_eq!(metrics.loss_e_g_ma(100), 25.0);
        assert_eq!(metrics.latest().unwrap().batch, 4);
    }

    #[test]
    fn test_avg_batch_time_resets_per_epoch() {
        let mut metrics = TrainingMetrics::new();
        assert_eq!(metrics.avg_batch_time(), None);

        metrics.record(record(1, 1, 1.0, 0.0, 0.0));
        metrics.record(record(1, 3, 1.0, 0.0, 0.0));
        assert_eq!(metrics.avg_batch_time().map(|d| d.as_millis()), Some(200));

        metrics.record(record(2, 1, 1.0, 0.0, 0.0));
        assert_eq!(metrics.avg_batch_time().map(|d| d.as_millis()), Some(100));

        metrics.start_epoch(3);
        assert_eq!(metrics.avg_batch_time(), None);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut metrics = TrainingMetrics::with_history(3);
        for b in 1..=10 {
            metrics.record(record(1, b, 1.0, 0.0, 0.0));
        }

        assert_eq!(metrics.len(), 10);
        let batches: Vec<usize> = metrics.recent().map(|r| r.batch).collect();
        assert_eq!(batches, vec![8, 9, 10]);
        assert_relative_eq!(metrics.loss_e_g_ma(100), 90.0);
        // Timing still covers the whole epoch
        assert_eq!(metrics.avg_batch_time().map(|d| d.as_millis()), Some(550));
    }

    #[test]
    fn test_discriminator_dominance() {
        let mut metrics = TrainingMetrics::new();
        for b in 1..=5 {
            metrics.record(record(1, b, 0.8, 0.3, -0.2));
        }
        assert!(!metrics.discriminator_dominates(5));

        for b in 6..=10 {
            metrics.record(record(1, b, 0.0, 2.5, -1.5));
        }
        assert!(metrics.discriminator_dominates(5));
        assert!(!metrics.discriminator_dominates(50));
    }

    #[test]
    fn test_flush_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");

        let mut metrics = TrainingMetrics::with_history(1);
        metrics.record(record(1, 1, 0.5, 0.1, -0.1));
        metrics.record(record(1, 2, 0.4, 0.2, -0.3));
        metrics.flush_csv(&path).unwrap();
        assert_eq!(metrics.pending(), 0);

        metrics.record(record(2, 1, 0.3, 0.4, -0.5));
        metrics.flush_csv(&path).unwrap();
        // Nothing pending leaves the file untouched
        metrics.flush_csv(&path).unwrap();

        let loaded = TrainingMetrics::load_csv(&path).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[0], record(1, 1, 0.5, 0.1, -0.1));
        assert_eq!(loaded[2], record(2, 1, 0.3, 0.4, -0.5));
    }
}
