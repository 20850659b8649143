//! # Weight Trainer
//!
//! Gradient descent over the feature weight vector, driven by user ratings.
//!
//! For every rated neighbor the trainer predicts
//!
//! ```text
//! predicted = sqrt(sum((w_i * (origin_i - neighbor_i))^2))
//! error     = target - predicted
//! ```
//!
//! and steps `w -= lr * (-2 * error * (origin - neighbor))` after each sample,
//! clamping every weight into `[0.0, 2.0]`. The epoch loss is the sum of the
//! squared errors seen during the epoch.
//!
//! ## Convergence
//!
//! - An epoch whose loss beats the best so far resets the stale counter.
//! - Once the counter reaches `patience` training stops early.
//! - While the counter is above `patience / 2` the learning rate halves after
//!   every epoch.
//!
//! The trainer never touches the weight store. It returns a candidate vector
//! and the caller decides whether to persist it.

use crate::config::TrainingConfig;
use crate::features::{weighted_euclidean, NormalizedFeatures};
use crate::weights::WeightVector;
use anyhow::{ensure, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Emitted after every epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    /// 1-based epoch number.
    pub epoch: usize,
    pub loss: f64,
    /// Learning rate used during this epoch.
    pub learning_rate: f64,
}

/// Receiver of [`ProgressEvent`]s.
///
/// Any `FnMut(&ProgressEvent)` closure is a sink.
pub trait ProgressSink {
    fn on_epoch(&mut self, event: &ProgressEvent);
}

impl<F: FnMut(&ProgressEvent)> ProgressSink for F {
    fn on_epoch(&mut self, event: &ProgressEvent) {
        self(event);
    }
}

/// Forwards progress to the `log` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_epoch(&mut self, event: &ProgressEvent) {
        debug!(
            "Epoch {}: loss {:.6}, learning rate {:.6}",
            event.epoch, event.loss, event.learning_rate
        );
    }
}

/// Cooperative cancellation flag shared between the trainer and whoever may
/// want to stop it (a signal handler, a UI thread).
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One rated neighbor with the similarity the user asked for.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingSample {
    pub neighbor: NormalizedFeatures,
    pub target: f64,
}

/// A rating nudges the observed similarity instead of replacing it.
#[inline]
#[must_use]
pub fn target_similarity(similarity: f64, rating: i32, adjustment_factor: f64) -> f64 {
    similarity + f64::from(rating) * adjustment_factor
}

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedWeights {
    pub weights: WeightVector,
    /// Epochs actually run.
    pub epochs: usize,
    pub best_loss: f64,
    pub final_loss: f64,
    pub learning_rate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainingOutcome {
    /// Ran all `max_epochs`.
    Converged(TrainedWeights),
    /// Stopped after `patience` epochs without improvement.
    EarlyStopped(TrainedWeights),
    /// Cancelled between epochs; no weights are produced.
    Cancelled,
}

impl TrainingOutcome {
    #[must_use]
    pub fn trained(&self) -> Option<&TrainedWeights> {
        match self {
            Self::Converged(t) | Self::EarlyStopped(t) => Some(t),
            Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn into_trained(self) -> Option<TrainedWeights> {
        match self {
            Self::Converged(t) | Self::EarlyStopped(t) => Some(t),
            Self::Cancelled => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Trainer {
    config: TrainingConfig,
}

impl Trainer {
    #[must_use]
    pub fn new(config: TrainingConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Fit `initial` to the rated `samples` of `origin`.
    ///
    /// The cancel token is checked before each epoch.
    ///
    /// # Errors
    ///
    /// Fails if there are no samples or the vectors disagree on dimensionality.
    ///
    /// # Examples
    ///
    /// ```
    /// use echoes::config::TrainingConfig;
    /// use echoes::features::NormalizedFeatures;
    /// use echoes::trainer::{CancelToken, LogProgress, Trainer, TrainingSample};
    /// use echoes::weights::WeightVector;
    ///
    /// let origin = NormalizedFeatures::from(vec![0.0, 0.0]);
    /// let samples = vec![TrainingSample {
    ///     neighbor: NormalizedFeatures::from(vec![0.5, 0.5]),
    ///     target: 0.2,
    /// }];
    ///
    /// let trainer = Trainer::new(TrainingConfig::default());
    /// let outcome = trainer.train(
    ///     &origin,
    ///     &samples,
    ///     &WeightVector::uniform(2, 1.0),
    ///     &mut LogProgress,
    ///     &CancelToken::new(),
    /// )?;
    /// assert!(outcome.trained().is_some());
    /// # Ok::<(), anyhow::Error>(())
    /// ```
    pub fn train(
        &self,
        origin: &NormalizedFeatures,
        samples: &[TrainingSample],
        initial: &WeightVector,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<TrainingOutcome> {
        ensure!(!samples.is_empty(), "No rated samples to train on");
        ensure!(
            origin.len() == initial.len(),
            "Origin has {} features but there are {} weights",
            origin.len(),
            initial.len()
        );
        for sample in samples {
            ensure!(
                sample.neighbor.len() == origin.len(),
                "Sample has {} features, expected {}",
                sample.neighbor.len(),
                origin.len()
            );
        }

        let deltas: Vec<Vec<f64>> = samples
            .iter()
            .map(|s| {
                origin
                    .as_slice()
                    .iter()
                    .zip(s.neighbor.as_slice())
                    .map(|(o, n)| o - n)
                    .collect()
            })
            .collect();
        let zeros = vec![0.0; origin.len()];

        let mut weights = initial.clone();
        let mut learning_rate = self.config.learning_rate;
        let mut best_loss = f64::INFINITY;
        let mut final_loss = f64::INFINITY;
        let mut stale = 0;

        for epoch in 1..=self.config.max_epochs {
            if cancel.is_cancelled() {
                info!("Training cancelled before epoch {epoch}");
                return Ok(TrainingOutcome::Cancelled);
            }

            let mut loss = 0.0;
            for (delta, sample) in deltas.iter().zip(samples) {
                let predicted = weighted_euclidean(weights.as_slice(), delta, &zeros);
                let error = sample.target - predicted;
                loss += error * error;

                let gradient: Vec<f64> = delta.iter().map(|d| -2.0 * error * d).collect();
                weights.descend(&gradient, learning_rate);
            }
            final_loss = loss;

            if loss < best_loss {
                best_loss = loss;
                stale = 0;
            } else {
                stale += 1;
            }

            progress.on_epoch(&ProgressEvent {
                epoch,
                loss,
                learning_rate,
            });

            if stale >= self.config.patience {
                info!("Early stopping at epoch {epoch}, best loss {best_loss:.6}");
                return Ok(TrainingOutcome::EarlyStopped(TrainedWeights {
                    weights,
                    epochs: epoch,
                    best_loss,
                    final_loss,
                    learning_rate,
                }));
            }

            if stale > self.config.patience / 2 {
                learning_rate /= 2.0;
                debug!("Loss plateaued, learning rate now {learning_rate}");
            }
        }

        info!(
            "Training finished after {} epochs, best loss {best_loss:.6}",
            self.config.max_epochs
        );
        Ok(TrainingOutcome::Converged(TrainedWeights {
            weights,
            epochs: self.config.max_epochs,
            best_loss,
            final_loss,
            learning_rate,
        }))
    }
}
