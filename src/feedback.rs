//! # Feedback Sessions
//!
//! Collects ratings for the neighbors of an origin track and hands them to
//! the [`Trainer`].
//!
//! ## Session lifecycle
//!
//! ```text
//! Idle -> Collecting -> Training -> Converged | EarlyStopped
//!            |              |
//!            +-> Aborted <--+ (quit while rating, or cancelled)
//! ```
//!
//! Ratings run from 1 to 5; the origin track is recorded with the sentinel
//! [`ORIGIN_RATING`] and is never trained on. Training only starts once every
//! candidate is rated. A finished run asks the user to confirm before the
//! caller persists anything via [`apply_trained_weights`].

use crate::features::{NormalizedFeatures, TrackId};
use crate::index::{rebuild_index, AnnIndex};
use crate::similarity::Similar;
use crate::store::{FeatureStore, TrackCatalog, TrackInfo};
use crate::trainer::{
    target_similarity, CancelToken, ProgressSink, TrainedWeights, Trainer, TrainingOutcome,
    TrainingSample,
};
use crate::weights::{WeightStore, WeightVector};
use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::ops::RangeInclusive;
use std::path::Path;

/// Rating stored for the origin track itself.
pub const ORIGIN_RATING: i32 = -1;

pub const RATING_RANGE: RangeInclusive<i32> = 1..=5;

/// Labels longer than this are shortened for display.
const LABEL_WIDTH: usize = 20;

/// Ratings collected in one session, in the order they were given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackSample {
    origin: TrackId,
    ratings: Vec<(TrackId, i32)>,
}

impl FeedbackSample {
    #[must_use]
    pub fn new(origin: TrackId) -> Self {
        Self {
            origin,
            ratings: vec![(origin, ORIGIN_RATING)],
        }
    }

    #[must_use]
    pub fn origin(&self) -> TrackId {
        self.origin
    }

    /// Record a rating for `id`. Rating a track again keeps its position.
    ///
    /// # Errors
    ///
    /// Fails for the origin track or a rating outside `1..=5`.
    pub fn rate(&mut self, id: TrackId, rating: i32) -> Result<()> {
        ensure!(id != self.origin, "The origin track cannot be rated");
        ensure!(
            RATING_RANGE.contains(&rating),
            "Rating {rating} outside {}..={}",
            RATING_RANGE.start(),
            RATING_RANGE.end()
        );
        match self.ratings.iter_mut().find(|(rated, _)| *rated == id) {
            Some(entry) => entry.1 = rating,
            None => self.ratings.push((id, rating)),
        }
        Ok(())
    }

    #[must_use]
    pub fn rating(&self, id: TrackId) -> Option<i32> {
        self.ratings
            .iter()
            .find_map(|&(rated, rating)| (rated == id).then_some(rating))
    }

    /// Whether every candidate has a rating.
    #[must_use]
    pub fn is_complete(&self, candidates: &[Candidate]) -> bool {
        candidates.iter().all(|c| {
            self.rating(c.id)
                .is_some_and(|r| RATING_RANGE.contains(&r))
        })
    }

    /// Ratings usable for training, in rating order: everything except the
    /// origin.
    pub fn trainable(&self) -> impl Iterator<Item = (TrackId, i32)> + '_ {
        self.ratings
            .iter()
            .copied()
            .filter(|&(_, rating)| rating != ORIGIN_RATING)
    }
}

/// A neighbor presented for rating.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: TrackId,
    pub similarity: f64,
    pub track: Option<TrackInfo>,
}

impl Candidate {
    /// `title - artist - album`, each part shortened for display.
    #[must_use]
    pub fn label(&self) -> String {
        describe(self.id, self.track.as_ref())
    }
}

fn describe(id: TrackId, track: Option<&TrackInfo>) -> String {
    match track {
        Some(t) => format!(
            "{} - {} - {}",
            shorten(&t.title),
            shorten(&t.artist),
            shorten(&t.album)
        ),
        None => format!("Track {id}"),
    }
}

fn shorten(text: &str) -> String {
    if text.chars().count() > LABEL_WIDTH {
        let head: String = text.chars().take(LABEL_WIDTH - 3).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackResponse {
    Rated(i32),
    Quit,
}

/// Presentation side of a feedback session.
pub trait FeedbackUi {
    /// Called once before the first candidate.
    ///
    /// # Errors
    ///
    /// I/O failures.
    fn begin(&mut self, origin: TrackId, track: Option<&TrackInfo>, candidates: usize) -> Result<()>;

    /// Ask for a rating of `candidate`, the `position`-th of the session.
    ///
    /// # Errors
    ///
    /// I/O failures.
    fn rate(&mut self, position: usize, candidate: &Candidate) -> Result<FeedbackResponse>;

    /// Show the old and proposed weights and ask whether to keep the new ones.
    ///
    /// # Errors
    ///
    /// I/O failures.
    fn confirm(&mut self, current: &WeightVector, proposed: &TrainedWeights) -> Result<bool>;
}

/// Line-oriented [`FeedbackUi`] over any reader and writer.
///
/// End of input counts as quitting.
pub struct TerminalFeedback<R, W> {
    input: R,
    output: W,
    feature_names: Vec<String>,
}

impl<R: BufRead, W: Write> TerminalFeedback<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self {
            input,
            output,
            feature_names: Vec::new(),
        }
    }

    /// Names shown next to each weight in the confirmation table.
    #[must_use]
    pub fn with_feature_names(mut self, names: Vec<String>) -> Self {
        self.feature_names = names;
        self
    }

    pub fn into_output(self) -> W {
        self.output
    }

    /// `None` at end of input.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("Failed to read from terminal")?;
        Ok((read > 0).then(|| line.trim().to_string()))
    }
}

impl<R: BufRead, W: Write> FeedbackUi for TerminalFeedback<R, W> {
    fn begin(&mut self, origin: TrackId, track: Option<&TrackInfo>, candidates: usize) -> Result<()> {
        writeln!(self.output, "For the track: {}", describe(origin, track))?;
        writeln!(
            self.output,
            "\nRate {candidates} tracks ({}-{}). Enter 'q' to quit.\n",
            RATING_RANGE.start(),
            RATING_RANGE.end()
        )?;
        Ok(())
    }

    fn rate(&mut self, position: usize, candidate: &Candidate) -> Result<FeedbackResponse> {
        loop {
            write!(
                self.output,
                "Track {}: {} (ID: {}) - Rating ({}-{}): ",
                position + 1,
                candidate.label(),
                candidate.id,
                RATING_RANGE.start(),
                RATING_RANGE.end()
            )?;
            self.output.flush()?;

            let Some(answer) = self.read_line()? else {
                return Ok(FeedbackResponse::Quit);
            };
            if answer.eq_ignore_ascii_case("q") {
                writeln!(self.output, "Exiting feedback collection...")?;
                return Ok(FeedbackResponse::Quit);
            }

            match answer.parse::<i32>() {
                Ok(rating) if RATING_RANGE.contains(&rating) => {
                    return Ok(FeedbackResponse::Rated(rating))
                }
                Ok(_) => writeln!(
                    self.output,
                    "Invalid input! Please enter a number between {} and {}.",
                    RATING_RANGE.start(),
                    RATING_RANGE.end()
                )?,
                Err(_) => writeln!(self.output, "Invalid input! Please enter a valid number.")?,
            }
        }
    }

    fn confirm(&mut self, current: &WeightVector, proposed: &TrainedWeights) -> Result<bool> {
        writeln!(
            self.output,
            "\nTraining finished after {} epochs (best loss {:.6}).",
            proposed.epochs, proposed.best_loss
        )?;
        writeln!(self.output, "{:<24} {:>8}    {:>8}", "Feature", "Old", "New")?;
        for (i, (old, new)) in current
            .as_slice()
            .iter()
            .zip(proposed.weights.as_slice())
            .enumerate()
        {
            let name = self
                .feature_names
                .get(i)
                .map_or_else(|| format!("#{i}"), Clone::clone);
            writeln!(self.output, "{name:<24} {old:>8.4} -> {new:>8.4}")?;
        }

        write!(self.output, "Save the new weights and rebuild the index? [y/N]: ")?;
        self.output.flush()?;

        Ok(self
            .read_line()?
            .is_some_and(|a| a.eq_ignore_ascii_case("y") || a.eq_ignore_ascii_case("yes")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Collecting,
    Training,
    Converged,
    EarlyStopped,
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The user quit before rating every candidate. Nothing was trained.
    Aborted,
    /// Training was cancelled. No weights were produced.
    Cancelled,
    Trained {
        weights: TrainedWeights,
        early_stopped: bool,
        /// Whether the user accepted the new weights.
        confirmed: bool,
    },
}

/// Every candidate's rating, with the training samples derived from them.
#[derive(Debug, Clone, PartialEq)]
pub struct RatedFeedback {
    sample: FeedbackSample,
    origin_features: NormalizedFeatures,
    samples: Vec<TrainingSample>,
}

impl RatedFeedback {
    #[must_use]
    pub fn sample(&self) -> &FeedbackSample {
        &self.sample
    }

    #[must_use]
    pub fn training_samples(&self) -> &[TrainingSample] {
        &self.samples
    }
}

/// One rating-then-training round for an origin track.
pub struct FeedbackSession<'a, S: ?Sized, U: ?Sized> {
    store: &'a S,
    ui: &'a mut U,
    trainer: Trainer,
    state: SessionState,
}

impl<'a, S, U> FeedbackSession<'a, S, U>
where
    S: FeatureStore + TrackCatalog + ?Sized,
    U: FeedbackUi + ?Sized,
{
    pub fn new(store: &'a S, ui: &'a mut U, trainer: Trainer) -> Self {
        Self {
            store,
            ui,
            trainer,
            state: SessionState::Idle,
        }
    }

    /// State reached by the last call to [`FeedbackSession::collect`],
    /// [`FeedbackSession::train`] or [`FeedbackSession::run`].
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Collect ratings for `neighbors` of `origin`, train, and ask for
    /// confirmation.
    ///
    /// Persisting confirmed weights is left to the caller.
    ///
    /// # Errors
    ///
    /// Fails if the origin has no features, or on store, UI or training
    /// errors.
    pub fn run(
        &mut self,
        origin: TrackId,
        neighbors: &[Similar],
        weights: &WeightVector,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        match self.collect(origin, neighbors)? {
            Some(rated) => self.train(&rated, weights, progress, cancel),
            None => Ok(SessionOutcome::Aborted),
        }
    }

    /// Ask the user to rate every neighbor of `origin`.
    ///
    /// `None` means the session was aborted: the user quit, or none of the
    /// rated tracks have features.
    ///
    /// # Errors
    ///
    /// Fails if the origin has no features, or on store or UI errors.
    pub fn collect(&mut self, origin: TrackId, neighbors: &[Similar]) -> Result<Option<RatedFeedback>> {
        self.state = SessionState::Collecting;

        let Some(origin_features) = self.store.normalized_features(origin)? else {
            self.state = SessionState::Idle;
            bail!("Track {origin} has no features to train on");
        };

        let candidates = neighbors
            .iter()
            .map(|n| {
                Ok(Candidate {
                    id: n.id,
                    similarity: n.similarity,
                    track: self.store.track(n.id)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut sample = FeedbackSample::new(origin);
        self.ui
            .begin(origin, self.store.track(origin)?.as_ref(), candidates.len())?;
        for (position, candidate) in candidates.iter().enumerate() {
            match self.ui.rate(position, candidate)? {
                FeedbackResponse::Rated(rating) => sample.rate(candidate.id, rating)?,
                FeedbackResponse::Quit => {
                    info!("Feedback aborted after {position} ratings");
                    self.state = SessionState::Aborted;
                    return Ok(None);
                }
            }
        }
        if !sample.is_complete(&candidates) {
            self.state = SessionState::Aborted;
            return Ok(None);
        }

        let similarity: HashMap<TrackId, f64> =
            neighbors.iter().map(|n| (n.id, n.similarity)).collect();
        let factor = self.trainer.config().adjustment_factor;
        let mut samples = Vec::new();
        for (id, rating) in sample.trainable() {
            let Some(neighbor) = self.store.normalized_features(id)? else {
                warn!("No features for rated track {id}; skipping");
                continue;
            };
            let observed = similarity.get(&id).copied().unwrap_or_default();
            samples.push(TrainingSample {
                neighbor,
                target: target_similarity(observed, rating, factor),
            });
        }
        if samples.is_empty() {
            warn!("None of the rated tracks have features; nothing to train");
            self.state = SessionState::Aborted;
            return Ok(None);
        }

        Ok(Some(RatedFeedback {
            sample,
            origin_features,
            samples,
        }))
    }

    /// Train on collected ratings and ask whether to keep the result.
    ///
    /// # Errors
    ///
    /// Training or UI failures.
    pub fn train(
        &mut self,
        rated: &RatedFeedback,
        weights: &WeightVector,
        progress: &mut dyn ProgressSink,
        cancel: &CancelToken,
    ) -> Result<SessionOutcome> {
        self.state = SessionState::Training;
        let (trained, early_stopped) = match self.trainer.train(
            &rated.origin_features,
            &rated.samples,
            weights,
            progress,
            cancel,
        )? {
            TrainingOutcome::Converged(t) => (t, false),
            TrainingOutcome::EarlyStopped(t) => (t, true),
            TrainingOutcome::Cancelled => {
                self.state = SessionState::Aborted;
                return Ok(SessionOutcome::Cancelled);
            }
        };

        self.state = if early_stopped {
            SessionState::EarlyStopped
        } else {
            SessionState::Converged
        };
        let confirmed = self.ui.confirm(weights, &trained)?;

        Ok(SessionOutcome::Trained {
            weights: trained,
            early_stopped,
            confirmed,
        })
    }
}

/// Persist confirmed weights, then rebuild and atomically replace the index.
///
/// # Errors
///
/// Fails if the weights cannot be saved or the index cannot be rebuilt.
pub fn apply_trained_weights<S: FeatureStore + ?Sized>(
    weight_store: &dyn WeightStore,
    store: &S,
    weights: &WeightVector,
    trees: usize,
    index_path: &Path,
) -> Result<AnnIndex> {
    weight_store.save(weights)?;
    let index = rebuild_index(store, weights, trees, index_path)?;
    info!(
        "Saved new weights and rebuilt the index over {} tracks",
        index.len()
    );
    Ok(index)
}
