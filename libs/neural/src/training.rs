//! Training loop: slice selection, stopping conditions and progress reporting

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, info, info_span};

use crate::backend::Backend;
use crate::config::StoppingMode;
use crate::error::{NeuralError, Result};
use crate::matrix::Matrix;
use crate::network::{Network, NetworkState};
use crate::optimizer::Optimizer;

/// Minimum-cost threshold active when no other limit is configured
pub const DEFAULT_MIN_COST: f32 = 0.001;

/// Chooses the training data used by each iteration
pub trait SliceSelector<B: Backend> {
    /// Inputs and labels of the current slice
    fn current(&self) -> (&Matrix<B>, &Matrix<B>);

    /// Move to the next slice. Returns `false` when the current slice is
    /// guaranteed to be unchanged.
    fn advance(&mut self) -> bool;
}

fn check_pair<B: Backend>(op: &'static str, x: &Matrix<B>, y: &Matrix<B>) -> Result<()> {
    if x.columns() != y.columns() {
        return Err(NeuralError::shape(
            op,
            format!(
                "{} input samples but {} label samples",
                x.columns(),
                y.columns()
            ),
        ));
    }
    Ok(())
}

/// Every iteration trains on the whole data set
pub struct FullBatch<B: Backend> {
    x: Matrix<B>,
    y: Matrix<B>,
}

impl<B: Backend> FullBatch<B> {
    pub fn new(x: Matrix<B>, y: Matrix<B>) -> Result<Self> {
        check_pair("full_batch", &x, &y)?;
        Ok(Self { x, y })
    }
}

impl<B: Backend> SliceSelector<B> for FullBatch<B> {
    fn current(&self) -> (&Matrix<B>, &Matrix<B>) {
        (&self.x, &self.y)
    }

    fn advance(&mut self) -> bool {
        false
    }
}

/// Contiguous fixed-size column blocks, one drawn uniformly at random (with
/// replacement) per iteration. Samples past the last full block are dropped.
pub struct MiniBatches<B: Backend, R: Rng> {
    batches: Vec<(Matrix<B>, Matrix<B>)>,
    current: usize,
    rng: R,
}

impl<B: Backend, R: Rng> MiniBatches<B, R> {
    pub fn new(x: &Matrix<B>, y: &Matrix<B>, batch_size: usize, mut rng: R) -> Result<Self> {
        check_pair("mini_batches", x, y)?;
        let samples = x.columns();
        if batch_size == 0 || batch_size > samples {
            return Err(NeuralError::Configuration(format!(
                "mini-batch size must be in 1..={samples}, got {batch_size}"
            )));
        }

        let (x_data, y_data) = (x.data()?, y.data()?);
        let count = samples / batch_size;
        let batches = (0..count)
            .map(|b| {
                let columns = b * batch_size..(b + 1) * batch_size;
                let xb = column_block(&x_data, x.rows(), samples, columns.clone());
                let yb = column_block(&y_data, y.rows(), samples, columns);
                Ok((
                    Matrix::from_data(x.backend(), x.rows(), batch_size, &xb)?,
                    Matrix::from_data(y.backend(), y.rows(), batch_size, &yb)?,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        let current = rng.random_range(0..count);
        debug!(count, batch_size, dropped = samples % batch_size, "partitioned mini-batches");
        Ok(Self {
            batches,
            current,
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn batches(&self) -> &[(Matrix<B>, Matrix<B>)] {
        &self.batches
    }

    pub fn current_index(&self) -> usize {
        self.current
    }
}

impl<B: Backend, R: Rng> SliceSelector<B> for MiniBatches<B, R> {
    fn current(&self) -> (&Matrix<B>, &Matrix<B>) {
        let (x, y) = &self.batches[self.current];
        (x, y)
    }

    fn advance(&mut self) -> bool {
        let next = self.rng.random_range(0..self.batches.len());
        let changed = next != self.current;
        self.current = next;
        changed
    }
}

/// Row-major copy of `columns` out of a `rows x width` row-major array
fn column_block(data: &[f32], rows: usize, width: usize, columns: std::ops::Range<usize>) -> Vec<f32> {
    let mut block = Vec::with_capacity(rows * columns.len());
    for row in 0..rows {
        let start = row * width;
        block.extend_from_slice(&data[start + columns.start..start + columns.end]);
    }
    block
}

/// Why a training run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MinCost,
    MaxIterations,
    MaxTime,
}

/// Limits checked between iterations; training stops when any one trips.
///
/// The minimum-cost limit starts at [`DEFAULT_MIN_COST`]. Setting an
/// iteration or time limit disables that default unless a minimum cost was
/// set explicitly.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppingCriteria {
    max_iterations: Option<usize>,
    max_time: Option<Duration>,
    min_cost: Option<f32>,
    min_cost_explicit: bool,
}

impl Default for StoppingCriteria {
    fn default() -> Self {
        Self {
            max_iterations: None,
            max_time: None,
            min_cost: Some(DEFAULT_MIN_COST),
            min_cost_explicit: false,
        }
    }
}

impl StoppingCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = Some(iterations);
        self.drop_default_min_cost();
        self
    }

    pub fn with_max_time(mut self, limit: Duration) -> Self {
        self.max_time = Some(limit);
        self.drop_default_min_cost();
        self
    }

    pub fn with_min_cost(mut self, cost: f32) -> Self {
        self.min_cost = Some(cost);
        self.min_cost_explicit = true;
        self
    }

    fn drop_default_min_cost(&mut self) {
        if !self.min_cost_explicit {
            self.min_cost = None;
        }
    }

    /// Build criteria from a single mode and value pair, as found in
    /// hyperparameter files
    pub fn from_mode(mode: StoppingMode, value: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(NeuralError::Configuration(format!(
                "stopping value must be finite and >= 0, got {value}"
            )));
        }
        match mode {
            StoppingMode::MaxIterations => {
                if value < 1.0 || value.fract() != 0.0 {
                    return Err(NeuralError::Configuration(format!(
                        "max_iterations must be a positive whole number, got {value}"
                    )));
                }
                Ok(Self::new().with_max_iterations(value as usize))
            }
            StoppingMode::MaxTime => {
                if value == 0.0 {
                    return Err(NeuralError::Configuration(
                        "max_time must be > 0 seconds".to_string(),
                    ));
                }
                Ok(Self::new().with_max_time(Duration::from_secs_f64(value)))
            }
            StoppingMode::MinCost => Ok(Self::new().with_min_cost(value as f32)),
        }
    }

    pub fn max_iterations(&self) -> Option<usize> {
        self.max_iterations
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time
    }

    pub fn min_cost(&self) -> Option<f32> {
        self.min_cost
    }

    /// First limit reached, checking cost, then iterations, then time
    pub fn check(&self, iteration: usize, elapsed: Duration, training_cost: f32) -> Option<StopReason> {
        if self.min_cost.is_some_and(|min| training_cost <= min) {
            return Some(StopReason::MinCost);
        }
        if self.max_iterations.is_some_and(|max| iteration >= max) {
            return Some(StopReason::MaxIterations);
        }
        if self.max_time.is_some_and(|max| elapsed >= max) {
            return Some(StopReason::MaxTime);
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Idle,
    Running,
    /// Stopped on the minimum-cost limit
    Converged,
    /// Stopped on an iteration or time limit, or by an error
    Stopped,
}

/// Snapshot handed to the progress callback
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingProgress {
    pub iteration: usize,
    pub training_cost: f32,
    pub testing_cost: Option<f32>,
    pub elapsed_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingOutcome {
    pub progress: TrainingProgress,
    pub reason: StopReason,
}

/// Receives training events
pub trait TrainingCallback<B: Backend> {
    /// Called once before the first iteration and after every iteration
    fn on_progress(&mut self, network: &Network<B>, progress: &TrainingProgress);

    /// Called when training stops
    fn on_training_end(&mut self, _network: &Network<B>, _outcome: &TrainingOutcome) {}
}

impl<B, F> TrainingCallback<B> for F
where
    B: Backend,
    F: FnMut(&Network<B>, &TrainingProgress),
{
    fn on_progress(&mut self, network: &Network<B>, progress: &TrainingProgress) {
        self(network, progress)
    }
}

/// Drives forward, backward and descend until a stopping condition trips
pub struct TrainingScheme<B: Backend, S: SliceSelector<B>> {
    selector: S,
    stopping: StoppingCriteria,
    testing: Option<(Matrix<B>, Matrix<B>)>,
    phase: TrainingPhase,
}

impl<B: Backend, S: SliceSelector<B>> TrainingScheme<B, S> {
    pub fn new(selector: S, stopping: StoppingCriteria) -> Self {
        Self {
            selector,
            stopping,
            testing: None,
            phase: TrainingPhase::Idle,
        }
    }

    /// Held-out data whose cost is reported every iteration
    pub fn with_testing_data(mut self, x: Matrix<B>, y: Matrix<B>) -> Result<Self> {
        check_pair("testing_data", &x, &y)?;
        self.testing = Some((x, y));
        Ok(self)
    }

    pub fn phase(&self) -> TrainingPhase {
        self.phase
    }

    pub fn stopping(&self) -> &StoppingCriteria {
        &self.stopping
    }

    pub fn selector(&self) -> &S {
        &self.selector
    }

    /// Return a finished scheme to `Idle` so it can train again
    pub fn reset(&mut self) {
        self.phase = TrainingPhase::Idle;
    }

    pub fn train<O, C>(&mut self, network: &mut Network<B>, optimizer: &mut O, callback: &mut C) -> Result<TrainingOutcome>
    where
        O: Optimizer<B>,
        C: TrainingCallback<B> + ?Sized,
    {
        if self.phase != TrainingPhase::Idle {
            return Err(NeuralError::State(format!(
                "training scheme is {:?}, expected Idle",
                self.phase
            )));
        }
        let span = info_span!("train", backend = %network.backend().name());
        let _guard = span.enter();

        self.phase = TrainingPhase::Running;
        let result = self.run(network, optimizer, callback);
        self.phase = match &result {
            Ok(outcome) if outcome.reason == StopReason::MinCost => TrainingPhase::Converged,
            _ => TrainingPhase::Stopped,
        };

        match &result {
            Ok(outcome) => info!(
                reason = ?outcome.reason,
                iterations = outcome.progress.iteration,
                cost = outcome.progress.training_cost,
                "training finished"
            ),
            Err(e) => info!(error = %e, "training aborted"),
        }
        result
    }

    fn run<O, C>(&mut self, network: &mut Network<B>, optimizer: &mut O, callback: &mut C) -> Result<TrainingOutcome>
    where
        O: Optimizer<B>,
        C: TrainingCallback<B> + ?Sized,
    {
        let start = Instant::now();
        info!(stopping = ?self.stopping, testing = self.testing.is_some(), "training started");

        let mut progress = TrainingProgress {
            iteration: 0,
            training_cost: self.training_cost(network)?,
            testing_cost: self.testing_cost(network)?,
            elapsed_seconds: start.elapsed().as_secs_f64(),
        };
        // the testing pass replaced the cached forward
        let mut fresh = self.testing.is_none();
        callback.on_progress(network, &progress);

        loop {
            if let Some(reason) = self.stopping.check(progress.iteration, start.elapsed(), progress.training_cost) {
                let outcome = TrainingOutcome { progress, reason };
                callback.on_training_end(network, &outcome);
                return Ok(outcome);
            }

            let (x, y) = self.selector.current();
            if !fresh || !matches!(network.state(), NetworkState::ForwardComputed { batch_width } if batch_width == x.columns()) {
                network.forward(x)?;
            }
            network.cost_prime(x, y)?;
            let (weights, gradients) = network.weights_and_gradients_mut();
            optimizer.descend(weights, gradients)?;

            let testing_cost = self.testing_cost(network)?;
            let training_cost = self.training_cost(network)?;
            progress = TrainingProgress {
                iteration: progress.iteration + 1,
                training_cost,
                testing_cost,
                elapsed_seconds: start.elapsed().as_secs_f64(),
            };
            debug!(
                iteration = progress.iteration,
                training_cost,
                testing_cost = ?testing_cost,
                "iteration complete"
            );
            callback.on_progress(network, &progress);

            fresh = !self.selector.advance();
        }
    }

    fn training_cost(&self, network: &mut Network<B>) -> Result<f32> {
        let (x, y) = self.selector.current();
        network.evaluate_cost(x, y)
    }

    fn testing_cost(&self, network: &mut Network<B>) -> Result<Option<f32>> {
        self.testing
            .as_ref()
            .map(|(x, y)| network.evaluate_cost(x, y))
            .transpose()
    }
}
