use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::CLASSES;
use neural::{
    Backend, Checkpoint, FullBatch, GradientDescent, MiniBatches, MnistBatch, Network,
    SliceSelector, TrainingCallback, TrainingOutcome, TrainingProgress, TrainingScheme,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::commands::TrainArgs;

/// Prints CSV progress lines and writes periodic checkpoints
struct ProgressReporter {
    checkpoint_dir: Option<PathBuf>,
    checkpoint_every: usize,
}

impl ProgressReporter {
    fn save<B: Backend>(&self, network: &Network<B>, iteration: usize) {
        let Some(dir) = &self.checkpoint_dir else { return };
        let path = dir.join(format!("network{iteration}.json"));
        let saved = Checkpoint::capture(network, iteration).and_then(|c| c.save(&path));
        if let Err(e) = saved {
            warn!(path = %path.display(), error = %e, "failed to write checkpoint");
        }
    }
}

impl<B: Backend> TrainingCallback<B> for ProgressReporter {
    fn on_progress(&mut self, network: &Network<B>, progress: &TrainingProgress) {
        let testing = progress.testing_cost.map(|c| c.to_string()).unwrap_or_default();
        println!(
            "{},{},{},{:.3}",
            progress.iteration, progress.training_cost, testing, progress.elapsed_seconds
        );
        if progress.iteration > 0 && progress.iteration % self.checkpoint_every.max(1) == 0 {
            self.save(network, progress.iteration);
        }
    }

    fn on_training_end(&mut self, network: &Network<B>, outcome: &TrainingOutcome) {
        self.save(network, outcome.progress.iteration);
    }
}

/// Load an IDX pair and upload the leading `proportion` of it
fn load_batch<B: Backend>(
    backend: &Arc<B>,
    images: &Path,
    labels: &Path,
    proportion: f32,
) -> Result<MnistBatch<B>, Box<dyn Error>> {
    let digits = common::load_mnist(images, labels)?;
    Ok(MnistBatch::new(backend, common::split(&digits, proportion))?)
}

pub fn train<B: Backend>(backend: Arc<B>, args: &TrainArgs) -> Result<(), Box<dyn Error>> {
    let config = args.training_config()?;
    if let Some(dir) = &args.checkpoint_dir {
        std::fs::create_dir_all(dir)?;
    }

    let training = load_batch(
        &backend,
        &args.data.images,
        &args.data.labels,
        config.sample_proportion,
    )?;
    let testing = match (&args.test_images, &args.test_labels) {
        (Some(images), Some(labels)) => {
            Some(load_batch(&backend, images, labels, config.sample_proportion)?)
        }
        _ => None,
    };
    info!(
        samples = training.len(),
        testing = testing.as_ref().map_or(0, MnistBatch::len),
        backend = %backend.name(),
        "loaded data"
    );

    let mut rng = StdRng::seed_from_u64(config.seed);
    let network_config = config.network_config(training.x.rows(), CLASSES);
    let mut network = Network::new(&backend, network_config, &mut rng)?;
    let mut optimizer = GradientDescent::new(config.learning_rate)?;
    let stopping = config.stopping_criteria()?;
    let mut reporter = ProgressReporter {
        checkpoint_dir: args.checkpoint_dir.clone(),
        checkpoint_every: args.checkpoint_every,
    };

    println!("iteration,training_cost,testing_cost,elapsed");
    let outcome = if config.use_stochastic {
        let selector = MiniBatches::new(&training.x, &training.y, config.mini_batch_size, rng)?;
        let scheme = with_testing(TrainingScheme::new(selector, stopping), testing.as_ref())?;
        run(scheme, &mut network, &mut optimizer, &mut reporter)?
    } else {
        let selector = FullBatch::new(training.x.try_clone()?, training.y.try_clone()?)?;
        let scheme = with_testing(TrainingScheme::new(selector, stopping), testing.as_ref())?;
        run(scheme, &mut network, &mut optimizer, &mut reporter)?
    };
    info!(reason = ?outcome.reason, iterations = outcome.progress.iteration, "stopped");

    let (label, batch) = match &testing {
        Some(batch) => ("test", batch),
        None => ("training", &training),
    };
    let accuracy = batch.accuracy(&mut network)?;
    println!("{label} accuracy: {:.2}%", accuracy * 100.0);
    Ok(())
}

fn with_testing<B: Backend, S: SliceSelector<B>>(
    scheme: TrainingScheme<B, S>,
    testing: Option<&MnistBatch<B>>,
) -> neural::Result<TrainingScheme<B, S>> {
    match testing {
        Some(batch) => scheme.with_testing_data(batch.x.try_clone()?, batch.y.try_clone()?),
        None => Ok(scheme),
    }
}

fn run<B: Backend, S: SliceSelector<B>>(
    mut scheme: TrainingScheme<B, S>,
    network: &mut Network<B>,
    optimizer: &mut GradientDescent,
    reporter: &mut ProgressReporter,
) -> neural::Result<TrainingOutcome> {
    scheme.train(network, optimizer, reporter)
}
