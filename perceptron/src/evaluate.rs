use std::error::Error;
use std::sync::Arc;

use neural::{Backend, Checkpoint, MnistBatch};

use crate::commands::DataArgs;

pub fn evaluate<B: Backend>(backend: Arc<B>, checkpoint: &std::path::Path, data: &DataArgs) -> Result<(), Box<dyn Error>> {
    let mut network = Checkpoint::load(checkpoint)?.restore(&backend)?;
    let digits = common::load_mnist(&data.images, &data.labels)?;
    let batch = MnistBatch::new(&backend, &digits)?;

    let cost = network.evaluate_cost(&batch.x, &batch.y)?;
    let accuracy = batch.accuracy(&mut network)?;
    println!("samples: {}", batch.len());
    println!("cost: {cost:.6}");
    println!("accuracy: {:.2}%", accuracy * 100.0);
    Ok(())
}
