use std::error::Error;
use std::sync::Arc;

use neural::{Backend, GradCheck, Matrix, Network, TrainingConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Check a seeded 2-5-1 network on one random sample with target 1
pub fn grad_check<B: Backend>(backend: Arc<B>, epsilon: f32, tolerance: f32, seed: u64) -> Result<(), Box<dyn Error>> {
    let config = TrainingConfig::tiny().network_config(2, 1);
    let mut rng = StdRng::seed_from_u64(seed);
    let mut network = Network::new(&backend, config, &mut rng)?;
    let x = Matrix::from_fn(&backend, 2, 1, |_, _| rng.random_range(0.0..1.0))?;
    let y = Matrix::from_data(&backend, 1, 1, &[1.0])?;

    let results = GradCheck::new(epsilon, tolerance).run(&mut network, &x, &y)?;
    for result in &results {
        println!("{result}");
    }

    if results.iter().all(|r| r.passed) {
        println!("gradient check passed on {}", backend.name());
        Ok(())
    } else {
        Err("gradient check failed".into())
    }
}
