mod commands;
mod evaluate;
mod grad_check;
mod print_numbers;
mod train;

use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use commands::{Cli, Commands, DeviceArgs};
use neural::CpuBackend;
use tracing_subscriber::EnvFilter;

/// Runs `$body` with `$backend` bound to the selected compute backend
macro_rules! with_backend {
    ($device:expr, |$backend:ident| $body:expr) => {{
        let device: &DeviceArgs = $device;
        #[cfg(feature = "gpu")]
        {
            if !device.cpu {
                let $backend = Arc::new(neural::GpuContext::new()?);
                return $body;
            }
        }
        #[cfg(not(feature = "gpu"))]
        {
            if !device.cpu {
                tracing::warn!("built without the gpu feature, using the CPU backend");
            }
        }
        let $backend = Arc::new(CpuBackend::new());
        $body
    }};
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train(args) => with_backend!(&args.device, |backend| train::train(backend, &args)),
        Commands::GradCheck {
            epsilon,
            tolerance,
            seed,
            device,
        } => with_backend!(&device, |backend| grad_check::grad_check(
            backend, epsilon, tolerance, seed
        )),
        Commands::Evaluate {
            checkpoint,
            data,
            device,
        } => with_backend!(&device, |backend| evaluate::evaluate(backend, &checkpoint, &data)),
        Commands::PrintNumbers { data, n } => print_numbers::print_numbers(&data, n),
    }
}

