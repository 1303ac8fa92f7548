use std::sync::Arc;

use awareness_operator::{Affinity, Endpoint, NativeBackend, OperatorConfig, Provider, Scalar};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Affinity 0: mean of three parameters. Affinity 1: spread (max - min) of two.
struct Statistics;

impl Endpoint for Statistics {
    fn affinities(&self) -> Vec<Affinity> {
        vec![
            Affinity {
                inputs: 3,
                outputs: 1,
            },
            Affinity {
                inputs: 2,
                outputs: 1,
            },
        ]
    }

    fn process_data(&self, index: u8, inputs: &[Scalar]) -> anyhow::Result<Vec<Scalar>> {
        match index {
            0 => Ok(vec![inputs.iter().sum::<Scalar>() / inputs.len() as Scalar]),
            1 => Ok(vec![(inputs[0] - inputs[1]).abs()]),
            _ => anyhow::bail!("unknown affinity {index}"),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,awareness_operator=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => OperatorConfig::load(path)?,
        None => OperatorConfig::default(),
    };

    let backend = NativeBackend::new(config.net.clone(), &config.server)?;
    let provider = Provider::bind(Arc::new(Statistics), backend, &config)?;
    tracing::info!(
        addr = %provider.local_addr()?,
        workers = config.server.workers,
        "statistics operator ready"
    );
    provider.serve()?;

    Ok(())
}
