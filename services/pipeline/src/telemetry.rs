//! Tracing setup shared by the orchestrator and the shard processes.

use crate::config::{LogFormat, ServiceConfig};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber.
///
/// `RUST_LOG` overrides the configured level. Shard processes additionally
/// write JSON lines to a daily rotated `{log_dir}/shard-{index}.log` when a
/// log directory is configured; keep the returned guard alive until exit
/// or buffered lines are lost.
pub fn init_tracing(
    service: &ServiceConfig,
    shard: Option<u32>,
) -> Result<Option<WorkerGuard>, tracing_subscriber::util::TryInitError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&service.log_level));

    let mut layers: Vec<BoxedLayer> = Vec::new();
    layers.push(match service.log_format {
        LogFormat::Json => fmt::layer().json().with_thread_names(true).boxed(),
        LogFormat::Pretty => fmt::layer().with_thread_names(true).boxed(),
    });

    let guard = match (&service.log_dir, shard) {
        (Some(dir), Some(index)) => {
            let appender = tracing_appender::rolling::daily(dir, format!("shard-{index}.log"));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            layers.push(
                fmt::layer()
                    .json()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed(),
            );
            Some(guard)
        }
        _ => None,
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()?;

    Ok(guard)
}
