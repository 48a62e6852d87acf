use maestro_core::{MaestroError, MaestroResult};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Output format of the process-wide subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line human-readable output.
    Compact,
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default `info` filter.
///
/// Fails with [`MaestroError::Config`] if a global subscriber is already set.
pub fn init_tracing(format: TelemetryFormat) -> MaestroResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match format {
        TelemetryFormat::Json => builder.json().try_init(),
        TelemetryFormat::Pretty => builder.pretty().try_init(),
        TelemetryFormat::Compact => builder.compact().try_init(),
    };
    result.map_err(|e| MaestroError::Config(format!("failed to install tracing subscriber: {e}")))
}
