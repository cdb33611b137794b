//! Logging/tracing bootstrap shared by every binary in the workspace (spec.md's CLI is an
//! external collaborator, but the subscriber it installs is part of the CORE's ambient stack).

use clap::ValueEnum;
use opentelemetry::trace::TraceId;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Installs a global `tracing` subscriber reading `log_filter` as an `EnvFilter` directive
/// string (e.g. `"info,npm_controllers=debug"`), rendering either human-readable text or
/// one JSON object per line depending on `format`.
pub fn init(log_filter: &str, format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_new(log_filter)
        .map_err(|e| Error::ParseError(format!("invalid log filter {log_filter}: {e}")))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).boxed();
            registry.with(fmt_layer).try_init()
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .boxed();
            registry.with(fmt_layer).try_init()
        }
    }
    .map_err(|e| Error::ParseError(format!("failed to install tracing subscriber: {e}")))
}

/// Reads the OpenTelemetry trace id off the current tracing span, or `TraceId::INVALID` when
/// no tracing pipeline is active (the common case for unit tests and the debug CLI).
pub fn get_trace_id() -> TraceId {
    use tracing_opentelemetry::OpenTelemetrySpanExt;
    tracing::Span::current()
        .context()
        .span()
        .span_context()
        .trace_id()
}
