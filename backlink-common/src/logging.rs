use std::sync::Arc;

use anyhow::{Context, Result};
use time::format_description;
use time::UtcOffset;
use tracing_log::LogTracer;
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console logging for the binaries. `RUST_LOG` wins; otherwise the
/// verbosity count picks the default filter.
pub fn init_logging(debug: u8) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        let default = match debug {
            0 => "info",
            1 => "debug",
            _ => "debug,russh=trace",
        };
        std::env::set_var("RUST_LOG", default);
    }

    LogTracer::init().context("initializing log compatibility layer")?;

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let env_filter = Arc::new(EnvFilter::from_default_env());

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_timer(OffsetTime::new(
            offset,
            format_description::parse("[year]-[month]-[day] [hour]:[minute]:[second]")
                .context("parsing log timestamp format")?,
        ))
        .with_filter(dynamic_filter_fn(move |metadata, cx| {
            env_filter.enabled(metadata, cx.clone())
        }));

    tracing_subscriber::registry().with(fmt_layer).init();
    Ok(())
}
