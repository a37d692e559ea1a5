//! Global subscriber assembly. The OTLP variant in `otel` stacks its span
//! layer on the same filter and fmt layer.

use tracing::Subscriber;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_DIRECTIVES: &str = "info";

/// `RUST_LOG` when it parses, otherwise `info`.
pub fn env_filter() -> EnvFilter {
    filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .map(str::trim)
        .filter(|directives| !directives.is_empty())
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// Line-oriented or JSON log output, without targets.
pub fn fmt_layer<S>(json_logs: bool) -> Box<dyn Layer<S> + Send + Sync + 'static>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let layer = tracing_subscriber::fmt::layer().with_target(false);
    if json_logs {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Installs the global subscriber.
pub fn init_tracing(json_logs: bool) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt_layer(json_logs))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tracing_subscriber::Registry;
    use tracing_subscriber::layer::SubscriberExt as _;

    use super::*;

    #[test]
    fn filter_falls_back_to_info_for_missing_or_bad_directives() {
        assert_eq!(filter_from(None).to_string(), "info");
        assert_eq!(filter_from(Some("  ")).to_string(), "info");
        assert_eq!(filter_from(Some("creditgate=verbose")).to_string(), "info");
        assert_eq!(
            filter_from(Some("creditgate=debug")).to_string(),
            "creditgate=debug"
        );
    }

    #[test]
    fn both_output_modes_record_events() {
        for json_logs in [false, true] {
            let subscriber = Registry::default().with(fmt_layer(json_logs));
            tracing::subscriber::with_default(subscriber, || {
                tracing::info!(json_logs, "log line");
            });
        }
    }
}
