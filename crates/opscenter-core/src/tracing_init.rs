//! Process-wide tracing subscriber.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter`. With `log_json` every event is a
/// single JSON object with its fields flattened to the top level, ready for
/// log aggregation.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);
    let fmt = tracing_subscriber::fmt::layer().with_target(true);

    if log_json {
        registry
            .with(fmt.json().flatten_event(true).with_current_span(true))
            .init();
    } else {
        registry.with(fmt).init();
    }
}
