use eyre::{Result, WrapErr, eyre};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize structured logging with JSON output
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install JSON subscriber: {e}"))?;

    tracing::info!("Conduit structured logging initialized");
    Ok(())
}

/// Initialize console-friendly logging for development
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .map_err(|e| eyre!("Failed to install console subscriber: {e}"))?;

    tracing::info!("Conduit console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.pretty().with_ansi(true))
            .try_init()
    };
    installed.map_err(|e| eyre!("Failed to install subscriber: {e}"))?;

    tracing::info!(log_level = level, json_format, include_spans, "Conduit logging initialized");
    Ok(())
}

/// Configure tracing for specific service components
pub fn configure_component_tracing(component: &str) -> tracing::Span {
    tracing::info_span!("component", name = component)
}

/// Create a span covering one dispatched request.
///
/// `dependency`, `fingerprint` and `coalesced` are recorded once known.
pub fn create_dispatch_span(target: &str, capability: &str) -> tracing::Span {
    tracing::info_span!(
        "dispatch",
        request.target = target,
        request.capability = capability,
        dependency = tracing::field::Empty,
        fingerprint = tracing::field::Empty,
        coalesced = tracing::field::Empty,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_is_rejected() {
        assert!(init_tracing_with_config("conduit=notalevel", false, false).is_err());
    }

    #[test]
    fn test_second_install_fails_without_panicking() {
        // whichever call wins, the other must report an error instead of panicking
        let first = init_tracing_with_config("debug", true, true);
        let second = init_tracing_with_config("debug", true, true);
        assert!(first.is_err() || second.is_err());
    }

    #[test]
    fn test_create_dispatch_span() {
        let span = create_dispatch_span("gpt-4o", "chat");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "dispatch");
            assert!(metadata.fields().field("dependency").is_some());
        }
    }

    #[test]
    fn test_configure_component_tracing() {
        let span = configure_component_tracing("pool");
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "component");
        }
    }
}
