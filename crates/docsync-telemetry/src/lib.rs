//! OpenTelemetry integration for docsync.
//!
//! Provides the OTel tracing layer and a sampler with per-category rates, so
//! the reconcile path is always traced while the fetch loop (which fires
//! every few seconds whether or not anything changed) stays quiet.
//!
//! # Activation
//!
//! Build with the `telemetry` feature. Export then activates when standard
//! OTel environment variables are set:
//!
//! ```bash
//! OTEL_EXPORTER_OTLP_ENDPOINT=http://localhost:4317 docsync watch doc.json log.json
//! ```
//!
//! Set `OTEL_SDK_DISABLED=true` to disable even when the endpoint is set.

#[cfg(feature = "telemetry")]
mod otel;

#[cfg(feature = "telemetry")]
pub use otel::{OtelGuard, otel_layer};

/// Check whether OTel export should be enabled.
///
/// True when `OTEL_SDK_DISABLED` is not `"true"` and either
/// `OTEL_EXPORTER_OTLP_ENDPOINT` is set or `OTEL_TRACES_EXPORTER` is set to
/// something other than `"none"`.
pub fn otel_enabled() -> bool {
    enabled_from(|key| std::env::var(key).ok())
}

fn enabled_from(var: impl Fn(&str) -> Option<String>) -> bool {
    // Explicit disable takes priority
    if var("OTEL_SDK_DISABLED").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
        return false;
    }

    if var("OTEL_EXPORTER_OTLP_ENDPOINT").is_some() {
        return true;
    }

    match var("OTEL_TRACES_EXPORTER") {
        Some(exporter) => !exporter.eq_ignore_ascii_case("none"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_disabled_without_env() {
        assert!(!enabled_from(env(&[])));
    }

    #[test]
    fn test_endpoint_enables() {
        assert!(enabled_from(env(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317")])));
    }

    #[test]
    fn test_sdk_disabled_wins() {
        assert!(!enabled_from(env(&[
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://localhost:4317"),
            ("OTEL_SDK_DISABLED", "TRUE"),
        ])));
    }

    #[test]
    fn test_traces_exporter_none() {
        assert!(!enabled_from(env(&[("OTEL_TRACES_EXPORTER", "none")])));
        assert!(enabled_from(env(&[("OTEL_TRACES_EXPORTER", "otlp")])));
    }
}
