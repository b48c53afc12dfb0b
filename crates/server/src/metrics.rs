//! Fire-and-forget metrics sink.
//!
//! Workers call [`MetricsSink::record`] outside the success/failure decision
//! path, so a sink can never affect a job's outcome. The default sink emits
//! structured log lines; a real backend plugs in behind the trait.

use std::fmt::Debug;

/// Narrow metrics capability injected into each worker.
pub trait MetricsSink: Send + Sync + Debug {
    fn record(&self, name: &str, value: f64, tags: &[(&str, String)]);
}

/// Sink that writes metrics as debug-level log lines.
#[derive(Debug, Default)]
pub struct LogMetricsSink;

impl MetricsSink for LogMetricsSink {
    fn record(&self, name: &str, value: f64, tags: &[(&str, String)]) {
        let tags: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
        tracing::debug!(metric = %name, value, tags = %tags.join(","), "metric");
    }
}

// ── Test support ────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Sink that captures every recorded metric for assertions.
    #[derive(Debug, Default)]
    pub struct CapturingSink {
        pub recorded: Mutex<Vec<(String, f64)>>,
    }

    impl MetricsSink for CapturingSink {
        fn record(&self, name: &str, value: f64, _tags: &[(&str, String)]) {
            self.recorded.lock().unwrap().push((name.to_string(), value));
        }
    }
}
