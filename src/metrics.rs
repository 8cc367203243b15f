//! Prometheus metrics and tracing spans for migration runs
//!
//! Metrics live in a private registry; [`render`] produces the text
//! exposition format, suitable for a node-exporter textfile collector.

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::time::Duration;

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<LockstepMetrics> = Lazy::new(LockstepMetrics::init);

#[cfg(feature = "metrics")]
pub struct LockstepMetrics {
    registry: Registry,
    pub applied_total: IntCounter,
    pub rolled_back_total: IntCounter,
    pub failures_total: IntCounter,
    pub lock_contention_total: IntCounter,
    pub script_duration: Histogram,
}

#[cfg(feature = "metrics")]
impl LockstepMetrics {
    pub fn init() -> Self {
        let registry = Registry::new_custom(Some("lockstep".to_string()), None)
            .unwrap_or_else(|e| panic!("failed to create metrics registry: {e}"));

        let applied_total = counter("migrations_applied_total", "Migration scripts applied");
        let rolled_back_total = counter("migrations_rolled_back_total", "Migrations rolled back");
        let failures_total = counter("migration_failures_total", "Migrate or rollback runs that failed");
        let lock_contention_total = counter(
            "lock_contention_total",
            "Runs that found the migration lock held by another session",
        );
        let script_duration = Histogram::with_opts(
            HistogramOpts::new("script_duration_seconds", "Time to run one script and update the ledger")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0]),
        )
        .unwrap_or_else(|e| panic!("invalid histogram options: {e}"));

        for collector in [
            Box::new(applied_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(rolled_back_total.clone()),
            Box::new(failures_total.clone()),
            Box::new(lock_contention_total.clone()),
            Box::new(script_duration.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                log::warn!("Failed to register metric: {}", e);
            }
        }

        Self {
            registry,
            applied_total,
            rolled_back_total,
            failures_total,
            lock_contention_total,
            script_duration,
        }
    }

    pub fn record_applied(&self, elapsed: Duration) {
        self.applied_total.inc();
        self.script_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_rolled_back(&self, elapsed: Duration) {
        self.rolled_back_total.inc();
        self.script_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self) {
        self.failures_total.inc();
    }

    pub fn record_lock_contention(&self) {
        self.lock_contention_total.inc();
    }

    /// Text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(feature = "metrics")]
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("invalid counter {name}: {e}"))
}

/// Render the global metrics
#[cfg(feature = "metrics")]
pub fn render() -> Result<String, prometheus::Error> {
    METRICS.render()
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn connect_span() -> Span {
        info_span!("lockstep.connect")
    }

    /// Statement text is truncated; scripts can be large
    pub fn statement_span(sql: &str) -> Span {
        let statement: String = sql.trim().chars().take(120).collect();
        info_span!("lockstep.statement", db.statement = %statement)
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("lockstep.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("lockstep.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("lockstep.transaction.rollback")
    }

    pub fn acquire_lock_span(key: i64) -> Span {
        info_span!("lockstep.lock.acquire", lock.key = key)
    }

    pub fn migrate_span() -> Span {
        info_span!("lockstep.migrate")
    }

    pub fn apply_span(script: &str) -> Span {
        info_span!("lockstep.apply", migration.script = script)
    }

    pub fn rollback_span() -> Span {
        info_span!("lockstep.rollback")
    }
}
