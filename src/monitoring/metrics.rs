use crate::healthcheck::models::CheckItem;
use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts,
    Registry,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Prometheus metrics of the diagnosis engine
#[derive(Debug)]
pub struct HealthcheckMetrics {
    registry: Arc<Registry>,

    // Admission
    pub runs_started_total: IntCounter,
    pub admission_conflicts_total: IntCounter,

    // Runs
    pub runs_in_flight: IntGauge,
    pub runs_succeeded_total: IntCounter,
    pub runs_failed_total: IntCounter,
    pub run_duration_seconds: Histogram,
    pub close_failures_total: IntCounter,

    // Scores of the last finished run
    pub item_score: IntGaugeVec,
    pub weighted_average_score: IntGauge,
}

impl HealthcheckMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let runs_started_total = IntCounter::with_opts(Opts::new(
            "healthcheck_runs_started_total",
            "Total number of admitted healthcheck runs",
        ))?;
        registry.register(Box::new(runs_started_total.clone()))?;

        let admission_conflicts_total = IntCounter::with_opts(Opts::new(
            "healthcheck_admission_conflicts_total",
            "Checks rejected because a run was already active for the target",
        ))?;
        registry.register(Box::new(admission_conflicts_total.clone()))?;

        let runs_in_flight = IntGauge::with_opts(Opts::new(
            "healthcheck_runs_in_flight",
            "Number of healthcheck runs currently executing",
        ))?;
        registry.register(Box::new(runs_in_flight.clone()))?;

        let runs_succeeded_total = IntCounter::with_opts(Opts::new(
            "healthcheck_runs_succeeded_total",
            "Total number of healthcheck runs that succeeded",
        ))?;
        registry.register(Box::new(runs_succeeded_total.clone()))?;

        let runs_failed_total = IntCounter::with_opts(Opts::new(
            "healthcheck_runs_failed_total",
            "Total number of healthcheck runs that failed",
        ))?;
        registry.register(Box::new(runs_failed_total.clone()))?;

        let run_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "healthcheck_run_duration_seconds",
                "Duration of healthcheck runs in seconds",
            )
            .buckets(exponential_buckets(0.1, 2.0, 12)?),
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        let close_failures_total = IntCounter::with_opts(Opts::new(
            "healthcheck_close_failures_total",
            "Total number of per-run connections that failed to close",
        ))?;
        registry.register(Box::new(close_failures_total.clone()))?;

        let item_score = IntGaugeVec::new(
            Opts::new(
                "healthcheck_item_score",
                "Score of each check item in the last finished run",
            ),
            &["item"],
        )?;
        registry.register(Box::new(item_score.clone()))?;

        let weighted_average_score = IntGauge::with_opts(Opts::new(
            "healthcheck_weighted_average_score",
            "Weighted average score of the last finished run",
        ))?;
        registry.register(Box::new(weighted_average_score.clone()))?;

        Ok(Self {
            registry,
            runs_started_total,
            admission_conflicts_total,
            runs_in_flight,
            runs_succeeded_total,
            runs_failed_total,
            run_duration_seconds,
            close_failures_total,
            item_score,
            weighted_average_score,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn record_item_score(&self, item: CheckItem, score: i32) {
        self.item_score
            .with_label_values(&[item.item_name()])
            .set(i64::from(score));
    }

    /// Record a finished run with timing
    pub fn record_run(&self, start_time: Instant, weighted_average_score: Option<i32>) {
        let duration = start_time.elapsed().as_secs_f64();
        self.run_duration_seconds.observe(duration);

        match weighted_average_score {
            Some(score) => {
                self.runs_succeeded_total.inc();
                self.weighted_average_score.set(i64::from(score));
                info!("Recorded successful healthcheck run in {:.3}s", duration);
            }
            None => {
                self.runs_failed_total.inc();
                warn!("Recorded failed healthcheck run after {:.3}s", duration);
            }
        }
    }

    pub fn record_close_failures(&self, count: usize) {
        self.close_failures_total.inc_by(count as u64);
    }

    /// Get metrics in Prometheus text format
    pub fn gather_text(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

/// Keeps the in-flight gauge raised for the lifetime of one run.
pub struct RunTimer {
    start: Instant,
    metrics: Arc<HealthcheckMetrics>,
}

impl RunTimer {
    pub fn new(metrics: Arc<HealthcheckMetrics>) -> Self {
        metrics.runs_in_flight.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        self.metrics.runs_in_flight.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_render_in_text_format() {
        let metrics = HealthcheckMetrics::new().unwrap();
        metrics.runs_started_total.inc();
        metrics.record_item_score(CheckItem::CpuUsage, 90);
        metrics.record_run(Instant::now(), Some(87));
        metrics.record_close_failures(2);

        let text = metrics.gather_text();
        assert!(text.contains("healthcheck_runs_started_total 1"));
        assert!(text.contains(r#"healthcheck_item_score{item="cpu_usage"} 90"#));
        assert!(text.contains("healthcheck_weighted_average_score 87"));
        assert!(text.contains("healthcheck_close_failures_total 2"));
    }

    #[test]
    fn test_run_timer_tracks_in_flight_runs() {
        let metrics = Arc::new(HealthcheckMetrics::new().unwrap());
        {
            let _timer = RunTimer::new(metrics.clone());
            assert_eq!(metrics.runs_in_flight.get(), 1);
        }
        assert_eq!(metrics.runs_in_flight.get(), 0);
    }

    #[test]
    fn test_failed_run_is_counted() {
        let metrics = HealthcheckMetrics::new().unwrap();
        metrics.record_run(Instant::now(), None);
        assert_eq!(metrics.runs_failed_total.get(), 1);
        assert_eq!(metrics.runs_succeeded_total.get(), 0);
    }
}
