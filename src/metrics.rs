//! Prometheus metrics shared by the API server and the worker

use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

pub struct Metrics {
    registry: Registry,

    pub http_requests_total: IntCounter,
    pub http_requests_in_flight: IntGauge,
    pub http_request_duration_seconds: Histogram,

    pub jobs_submitted_total: IntCounterVec,
    pub admission_rejections_total: IntCounterVec,
    pub jobs_finished_total: IntCounterVec,
    pub jobs_running: IntGauge,

    pub live_bot_cycles_total: IntCounter,
    pub live_bot_order_failures_total: IntCounter,
    pub backtest_duration_seconds: Histogram,

    pub database_connected: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total =
            IntCounter::new("http_requests_total", "Total HTTP requests served")?;
        let http_requests_in_flight =
            IntGauge::new("http_requests_in_flight", "HTTP requests currently in flight")?;
        let http_request_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "http_request_duration_seconds",
            "HTTP request latency in seconds",
        ))?;

        let jobs_submitted_total = IntCounterVec::new(
            Opts::new("jobs_submitted_total", "Jobs admitted and dispatched"),
            &["kind"],
        )?;
        let admission_rejections_total = IntCounterVec::new(
            Opts::new(
                "admission_rejections_total",
                "Job submissions rejected by admission control",
            ),
            &["kind", "reason"],
        )?;
        let jobs_finished_total = IntCounterVec::new(
            Opts::new("jobs_finished_total", "Jobs that reached a terminal status"),
            &["kind", "status"],
        )?;
        let jobs_running = IntGauge::new("jobs_running", "Worker tasks currently running")?;

        let live_bot_cycles_total = IntCounter::new(
            "live_bot_cycles_total",
            "Strategy cycles executed by live bots",
        )?;
        let live_bot_order_failures_total = IntCounter::new(
            "live_bot_order_failures_total",
            "Orders that failed to place from live bots",
        )?;
        let backtest_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "backtest_duration_seconds",
                "Wall-clock duration of backtest runs",
            )
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0, 240.0, 300.0]),
        )?;

        let database_connected = Gauge::new("database_connected", "1 when the store is reachable")?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_requests_in_flight.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(jobs_submitted_total.clone()))?;
        registry.register(Box::new(admission_rejections_total.clone()))?;
        registry.register(Box::new(jobs_finished_total.clone()))?;
        registry.register(Box::new(jobs_running.clone()))?;
        registry.register(Box::new(live_bot_cycles_total.clone()))?;
        registry.register(Box::new(live_bot_order_failures_total.clone()))?;
        registry.register(Box::new(backtest_duration_seconds.clone()))?;
        registry.register(Box::new(database_connected.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_requests_in_flight,
            http_request_duration_seconds,
            jobs_submitted_total,
            admission_rejections_total,
            jobs_finished_total,
            jobs_running,
            live_bot_cycles_total,
            live_bot_order_failures_total,
            backtest_duration_seconds,
            database_connected,
        })
    }

    /// Render the registry in the Prometheus text format
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
