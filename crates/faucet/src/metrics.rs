//! Prometheus metrics for the dispenser

use prometheus::{opts, Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};

/// Metrics collection for the faucet
#[derive(Debug)]
pub struct FaucetMetrics {
    registry: Registry,

    pub requests_total: IntCounter,
    pub rejections_total: IntCounterVec,
    pub deposits_total: IntCounter,
    pub paused: IntGauge,
}

impl FaucetMetrics {
    /// Create new metrics instance
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounter::with_opts(opts!(
            "drip_requests_total",
            "Successful token dispenses"
        ))?;
        let rejections_total = IntCounterVec::new(
            opts!("drip_rejections_total", "Refused operations by error code"),
            &["code"],
        )?;
        let deposits_total = IntCounter::with_opts(opts!(
            "drip_deposits_total",
            "Successful inventory deposits"
        ))?;
        let paused = IntGauge::with_opts(opts!(
            "drip_paused",
            "1 while dispensing is paused"
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(rejections_total.clone()))?;
        registry.register(Box::new(deposits_total.clone()))?;
        registry.register(Box::new(paused.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            rejections_total,
            deposits_total,
            paused,
        })
    }

    pub fn record_rejection(&self, code: &str) {
        self.rejections_total.with_label_values(&[code]).inc();
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.set(paused as i64);
    }

    /// Render metrics in Prometheus text format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
