use prometheus::{IntGauge, Opts, Registry};

/// Broker-level prometheus metrics.
pub struct BrokerMetrics {
    /// Number of registered devices, stale or not.
    pub devices: IntGauge,
    /// Number of devices within the staleness window.
    pub devices_active: IntGauge,
    /// Number of runs in the run table.
    pub runs: IntGauge,
    /// Number of broadcasts awaiting retransmission.
    pub publish_queue: IntGauge,
    /// Free ports in the request pool.
    pub request_ports_free: IntGauge,
    /// Free ports in the survey pool.
    pub survey_ports_free: IntGauge,
}

impl BrokerMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::build()?;
        registry.register(Box::new(metrics.devices.clone()))?;
        registry.register(Box::new(metrics.devices_active.clone()))?;
        registry.register(Box::new(metrics.runs.clone()))?;
        registry.register(Box::new(metrics.publish_queue.clone()))?;
        registry.register(Box::new(metrics.request_ports_free.clone()))?;
        registry.register(Box::new(metrics.survey_ports_free.clone()))?;
        Ok(metrics)
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self::build().expect("valid metric names")
    }

    fn build() -> Result<Self, prometheus::Error> {
        Ok(Self {
            devices: IntGauge::with_opts(Opts::new(
                "broker_devices",
                "Number of registered devices",
            ))?,
            devices_active: IntGauge::with_opts(Opts::new(
                "broker_devices_active",
                "Number of devices with a fresh heartbeat",
            ))?,
            runs: IntGauge::with_opts(Opts::new("broker_runs", "Number of tracked runs"))?,
            publish_queue: IntGauge::with_opts(Opts::new(
                "broker_publish_queue",
                "Number of broadcasts awaiting retransmission",
            ))?,
            request_ports_free: IntGauge::with_opts(Opts::new(
                "broker_request_ports_free",
                "Free ports in the request pool",
            ))?,
            survey_ports_free: IntGauge::with_opts(Opts::new(
                "broker_survey_ports_free",
                "Free ports in the survey pool",
            ))?,
        })
    }
}
