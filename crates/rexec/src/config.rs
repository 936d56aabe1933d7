use crate::admission::AdmissionPolicy;
use crate::error::BrokerError;
use std::ops::Range;
use std::time::Duration;

/// Configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Fixed admin channel peers register on. Default: 5555.
    pub admin_port: u16,
    /// Broadcast channel dispatched calls are published on. Default: 6666.
    pub device_publish_port: u16,
    /// Broadcast channel reserved for cloud peers. Not used by the core. Default: 6677.
    pub cloud_publish_port: u16,
    /// Ports handed out as private per-peer request channels. Default: 25000..35000.
    pub request_ports: Range<u16>,
    /// Ports leased to runs for their survey channel. Default: 40000..50000.
    pub survey_ports: Range<u16>,
    /// Decides which replying peers execute a call. Default: `Majority(1.0)`.
    pub admission_policy: AdmissionPolicy,
    /// Fraction of `needed` results a survey must exceed to resolve. Default: 0.5.
    pub survey_threshold: f64,
    /// Deadline for the admission phase of a synchronous call. Default: 500ms.
    pub admission_timeout: Duration,
    /// Deadline for the survey phase of a synchronous call. Default: 2s.
    pub survey_timeout: Duration,
    /// How many times a queued broadcast is re-sent. Default: 5.
    pub publish_retries: u32,
    /// Interval of the broadcast retry tick. Default: 2s.
    pub publish_interval: Duration,
    /// A peer whose last heartbeat is older than this is not counted as active. Default: 50s.
    pub staleness_window: Duration,
}

impl BrokerConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - both port pools are non-empty and disjoint, and exclude the fixed channels
    /// - the admission threshold and survey threshold are finite and in `(0, 1]`
    /// - all durations are non-zero
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.request_ports.is_empty() {
            return Err(invalid("request_ports must not be empty"));
        }
        if self.survey_ports.is_empty() {
            return Err(invalid("survey_ports must not be empty"));
        }
        if self.request_ports.start < self.survey_ports.end
            && self.survey_ports.start < self.request_ports.end
        {
            return Err(invalid("request_ports and survey_ports must be disjoint"));
        }
        for fixed in [
            self.admin_port,
            self.device_publish_port,
            self.cloud_publish_port,
        ] {
            if self.request_ports.contains(&fixed) || self.survey_ports.contains(&fixed) {
                return Err(BrokerError::InvalidConfig {
                    reason: format!("fixed port {fixed} overlaps a port pool"),
                });
            }
        }
        check_admission_policy(self.admission_policy)?;
        check_survey_threshold(self.survey_threshold)?;
        if self.admission_timeout.is_zero() {
            return Err(invalid("admission_timeout must be > 0"));
        }
        if self.survey_timeout.is_zero() {
            return Err(invalid("survey_timeout must be > 0"));
        }
        if self.publish_interval.is_zero() {
            return Err(invalid("publish_interval must be > 0"));
        }
        if self.staleness_window.is_zero() {
            return Err(invalid("staleness_window must be > 0"));
        }
        Ok(())
    }
}

/// A `Majority` threshold must be finite and in `(0, 1]`.
pub(crate) fn check_admission_policy(policy: AdmissionPolicy) -> Result<(), BrokerError> {
    if let AdmissionPolicy::Majority(p) = policy {
        if !in_unit_range(p) {
            return Err(BrokerError::InvalidConfig {
                reason: format!("admission_policy threshold must be in (0, 1], got {p}"),
            });
        }
    }
    Ok(())
}

pub(crate) fn check_survey_threshold(threshold: f64) -> Result<(), BrokerError> {
    if !in_unit_range(threshold) {
        return Err(BrokerError::InvalidConfig {
            reason: format!("survey_threshold must be in (0, 1], got {threshold}"),
        });
    }
    Ok(())
}

fn in_unit_range(value: f64) -> bool {
    value.is_finite() && value > 0.0 && value <= 1.0
}

fn invalid(reason: &str) -> BrokerError {
    BrokerError::InvalidConfig {
        reason: reason.to_string(),
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            admin_port: 5555,
            device_publish_port: 6666,
            cloud_publish_port: 6677,
            request_ports: 25000..35000,
            survey_ports: 40000..50000,
            admission_policy: AdmissionPolicy::Majority(1.0),
            survey_threshold: 0.5,
            admission_timeout: Duration::from_millis(500),
            survey_timeout: Duration::from_secs(2),
            publish_retries: 5,
            publish_interval: Duration::from_secs(2),
            staleness_window: Duration::from_secs(50),
        }
    }
}
