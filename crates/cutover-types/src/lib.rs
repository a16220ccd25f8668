use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

pub type CorrelationId = String;
pub type EndpointId = String;

/// Response payload produced by either implementation.
pub type Payload = Value;

/// The router's operating mode. Only an administrator moves between phases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    #[default]
    LegacyOnly,
    Validation,
    StranglerFig,
    NewArchitecture,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 4] = [
        MigrationPhase::LegacyOnly,
        MigrationPhase::Validation,
        MigrationPhase::StranglerFig,
        MigrationPhase::NewArchitecture,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::LegacyOnly => "legacy_only",
            MigrationPhase::Validation => "validation",
            MigrationPhase::StranglerFig => "strangler_fig",
            MigrationPhase::NewArchitecture => "new_architecture",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts `strangler_fig`, `strangler-fig`, `StranglerFig`, case-insensitively.
impl FromStr for MigrationPhase {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match folded.as_str() {
            "legacyonly" => Ok(MigrationPhase::LegacyOnly),
            "validation" => Ok(MigrationPhase::Validation),
            "stranglerfig" => Ok(MigrationPhase::StranglerFig),
            "newarchitecture" => Ok(MigrationPhase::NewArchitecture),
            _ => Err(MigrationError::InvalidConfiguration(format!(
                "unknown phase '{s}'; expected one of legacy_only, validation, \
                 strangler_fig, new_architecture"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Implementation {
    Legacy,
    New,
}

impl Implementation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Implementation::Legacy => "legacy",
            Implementation::New => "new",
        }
    }
}

impl fmt::Display for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable routing snapshot. Replaced wholesale on every administrative change.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RoutingConfig {
    pub phase: MigrationPhase,
    /// Share of requests sent to New while in `StranglerFig`, in `[0, 1]`.
    pub migration_percentage: f64,
    /// Share of requests shadowed against New while in `Validation`, in `[0, 1]`.
    pub validation_sampling: f64,
    pub fallback_enabled: bool,
    #[serde(rename = "fallback_timeout_ms", with = "duration_ms")]
    pub fallback_timeout: Duration,
    /// Bumped by the phase controller each time a changed snapshot is installed.
    #[serde(default)]
    pub revision: u64,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        RoutingConfig {
            phase: MigrationPhase::LegacyOnly,
            migration_percentage: 0.0,
            validation_sampling: 0.0,
            fallback_enabled: true,
            fallback_timeout: Duration::from_millis(1000),
            revision: 0,
        }
    }
}

impl RoutingConfig {
    pub fn validate(&self) -> Result<(), MigrationError> {
        check_fraction("migration_percentage", self.migration_percentage)?;
        check_fraction("validation_sampling", self.validation_sampling)?;
        if self.fallback_timeout.is_zero() {
            return Err(MigrationError::InvalidConfiguration(
                "fallback_timeout must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Field-wise equality ignoring `revision`.
    pub fn same_settings(&self, other: &RoutingConfig) -> bool {
        self.phase == other.phase
            && self.migration_percentage == other.migration_percentage
            && self.validation_sampling == other.validation_sampling
            && self.fallback_enabled == other.fallback_enabled
            && self.fallback_timeout == other.fallback_timeout
    }
}

/// Rejects NaN, infinities and anything outside `[0, 1]`.
pub fn check_fraction(name: &str, value: f64) -> Result<(), MigrationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MigrationError::InvalidConfiguration(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

/// Computed once per request from a single config snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RoutingDecision {
    pub correlation_id: CorrelationId,
    pub phase: MigrationPhase,
    pub implementation: Implementation,
    pub shadow_sampled: bool,
    /// Hash bucket of the correlation id the decision was derived from.
    pub bucket: u64,
}

/// What an adapter call produced.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub implementation: Implementation,
    pub outcome: Result<Payload, ExecError>,
    pub latency: Duration,
}

/// One field-level difference between legacy and new outputs.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct FieldDiff {
    pub field: String,
    pub legacy_value: Value,
    pub new_value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Match,
    Diverged,
    NewFailed,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Match => "match",
            Classification::Diverged => "diverged",
            Classification::NewFailed => "new_failed",
        })
    }
}

/// Result of a shadow run. Never reaches the caller.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ComparisonRecord {
    pub correlation_id: CorrelationId,
    pub endpoint_id: EndpointId,
    pub legacy_output: Payload,
    pub new_output: Option<Payload>,
    /// Error text when New failed or timed out.
    pub new_error: Option<String>,
    pub field_diffs: Vec<FieldDiff>,
    pub classification: Classification,
    #[serde(rename = "new_latency_ms", with = "duration_ms")]
    pub new_latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Request,
    ShadowComparison,
    ShadowSkipped,
    ShadowFailure,
}

/// One telemetry record. Serialized as a single JSON object by sinks.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,
    pub correlation_id: CorrelationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_id: Option<EndpointId>,
    pub phase: MigrationPhase,
    pub implementation_used: Implementation,
    pub latency_ms: u64,
    pub fallback_triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub divergence: Option<Vec<FieldDiff>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl TelemetryEvent {
    /// Caller-path record; one per handled request.
    pub fn request(
        decision: &RoutingDecision,
        endpoint_id: &str,
        implementation_used: Implementation,
        latency: Duration,
    ) -> Self {
        TelemetryEvent {
            kind: EventKind::Request,
            correlation_id: decision.correlation_id.clone(),
            endpoint_id: Some(endpoint_id.to_string()),
            phase: decision.phase,
            implementation_used,
            latency_ms: millis(latency),
            fallback_triggered: false,
            fallback_reason: None,
            classification: None,
            divergence: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_fallback(mut self, reason: impl Into<String>) -> Self {
        self.fallback_triggered = true;
        self.fallback_reason = Some(reason.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn comparison(record: &ComparisonRecord, phase: MigrationPhase) -> Self {
        TelemetryEvent {
            kind: EventKind::ShadowComparison,
            correlation_id: record.correlation_id.clone(),
            endpoint_id: Some(record.endpoint_id.clone()),
            phase,
            implementation_used: Implementation::New,
            latency_ms: millis(record.new_latency),
            fallback_triggered: false,
            fallback_reason: None,
            classification: Some(record.classification),
            divergence: if record.field_diffs.is_empty() {
                None
            } else {
                Some(record.field_diffs.clone())
            },
            error: record.new_error.clone(),
            timestamp: Utc::now(),
        }
    }

    pub fn shadow_skipped(correlation_id: &str, endpoint_id: &str, phase: MigrationPhase) -> Self {
        TelemetryEvent {
            kind: EventKind::ShadowSkipped,
            correlation_id: correlation_id.to_string(),
            endpoint_id: Some(endpoint_id.to_string()),
            phase,
            implementation_used: Implementation::New,
            latency_ms: 0,
            fallback_triggered: false,
            fallback_reason: None,
            classification: None,
            divergence: None,
            error: Some("skipped-overload".into()),
            timestamp: Utc::now(),
        }
    }

    pub fn shadow_failure(
        correlation_id: &str,
        endpoint_id: &str,
        phase: MigrationPhase,
        err: &MigrationError,
    ) -> Self {
        TelemetryEvent {
            kind: EventKind::ShadowFailure,
            correlation_id: correlation_id.to_string(),
            endpoint_id: Some(endpoint_id.to_string()),
            phase,
            implementation_used: Implementation::New,
            latency_ms: 0,
            fallback_triggered: false,
            fallback_reason: None,
            classification: None,
            divergence: None,
            error: Some(err.to_string()),
            timestamp: Utc::now(),
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Errors an adapter reports. This is also the only error shape callers see.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ExecError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("cancelled")]
    Cancelled,
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum MigrationError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("{implementation} implementation exceeded {}ms", .timeout.as_millis())]
    ExecutionTimeout {
        implementation: Implementation,
        timeout: Duration,
    },
    #[error("{implementation} implementation failed: {source}")]
    ExecutionError {
        implementation: Implementation,
        #[source]
        source: ExecError,
    },
    #[error("both implementations failed (new: {primary}; legacy: {fallback})")]
    BothImplementationsFailed {
        primary: Box<MigrationError>,
        fallback: ExecError,
    },
    #[error("shadow execution failed: {0}")]
    ShadowExecutionFailure(String),
}

impl MigrationError {
    /// The error as the caller sees it, stripped of routing details.
    pub fn into_caller_error(self) -> ExecError {
        match self {
            MigrationError::ExecutionError { source, .. } => source,
            MigrationError::BothImplementationsFailed { fallback, .. } => fallback,
            MigrationError::ExecutionTimeout { .. } => {
                ExecError::Unavailable("request timed out".into())
            }
            MigrationError::InvalidConfiguration(msg) => ExecError::InvalidRequest(msg),
            MigrationError::ShadowExecutionFailure(msg) => ExecError::Internal(msg),
        }
    }
}

/// Serializes a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
