//! Event envelope - the episodic unit of memory
//!
//! Events are immutable once appended. The store assigns `global_position`
//! on append; everything else comes from the producer and is validated here,
//! independent of any transport framework.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Maximum tolerated clock drift into the future
const MAX_FUTURE_DRIFT_MINUTES: i64 = 5;

/// Maximum length of a payload reference
const MAX_PAYLOAD_REF_LEN: usize = 256;

/// Canonical session-end event type. `session.ended` is accepted on ingress
/// and normalized to this string before storage.
pub const SESSION_END_EVENT_TYPE: &str = "system.session_end";

/// Legacy alias for [`SESSION_END_EVENT_TYPE`]
pub const SESSION_END_ALIAS: &str = "session.ended";

/// Event type published when accumulated importance crosses the reflection
/// threshold, causing an immediate consolidation pass.
pub const REFLECTION_EVENT_TYPE: &str = "system.reflection_triggered";

/// Event type carrying an explicit, structured preference statement
pub const PREFERENCE_STATED_EVENT_TYPE: &str = "user.preference.stated";

static EVENT_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]+(\.[a-z_]+)+$").expect("valid event_type regex"));

// ============================================================================
// GLOBAL POSITION
// ============================================================================

/// Opaque monotonic cursor assigned by the event store on append.
///
/// Clients receive it as a string and must not parse it; internally it is the
/// stream's monotonically increasing entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalPosition(i64);

impl Serialize for GlobalPosition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for GlobalPosition {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse::<i64>()
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

impl GlobalPosition {
    /// Wrap a raw stream entry id
    pub fn new(raw: i64) -> Self {
        Self(raw)
    }

    /// Raw stream entry id (store-internal)
    pub fn raw(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for GlobalPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GlobalPosition {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<i64>().map(Self)
    }
}

// ============================================================================
// EVENT STATUS
// ============================================================================

/// Terminal or in-flight status of the recorded occurrence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Timeout,
}

impl EventStatus {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Running => "running",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Timeout => "timeout",
        }
    }

    /// Parse from string name
    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EventStatus::Pending),
            "running" => Some(EventStatus::Running),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            "timeout" => Some(EventStatus::Timeout),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// EVENT
// ============================================================================

/// An immutable record of an occurrence in an agent/tool/LLM interaction.
///
/// `global_position` is `None` until the event store assigns it on append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Caller-supplied unique id; idempotency key for ingestion
    pub event_id: String,
    /// Dot-namespaced type, e.g. `tool.call`, `observation.input`
    pub event_type: String,
    /// When the occurrence happened (producer clock)
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub trace_id: String,
    /// Pseudonym pointing into the forgettable payload store; never raw PII
    pub payload_ref: String,
    /// Assigned by the store on append; the authoritative total order
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_position: Option<GlobalPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_event_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EventStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,
    /// Producer's importance hint, 1..=10
    #[serde(skip_serializing_if = "Option::is_none")]
    pub importance_hint: Option<u8>,
}

// ============================================================================
// VALIDATION
// ============================================================================

/// Raw ingress shape before validation.
///
/// Uses `deny_unknown_fields` to prevent field injection. `payload` is the
/// optional inline body that the API layer moves into the forgettable
/// payload store before append.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventInput {
    pub event_id: String,
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub session_id: String,
    pub agent_id: String,
    pub trace_id: String,
    pub payload_ref: String,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub parent_event_id: Option<String>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub importance_hint: Option<u8>,
    /// Inline payload body; stored behind `payload_ref`, never in the event store
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// A single validation failure with the offending field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate an ingress event against the envelope invariants.
///
/// Collects every violation instead of failing fast, so the caller can
/// surface a complete 422 body. On success the returned [`Event`] has its
/// `event_type` normalized (legacy `session.ended` becomes
/// `system.session_end`) and no `global_position` yet.
pub fn validate_event(input: &EventInput, now: DateTime<Utc>) -> Result<Event, Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    if input.event_id.trim().is_empty() {
        issues.push(ValidationIssue::new("event_id", "must not be empty"));
    }
    for (field, value) in [
        ("session_id", &input.session_id),
        ("agent_id", &input.agent_id),
        ("trace_id", &input.trace_id),
    ] {
        if value.trim().is_empty() {
            issues.push(ValidationIssue::new(field, "must not be empty"));
        }
    }

    let event_type = normalize_event_type(&input.event_type);
    if !EVENT_TYPE_RE.is_match(&event_type) {
        issues.push(ValidationIssue::new(
            "event_type",
            format!("'{}' does not match the dot-namespaced format", input.event_type),
        ));
    }

    if input.occurred_at > now + Duration::minutes(MAX_FUTURE_DRIFT_MINUTES) {
        issues.push(ValidationIssue::new(
            "occurred_at",
            format!("more than {} minutes in the future", MAX_FUTURE_DRIFT_MINUTES),
        ));
    }

    if let Some(parent) = &input.parent_event_id {
        if parent == &input.event_id {
            issues.push(ValidationIssue::new(
                "parent_event_id",
                "event cannot be its own parent",
            ));
        }
    }

    if let Some(ended_at) = input.ended_at {
        if ended_at < input.occurred_at {
            issues.push(ValidationIssue::new("ended_at", "must be >= occurred_at"));
        }
    }

    if input.payload_ref.is_empty() {
        issues.push(ValidationIssue::new("payload_ref", "must not be empty"));
    } else if input.payload_ref.len() > MAX_PAYLOAD_REF_LEN {
        issues.push(ValidationIssue::new(
            "payload_ref",
            format!("exceeds {} bytes", MAX_PAYLOAD_REF_LEN),
        ));
    }

    let status = match &input.status {
        None => None,
        Some(raw) => match EventStatus::parse_name(raw) {
            Some(s) => Some(s),
            None => {
                issues.push(ValidationIssue::new(
                    "status",
                    format!("unknown status '{}'", raw),
                ));
                None
            }
        },
    };

    if let Some(hint) = input.importance_hint {
        if !(1..=10).contains(&hint) {
            issues.push(ValidationIssue::new("importance_hint", "must be in 1..=10"));
        }
    }

    if !issues.is_empty() {
        return Err(issues);
    }

    Ok(Event {
        event_id: input.event_id.clone(),
        event_type,
        occurred_at: input.occurred_at,
        session_id: input.session_id.clone(),
        agent_id: input.agent_id.clone(),
        trace_id: input.trace_id.clone(),
        payload_ref: input.payload_ref.clone(),
        global_position: None,
        tool_name: input.tool_name.clone(),
        parent_event_id: input.parent_event_id.clone(),
        ended_at: input.ended_at,
        status,
        schema_version: input.schema_version,
        importance_hint: input.importance_hint,
    })
}

/// Map legacy event type aliases onto their canonical strings
pub fn normalize_event_type(raw: &str) -> String {
    if raw == SESSION_END_ALIAS {
        SESSION_END_EVENT_TYPE.to_string()
    } else {
        raw.to_string()
    }
}

impl Event {
    /// Whether this event ends a session and should trigger extraction
    pub fn is_session_end(&self) -> bool {
        self.event_type == SESSION_END_EVENT_TYPE
    }

    /// Whether this event is the reflection trigger for consolidation
    pub fn is_reflection_trigger(&self) -> bool {
        self.event_type == REFLECTION_EVENT_TYPE
    }

    /// Top-level namespace of the event type (`tool` for `tool.call`)
    pub fn type_namespace(&self) -> &str {
        self.event_type.split('.').next().unwrap_or(&self.event_type)
    }
}

// ============================================================================
// TESTS
// ============================================================================
