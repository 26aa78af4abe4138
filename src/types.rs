use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    Contacted,
    Responded,
    Recovered,
    Lost,
}

impl ContactStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Contacted => "contacted",
            Self::Responded => "responded",
            Self::Recovered => "recovered",
            Self::Lost => "lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "contacted" => Some(Self::Contacted),
            "responded" => Some(Self::Responded),
            "recovered" => Some(Self::Recovered),
            "lost" => Some(Self::Lost),
            _ => None,
        }
    }

    /// A reply is only actionable once the contact has been messaged.
    pub fn accepts_replies(self) -> bool {
        matches!(self, Self::Contacted | Self::Responded)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub tenant_id: String,
    pub name: String,
    pub phone: String,
    pub product: String,
    pub status: ContactStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewContact {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub product: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Initializing,
    AwaitingScan,
    Ready,
    Error,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Initializing => "initializing",
            Self::AwaitingScan => "awaiting_scan",
            Self::Ready => "ready",
            Self::Error => "error",
        }
    }

    /// Pairing is still in flight and the supervisor deadline applies.
    pub fn is_pairing(self) -> bool {
        matches!(self, Self::Initializing | Self::AwaitingScan)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    PairingTimeout,
    AuthenticationFailure(String),
    ClientClosed(String),
    Aborted,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PairingTimeout => f.write_str("pairing timed out"),
            Self::AuthenticationFailure(message) => write!(f, "authentication failed: {message}"),
            Self::ClientClosed(reason) => write!(f, "client disconnected: {reason}"),
            Self::Aborted => f.write_str("session torn down"),
        }
    }
}

/// Point-in-time view of one session, published by its state machine task.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub pairing_payload: Option<String>,
    pub pairing_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub failure: Option<FailureReason>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub tenant_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_deadline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<String>,
    pub messages_sent: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl SessionStatus {
    pub fn disconnected(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: SessionState::Disconnected,
            pairing_payload: None,
            pairing_deadline: None,
            created_at: None,
            last_transition_at: None,
            messages_sent: 0,
            failure: None,
        }
    }

    pub fn from_snapshot(tenant_id: &str, snapshot: &SessionSnapshot, messages_sent: u64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            state: snapshot.state,
            pairing_payload: snapshot
                .pairing_payload
                .clone()
                .filter(|_| snapshot.state == SessionState::AwaitingScan),
            pairing_deadline: snapshot.pairing_deadline.map(|at| at.to_rfc3339()),
            created_at: Some(snapshot.created_at.to_rfc3339()),
            last_transition_at: Some(snapshot.last_transition_at.to_rfc3339()),
            messages_sent,
            failure: snapshot.failure.as_ref().map(ToString::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingResponse {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pairing_payload: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchOutcome {
    Completed,
    NotConnected,
    AlreadyRunning,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchFailure {
    pub contact_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub sent_count: usize,
    pub failures: Vec<DispatchFailure>,
}

impl DispatchReport {
    pub fn skipped(outcome: DispatchOutcome) -> Self {
        Self {
            outcome,
            sent_count: 0,
            failures: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResendResponse {
    pub sent_count: usize,
    pub message: String,
    pub outcome: DispatchOutcome,
    pub failures: Vec<DispatchFailure>,
}

pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Extracts the phone digits from a chat address such as `5511999999999@c.us`.
/// Group and broadcast addresses never map to a single customer.
pub fn phone_from_address(address: &str) -> Option<String> {
    let (user, domain) = match address.trim().split_once('@') {
        Some((user, domain)) => (user, domain),
        None => (address.trim(), ""),
    };
    let domain = domain.to_ascii_lowercase();
    if domain == "g.us" || domain == "broadcast" || user.eq_ignore_ascii_case("status") {
        return None;
    }
    // multi-device ids carry a `:device` suffix on the user part
    let user = user.split(':').next().unwrap_or(user);
    normalize_phone(user)
}

pub fn address_for_phone(phone: &str, suffix: &str) -> Option<String> {
    let digits = normalize_phone(phone)?;
    Some(format!("{digits}@{}", suffix.trim_start_matches('@')))
}
