// protocol: wire types for the real-time messaging gateway.
//
// Every message that crosses the WebSocket boundary is modeled here as a
// typed, validated variant. Nothing past the codec boundary should ever
// touch a free-form `serde_json::Value` for envelope framing -- only the
// `data` payload carried inside a DATA/REQUEST/COMMAND envelope is left as
// `serde_json::Value`, because its shape is owned by the topic handler, not
// the gateway.

use serde::{Deserialize, Serialize};

pub mod error_codes {
    pub const INVALID_FORMAT: u32 = 4000;
    pub const MISSING_TYPE: u32 = 4001;
    pub const EMPTY_TOPICS: u32 = 4003;
    pub const REQUEST_SUPERSEDED: u32 = 4005;
    pub const AUTH_REQUIRED: u32 = 4010;
    pub const INVALID_TOKEN: u32 = 4011;
    pub const ROLE_REQUIRED: u32 = 4012;
    pub const RATE_LIMITED: u32 = 4029;
    pub const NOT_FOUND: u32 = 4040;
    pub const INVALID_STATE: u32 = 4050;
    pub const TOKEN_EXPIRED: u32 = 4401;
    pub const INTERNAL_ERROR: u32 = 5000;
    pub const REQUEST_TIMEOUT: u32 = 5002;
}

pub mod close_codes {
    pub const NORMAL: u16 = 1000;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TRY_AGAIN_LATER: u16 = 1013;
}

/// Maximum inbound frame size, per §4.A.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

/// Maximum byte length of a client-chosen `requestId`.
pub const MAX_REQUEST_ID_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Identity & roles
// ---------------------------------------------------------------------------

/// A connection's role. Ordered: an `Admin` identity satisfies anything an
/// `Admin`-gated topic asks for; `Superadmin` is carried for handlers that
/// want a stricter check of their own, but the gateway itself only ever
/// tests against `AuthRequirement::Admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Anonymous,
    User,
    Admin,
    Superadmin,
}

impl Role {
    /// Whether this role satisfies the given topic auth requirement.
    pub fn satisfies(self, requirement: AuthRequirement) -> bool {
        match requirement {
            AuthRequirement::None | AuthRequirement::Optional => true,
            AuthRequirement::Required => self != Role::Anonymous,
            AuthRequirement::Admin => self >= Role::Admin,
        }
    }
}

/// The validated principal, role, session, and token expiry of a connection
/// at a point in time. Downstream code never inspects the original token
/// form -- everything converges on this value immediately after verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub principal_id: Option<String>,
    pub role: Role,
    pub session_id: Option<String>,
    /// Unix timestamp (seconds) the identity's token expires, if any.
    pub expires_at: Option<i64>,
}

impl Identity {
    pub fn anonymous() -> Self {
        Self {
            principal_id: None,
            role: Role::Anonymous,
            session_id: None,
            expires_at: None,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.role == Role::Anonymous
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::anonymous()
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// The closed initial set of topics, per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    MarketData,
    Portfolio,
    System,
    Contest,
    User,
    Admin,
    Wallet,
    WalletBalance,
    Skyduel,
}

impl Topic {
    pub const ALL: [Topic; 9] = [
        Topic::MarketData,
        Topic::Portfolio,
        Topic::System,
        Topic::Contest,
        Topic::User,
        Topic::Admin,
        Topic::Wallet,
        Topic::WalletBalance,
        Topic::Skyduel,
    ];

    pub fn as_wire_str(self) -> &'static str {
        match self {
            Topic::MarketData => "market-data",
            Topic::Portfolio => "portfolio",
            Topic::System => "system",
            Topic::Contest => "contest",
            Topic::User => "user",
            Topic::Admin => "admin",
            Topic::Wallet => "wallet",
            Topic::WalletBalance => "wallet-balance",
            Topic::Skyduel => "skyduel",
        }
    }

    pub fn parse(s: &str) -> Option<Topic> {
        Self::ALL.into_iter().find(|t| t.as_wire_str() == s)
    }

    /// The auth requirement the gateway enforces at subscribe and at
    /// request/command invocation, per §3 / §4.H.
    pub fn auth_requirement(self) -> AuthRequirement {
        match self {
            Topic::MarketData | Topic::System => AuthRequirement::None,
            Topic::Contest | Topic::Skyduel => AuthRequirement::Optional,
            Topic::Portfolio | Topic::User | Topic::Wallet | Topic::WalletBalance => {
                AuthRequirement::Required
            }
            Topic::Admin => AuthRequirement::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthRequirement {
    None,
    Optional,
    Required,
    Admin,
}

// ---------------------------------------------------------------------------
// Client -> Server envelopes
// ---------------------------------------------------------------------------

/// A decoded, validated inbound envelope. Each variant carries only the
/// fields that are meaningful for its `type`, per the REDESIGN FLAGS note
/// against modeling this as a free-form map.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEnvelope {
    Subscribe {
        topics: Vec<String>,
        auth_token: Option<String>,
    },
    Unsubscribe {
        topics: Vec<String>,
    },
    Request {
        topic: String,
        action: String,
        request_id: String,
        data: serde_json::Value,
    },
    Command {
        topic: String,
        action: String,
        request_id: Option<String>,
        data: serde_json::Value,
    },
}

/// Raw wire shape of a client envelope, matched against the `type` tag
/// before being promoted to [`ClientEnvelope`]. Kept private to the codec:
/// callers outside this crate should never see a half-validated envelope.
#[derive(Debug, Deserialize)]
struct RawClientEnvelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    topic: Option<String>,
    action: Option<String>,
    #[serde(rename = "requestId")]
    request_id: Option<String>,
    #[serde(rename = "authToken")]
    auth_token: Option<String>,
    topics: Option<Vec<String>>,
    #[serde(flatten)]
    data: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame exceeded [`MAX_FRAME_BYTES`] or isn't valid UTF-8 JSON.
    InvalidFormat(String),
    /// `type` field absent.
    MissingType,
    /// `type` field present but not a known literal.
    UnknownType(String),
    /// SUBSCRIBE/UNSUBSCRIBE with an empty or missing `topics` array.
    EmptyTopics,
    /// REQUEST/COMMAND missing `topic` or `action`.
    MissingRequestFields,
}

impl CodecError {
    pub fn wire_code(&self) -> u32 {
        match self {
            CodecError::InvalidFormat(_) => error_codes::INVALID_FORMAT,
            CodecError::MissingType => error_codes::MISSING_TYPE,
            CodecError::UnknownType(_) => error_codes::INVALID_FORMAT,
            CodecError::EmptyTopics => error_codes::EMPTY_TOPICS,
            CodecError::MissingRequestFields => error_codes::INVALID_FORMAT,
        }
    }

    pub fn message(&self) -> String {
        match self {
            CodecError::InvalidFormat(detail) => format!("invalid message format: {detail}"),
            CodecError::MissingType => "missing message type".to_owned(),
            CodecError::UnknownType(kind) => format!("unknown message type: {kind}"),
            CodecError::EmptyTopics => "subscription requires at least one topic".to_owned(),
            CodecError::MissingRequestFields => {
                "request/command requires topic and action".to_owned()
            }
        }
    }
}

/// Decode and validate one inbound text frame, per §4.A.
///
/// Oversized-frame rejection (> [`MAX_FRAME_BYTES`]) is the caller's
/// responsibility before this is invoked, since it depends on the raw byte
/// length rather than the decoded string.
pub fn decode_client_envelope(text: &str) -> Result<ClientEnvelope, CodecError> {
    let raw: RawClientEnvelope =
        serde_json::from_str(text).map_err(|e| CodecError::InvalidFormat(e.to_string()))?;

    let kind = raw.kind.ok_or(CodecError::MissingType)?;

    match kind.as_str() {
        "SUBSCRIBE" => {
            let topics = raw.topics.unwrap_or_default();
            if topics.is_empty() {
                return Err(CodecError::EmptyTopics);
            }
            Ok(ClientEnvelope::Subscribe {
                topics,
                auth_token: raw.auth_token,
            })
        }
        "UNSUBSCRIBE" => {
            let topics = raw.topics.unwrap_or_default();
            if topics.is_empty() {
                return Err(CodecError::EmptyTopics);
            }
            Ok(ClientEnvelope::Unsubscribe { topics })
        }
        "REQUEST" => {
            let topic = raw.topic.ok_or(CodecError::MissingRequestFields)?;
            let action = raw.action.ok_or(CodecError::MissingRequestFields)?;
            let request_id = raw.request_id.ok_or(CodecError::MissingRequestFields)?;
            Ok(ClientEnvelope::Request {
                topic,
                action,
                request_id,
                data: serde_json::Value::Object(raw.data),
            })
        }
        "COMMAND" => {
            let topic = raw.topic.ok_or(CodecError::MissingRequestFields)?;
            let action = raw.action.ok_or(CodecError::MissingRequestFields)?;
            Ok(ClientEnvelope::Command {
                topic,
                action,
                request_id: raw.request_id,
                data: serde_json::Value::Object(raw.data),
            })
        }
        other => Err(CodecError::UnknownType(other.to_owned())),
    }
}

// ---------------------------------------------------------------------------
// Server -> Client envelopes
// ---------------------------------------------------------------------------

fn now_iso8601() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Outbound envelope. Serializes with a stable field order and appends
/// `timestamp` automatically, per §4.A. Also derives `Deserialize` so
/// integration tests can parse what the gateway actually sent back.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEnvelope {
    #[serde(rename = "DATA")]
    Data {
        topic: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        action: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
        request_id: Option<String>,
        data: serde_json::Value,
        timestamp: String,
    },
    #[serde(rename = "ACKNOWLEDGMENT")]
    Acknowledgment {
        operation: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        topics: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
        request_id: Option<String>,
        timestamp: String,
    },
    #[serde(rename = "SYSTEM")]
    System { action: String, timestamp: String },
    #[serde(rename = "ERROR")]
    Error {
        code: u32,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none", rename = "requestId")]
        request_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic: Option<String>,
        timestamp: String,
    },
}

impl ServerEnvelope {
    pub fn data(
        topic: impl Into<String>,
        action: Option<String>,
        request_id: Option<String>,
        data: serde_json::Value,
    ) -> Self {
        ServerEnvelope::Data {
            topic: topic.into(),
            action,
            request_id,
            data,
            timestamp: now_iso8601(),
        }
    }

    pub fn ack(
        operation: impl Into<String>,
        topics: Option<Vec<String>>,
        request_id: Option<String>,
    ) -> Self {
        ServerEnvelope::Acknowledgment {
            operation: operation.into(),
            topics,
            request_id,
            timestamp: now_iso8601(),
        }
    }

    pub fn system(action: impl Into<String>) -> Self {
        ServerEnvelope::System {
            action: action.into(),
            timestamp: now_iso8601(),
        }
    }

    pub fn error(
        code: u32,
        message: impl Into<String>,
        request_id: Option<String>,
        topic: Option<String>,
    ) -> Self {
        ServerEnvelope::Error {
            code,
            message: message.into(),
            request_id,
            topic,
            timestamp: now_iso8601(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerEnvelope always serializes")
    }
}

// ---------------------------------------------------------------------------
// HTTP admin surface types
// ---------------------------------------------------------------------------

/// Frozen HTTP error envelope used by all non-2xx admin responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
