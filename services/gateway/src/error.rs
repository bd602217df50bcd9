use protocol::error_codes;

/// Internal error taxonomy for the gateway, per the error-handling design.
/// Every code the wire protocol can emit has exactly one variant here --
/// the dispatcher and connection loop never hand-roll a numeric code at
/// the call site.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),
    #[error("missing message type")]
    MissingType,
    #[error("subscription requires at least one topic")]
    EmptyTopics,
    #[error("request superseded by a new requestId")]
    RequestSuperseded,
    #[error("authentication required for topic {topic}")]
    AuthRequired { topic: String },
    #[error("invalid authentication token")]
    InvalidToken,
    #[error("elevated role required for topic {topic}")]
    RoleRequired { topic: String },
    #[error("rate limited")]
    RateLimited,
    #[error("{0} not found")]
    NotFound(String),
    #[error("connection state invalid for this operation")]
    InvalidState,
    #[error("token expired")]
    TokenExpired,
    #[error("internal server error")]
    Internal(#[from] anyhow::Error),
    #[error("request timed out")]
    RequestTimeout,
}

impl GatewayError {
    /// The numeric wire code this error maps to, per the error code table.
    pub fn wire_code(&self) -> u32 {
        match self {
            GatewayError::InvalidFormat(_) => error_codes::INVALID_FORMAT,
            GatewayError::MissingType => error_codes::MISSING_TYPE,
            GatewayError::EmptyTopics => error_codes::EMPTY_TOPICS,
            GatewayError::RequestSuperseded => error_codes::REQUEST_SUPERSEDED,
            GatewayError::AuthRequired { .. } => error_codes::AUTH_REQUIRED,
            GatewayError::InvalidToken => error_codes::INVALID_TOKEN,
            GatewayError::RoleRequired { .. } => error_codes::ROLE_REQUIRED,
            GatewayError::RateLimited => error_codes::RATE_LIMITED,
            GatewayError::NotFound(_) => error_codes::NOT_FOUND,
            GatewayError::InvalidState => error_codes::INVALID_STATE,
            GatewayError::TokenExpired => error_codes::TOKEN_EXPIRED,
            GatewayError::Internal(_) => error_codes::INTERNAL_ERROR,
            GatewayError::RequestTimeout => error_codes::REQUEST_TIMEOUT,
        }
    }

    /// Whether this error class revokes subscriptions / ends the
    /// connection, versus leaving it open per the error taxonomy's classes
    /// 1-3 and 5 (protocol/resource/handler errors never close the socket).
    pub fn is_auth_class(&self) -> bool {
        matches!(
            self,
            GatewayError::AuthRequired { .. }
                | GatewayError::InvalidToken
                | GatewayError::RoleRequired { .. }
                | GatewayError::TokenExpired
        )
    }

    pub fn topic(&self) -> Option<&str> {
        match self {
            GatewayError::AuthRequired { topic } | GatewayError::RoleRequired { topic } => {
                Some(topic)
            }
            _ => None,
        }
    }
}
