//! Typed streaming events for answer delivery.
//!
//! The event order is fixed: zero or more `Chunk`s, then exactly one
//! terminator, either `Done` or `Error`. Nothing follows a terminator.

use arbiter_core::error::ProviderError;
use arbiter_core::provider::Usage;
use serde::{Deserialize, Serialize};

/// Coarse error classification carried to streaming clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamErrorCode {
    QuotaExceeded,
    ServiceUnavailable,
    Internal,
}

impl StreamErrorCode {
    /// Map a provider failure onto a client-facing code.
    pub fn from_provider_error(error: &ProviderError) -> Self {
        match error {
            ProviderError::RateLimited { .. } => Self::QuotaExceeded,
            ProviderError::Unavailable(_)
            | ProviderError::Timeout(_)
            | ProviderError::Network(_) => Self::ServiceUnavailable,
            ProviderError::ApiError { status_code, .. } if *status_code == 429 => {
                Self::QuotaExceeded
            }
            ProviderError::ApiError { status_code, .. } if *status_code >= 500 => {
                Self::ServiceUnavailable
            }
            // Exhaustion folds the last failure into a string; classify
            // conservatively as unavailable since every entry was tried.
            ProviderError::ChainExhausted(_) => Self::ServiceUnavailable,
            _ => Self::Internal,
        }
    }
}

/// Events emitted while answering a query in streaming mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerStreamEvent {
    /// Partial answer text.
    Chunk { content: String },

    /// Terminal failure.
    Error {
        code: StreamErrorCode,
        message: String,
    },

    /// Explicit terminator: the answer is complete.
    Done {
        session_id: String,
        usage: Option<Usage>,
        iterations: u32,
    },
}

impl AnswerStreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Done { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_serialization() {
        let event = AnswerStreamEvent::Chunk {
            content: "The rate".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(!event.is_terminal());
    }

    #[test]
    fn error_carries_code() {
        let event = AnswerStreamEvent::Error {
            code: StreamErrorCode::QuotaExceeded,
            message: "all providers rate limited".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""code":"quota_exceeded""#));
        assert!(event.is_terminal());
    }

    #[test]
    fn done_is_terminal() {
        let event = AnswerStreamEvent::Done {
            session_id: "s1".into(),
            usage: None,
            iterations: 2,
        };
        assert!(event.is_terminal());
    }

    #[test]
    fn provider_error_mapping() {
        assert_eq!(
            StreamErrorCode::from_provider_error(&ProviderError::RateLimited {
                retry_after_secs: 5
            }),
            StreamErrorCode::QuotaExceeded
        );
        assert_eq!(
            StreamErrorCode::from_provider_error(&ProviderError::Unavailable("down".into())),
            StreamErrorCode::ServiceUnavailable
        );
        assert_eq!(
            StreamErrorCode::from_provider_error(&ProviderError::AuthenticationFailed(
                "bad key".into()
            )),
            StreamErrorCode::Internal
        );
        assert_eq!(
            StreamErrorCode::from_provider_error(&ProviderError::ApiError {
                status_code: 503,
                message: String::new()
            }),
            StreamErrorCode::ServiceUnavailable
        );
    }

    #[test]
    fn deserialization_round_trip() {
        let json = r#"{"type":"chunk","content":"hi"}"#;
        let event: AnswerStreamEvent = serde_json::from_str(json).unwrap();
        match event {
            AnswerStreamEvent::Chunk { content } => assert_eq!(content, "hi"),
            _ => panic!("Wrong variant"),
        }
    }
}
