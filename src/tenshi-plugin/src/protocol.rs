//! Wire protocol spoken between Tenshi and content adapter processes.
//!
//! Messages are single-line JSON documents. Every request carries an id the
//! adapter echoes in its response. `RequestStreamUri` may be answered long
//! after it was sent, and other requests may be answered in between.

use crate::transport::{StreamReply, StreamRequest};
use serde::{Deserialize, Serialize};

/// Protocol version for compatibility checking.
pub const PROTOCOL_VERSION: u32 = 1;

/// Request sent from Tenshi to an adapter process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    /// Unique request ID for correlation.
    pub id: u64,
    /// The method to invoke on the adapter.
    pub method: PluginMethod,
}

/// Response from an adapter process to Tenshi.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    /// Request ID this response correlates to.
    pub id: u64,
    pub result: PluginResult,
}

/// Methods that can be invoked on an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params")]
pub enum PluginMethod {
    /// Handshake; the adapter answers with its [`PluginInfo`].
    Hello,
    /// List the unique names this adapter serves.
    UniqueNames,
    /// Display name for one unique name.
    DisplayName { unique_name: String },
    /// Resolve a stream URI. Answered asynchronously with `StreamUri`.
    RequestStreamUri {
        unique_name: String,
        anime_id: u32,
        en_title: String,
        jp_title: String,
        episode: u32,
        persistent_storage: String,
    },
    /// Ask the adapter to exit.
    Shutdown,
}

impl From<StreamRequest> for PluginMethod {
    fn from(req: StreamRequest) -> Self {
        Self::RequestStreamUri {
            unique_name: req.unique_name,
            anime_id: req.anime_id,
            en_title: req.en_title,
            jp_title: req.jp_title,
            episode: req.episode,
            persistent_storage: req.persistent_storage,
        }
    }
}

impl PluginMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello => "Hello",
            Self::UniqueNames => "UniqueNames",
            Self::DisplayName { .. } => "DisplayName",
            Self::RequestStreamUri { .. } => "RequestStreamUri",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Result of a method invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum PluginResult {
    Hello(PluginInfo),
    UniqueNames {
        names: Vec<String>,
    },
    DisplayName {
        name: String,
    },
    /// Answer to `RequestStreamUri`. Both fields may be absent.
    StreamUri {
        #[serde(default)]
        stream_uri: Option<String>,
        #[serde(default)]
        persistent_storage: Option<String>,
    },
    ShutdownAck,
    Error(PluginError),
}

impl From<StreamReply> for PluginResult {
    fn from(reply: StreamReply) -> Self {
        Self::StreamUri {
            stream_uri: reply.stream_uri,
            persistent_storage: reply.persistent_storage,
        }
    }
}

/// Adapter metadata returned from the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Human-friendly adapter process name.
    pub name: String,
    /// Adapter version (semantic versioning).
    pub version: String,
    /// Protocol version the adapter speaks.
    pub protocol_version: u32,
}

/// Error returned by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginError {
    pub kind: PluginErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginErrorKind {
    /// The unique name is not served by this adapter.
    UnknownName,
    /// Method not implemented by this adapter.
    NotSupported,
    /// Request could not be parsed.
    BadRequest,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_method_serializes_without_params() {
        let req = PluginRequest {
            id: 7,
            method: PluginMethod::UniqueNames,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"id":7,"method":{"type":"UniqueNames"}}"#);
    }

    #[test]
    fn stream_request_carries_all_fields() {
        let method: PluginMethod = StreamRequest {
            unique_name: "gogo".into(),
            anime_id: 21,
            en_title: "One Piece".into(),
            jp_title: "ワンピース".into(),
            episode: 1000,
            persistent_storage: "slug=one-piece".into(),
        }
        .into();
        let json = serde_json::to_string(&method).unwrap();
        assert!(json.contains(r#""type":"RequestStreamUri""#));
        assert!(json.contains(r#""anime_id":21"#));
        assert!(json.contains(r#""persistent_storage":"slug=one-piece""#));
    }

    #[test]
    fn stream_uri_response_tolerates_missing_fields() {
        let json = r#"{"id":3,"result":{"status":"StreamUri"}}"#;
        let resp: PluginResponse = serde_json::from_str(json).unwrap();
        assert_eq!(
            resp.result,
            PluginResult::StreamUri {
                stream_uri: None,
                persistent_storage: None
            }
        );
    }

    #[test]
    fn hello_response_deserializes() {
        let json = r#"{"id":1,"result":{"status":"Hello","name":"Gogo","version":"1.2.0","protocol_version":1}}"#;
        let resp: PluginResponse = serde_json::from_str(json).unwrap();
        match resp.result {
            PluginResult::Hello(info) => {
                assert_eq!(info.name, "Gogo");
                assert_eq!(info.protocol_version, PROTOCOL_VERSION);
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn error_kind_is_snake_case() {
        let result = PluginResult::Error(PluginError {
            kind: PluginErrorKind::UnknownName,
            message: "nope".into(),
        });
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""kind":"unknown_name""#));
    }
}
