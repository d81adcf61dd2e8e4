//! Seams between the adapter host and whatever carries calls to adapter processes.
//!
//! A [`Transport`] finds installed adapter services and binds to them. Once a
//! binding is established the transport hands a [`RemoteAdapter`] to the
//! [`ConnectionEvents`] it was given; the adapter's stream answers come back
//! through a [`ReplySink`] on whatever thread the transport uses.

use crate::host::PluginHostError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity of one installed adapter service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentName {
    pub package: String,
    pub name: String,
}

impl ComponentName {
    pub fn new(package: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.package, self.name)
    }
}

/// A service found by [`Transport::query_services`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
    pub component: ComponentName,
    /// Whether the service may be bound by other applications.
    pub exported: bool,
}

/// A single metadata value advertised by a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Integer(i64),
    Flag(bool),
    Text(String),
}

impl MetadataValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

pub type ServiceMetadata = BTreeMap<String, MetadataValue>;

/// Input to a stream resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub unique_name: String,
    pub anime_id: u32,
    pub en_title: String,
    pub jp_title: String,
    pub episode: u32,
    /// Storage previously saved for (`unique_name`, `anime_id`); empty if none.
    pub persistent_storage: String,
}

/// An adapter's answer to a [`StreamRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReply {
    pub stream_uri: Option<String>,
    pub persistent_storage: Option<String>,
}

impl StreamReply {
    pub fn new(stream_uri: Option<String>, persistent_storage: Option<String>) -> Self {
        Self {
            stream_uri,
            persistent_storage,
        }
    }
}

/// What a [`ReplySink`] hands its receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyOutcome {
    /// The adapter answered.
    Replied(StreamReply),
    /// The sink was dropped unanswered: disconnect, process exit, error
    /// reply or failed dispatch.
    Lost,
}

impl ReplyOutcome {
    pub fn into_reply(self) -> Option<StreamReply> {
        match self {
            Self::Replied(reply) => Some(reply),
            Self::Lost => None,
        }
    }
}

type ReplyFn = Box<dyn FnOnce(ReplyOutcome) + Send + 'static>;

/// One-shot receiver of a [`StreamReply`].
///
/// Consumed by [`ReplySink::send`]. A sink that is dropped without being sent
/// reports [`ReplyOutcome::Lost`], so a caller waiting on it is always answered
/// once. [`ReplySink::abandon`] disarms that.
pub struct ReplySink {
    reply: Option<ReplyFn>,
}

impl fmt::Debug for ReplySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplySink")
            .field("armed", &self.reply.is_some())
            .finish()
    }
}

impl ReplySink {
    pub fn new(reply: impl FnOnce(ReplyOutcome) + Send + 'static) -> Self {
        Self {
            reply: Some(Box::new(reply)),
        }
    }

    pub fn send(mut self, reply: StreamReply) {
        if let Some(f) = self.reply.take() {
            f(ReplyOutcome::Replied(reply));
        }
    }

    /// Drop the sink without ever answering.
    pub fn abandon(mut self) {
        self.reply = None;
    }
}

impl Drop for ReplySink {
    fn drop(&mut self) {
        if let Some(f) = self.reply.take() {
            f(ReplyOutcome::Lost);
        }
    }
}

/// Errors from calls on a bound adapter.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("adapter disconnected")]
    Disconnected,
    #[error("adapter returned error: {0}")]
    Adapter(String),
    #[error("unexpected response to {method}")]
    UnexpectedResponse { method: &'static str },
    #[error("interactive resolution failed to start: {0}")]
    Launch(String),
    #[error(transparent)]
    Host(#[from] PluginHostError),
}

/// The calls a content adapter answers.
pub trait RemoteAdapter: Send + Sync {
    /// Unique names served by this adapter process.
    fn unique_names(&self) -> Result<Vec<String>, RemoteError>;

    /// Display name for `unique_name`; may be empty.
    fn display_name(&self, unique_name: &str) -> Result<String, RemoteError>;

    /// Start resolving a stream. The answer goes to `reply`, possibly much later
    /// and from another thread.
    fn request_stream_uri(&self, request: StreamRequest, reply: ReplySink)
        -> Result<(), RemoteError>;
}

/// Connection signals a transport delivers for one bind request.
pub trait ConnectionEvents: Send + Sync {
    fn on_connected(&self, adapter: Arc<dyn RemoteAdapter>);

    fn on_disconnected(&self);
}

/// Errors from transport-level operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown adapter component {0}")]
    UnknownComponent(ComponentName),
    #[error("{0}")]
    Other(String),
}

/// Discovers and binds adapter services.
pub trait Transport: Send + Sync {
    /// Services advertising `capability`, in platform order.
    fn query_services(&self, capability: &str) -> Result<Vec<ServiceEntry>, TransportError>;

    /// Metadata for `component`, or `None` if it cannot be resolved.
    fn service_metadata(
        &self,
        component: &ComponentName,
    ) -> Result<Option<ServiceMetadata>, TransportError>;

    /// Request a connection. The outcome arrives through `events`, possibly
    /// before this returns.
    fn bind(
        &self,
        component: &ComponentName,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError>;

    /// Request teardown. The transport signals `on_disconnected` when done.
    fn unbind(&self, component: &ComponentName) -> Result<(), TransportError>;
}
