//! Content adapter support for Tenshi.
//!
//! This crate provides:
//! - Discovery of installed content adapters, gated on the API version they advertise
//! - A connection per adapter service that can be waited on from background tasks
//! - Stream URI resolution with a persistent storage round-trip
//! - An exec-based transport that runs adapters as child processes
//! - The adapter-side server and request router adapter executables link against
//!
//! # Adapter Protocol
//!
//! Adapters communicate with Tenshi via JSON messages over stdin/stdout:
//! - Tenshi sends [`PluginRequest`] messages (one per line) to the adapter's stdin
//! - The adapter responds with [`PluginResponse`] messages (one per line) on stdout
//!
//! Stream requests may be answered out of order, so responses carry the
//! request id they answer.
//!
//! # Example Adapter (pseudocode)
//!
//! ```text
//! while (line = read_stdin()):
//!     request = json_parse(line)
//!     if request.method.type == "Hello":
//!         result = {"status": "Hello", "name": "gogo", "version": "1.0.0", "protocol_version": 1}
//!     elif request.method.type == "UniqueNames":
//!         result = {"status": "UniqueNames", "names": ["gogo"]}
//!     elif request.method.type == "RequestStreamUri":
//!         result = {"status": "StreamUri", "stream_uri": find(request.method.params), "persistent_storage": "..."}
//!     write_stdout(json_stringify({"id": request.id, "result": result}) + "\n")
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tenshi_core::{MainLoop, TaskPool};
//! use tenshi_plugin::{AdapterContext, AdapterRegistry, ExecTransport};
//!
//! let main_loop = MainLoop::new();
//! let transport = Arc::new(ExecTransport::new(vec!["/path/to/adapters".into()]));
//! let pool = Arc::new(TaskPool::new(4)?);
//! let ctx = AdapterContext::new(transport, pool, Arc::new(main_loop.handle()));
//! let registry = AdapterRegistry::new(ctx);
//! registry.discover(false);
//! registry.on_discovery_complete(|| println!("adapters ready"));
//! ```

mod connection;
mod descriptor;
mod exec;
mod host;
mod manifest;
pub mod protocol;
mod registry;
pub mod router;
pub mod server;
pub mod transport;

/// Capability tag every content adapter service advertises.
pub const CAPABILITY_CONTENT_ADAPTER: &str = "io.github.shadow578.tenshi.content.ADAPTER";

/// Metadata key holding the adapter's API version.
pub const META_API_VERSION: &str = "io.github.shadow578.tenshi.content.ADAPTER_VERSION";

/// Lowest adapter API version this host talks to.
pub const TARGET_API_VERSION: i32 = 2;

pub use connection::{
    AdapterContext, AdapterIdentity, ConnectionState, ContentAdapter, StreamCallback,
};
pub use descriptor::{
    api_version_of, check_endpoint, resolve_display_name, DiscoveryError, EndpointDescriptor,
    UNKNOWN_API_VERSION,
};
pub use exec::ExecTransport;
pub use host::{ExecPluginHost, ExecRemote, PluginConfig, PluginHostError, DEFAULT_CALL_TIMEOUT};
pub use manifest::{
    scan as scan_manifests, AdapterManifest, ExecSection, InstalledAdapter, ManifestError,
    ServiceSection, MANIFEST_FILE,
};
pub use protocol::{
    PluginError, PluginErrorKind, PluginInfo, PluginMethod, PluginRequest, PluginResponse,
    PluginResult, PROTOCOL_VERSION,
};
pub use registry::{AdapterRegistry, DiscoveryState};
pub use router::{AdapterCatalog, InteractiveLauncher, InteractiveRequest, RequestRouter};
pub use transport::{
    ComponentName, ConnectionEvents, MetadataValue, RemoteAdapter, RemoteError, ReplyOutcome,
    ReplySink,
    ServiceEntry, ServiceMetadata, StreamReply, StreamRequest, Transport, TransportError,
};
