//! Connection to one content adapter service.
//!
//! A [`ContentAdapter`] owns the binding to a single adapter process. It tracks
//! the transport's connect/disconnect signals, lets background tasks block
//! until the binding settles, and wraps the adapter's stream call with the
//! persistent storage round-trip.

use crate::descriptor::{resolve_display_name, DiscoveryError, EndpointDescriptor};
use crate::transport::{
    ComponentName, ConnectionEvents, RemoteAdapter, RemoteError, ReplySink, StreamRequest,
    Transport,
};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tenshi_core::{Dispatcher, PersistentStorage, StorageError};
use thiserror::Error;

/// Callback receiving a resolved stream URI, or `None` if nothing was found.
pub type StreamCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Collaborators shared by the registry and every connection it creates.
pub struct AdapterContext {
    transport: Arc<dyn Transport>,
    storage: Option<Arc<dyn PersistentStorage>>,
    background: Arc<dyn Dispatcher>,
    main: Arc<dyn Dispatcher>,
    connect_timeout: Option<Duration>,
}

impl fmt::Debug for AdapterContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterContext")
            .field("storage", &self.storage.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl AdapterContext {
    /// `background` runs discovery and blocking request work; `main` receives
    /// every result callback.
    pub fn new(
        transport: Arc<dyn Transport>,
        background: Arc<dyn Dispatcher>,
        main: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            transport,
            storage: None,
            background,
            main,
            connect_timeout: None,
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn PersistentStorage>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Stop waiting for a connection after `timeout`. Without one, waiters
    /// block until the transport signals connect or disconnect.
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub(crate) fn background(&self) -> &Arc<dyn Dispatcher> {
        &self.background
    }

    pub(crate) fn main(&self) -> &Arc<dyn Dispatcher> {
        &self.main
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unbound,
    Connecting,
    Connected,
    Disconnected,
}

struct Link {
    state: ConnectionState,
    remote: Option<Arc<dyn RemoteAdapter>>,
    /// Bumped on every bind so signals from an earlier binding are ignored.
    generation: u64,
    teardown_requested: bool,
}

struct Inner {
    endpoint: EndpointDescriptor,
    ctx: Arc<AdapterContext>,
    link: Mutex<Link>,
    link_changed: Condvar,
    /// Serialises identity queries and stream requests on this connection.
    calls: Mutex<()>,
}

/// Handle to one adapter service connection. Cheap to clone.
#[derive(Clone)]
pub struct ContentAdapter {
    inner: Arc<Inner>,
}

impl fmt::Debug for ContentAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentAdapter")
            .field("component", &self.inner.endpoint.component)
            .field("api_version", &self.inner.endpoint.api_version)
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Error)]
enum RequestError {
    #[error("failed to load persistent storage: {0}")]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ContentAdapter {
    pub fn new(endpoint: EndpointDescriptor, ctx: Arc<AdapterContext>) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint,
                ctx,
                link: Mutex::new(Link {
                    state: ConnectionState::Unbound,
                    remote: None,
                    generation: 0,
                    teardown_requested: false,
                }),
                link_changed: Condvar::new(),
                calls: Mutex::new(()),
            }),
        }
    }

    pub fn component(&self) -> &ComponentName {
        &self.inner.endpoint.component
    }

    pub fn api_version(&self) -> i32 {
        self.inner.endpoint.api_version
    }

    pub fn state(&self) -> ConnectionState {
        self.link().state
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        self.inner
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the transport to connect. Does nothing while a connection is being
    /// established or is up.
    pub fn bind(&self) {
        let generation = {
            let mut link = self.link();
            let live = matches!(
                link.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if live && !link.teardown_requested {
                return;
            }
            link.generation += 1;
            link.state = ConnectionState::Connecting;
            link.remote = None;
            link.teardown_requested = false;
            link.generation
        };

        let events: Arc<dyn ConnectionEvents> = Arc::new(LinkEvents {
            adapter: Arc::downgrade(&self.inner),
            generation,
        });

        tracing::debug!(component = %self.component(), generation, "binding adapter");
        if let Err(err) = self.inner.ctx.transport.bind(self.component(), events) {
            tracing::warn!(component = %self.component(), error = %err, "failed to bind adapter");
            Inner::apply(&self.inner, generation, None);
        }
    }

    /// Ask the transport to tear the connection down. The state changes when
    /// the transport reports the disconnect. Repeated calls, or calls on an
    /// adapter that is not bound, do nothing.
    pub fn unbind(&self) {
        {
            let mut link = self.link();
            let live = matches!(
                link.state,
                ConnectionState::Connecting | ConnectionState::Connected
            );
            if !live || link.teardown_requested {
                return;
            }
            link.teardown_requested = true;
        }

        tracing::debug!(component = %self.component(), "unbinding adapter");
        if let Err(err) = self.inner.ctx.transport.unbind(self.component()) {
            tracing::warn!(component = %self.component(), error = %err, "failed to unbind adapter");
        }
    }

    /// Unbind and wake every waiter now, without waiting for the transport to
    /// confirm. Signals from the closed binding are ignored afterwards.
    pub fn close(&self) {
        self.unbind();
        let mut link = self.link();
        link.generation += 1;
        link.state = ConnectionState::Disconnected;
        link.remote = None;
        link.teardown_requested = false;
        self.inner.link_changed.notify_all();
    }

    /// Block until the connection is up or has gone away.
    fn wait_until_connected(&self) -> Option<Arc<dyn RemoteAdapter>> {
        let deadline = self.inner.ctx.connect_timeout.map(|t| Instant::now() + t);
        let mut link = self.link();
        loop {
            match link.state {
                ConnectionState::Connected => return link.remote.clone(),
                ConnectionState::Disconnected | ConnectionState::Unbound => return None,
                ConnectionState::Connecting => {}
            }

            link = match deadline {
                None => self
                    .inner
                    .link_changed
                    .wait(link)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(
                            component = %self.component(),
                            "timed out waiting for adapter to connect"
                        );
                        return None;
                    }
                    self.inner
                        .link_changed
                        .wait_timeout(link, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Bind, query every unique name the adapter serves, and build an
    /// identity for each. Unbinds afterwards unless `keep_bound` is set.
    pub fn identities(&self, keep_bound: bool) -> Result<Vec<AdapterIdentity>, DiscoveryError> {
        let result = {
            let _calls = self
                .inner
                .calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.bind();
            self.query_identities()
        };
        if !keep_bound {
            self.unbind();
        }
        result
    }

    fn query_identities(&self) -> Result<Vec<AdapterIdentity>, DiscoveryError> {
        let component = self.component().clone();
        let remote = self
            .wait_until_connected()
            .ok_or_else(|| DiscoveryError::NotConnected {
                component: component.clone(),
            })?;

        let names = remote
            .unique_names()
            .map_err(|source| DiscoveryError::Remote {
                component: component.clone(),
                source,
            })?;

        let mut identities = Vec::with_capacity(names.len());
        for unique_name in names {
            if unique_name.trim().is_empty() {
                tracing::error!(
                    component = %component,
                    "adapter reported an empty unique name; skipping it"
                );
                continue;
            }

            let reported =
                remote
                    .display_name(&unique_name)
                    .map_err(|source| DiscoveryError::Remote {
                        component: component.clone(),
                        source,
                    })?;
            let (display_name, missing) = resolve_display_name(&unique_name, &reported);
            if missing {
                tracing::warn!(
                    unique_name = %unique_name,
                    "adapter does not define a display name (or it equals the unique name)"
                );
            }

            identities.push(AdapterIdentity {
                adapter: self.clone(),
                unique_name,
                display_name,
            });
        }

        if identities.is_empty() {
            return Err(DiscoveryError::NoUniqueNames { component });
        }
        Ok(identities)
    }

    /// Resolve a stream URI for `unique_name` without blocking the caller.
    ///
    /// The work runs on the background dispatcher: bind if needed, wait for
    /// the connection, load storage, call the adapter. `on_result` runs exactly
    /// once on the main dispatcher, with `None` on any failure.
    pub fn request_stream_uri(
        &self,
        unique_name: &str,
        anime_id: u32,
        en_title: &str,
        jp_title: &str,
        episode: u32,
        on_result: impl FnOnce(Option<String>) + Send + 'static,
    ) {
        let request = StreamRequest {
            unique_name: unique_name.to_string(),
            anime_id,
            en_title: en_title.to_string(),
            jp_title: jp_title.to_string(),
            episode,
            persistent_storage: String::new(),
        };
        let delivery = Delivery::new(Arc::clone(&self.inner.ctx.main), Box::new(on_result));
        let this = self.clone();
        self.inner
            .ctx
            .background
            .dispatch(Box::new(move || this.resolve_blocking(request, delivery)));
    }

    fn resolve_blocking(&self, request: StreamRequest, delivery: Delivery) {
        let _calls = self
            .inner
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        self.bind();
        let Some(remote) = self.wait_until_connected() else {
            tracing::info!(
                component = %self.component(),
                unique_name = %request.unique_name,
                "adapter is not connected; no stream"
            );
            delivery.deliver(None);
            return;
        };

        let unique_name = request.unique_name.clone();
        if let Err(err) = self.send_request(remote.as_ref(), request, delivery.clone()) {
            tracing::error!(
                component = %self.component(),
                unique_name = %unique_name,
                error = %err,
                "stream request failed"
            );
            delivery.deliver(None);
        }
    }

    fn send_request(
        &self,
        remote: &dyn RemoteAdapter,
        mut request: StreamRequest,
        delivery: Delivery,
    ) -> Result<(), RequestError> {
        let storage = self.inner.ctx.storage.clone();
        let storage_in = match &storage {
            Some(storage) => storage.get(&request.unique_name, request.anime_id)?,
            None => String::new(),
        };
        request.persistent_storage = storage_in.clone();

        let unique_name = request.unique_name.clone();
        let anime_id = request.anime_id;
        let sink = ReplySink::new(move |outcome| {
            let Some(reply) = outcome.into_reply() else {
                // Nothing came back, so the saved storage stays as it was.
                tracing::info!(
                    unique_name = %unique_name,
                    anime_id,
                    "stream request went unanswered"
                );
                delivery.deliver(None);
                return;
            };
            let storage_out = reply.persistent_storage.unwrap_or_default();
            if let Some(storage) = storage {
                if storage_out != storage_in {
                    if let Err(err) = storage.set(&unique_name, anime_id, &storage_out) {
                        tracing::warn!(
                            unique_name = %unique_name,
                            anime_id,
                            error = %err,
                            "failed to save persistent storage"
                        );
                    }
                }
            }
            delivery.deliver(reply.stream_uri);
        });

        remote.request_stream_uri(request, sink)?;
        Ok(())
    }
}

impl Inner {
    /// Record a connect (`Some`) or disconnect (`None`) for `generation`.
    fn apply(inner: &Arc<Inner>, generation: u64, remote: Option<Arc<dyn RemoteAdapter>>) {
        let mut link = inner.link.lock().unwrap_or_else(PoisonError::into_inner);
        if link.generation != generation {
            tracing::debug!(
                component = %inner.endpoint.component,
                generation,
                current = link.generation,
                "ignoring signal from a previous binding"
            );
            return;
        }

        match remote {
            Some(remote) => {
                tracing::info!(component = %inner.endpoint.component, "adapter connected");
                link.state = ConnectionState::Connected;
                link.remote = Some(remote);
            }
            None => {
                tracing::warn!(component = %inner.endpoint.component, "adapter disconnected");
                link.state = ConnectionState::Disconnected;
                link.remote = None;
                link.teardown_requested = false;
            }
        }
        inner.link_changed.notify_all();
    }
}

struct LinkEvents {
    adapter: Weak<Inner>,
    generation: u64,
}

impl ConnectionEvents for LinkEvents {
    fn on_connected(&self, remote: Arc<dyn RemoteAdapter>) {
        if let Some(inner) = self.adapter.upgrade() {
            Inner::apply(&inner, self.generation, Some(remote));
        }
    }

    fn on_disconnected(&self) {
        if let Some(inner) = self.adapter.upgrade() {
            Inner::apply(&inner, self.generation, None);
        }
    }
}

struct DeliveryInner {
    main: Arc<dyn Dispatcher>,
    callback: Mutex<Option<StreamCallback>>,
}

impl DeliveryInner {
    fn deliver(&self, stream_uri: Option<String>) {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            self.main.dispatch(Box::new(move || callback(stream_uri)));
        }
    }
}

impl Drop for DeliveryInner {
    fn drop(&mut self) {
        // Every clone is gone without an answer (e.g. a panicking task).
        self.deliver(None);
    }
}

/// Single-use route for a stream result back onto the main dispatcher.
#[derive(Clone)]
struct Delivery(Arc<DeliveryInner>);

impl Delivery {
    fn new(main: Arc<dyn Dispatcher>, callback: StreamCallback) -> Self {
        Self(Arc::new(DeliveryInner {
            main,
            callback: Mutex::new(Some(callback)),
        }))
    }

    fn deliver(&self, stream_uri: Option<String>) {
        self.0.deliver(stream_uri);
    }
}

/// One unique name served by a [`ContentAdapter`].
///
/// Several identities may share the same adapter connection.
#[derive(Clone)]
pub struct AdapterIdentity {
    adapter: ContentAdapter,
    unique_name: String,
    display_name: String,
}

impl fmt::Debug for AdapterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterIdentity")
            .field("unique_name", &self.unique_name)
            .field("display_name", &self.display_name)
            .field("component", self.adapter.component())
            .finish()
    }
}

impl AdapterIdentity {
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn api_version(&self) -> i32 {
        self.adapter.api_version()
    }

    pub fn component(&self) -> &ComponentName {
        self.adapter.component()
    }

    pub fn adapter(&self) -> &ContentAdapter {
        &self.adapter
    }

    pub fn bind(&self) {
        self.adapter.bind();
    }

    pub fn unbind(&self) {
        self.adapter.unbind();
    }

    /// Resolve a stream URI through this identity.
    /// See [`ContentAdapter::request_stream_uri`].
    pub fn request_stream_uri(
        &self,
        anime_id: u32,
        en_title: &str,
        jp_title: &str,
        episode: u32,
        on_result: impl FnOnce(Option<String>) + Send + 'static,
    ) {
        self.adapter.request_stream_uri(
            &self.unique_name,
            anime_id,
            en_title,
            jp_title,
            episode,
            on_result,
        );
    }
}
