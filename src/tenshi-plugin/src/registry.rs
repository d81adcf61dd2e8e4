//! Discovery and bookkeeping of installed content adapters.

use crate::connection::{AdapterContext, AdapterIdentity, ContentAdapter};
use crate::descriptor::{check_endpoint, DiscoveryError, EndpointDescriptor};
use crate::transport::{ComponentName, ServiceEntry};
use crate::CAPABILITY_CONTENT_ADAPTER;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

type DiscoveryListener = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    NotStarted,
    Running,
    Complete,
}

struct DiscoverySession {
    state: DiscoveryState,
    listeners: Vec<DiscoveryListener>,
}

struct RegistryInner {
    ctx: Arc<AdapterContext>,
    /// Identities in discovery order; unique names never repeat.
    identities: RwLock<Vec<AdapterIdentity>>,
    /// Connections that contributed at least one identity.
    adapters: Mutex<Vec<ContentAdapter>>,
    session: Mutex<DiscoverySession>,
}

/// Finds content adapters, keeps one connection per adapter service and
/// looks identities up by unique name. Cheap to clone.
#[derive(Clone)]
pub struct AdapterRegistry {
    inner: Arc<RegistryInner>,
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.count())
            .field("discovery", &self.discovery_state())
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new(ctx: AdapterContext) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                ctx: Arc::new(ctx),
                identities: RwLock::new(Vec::new()),
                adapters: Mutex::new(Vec::new()),
                session: Mutex::new(DiscoverySession {
                    state: DiscoveryState::NotStarted,
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, DiscoverySession> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.session().state
    }

    /// Listeners still waiting for the current discovery pass.
    pub fn pending_listeners(&self) -> usize {
        self.session().listeners.len()
    }

    /// Run a discovery pass on the background dispatcher.
    ///
    /// With `auto_connect` the adapters stay bound afterwards; otherwise they
    /// are bound only long enough to ask for their unique names. Listeners
    /// registered with [`on_discovery_complete`](Self::on_discovery_complete)
    /// run on the main dispatcher once the pass ends.
    pub fn discover(&self, auto_connect: bool) {
        self.session().state = DiscoveryState::Running;
        let this = self.clone();
        self.inner.ctx.background().dispatch(Box::new(move || {
            this.run_discovery(auto_connect);
            this.complete_discovery();
        }));
    }

    /// Run `listener` once discovery has completed: immediately (on the
    /// calling thread) if it already has, otherwise on the main dispatcher
    /// when the running pass ends.
    pub fn on_discovery_complete(&self, listener: impl FnOnce() + Send + 'static) {
        let mut session = self.session();
        if session.state == DiscoveryState::Complete {
            drop(session);
            listener();
        } else {
            session.listeners.push(Box::new(listener));
        }
    }

    fn complete_discovery(&self) {
        let listeners = {
            let mut session = self.session();
            session.state = DiscoveryState::Complete;
            std::mem::take(&mut session.listeners)
        };
        tracing::info!(
            adapters = self.count(),
            listeners = listeners.len(),
            "content adapter discovery complete"
        );
        for listener in listeners {
            self.inner.ctx.main().dispatch(listener);
        }
    }

    fn run_discovery(&self, auto_connect: bool) {
        let services = match self
            .inner
            .ctx
            .transport()
            .query_services(CAPABILITY_CONTENT_ADAPTER)
        {
            Ok(services) => services,
            Err(err) => {
                tracing::error!(error = %err, "failed to query content adapter services");
                return;
            }
        };
        tracing::debug!(found = services.len(), "queried content adapter services");

        for entry in services {
            if let Err(err) = self.add_service(&entry, auto_connect) {
                tracing::warn!(error = %err, "skipping content adapter");
            }
        }
    }

    fn add_service(&self, entry: &ServiceEntry, auto_connect: bool) -> Result<(), DiscoveryError> {
        let metadata = match self.inner.ctx.transport().service_metadata(&entry.component) {
            Ok(metadata) => metadata,
            Err(err) => {
                return Err(DiscoveryError::MetadataUnavailable {
                    component: entry.component.clone(),
                    reason: err.to_string(),
                })
            }
        };
        let endpoint = check_endpoint(entry, metadata)?;
        self.add_endpoint(endpoint, auto_connect)
    }

    fn add_endpoint(
        &self,
        endpoint: EndpointDescriptor,
        auto_connect: bool,
    ) -> Result<(), DiscoveryError> {
        if let Some(known) = self.adapter_for(&endpoint.component) {
            // Binding a second connection would replace the live one.
            tracing::debug!(
                component = %known.component(),
                "content adapter already registered"
            );
            if auto_connect {
                known.bind();
            }
            return Ok(());
        }

        let adapter = ContentAdapter::new(endpoint, Arc::clone(&self.inner.ctx));
        let identities = adapter.identities(auto_connect)?;

        let added = {
            let mut table = self
                .inner
                .identities
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut added = 0;
            for identity in identities {
                if let Some(existing) = table
                    .iter()
                    .find(|known| known.unique_name() == identity.unique_name())
                {
                    tracing::warn!(
                        unique_name = %identity.unique_name(),
                        kept = %existing.component(),
                        dropped = %identity.component(),
                        "duplicate adapter unique name; keeping the first one found"
                    );
                    continue;
                }
                tracing::info!(
                    unique_name = %identity.unique_name(),
                    display_name = %identity.display_name(),
                    component = %identity.component(),
                    "registered content adapter"
                );
                table.push(identity);
                added += 1;
            }
            added
        };

        if added == 0 {
            tracing::debug!(
                component = %adapter.component(),
                "adapter contributed no new identities"
            );
            adapter.unbind();
            return Ok(());
        }

        self.inner
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(adapter);
        Ok(())
    }

    fn adapter_for(&self, component: &ComponentName) -> Option<ContentAdapter> {
        self.inner
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|adapter| adapter.component() == component)
            .cloned()
    }

    /// Snapshot of every registered identity, in discovery order.
    pub fn list(&self) -> Vec<AdapterIdentity> {
        self.inner
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self) -> usize {
        self.inner
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn get(&self, unique_name: &str) -> Option<AdapterIdentity> {
        self.inner
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|identity| identity.unique_name() == unique_name)
            .cloned()
    }

    /// Look `unique_name` up, falling back to the first identity discovered.
    pub fn get_or_default(&self, unique_name: &str) -> Option<AdapterIdentity> {
        let table = self
            .inner
            .identities
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        table
            .iter()
            .find(|identity| identity.unique_name() == unique_name)
            .or_else(|| table.first())
            .cloned()
    }

    /// Resolve a stream through the identity named `unique_name`.
    ///
    /// An unknown name answers `None` on the main dispatcher.
    pub fn request_stream_uri(
        &self,
        unique_name: &str,
        anime_id: u32,
        en_title: &str,
        jp_title: &str,
        episode: u32,
        on_result: impl FnOnce(Option<String>) + Send + 'static,
    ) {
        match self.get(unique_name) {
            Some(identity) => {
                identity.request_stream_uri(anime_id, en_title, jp_title, episode, on_result)
            }
            None => {
                tracing::warn!(unique_name = %unique_name, "no content adapter with this name");
                self.inner
                    .ctx
                    .main()
                    .dispatch(Box::new(move || on_result(None)));
            }
        }
    }

    /// Close every retained adapter, releasing anything still waiting for a
    /// connection. Safe to call repeatedly.
    pub fn shutdown(&self) {
        let adapters = self
            .inner
            .adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        tracing::debug!(adapters = adapters.len(), "closing content adapters");
        for adapter in adapters {
            adapter.close();
        }
    }
}
