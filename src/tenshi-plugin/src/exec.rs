//! [`Transport`] that runs installed adapters as child processes.

use crate::host::{ExecPluginHost, ExecRemote};
use crate::manifest::{self, InstalledAdapter};
use crate::transport::{
    ComponentName, ConnectionEvents, ServiceEntry, ServiceMetadata, Transport, TransportError,
};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread;

type HostMap = HashMap<ComponentName, Arc<ExecPluginHost>>;

/// Finds adapters through `adapter.toml` manifests and binds to them by
/// spawning their executables.
pub struct ExecTransport {
    search_dirs: Vec<PathBuf>,
    /// Manifests seen by the last scan.
    catalog: RwLock<BTreeMap<ComponentName, InstalledAdapter>>,
    hosts: Arc<Mutex<HostMap>>,
}

impl std::fmt::Debug for ExecTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecTransport")
            .field("search_dirs", &self.search_dirs)
            .field("running", &self.running())
            .finish()
    }
}

fn lock_hosts(hosts: &Mutex<HostMap>) -> MutexGuard<'_, HostMap> {
    hosts.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecTransport {
    pub fn new(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            catalog: RwLock::new(BTreeMap::new()),
            hosts: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn search_dirs(&self) -> &[PathBuf] {
        &self.search_dirs
    }

    /// Number of adapter processes currently owned by this transport.
    pub fn running(&self) -> usize {
        lock_hosts(&self.hosts).len()
    }

    fn installed(&self, component: &ComponentName) -> Option<InstalledAdapter> {
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(component)
            .cloned()
    }
}

impl Transport for ExecTransport {
    fn query_services(&self, capability: &str) -> Result<Vec<ServiceEntry>, TransportError> {
        let scanned = manifest::scan(&self.search_dirs);

        let mut catalog: BTreeMap<ComponentName, InstalledAdapter> = BTreeMap::new();
        let mut entries = Vec::new();
        for adapter in scanned {
            let component = adapter.component();
            if let Some(existing) = catalog.get(&component) {
                tracing::warn!(
                    component = %component,
                    kept = %existing.manifest_path.display(),
                    ignored = %adapter.manifest_path.display(),
                    "adapter component installed twice"
                );
                continue;
            }
            if adapter.advertises(capability) {
                entries.push(ServiceEntry {
                    component: component.clone(),
                    exported: adapter.manifest.service.exported,
                });
            }
            catalog.insert(component, adapter);
        }

        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog;
        Ok(entries)
    }

    fn service_metadata(
        &self,
        component: &ComponentName,
    ) -> Result<Option<ServiceMetadata>, TransportError> {
        Ok(self
            .installed(component)
            .map(|adapter| adapter.manifest.metadata))
    }

    fn bind(
        &self,
        component: &ComponentName,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError> {
        let adapter = self
            .installed(component)
            .ok_or_else(|| TransportError::UnknownComponent(component.clone()))?;

        let host = Arc::new(ExecPluginHost::new(adapter.plugin_config()));
        let previous = lock_hosts(&self.hosts).insert(component.clone(), Arc::clone(&host));
        if let Some(previous) = previous {
            tracing::debug!(component = %component, "replacing running adapter process");
            previous.stop();
        }

        let on_exit = {
            let hosts = Arc::clone(&self.hosts);
            let owner = Arc::downgrade(&host);
            let component = component.clone();
            let events = Arc::clone(&events);
            move || {
                let removed = {
                    let mut map = lock_hosts(&hosts);
                    let ours = map
                        .get(&component)
                        .is_some_and(|h| std::ptr::eq(Arc::as_ptr(h), owner.as_ptr()));
                    if ours {
                        map.remove(&component)
                    } else {
                        None
                    }
                };
                if let Some(host) = removed {
                    host.stop();
                }
                tracing::debug!(component = %component, "adapter process exited");
                events.on_disconnected();
            }
        };

        let thread_component = component.clone();
        let thread_host = Arc::clone(&host);
        let spawned = thread::Builder::new()
            .name(format!("tenshi-bind-{}", component.name))
            .spawn(move || match thread_host.start(on_exit) {
                Ok(info) => {
                    tracing::debug!(
                        component = %thread_component,
                        adapter_name = %info.name,
                        "adapter process ready"
                    );
                    let exited = thread_host.has_exited();
                    events.on_connected(Arc::new(ExecRemote::new(thread_host)));
                    if exited {
                        events.on_disconnected();
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        component = %thread_component,
                        error = %err,
                        "failed to start adapter process"
                    );
                }
            });

        if let Err(err) = spawned {
            lock_hosts(&self.hosts).remove(component);
            return Err(TransportError::Other(format!(
                "failed to spawn bind thread for {component}: {err}"
            )));
        }
        Ok(())
    }

    fn unbind(&self, component: &ComponentName) -> Result<(), TransportError> {
        let host = lock_hosts(&self.hosts).remove(component);
        match host {
            // The reader thread reports the disconnect once the process is gone.
            Some(host) => host.stop(),
            None => tracing::debug!(component = %component, "unbind with no running process"),
        }
        Ok(())
    }
}

impl Drop for ExecTransport {
    fn drop(&mut self) {
        let hosts: Vec<_> = lock_hosts(&self.hosts).drain().map(|(_, h)| h).collect();
        for host in hosts {
            host.stop();
        }
    }
}
