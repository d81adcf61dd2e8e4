#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tenshi_core::{MainLoop, PersistentStorage, StorageError, StorageResult, TaskPool};
use tenshi_plugin::{
    AdapterContext, AdapterRegistry, ComponentName, ConnectionEvents, MetadataValue,
    RemoteAdapter, RemoteError, ReplySink, ServiceEntry, ServiceMetadata, StreamReply,
    StreamRequest, Transport, TransportError, META_API_VERSION,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn version_meta(version: i64) -> ServiceMetadata {
    let mut meta = ServiceMetadata::new();
    meta.insert(META_API_VERSION.to_string(), MetadataValue::Integer(version));
    meta
}

/// Poll `cond` until it holds or [`WAIT`] elapses.
pub fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + WAIT;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn component(name: &str) -> ComponentName {
    ComponentName::new(format!("io.example.{name}"), name)
}

/// How a fake service reacts to a bind.
#[derive(Debug, Clone, Copy)]
pub enum BindMode {
    /// Connects before `bind` returns.
    Immediate,
    /// Connects from another thread after the delay.
    Delayed(Duration),
    /// Waits for [`FakeTransport::connect`] or [`FakeTransport::disconnect`].
    Manual,
    /// Reports a disconnect from another thread.
    Fail,
    /// `bind` itself returns an error.
    Refuse,
}

struct FakeService {
    entry: ServiceEntry,
    metadata: Option<ServiceMetadata>,
    remote: Arc<FakeRemote>,
    mode: BindMode,
}

/// In-memory transport with a fixed service order.
#[derive(Default)]
pub struct FakeTransport {
    services: Mutex<Vec<FakeService>>,
    events: Mutex<HashMap<ComponentName, Arc<dyn ConnectionEvents>>>,
    binds: Mutex<Vec<ComponentName>>,
    unbinds: Mutex<Vec<ComponentName>>,
    replaced: Mutex<Vec<ComponentName>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(
        &self,
        name: &str,
        metadata: Option<ServiceMetadata>,
        remote: Arc<FakeRemote>,
        mode: BindMode,
    ) -> ComponentName {
        self.add_entry(name, true, metadata, remote, mode)
    }

    pub fn add_entry(
        &self,
        name: &str,
        exported: bool,
        metadata: Option<ServiceMetadata>,
        remote: Arc<FakeRemote>,
        mode: BindMode,
    ) -> ComponentName {
        let component = component(name);
        self.services.lock().unwrap().push(FakeService {
            entry: ServiceEntry {
                component: component.clone(),
                exported,
            },
            metadata,
            remote,
            mode,
        });
        component
    }

    fn remote_of(&self, component: &ComponentName) -> Option<Arc<FakeRemote>> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.entry.component == component)
            .map(|s| Arc::clone(&s.remote))
    }

    pub fn binds(&self, component: &ComponentName) -> usize {
        self.binds.lock().unwrap().iter().filter(|c| *c == component).count()
    }

    pub fn unbinds(&self, component: &ComponentName) -> usize {
        self.unbinds.lock().unwrap().iter().filter(|c| *c == component).count()
    }

    /// Bindings of `component` torn down because a newer bind replaced them.
    pub fn replaced(&self, component: &ComponentName) -> usize {
        self.replaced.lock().unwrap().iter().filter(|c| *c == component).count()
    }

    /// True while a bind of `component` awaits its outcome or is connected.
    pub fn is_bound(&self, component: &ComponentName) -> bool {
        self.events.lock().unwrap().contains_key(component)
    }

    /// Signal a connect for the latest bind of `component`.
    pub fn connect(&self, component: &ComponentName) {
        let events = self.events.lock().unwrap().get(component).cloned();
        if let (Some(events), Some(remote)) = (events, self.remote_of(component)) {
            events.on_connected(remote);
        }
    }

    /// Signal a disconnect, dropping any stream request the remote holds.
    pub fn disconnect(&self, component: &ComponentName) {
        if let Some(remote) = self.remote_of(component) {
            remote.drop_held();
        }
        let events = self.events.lock().unwrap().get(component).cloned();
        if let Some(events) = events {
            events.on_disconnected();
        }
    }
}

impl Transport for FakeTransport {
    fn query_services(&self, _capability: &str) -> Result<Vec<ServiceEntry>, TransportError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.entry.clone())
            .collect())
    }

    fn service_metadata(
        &self,
        component: &ComponentName,
    ) -> Result<Option<ServiceMetadata>, TransportError> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.entry.component == component)
            .and_then(|s| s.metadata.clone()))
    }

    fn bind(
        &self,
        component: &ComponentName,
        events: Arc<dyn ConnectionEvents>,
    ) -> Result<(), TransportError> {
        self.binds.lock().unwrap().push(component.clone());
        let (remote, mode) = {
            let services = self.services.lock().unwrap();
            let service = services
                .iter()
                .find(|s| &s.entry.component == component)
                .ok_or_else(|| TransportError::UnknownComponent(component.clone()))?;
            (Arc::clone(&service.remote), service.mode)
        };

        if matches!(mode, BindMode::Refuse) {
            return Err(TransportError::Other("bind refused".into()));
        }
        // A new binding replaces the previous one, which is torn down.
        let replaced = self
            .events
            .lock()
            .unwrap()
            .insert(component.clone(), Arc::clone(&events));
        if let Some(replaced) = replaced {
            self.replaced.lock().unwrap().push(component.clone());
            replaced.on_disconnected();
        }

        match mode {
            BindMode::Immediate => events.on_connected(remote),
            BindMode::Delayed(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    events.on_connected(remote);
                });
            }
            BindMode::Fail => {
                thread::spawn(move || events.on_disconnected());
            }
            BindMode::Manual | BindMode::Refuse => {}
        }
        Ok(())
    }

    fn unbind(&self, component: &ComponentName) -> Result<(), TransportError> {
        self.unbinds.lock().unwrap().push(component.clone());
        let events = self.events.lock().unwrap().remove(component);
        if let Some(events) = events {
            events.on_disconnected();
        }
        Ok(())
    }
}

/// How a fake remote answers stream requests.
#[derive(Debug, Clone)]
pub enum ReplyMode {
    Immediate(StreamReply),
    /// Keep the sink until the test releases or drops it.
    Hold,
    Fail,
}

pub struct FakeRemote {
    names: Vec<String>,
    display: HashMap<String, String>,
    reply: Mutex<ReplyMode>,
    requests: Mutex<Vec<StreamRequest>>,
    held: Mutex<Vec<ReplySink>>,
    names_fail: bool,
}

impl FakeRemote {
    pub fn new(names: &[&str]) -> Self {
        Self {
            names: names.iter().map(|n| n.to_string()).collect(),
            display: HashMap::new(),
            reply: Mutex::new(ReplyMode::Immediate(StreamReply::default())),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
            names_fail: false,
        }
    }

    pub fn with_display(mut self, unique_name: &str, display_name: &str) -> Self {
        self.display
            .insert(unique_name.to_string(), display_name.to_string());
        self
    }

    pub fn replying(self, stream_uri: Option<&str>, storage: Option<&str>) -> Self {
        *self.reply.lock().unwrap() = ReplyMode::Immediate(StreamReply::new(
            stream_uri.map(str::to_string),
            storage.map(str::to_string),
        ));
        self
    }

    pub fn holding(self) -> Self {
        *self.reply.lock().unwrap() = ReplyMode::Hold;
        self
    }

    pub fn failing(self) -> Self {
        *self.reply.lock().unwrap() = ReplyMode::Fail;
        self
    }

    pub fn failing_names(mut self) -> Self {
        self.names_fail = true;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn release_held(&self, reply: StreamReply) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        for sink in held {
            sink.send(reply.clone());
        }
    }

    pub fn drop_held(&self) {
        let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
        drop(held);
    }
}

impl RemoteAdapter for FakeRemote {
    fn unique_names(&self) -> Result<Vec<String>, RemoteError> {
        if self.names_fail {
            return Err(RemoteError::Adapter("names unavailable".into()));
        }
        Ok(self.names.clone())
    }

    fn display_name(&self, unique_name: &str) -> Result<String, RemoteError> {
        Ok(self.display.get(unique_name).cloned().unwrap_or_default())
    }

    fn request_stream_uri(
        &self,
        request: StreamRequest,
        reply: ReplySink,
    ) -> Result<(), RemoteError> {
        self.requests.lock().unwrap().push(request);
        let mode = self.reply.lock().unwrap().clone();
        match mode {
            ReplyMode::Immediate(answer) => {
                // Answer from a thread the caller does not own.
                thread::spawn(move || reply.send(answer));
                Ok(())
            }
            ReplyMode::Hold => {
                self.held.lock().unwrap().push(reply);
                Ok(())
            }
            // The unanswered sink drops on return.
            ReplyMode::Fail => Err(RemoteError::Adapter("resolve failed".into())),
        }
    }
}

/// In-memory storage that records every call.
#[derive(Default)]
pub struct RecordingStorage {
    values: Mutex<HashMap<(String, u32), String>>,
    gets: Mutex<Vec<(String, u32)>>,
    sets: Mutex<Vec<(String, u32, String)>>,
    fail_get: bool,
}

impl RecordingStorage {
    pub fn with_value(self, unique_name: &str, anime_id: u32, value: &str) -> Self {
        self.values
            .lock()
            .unwrap()
            .insert((unique_name.to_string(), anime_id), value.to_string());
        self
    }

    pub fn failing_reads() -> Self {
        Self {
            fail_get: true,
            ..Self::default()
        }
    }

    pub fn gets(&self) -> Vec<(String, u32)> {
        self.gets.lock().unwrap().clone()
    }

    pub fn sets(&self) -> Vec<(String, u32, String)> {
        self.sets.lock().unwrap().clone()
    }

    pub fn value(&self, unique_name: &str, anime_id: u32) -> Option<String> {
        self.values
            .lock()
            .unwrap()
            .get(&(unique_name.to_string(), anime_id))
            .cloned()
    }
}

impl PersistentStorage for RecordingStorage {
    fn get(&self, unique_name: &str, anime_id: u32) -> StorageResult<String> {
        self.gets
            .lock()
            .unwrap()
            .push((unique_name.to_string(), anime_id));
        if self.fail_get {
            return Err(StorageError::Poisoned);
        }
        Ok(self.value(unique_name, anime_id).unwrap_or_default())
    }

    fn set(&self, unique_name: &str, anime_id: u32, value: &str) -> StorageResult<()> {
        self.sets
            .lock()
            .unwrap()
            .push((unique_name.to_string(), anime_id, value.to_string()));
        self.values
            .lock()
            .unwrap()
            .insert((unique_name.to_string(), anime_id), value.to_string());
        Ok(())
    }
}

/// A registry wired to a worker pool and a main loop driven by the test.
pub struct Harness {
    pub main: MainLoop,
    pub registry: AdapterRegistry,
}

impl Harness {
    pub fn new(transport: Arc<FakeTransport>) -> Self {
        Self::with_context(transport, |ctx| ctx)
    }

    pub fn with_context(
        transport: Arc<FakeTransport>,
        configure: impl FnOnce(AdapterContext) -> AdapterContext,
    ) -> Self {
        let main = MainLoop::new();
        let ctx = AdapterContext::new(
            transport,
            Arc::new(TaskPool::new(2).unwrap()),
            Arc::new(main.handle()),
        );
        Self {
            registry: AdapterRegistry::new(configure(ctx)),
            main,
        }
    }

    /// Run discovery and pump the main loop until it completes.
    pub fn discover(&self, auto_connect: bool) {
        let done = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&done);
        self.registry.discover(auto_connect);
        self.registry
            .on_discovery_complete(move || *flag.lock().unwrap() = true);
        assert!(
            self.main.run_until(|| *done.lock().unwrap(), WAIT),
            "discovery did not complete"
        );
    }
}

/// Collects stream results delivered on the main loop.
#[derive(Clone, Default)]
pub struct Results(Arc<Mutex<Vec<Option<String>>>>);

impl Results {
    pub fn callback(&self) -> impl FnOnce(Option<String>) + Send + 'static {
        let results = Arc::clone(&self.0);
        move |uri| results.lock().unwrap().push(uri)
    }

    pub fn all(&self) -> Vec<Option<String>> {
        self.0.lock().unwrap().clone()
    }

    pub fn wait_for(&self, main: &MainLoop, count: usize) -> Vec<Option<String>> {
        main.run_until(|| self.0.lock().unwrap().len() >= count, WAIT);
        self.all()
    }
}
