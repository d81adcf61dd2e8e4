//! Exec-based adapter host that talks to an external process via JSON over stdio.
//!
//! Unlike a strict request/response pipe, stream requests stay open while
//! other calls go through, so responses are read on a dedicated thread and
//! routed back to their caller by request id.

use crate::protocol::{
    PluginInfo, PluginMethod, PluginRequest, PluginResponse, PluginResult, PROTOCOL_VERSION,
};
use crate::transport::{RemoteAdapter, RemoteError, ReplySink, StreamReply, StreamRequest};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// How long a synchronous call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

/// Errors from adapter host operations.
#[derive(Debug, Error)]
pub enum PluginHostError {
    #[error("failed to spawn adapter process: {0}")]
    SpawnFailed(std::io::Error),
    #[error("adapter process has no stdin")]
    NoStdin,
    #[error("adapter process has no stdout")]
    NoStdout,
    #[error("failed to start adapter reader thread: {0}")]
    ReaderFailed(std::io::Error),
    #[error("failed to write to adapter: {0}")]
    WriteError(std::io::Error),
    #[error("failed to encode adapter request: {0}")]
    EncodeError(serde_json::Error),
    #[error("adapter returned error: {0}")]
    PluginError(String),
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolMismatch { expected: u32, actual: u32 },
    #[error("unexpected response to {method}")]
    UnexpectedResponse { method: &'static str },
    #[error("adapter did not answer {method} within {timeout:?}")]
    Timeout {
        method: &'static str,
        timeout: Duration,
    },
    #[error("adapter process terminated unexpectedly")]
    ProcessTerminated,
}

/// Configuration for an external adapter process.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    /// Path to the adapter executable.
    pub executable: PathBuf,
    /// Arguments to pass to the adapter.
    pub args: Vec<String>,
    /// Working directory for the adapter process.
    pub working_dir: Option<PathBuf>,
    /// Environment variables to set for the adapter.
    pub env: Vec<(String, String)>,
}

enum Pending {
    Call(mpsc::Sender<PluginResult>),
    Stream(ReplySink),
}

/// Requests awaiting a response. Closed once the process output ends.
struct PendingTable {
    open: bool,
    entries: HashMap<u64, Pending>,
}

struct ProcessSlot {
    child: Option<Child>,
    stopped: bool,
}

type ExitFn = Box<dyn FnOnce() + Send + 'static>;

/// Fires at most once, when the process goes away or fails to start.
struct ExitSignal(Mutex<Option<ExitFn>>);

impl ExitSignal {
    fn fire(&self) {
        let on_exit = self.0.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(on_exit) = on_exit {
            on_exit();
        }
    }
}

/// Host for an external adapter process.
pub struct ExecPluginHost {
    config: PluginConfig,
    process: Mutex<ProcessSlot>,
    stdin: Mutex<Option<ChildStdin>>,
    pending: Arc<Mutex<PendingTable>>,
    request_id: AtomicU64,
    info: Mutex<Option<PluginInfo>>,
    call_timeout: Duration,
}

impl std::fmt::Debug for ExecPluginHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecPluginHost")
            .field("executable", &self.config.executable)
            .field("exited", &self.has_exited())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ExecPluginHost {
    /// Create a new adapter host with the given configuration.
    pub fn new(config: PluginConfig) -> Self {
        Self {
            config,
            process: Mutex::new(ProcessSlot {
                child: None,
                stopped: false,
            }),
            stdin: Mutex::new(None),
            pending: Arc::new(Mutex::new(PendingTable {
                open: false,
                entries: HashMap::new(),
            })),
            request_id: AtomicU64::new(1),
            info: Mutex::new(None),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Start the adapter process and perform the handshake.
    ///
    /// `on_exit` runs once: when the process output ends, or right away if
    /// starting fails. It runs on the reader thread in the first case.
    pub fn start(
        &self,
        on_exit: impl FnOnce() + Send + 'static,
    ) -> Result<PluginInfo, PluginHostError> {
        let exit = Arc::new(ExitSignal(Mutex::new(Some(Box::new(on_exit)))));
        match self.launch(&exit) {
            Ok(info) => Ok(info),
            Err(err) => {
                self.stop();
                exit.fire();
                Err(err)
            }
        }
    }

    fn launch(&self, exit: &Arc<ExitSignal>) -> Result<PluginInfo, PluginHostError> {
        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(PluginHostError::SpawnFailed)?;

        let stdin = child.stdin.take().ok_or(PluginHostError::NoStdin)?;
        let stdout = child.stdout.take().ok_or(PluginHostError::NoStdout)?;

        {
            let mut process = lock(&self.process);
            if process.stopped {
                // Stopped while spawning; nobody will ever talk to this one.
                let _ = child.kill();
                let _ = child.wait();
                return Err(PluginHostError::ProcessTerminated);
            }
            process.child = Some(child);
        }
        *lock(&self.stdin) = Some(stdin);
        lock(&self.pending).open = true;

        let pending = Arc::clone(&self.pending);
        let reader_exit = Arc::clone(exit);
        thread::Builder::new()
            .name("tenshi-adapter-reader".into())
            .spawn(move || {
                read_responses(BufReader::new(stdout), &pending);
                reader_exit.fire();
            })
            .map_err(PluginHostError::ReaderFailed)?;

        let info = self.initialize()?;
        *lock(&self.info) = Some(info.clone());
        Ok(info)
    }

    /// Stop the adapter process. Pending requests are answered with nothing
    /// once its output closes. Safe to call repeatedly.
    pub fn stop(&self) {
        let child = {
            let mut process = lock(&self.process);
            process.stopped = true;
            process.child.take()
        };

        if let Some(mut child) = child {
            // Give the adapter a chance to exit on its own.
            let _ = self.call_with_timeout(PluginMethod::Shutdown, SHUTDOWN_GRACE);
            let _ = child.kill();
            let _ = child.wait();
        }

        *lock(&self.stdin) = None;
        *lock(&self.info) = None;
    }

    /// Check if the adapter process is running.
    pub fn is_running(&self) -> bool {
        lock(&self.process)
            .child
            .as_mut()
            .map(|c| c.try_wait().ok().flatten().is_none())
            .unwrap_or(false)
    }

    /// True once the process output has closed.
    pub fn has_exited(&self) -> bool {
        !lock(&self.pending).open
    }

    /// Get the adapter info (available after start).
    pub fn info(&self) -> Option<PluginInfo> {
        lock(&self.info).clone()
    }

    /// Send a request and wait for its response.
    pub fn call(&self, method: PluginMethod) -> Result<PluginResult, PluginHostError> {
        self.call_with_timeout(method, self.call_timeout)
    }

    fn call_with_timeout(
        &self,
        method: PluginMethod,
        timeout: Duration,
    ) -> Result<PluginResult, PluginHostError> {
        let name = method.name();
        let (tx, rx) = mpsc::channel();
        let id = self.submit(method, Pending::Call(tx))?;

        match rx.recv_timeout(timeout) {
            Ok(PluginResult::Error(err)) => Err(PluginHostError::PluginError(err.message)),
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                lock(&self.pending).entries.remove(&id);
                Err(PluginHostError::Timeout {
                    method: name,
                    timeout,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(PluginHostError::ProcessTerminated),
        }
    }

    /// Send a stream request. `reply` receives the answer whenever it arrives,
    /// or an empty answer if the process goes away first.
    pub fn request_stream(
        &self,
        request: StreamRequest,
        reply: ReplySink,
    ) -> Result<(), PluginHostError> {
        self.submit(request.into(), Pending::Stream(reply))?;
        Ok(())
    }

    fn submit(&self, method: PluginMethod, waiter: Pending) -> Result<u64, PluginHostError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = PluginRequest { id, method };
        let json = serde_json::to_string(&request).map_err(PluginHostError::EncodeError)?;

        {
            let mut pending = lock(&self.pending);
            if !pending.open {
                return Err(PluginHostError::ProcessTerminated);
            }
            pending.entries.insert(id, waiter);
        }

        let written = {
            let mut stdin_guard = lock(&self.stdin);
            match stdin_guard.as_mut() {
                Some(stdin) => writeln!(stdin, "{}", json)
                    .and_then(|_| stdin.flush())
                    .map_err(PluginHostError::WriteError),
                None => Err(PluginHostError::ProcessTerminated),
            }
        };

        if let Err(err) = written {
            let waiter = lock(&self.pending).entries.remove(&id);
            drop(waiter);
            return Err(err);
        }
        Ok(id)
    }

    fn initialize(&self) -> Result<PluginInfo, PluginHostError> {
        match self.call(PluginMethod::Hello)? {
            PluginResult::Hello(info) => {
                if info.protocol_version != PROTOCOL_VERSION {
                    return Err(PluginHostError::ProtocolMismatch {
                        expected: PROTOCOL_VERSION,
                        actual: info.protocol_version,
                    });
                }
                tracing::info!(
                    adapter_name = %info.name,
                    adapter_version = %info.version,
                    "adapter process initialized"
                );
                Ok(info)
            }
            _ => Err(PluginHostError::UnexpectedResponse { method: "Hello" }),
        }
    }
}

impl Drop for ExecPluginHost {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_responses(mut stdout: impl BufRead, pending: &Mutex<PendingTable>) {
    let mut line = String::new();
    loop {
        line.clear();
        match stdout.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "failed to read from adapter");
                break;
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        let response: PluginResponse = match serde_json::from_str(&line) {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "failed to parse adapter response");
                break;
            }
        };

        let waiter = lock(pending).entries.remove(&response.id);
        match waiter {
            Some(Pending::Call(tx)) => {
                let _ = tx.send(response.result);
            }
            Some(Pending::Stream(sink)) => deliver_stream(response, sink),
            None => {
                tracing::debug!(id = response.id, "response for a request nobody waits on");
            }
        }
    }

    let abandoned = {
        let mut table = lock(pending);
        table.open = false;
        std::mem::take(&mut table.entries)
    };
    if !abandoned.is_empty() {
        tracing::debug!(
            requests = abandoned.len(),
            "adapter output closed with requests pending"
        );
    }
    // Dropping the waiters answers every pending stream request with nothing.
    drop(abandoned);
}

fn deliver_stream(response: PluginResponse, sink: ReplySink) {
    match response.result {
        PluginResult::StreamUri {
            stream_uri,
            persistent_storage,
        } => sink.send(StreamReply::new(stream_uri, persistent_storage)),
        PluginResult::Error(err) => {
            tracing::warn!(
                kind = ?err.kind,
                message = %err.message,
                "adapter failed to resolve stream"
            );
        }
        other => {
            tracing::warn!(result = ?other, "unexpected response to RequestStreamUri");
        }
    }
}

/// [`RemoteAdapter`] backed by a running [`ExecPluginHost`].
#[derive(Debug, Clone)]
pub struct ExecRemote {
    host: Arc<ExecPluginHost>,
}

impl ExecRemote {
    pub fn new(host: Arc<ExecPluginHost>) -> Self {
        Self { host }
    }
}

fn remote_error(err: PluginHostError) -> RemoteError {
    match err {
        PluginHostError::PluginError(message) => RemoteError::Adapter(message),
        PluginHostError::ProcessTerminated => RemoteError::Disconnected,
        other => RemoteError::Host(other),
    }
}

impl RemoteAdapter for ExecRemote {
    fn unique_names(&self) -> Result<Vec<String>, RemoteError> {
        match self.host.call(PluginMethod::UniqueNames).map_err(remote_error)? {
            PluginResult::UniqueNames { names } => Ok(names),
            _ => Err(RemoteError::UnexpectedResponse {
                method: "UniqueNames",
            }),
        }
    }

    fn display_name(&self, unique_name: &str) -> Result<String, RemoteError> {
        let method = PluginMethod::DisplayName {
            unique_name: unique_name.to_string(),
        };
        match self.host.call(method).map_err(remote_error)? {
            PluginResult::DisplayName { name } => Ok(name),
            _ => Err(RemoteError::UnexpectedResponse {
                method: "DisplayName",
            }),
        }
    }

    fn request_stream_uri(
        &self,
        request: StreamRequest,
        reply: ReplySink,
    ) -> Result<(), RemoteError> {
        self.host.request_stream(request, reply).map_err(remote_error)
    }
}
