//! Adapter-side half of the protocol.
//!
//! An adapter executable implements [`RemoteAdapter`] and hands it to
//! [`serve_stdio`]. Stream requests may be answered from any thread at any
//! later time; the answer is written whenever its [`ReplySink`] is used.

use crate::protocol::{
    PluginError, PluginErrorKind, PluginInfo, PluginMethod, PluginRequest, PluginResponse,
    PluginResult,
};
use crate::transport::{RemoteAdapter, RemoteError, ReplyOutcome, ReplySink, StreamRequest};
use std::io::{self, BufRead, Write};
use std::sync::{Arc, Mutex, PoisonError};

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

fn write_response(output: &SharedWriter, response: &PluginResponse) -> io::Result<()> {
    let json = serde_json::to_string(response)?;
    let mut out = output.lock().unwrap_or_else(PoisonError::into_inner);
    writeln!(out, "{}", json)?;
    out.flush()
}

fn error_result(kind: PluginErrorKind, message: impl Into<String>) -> PluginResult {
    PluginResult::Error(PluginError {
        kind,
        message: message.into(),
    })
}

fn remote_failure(err: RemoteError) -> PluginResult {
    error_result(PluginErrorKind::Internal, err.to_string())
}

/// Answer requests read from `input` until `Shutdown` or end of input.
pub fn serve<A>(
    info: &PluginInfo,
    adapter: &A,
    input: impl BufRead,
    output: impl Write + Send + 'static,
) -> io::Result<()>
where
    A: RemoteAdapter + ?Sized,
{
    let output: SharedWriter = Arc::new(Mutex::new(Box::new(output)));

    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let request: PluginRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(error = %err, "malformed request");
                let response = PluginResponse {
                    id: 0,
                    result: error_result(PluginErrorKind::BadRequest, err.to_string()),
                };
                write_response(&output, &response)?;
                continue;
            }
        };

        let id = request.id;
        let result = match request.method {
            PluginMethod::Hello => PluginResult::Hello(info.clone()),
            PluginMethod::UniqueNames => match adapter.unique_names() {
                Ok(names) => PluginResult::UniqueNames { names },
                Err(err) => remote_failure(err),
            },
            PluginMethod::DisplayName { unique_name } => match adapter.display_name(&unique_name) {
                Ok(name) => PluginResult::DisplayName { name },
                Err(err) => remote_failure(err),
            },
            PluginMethod::RequestStreamUri {
                unique_name,
                anime_id,
                en_title,
                jp_title,
                episode,
                persistent_storage,
            } => {
                let request = StreamRequest {
                    unique_name,
                    anime_id,
                    en_title,
                    jp_title,
                    episode,
                    persistent_storage,
                };
                let sink_output = Arc::clone(&output);
                let sink = ReplySink::new(move |outcome| {
                    let result = match outcome {
                        ReplyOutcome::Replied(reply) => reply.into(),
                        ReplyOutcome::Lost => error_result(
                            PluginErrorKind::Internal,
                            "stream request dropped without an answer",
                        ),
                    };
                    let response = PluginResponse { id, result };
                    if let Err(err) = write_response(&sink_output, &response) {
                        tracing::error!(id, error = %err, "failed to write stream answer");
                    }
                });
                // A failed request has already answered with an error through the dropped sink.
                if let Err(err) = adapter.request_stream_uri(request, sink) {
                    tracing::warn!(id, error = %err, "stream request failed");
                }
                continue;
            }
            PluginMethod::Shutdown => {
                write_response(
                    &output,
                    &PluginResponse {
                        id,
                        result: PluginResult::ShutdownAck,
                    },
                )?;
                tracing::debug!("shutdown requested");
                return Ok(());
            }
        };

        write_response(&output, &PluginResponse { id, result })?;
    }
    Ok(())
}

/// [`serve`] over the process's own stdin and stdout.
pub fn serve_stdio<A>(info: &PluginInfo, adapter: &A) -> io::Result<()>
where
    A: RemoteAdapter + ?Sized,
{
    let stdin = io::stdin();
    serve(info, adapter, stdin.lock(), io::stdout())
}
