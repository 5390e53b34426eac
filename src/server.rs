//! TCP server for the echo service.
//!
//! Accepts connections, reads call frames and dispatches each call to the
//! [`EchoService`]. Calls on one connection run one after another;
//! connections are served concurrently.

use crate::config::Config;
use crate::metadata::Metadata;
use crate::protocol::{ClientFrame, FrameError, FrameReader, FrameWriter, ServerFrame};
use crate::service::context::{CallContext, CancelHandle, Cancellation};
use crate::service::types::{EchoRequest, EchoResponse, GetOperationRequest};
use crate::service::{EchoService, ECHO_SERVICE};
use crate::status::Status;
use crate::waiter::Waiter;
use futures_util::stream::{self, Stream};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Service hosting `GetOperation`.
pub const OPERATIONS_SERVICE: &str = "google.longrunning.Operations";

/// Server instance
pub struct Server {
    config: Config,
    waiter: Arc<dyn Waiter>,
    service: Arc<EchoService>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, waiter: Arc<dyn Waiter>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            service: Arc::new(EchoService::new(Arc::clone(&waiter))),
            waiter,
            connection_limit,
        }
    }

    /// Bind the configured address and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");
        self.serve(listener).await?;
        Ok(())
    }

    /// Accept connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        // Start the operation cleanup task
        let cleanup = tokio::spawn(cleanup_task(
            Arc::clone(&self.waiter),
            self.config.operation_retention,
            self.config.cleanup_interval,
        ));
        let _cleanup = AbortOnDrop(cleanup);

        loop {
            // Wait for a connection slot
            let Ok(permit) = self.connection_limit.clone().acquire_owned().await else {
                return Ok(());
            };

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let service = Arc::clone(&self.service);
                    let stream_buffer = self.config.stream_buffer;

                    tokio::spawn(async move {
                        match handle_connection(stream, service, stream_buffer).await {
                            Ok(()) => debug!(peer = %addr, "Connection closed"),
                            Err(e) => debug!(peer = %addr, error = %e, "Connection error"),
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Stops the cleanup task when `serve` returns or is dropped.
struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Background task dropping operations past their retention
async fn cleanup_task(waiter: Arc<dyn Waiter>, retention_secs: u64, interval_secs: u64) {
    let retention = i64::try_from(retention_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX);
    let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));

    loop {
        interval.tick().await;
        let count = waiter.cleanup_finished(retention);
        if count > 0 {
            debug!(count, "Dropped finished operations");
        }
    }
}

/// RPC methods reachable over a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Echo,
    Expand,
    Collect,
    Chat,
    PagedExpand,
    PagedExpandLegacy,
    Block,
    Wait,
    GetOperation,
}

impl Method {
    /// Resolve `Service/Name`, `/Service/Name` or a bare `Name`.
    pub fn from_path(path: &str) -> Option<Method> {
        let path = path.strip_prefix('/').unwrap_or(path);
        let (service, name) = match path.rsplit_once('/') {
            Some((service, name)) => (Some(service), name),
            None => (None, path),
        };

        let method = match name {
            "Echo" => Method::Echo,
            "Expand" => Method::Expand,
            "Collect" => Method::Collect,
            "Chat" => Method::Chat,
            "PagedExpand" => Method::PagedExpand,
            "PagedExpandLegacy" => Method::PagedExpandLegacy,
            "Block" => Method::Block,
            "Wait" => Method::Wait,
            "GetOperation" => Method::GetOperation,
            _ => return None,
        };

        match service {
            None => Some(method),
            Some(service) if service == method.service() => Some(method),
            Some(_) => None,
        }
    }

    pub fn service(self) -> &'static str {
        match self {
            Method::GetOperation => OPERATIONS_SERVICE,
            _ => ECHO_SERVICE,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::Echo => "Echo",
            Method::Expand => "Expand",
            Method::Collect => "Collect",
            Method::Chat => "Chat",
            Method::PagedExpand => "PagedExpand",
            Method::PagedExpandLegacy => "PagedExpandLegacy",
            Method::Block => "Block",
            Method::Wait => "Wait",
            Method::GetOperation => "GetOperation",
        }
    }
}

/// Serve calls on one connection until the peer goes away.
pub async fn handle_connection<S>(
    stream: S,
    service: Arc<EchoService>,
    stream_buffer: usize,
) -> Result<(), FrameError>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut connection = Connection {
        reader: FrameReader::new(read_half),
        writer: FrameWriter::new(write_half),
        service,
        stream_buffer: stream_buffer.max(1),
        queued: None,
    };

    loop {
        let next = match connection.queued.take() {
            Some(frame) => Ok(Some(frame)),
            None => connection.reader.next_frame::<ClientFrame>().await,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                trace!("Connection closed by client");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "Protocol error");
                return Err(e);
            }
        };

        match frame {
            ClientFrame::Call { method, metadata } => connection.serve_call(&method, metadata).await?,
            // Leftovers of a call the server already finished
            other => trace!(frame = ?other, "Ignoring frame outside of a call"),
        }
    }
}

/// One connection: split halves plus what calls need.
struct Connection<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
    service: Arc<EchoService>,
    stream_buffer: usize,
    /// Next call, read while the previous one was still running
    queued: Option<ClientFrame>,
}

/// How reading a single request message ended.
enum UnaryRequest {
    Body(Value),
    Rejected(Status),
    Closed,
}

impl<S: AsyncRead + AsyncWrite + Send> Connection<S> {
    async fn serve_call(&mut self, path: &str, metadata: Metadata) -> Result<(), FrameError> {
        let Connection {
            reader,
            writer,
            service,
            stream_buffer,
            queued,
        } = self;

        let Some(method) = Method::from_path(path) else {
            debug!(method = path, "Unknown method");
            let status = Status::unimplemented(format!("Method {path} is not implemented"));
            return finish(writer, Err(status), Metadata::new()).await;
        };

        let (cancel, cancellation) = Cancellation::new();
        let mut ctx = CallContext::new(metadata, cancellation);
        debug!(method = method.name(), metadata = ctx.metadata().len(), "Call started");
        for (key, value) in ctx.metadata().iter() {
            trace!(key, value, "Request metadata");
        }
        let service = Arc::clone(service);

        let result = match method {
            Method::Collect => {
                let requests = pin!(inbound(reader));
                service
                    .collect(&mut ctx, requests)
                    .await
                    .and_then(encode_body)
                    .map(Some)
            }
            Method::Chat => {
                let (tx, rx) = mpsc::channel(*stream_buffer);
                let requests = pin!(inbound(reader));
                let (result, forwarded) =
                    tokio::join!(service.chat(&mut ctx, requests, tx), forward(rx, writer));
                forwarded?;
                result.map(|()| None)
            }
            Method::Expand => {
                let body = match read_request(reader).await? {
                    UnaryRequest::Body(body) => body,
                    UnaryRequest::Rejected(status) => {
                        return finish(writer, Err(status), Metadata::new()).await
                    }
                    UnaryRequest::Closed => return Ok(()),
                };

                let (tx, rx) = mpsc::channel(*stream_buffer);
                let call = async {
                    let request: EchoRequest = decode(body)?;
                    service.expand(&mut ctx, request, tx).await
                };
                let ((result, forwarded), next) =
                    watched(reader, &cancel, async { tokio::join!(call, forward(rx, writer)) })
                        .await;
                *queued = next;
                forwarded?;
                result.map(|()| None)
            }
            _ => {
                let body = match read_request(reader).await? {
                    UnaryRequest::Body(body) => body,
                    UnaryRequest::Rejected(status) => {
                        return finish(writer, Err(status), Metadata::new()).await
                    }
                    UnaryRequest::Closed => return Ok(()),
                };

                let (result, next) =
                    watched(reader, &cancel, unary(&service, &mut ctx, method, body)).await;
                *queued = next;
                result.map(Some)
            }
        };

        if let Err(status) = &result {
            debug!(method = method.name(), code = %status.code, message = %status.message, "Call failed");
        } else {
            debug!(method = method.name(), trailers = ctx.trailers().len(), "Call succeeded");
        }
        finish(writer, result, ctx.into_trailers()).await
    }
}

/// Run a unary-shaped call to completion.
async fn unary(
    service: &EchoService,
    ctx: &mut CallContext,
    method: Method,
    body: Value,
) -> Result<Value, Status> {
    match method {
        Method::Echo => encode_body(service.echo(ctx, decode(body)?)?),
        Method::PagedExpand => encode_body(service.paged_expand(ctx, decode(body)?)?),
        Method::PagedExpandLegacy => encode_body(service.paged_expand_legacy(ctx, decode(body)?)?),
        Method::Block => encode_body(service.block(ctx, decode(body)?).await?),
        Method::Wait => encode_body(service.wait(ctx, decode(body)?)?),
        Method::GetOperation => {
            let request: GetOperationRequest = decode(body)?;
            encode_body(service.get_operation(ctx, &request.name)?)
        }
        Method::Expand | Method::Collect | Method::Chat => Err(Status::internal(format!(
            "{} is a streaming method",
            method.name()
        ))),
    }
}

/// Read exactly one request message followed by half-close.
async fn read_request<R>(reader: &mut FrameReader<R>) -> Result<UnaryRequest, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut body = None;

    loop {
        let Some(frame) = reader.next_frame::<ClientFrame>().await? else {
            debug!("Peer closed before half-close");
            return Ok(UnaryRequest::Closed);
        };
        trace!(frame = ?frame, "Request frame");

        match frame {
            ClientFrame::Message { body: message } => {
                if body.is_some() {
                    return Ok(UnaryRequest::Rejected(Status::internal(
                        "expected exactly one request message, received more",
                    )));
                }
                body = Some(message);
            }
            ClientFrame::HalfClose => {
                return Ok(match body {
                    Some(body) => UnaryRequest::Body(body),
                    None => UnaryRequest::Rejected(Status::internal(
                        "expected exactly one request message, received none",
                    )),
                })
            }
            ClientFrame::Cancel => {
                return Ok(UnaryRequest::Rejected(Status::cancelled("call cancelled by peer")))
            }
            ClientFrame::Call { .. } => {
                return Ok(UnaryRequest::Rejected(Status::internal(
                    "call started before the previous call finished",
                )))
            }
        }
    }
}

/// Inbound request stream of a client- or bidi-streaming call.
///
/// `half_close` ends the stream; `cancel`, EOF and read errors yield one
/// `Cancelled` failure.
fn inbound<R>(reader: &mut FrameReader<R>) -> impl Stream<Item = Result<EchoRequest, Status>> + '_
where
    R: AsyncRead + Unpin,
{
    stream::unfold(Some(reader), |reader| async move {
        let reader = reader?;
        let failure = match reader.next_frame::<ClientFrame>().await {
            Ok(Some(ClientFrame::Message { body })) => {
                trace!("Inbound message");
                return Some((decode::<EchoRequest>(body), Some(reader)));
            }
            Ok(Some(ClientFrame::HalfClose)) => return None,
            Ok(Some(ClientFrame::Cancel)) => Status::cancelled("call cancelled by peer"),
            Ok(Some(ClientFrame::Call { .. })) => {
                Status::internal("call started before the previous call finished")
            }
            Ok(None) => Status::cancelled("connection closed by peer"),
            Err(e) => Status::cancelled(format!("connection failed: {e}")),
        };
        Some((Err(failure), None))
    })
}

/// Drive `work` while watching the connection for `cancel` or EOF.
///
/// Also returns the `call` frame of a pipelined next call, if one arrived
/// while `work` was running.
async fn watched<R, F>(
    reader: &mut FrameReader<R>,
    cancel: &CancelHandle,
    work: F,
) -> (F::Output, Option<ClientFrame>)
where
    R: AsyncRead + Unpin,
    F: Future,
{
    let mut work = pin!(work);
    let mut watching = true;
    let mut next = None;

    loop {
        tokio::select! {
            output = &mut work => return (output, next),
            frame = watch_peer(reader, cancel), if watching => {
                watching = false;
                next = frame;
            }
        }
    }
}

/// Resolves when the peer cancels the call or starts the next one.
///
/// Cancel, EOF and read errors fire `cancel`; a `call` frame is handed back
/// untouched.
async fn watch_peer<R>(reader: &mut FrameReader<R>, cancel: &CancelHandle) -> Option<ClientFrame>
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.next_frame::<ClientFrame>().await {
            Ok(Some(ClientFrame::Cancel)) => {
                debug!("Call cancelled by peer");
                break;
            }
            Ok(Some(frame @ ClientFrame::Call { .. })) => {
                trace!("Next call queued behind the running one");
                return Some(frame);
            }
            Ok(Some(frame)) => trace!(frame = ?frame, "Ignoring frame while call is running"),
            Ok(None) => {
                debug!("Peer closed during call");
                break;
            }
            Err(e) => {
                debug!(error = %e, "Read failed during call");
                break;
            }
        }
    }
    cancel.cancel();
    None
}

/// Copy streamed responses to the connection.
async fn forward<W>(
    mut responses: mpsc::Receiver<EchoResponse>,
    writer: &mut FrameWriter<W>,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = responses.recv().await {
        let body = serde_json::to_value(&response)?;
        writer.write_frame(&ServerFrame::Message { body }).await?;
    }
    Ok(())
}

/// Write the response message (if any) and the closing trailers frame.
async fn finish<W>(
    writer: &mut FrameWriter<W>,
    result: Result<Option<Value>, Status>,
    trailers: Metadata,
) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let status = match result {
        Ok(body) => {
            if let Some(body) = body {
                writer.write_frame(&ServerFrame::Message { body }).await?;
            }
            Status::ok()
        }
        Err(status) => status,
    };
    writer.write_frame(&ServerFrame::Trailers { status, trailers }).await
}

fn decode<T: DeserializeOwned>(body: Value) -> Result<T, Status> {
    serde_json::from_value(body)
        .map_err(|e| Status::internal(format!("failed to decode request message: {e}")))
}

fn encode_body<T: Serialize>(response: T) -> Result<Value, Status> {
    serde_json::to_value(response)
        .map_err(|e| Status::internal(format!("failed to encode response message: {e}")))
}
