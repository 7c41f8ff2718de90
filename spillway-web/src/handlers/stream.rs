//! The `/stream` endpoint: per-request orchestration of the worker pool,
//! access resolver, location cache, and the chunk streaming engine.
//!
//! The request splits into two phases. Everything that can change the
//! status code (worker selection, access resolution, descriptor lookup,
//! range validation) happens before the response is returned. Once the
//! headers are committed, the body is produced by a spawned task that may
//! fail over to another worker on a stale file reference, resuming at the
//! exact offset where the old worker stopped.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use spillway_core::pool::Worker;
use spillway_core::streaming::{BodySink, StreamError, StreamOutcome, stream_range};
use spillway_core::upstream::{FileDescriptor, UpstreamError, document_from_reply};
use tracing::{debug, error, info, warn};

use super::range::{RangeSpec, resolve_range};
use super::request_meta::{client_ip, request_id};
use crate::server::AppState;

/// Query parameters for `/stream`.
#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Message id holding the file to stream.
    pub id: i32,
}

/// Pre-header failures, mapped onto the endpoint's status table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamFailure {
    /// No workers configured or all skipped at startup.
    PoolEmpty,
    /// No access handle could be obtained for the channel.
    AccessUnavailable,
    /// The message exists but carries no streamable document.
    NotAFile,
    /// The message fetch kept failing across workers.
    ResolveFailed,
}

impl IntoResponse for StreamFailure {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            StreamFailure::PoolEmpty => (StatusCode::SERVICE_UNAVAILABLE, "no workers available"),
            StreamFailure::AccessUnavailable => {
                (StatusCode::INTERNAL_SERVER_ERROR, "channel access not available")
            }
            StreamFailure::NotAFile => (StatusCode::NOT_FOUND, "file not found in message"),
            StreamFailure::ResolveFailed => {
                (StatusCode::INTERNAL_SERVER_ERROR, "error fetching message")
            }
        };
        (status, message).into_response()
    }
}

/// Streams the document attached to a channel message, honoring byte
/// ranges so download managers and media players can seek and resume.
pub async fn stream_message(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let started = Instant::now();
    let rid = request_id(&headers);
    let (ip, ip_range) = client_ip(&headers);
    info!(
        request_id = %rid,
        method = %method,
        msg = params.id,
        client_ip = %ip,
        ip_range = %ip_range,
        "incoming stream request"
    );

    let response = handle_stream(&state, &method, &headers, params.id).await;

    info!(
        request_id = %rid,
        msg = params.id,
        status = response.status().as_u16(),
        duration_ms = started.elapsed().as_millis() as u64,
        "request finished"
    );
    response
}

async fn handle_stream(
    state: &AppState,
    method: &Method,
    headers: &HeaderMap,
    message_id: i32,
) -> Response {
    if message_id <= 0 {
        return (StatusCode::BAD_REQUEST, "id must be a positive integer").into_response();
    }

    let (worker, descriptor) = match resolve_stream_source(state, message_id).await {
        Ok(resolved) => resolved,
        Err(failure) => return failure.into_response(),
    };
    let size = descriptor.size;

    let range = resolve_range(headers, size);
    let (status, start, end) = match range {
        RangeSpec::Unsatisfiable => {
            return Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}"))
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        RangeSpec::Full => (StatusCode::OK, 0, size.saturating_sub(1)),
        RangeSpec::Partial { start, end } => (StatusCode::PARTIAL_CONTENT, start, end),
    };
    let content_length = range.content_length(size);

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_LENGTH, content_length.to_string());
    if let RangeSpec::Partial { start, end } = range {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{size}"));
    }

    // HEAD requests and empty files are headers-only: no chunk fetches.
    if *method == Method::HEAD || content_length == 0 {
        return builder
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
    }

    let (sink, body) = BodySink::channel();
    spawn_stream_producer(state.clone(), worker, descriptor, message_id, start, end, sink);
    builder
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Steps 1-3 of the per-request state machine: pick a worker, ensure
/// channel access, resolve the file descriptor through the cache. Rotates
/// to the next worker on transient failures, bounded by the configured
/// attempt count.
async fn resolve_stream_source(
    state: &AppState,
    message_id: i32,
) -> Result<(Arc<Worker>, FileDescriptor), StreamFailure> {
    let channel_id = state.config.upstream.channel_id;
    let max_attempts = state.config.streaming.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        let Some(worker) = state.pool.next() else {
            warn!(msg = message_id, "worker pool is empty");
            return Err(StreamFailure::PoolEmpty);
        };

        let handle = match state.resolver.ensure(&worker, channel_id).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    msg = message_id,
                    worker = worker.id(),
                    attempt,
                    %err,
                    "channel access resolution failed"
                );
                if attempt == max_attempts {
                    return Err(StreamFailure::AccessUnavailable);
                }
                continue;
            }
        };

        if let Some(descriptor) = state.cache.lookup(message_id, worker.id()).await {
            debug!(
                msg = message_id,
                worker = worker.id(),
                size = descriptor.size,
                "location cache hit"
            );
            return Ok((worker, descriptor));
        }
        debug!(msg = message_id, worker = worker.id(), "location cache miss");

        match fetch_descriptor(&worker, channel_id, handle, message_id).await {
            Ok(descriptor) => {
                info!(
                    msg = message_id,
                    worker = worker.id(),
                    size = descriptor.size,
                    "document resolved"
                );
                state
                    .cache
                    .store(message_id, worker.id(), descriptor.clone())
                    .await;
                return Ok((worker, descriptor));
            }
            Err(DescriptorError::NotAFile) => {
                info!(
                    msg = message_id,
                    worker = worker.id(),
                    "message carries no streamable document"
                );
                return Err(StreamFailure::NotAFile);
            }
            Err(DescriptorError::Upstream(err)) => {
                warn!(
                    msg = message_id,
                    worker = worker.id(),
                    attempt,
                    %err,
                    "message fetch failed"
                );
            }
        }
    }
    Err(StreamFailure::ResolveFailed)
}

enum DescriptorError {
    NotAFile,
    Upstream(UpstreamError),
}

async fn fetch_descriptor(
    worker: &Worker,
    channel_id: i64,
    handle: u64,
    message_id: i32,
) -> Result<FileDescriptor, DescriptorError> {
    let reply = worker
        .api()
        .channel_messages(channel_id, handle, &[message_id])
        .await
        .map_err(DescriptorError::Upstream)?;
    document_from_reply(reply).map_err(|_| DescriptorError::NotAFile)
}

/// Body producer: runs the engine, failing over once on a stale file
/// reference. The failover invalidates the cache entry, rotates to the
/// next worker, re-resolves the descriptor, and resumes at the offset
/// where the stale reference struck; the committed headers stay valid
/// because the byte range never changes.
fn spawn_stream_producer(
    state: AppState,
    worker: Arc<Worker>,
    descriptor: FileDescriptor,
    message_id: i32,
    start: u64,
    end: u64,
    mut sink: BodySink,
) {
    tokio::spawn(async move {
        let channel_id = state.config.upstream.channel_id;
        let max_attempts = state.config.streaming.max_attempts.max(1);
        let mut worker = worker;
        let mut descriptor = descriptor;
        let mut offset = start;
        let mut attempt = 1u32;

        loop {
            match stream_range(worker.api().as_ref(), &descriptor, offset, end, &mut sink).await {
                Ok(StreamOutcome::Completed { bytes_sent }) => {
                    debug!(msg = message_id, bytes_sent, "stream completed");
                    return;
                }
                Ok(StreamOutcome::ClientGone { bytes_sent }) => {
                    debug!(msg = message_id, bytes_sent, "client disconnected");
                    return;
                }
                Ok(StreamOutcome::ShortRead { bytes_sent }) => {
                    warn!(msg = message_id, bytes_sent, "upstream ended before range end");
                    return;
                }
                Err(StreamError::StaleReference { offset: stale_at }) => {
                    state.cache.invalidate(message_id, worker.id()).await;
                    attempt += 1;
                    if attempt > max_attempts {
                        error!(
                            msg = message_id,
                            offset = stale_at,
                            "file reference expired again, stream truncated"
                        );
                        return;
                    }
                    warn!(
                        msg = message_id,
                        worker = worker.id(),
                        offset = stale_at,
                        "file reference expired, rotating worker"
                    );
                    offset = stale_at;

                    let Some(fresh) = state.pool.next() else {
                        error!(msg = message_id, "no workers for failover, stream truncated");
                        return;
                    };
                    worker = fresh;

                    let handle = match state.resolver.ensure(&worker, channel_id).await {
                        Ok(handle) => handle,
                        Err(err) => {
                            error!(
                                msg = message_id,
                                worker = worker.id(),
                                %err,
                                "failover access resolution failed, stream truncated"
                            );
                            return;
                        }
                    };

                    descriptor = match state.cache.lookup(message_id, worker.id()).await {
                        Some(cached) => cached,
                        None => {
                            match fetch_descriptor(&worker, channel_id, handle, message_id).await {
                                Ok(descriptor) => {
                                    state
                                        .cache
                                        .store(message_id, worker.id(), descriptor.clone())
                                        .await;
                                    descriptor
                                }
                                Err(_) => {
                                    error!(
                                        msg = message_id,
                                        worker = worker.id(),
                                        "failover descriptor fetch failed, stream truncated"
                                    );
                                    return;
                                }
                            }
                        }
                    };
                }
                Err(StreamError::Upstream { offset, source }) => {
                    error!(msg = message_id, offset, %source, "stream failed");
                    return;
                }
            }
        }
    });
}
