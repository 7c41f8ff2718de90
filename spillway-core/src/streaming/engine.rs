//! The chunk-fetch loop translating a byte range into upstream RPCs.

use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use super::sink::ByteSink;
use crate::upstream::{FileDescriptor, UPSTREAM_CHUNK_SIZE, UpstreamApi, UpstreamError};

/// Terminal states of one streaming pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every byte of the range was delivered.
    Completed {
        /// Bytes written to the sink.
        bytes_sent: u64,
    },
    /// The client went away; not an error.
    ClientGone {
        /// Bytes written before the disconnect.
        bytes_sent: u64,
    },
    /// The upstream stopped returning data before the range end.
    ShortRead {
        /// Bytes written before the premature end.
        bytes_sent: u64,
    },
}

/// Failures the request orchestrator must react to.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The file reference expired mid-stream. `offset` is the first byte
    /// not yet delivered, so a failover can resume exactly there without
    /// violating the committed `Content-Length`.
    #[error("file reference expired at offset {offset}")]
    StaleReference {
        /// First undelivered byte offset.
        offset: u64,
    },

    /// Any other upstream failure; the stream cannot continue.
    #[error("upstream failure at offset {offset}: {source}")]
    Upstream {
        /// Offset of the failed chunk fetch.
        offset: u64,
        /// The underlying upstream error.
        #[source]
        source: UpstreamError,
    },
}

/// Streams bytes `[start, end]` of `descriptor` into `sink`.
///
/// Chunks are always requested at the full upstream chunk size (the
/// upstream rejects limits that are not power-of-two divisors of 1 MiB)
/// and the returned bytes are sliced to the range remainder before
/// delivery, so the on-wire `Content-Length` is honored exactly.
///
/// Flood waits are absorbed in place: sleep for the commanded duration,
/// then retry the same offset. Both the sleep and the chunk fetch abort as
/// soon as the client disconnects.
///
/// # Errors
///
/// - `StreamError::StaleReference` - the file reference expired; the
///   caller should invalidate its cache entry and fail over
/// - `StreamError::Upstream` - unrecoverable upstream failure
pub async fn stream_range(
    api: &dyn UpstreamApi,
    descriptor: &FileDescriptor,
    start: u64,
    end: u64,
    sink: &mut dyn ByteSink,
) -> Result<StreamOutcome, StreamError> {
    let mut offset = start;
    let mut bytes_sent = 0u64;

    while offset <= end {
        let fetched = tokio::select! {
            result = api.file_chunk(descriptor, offset, UPSTREAM_CHUNK_SIZE) => result,
            () = sink.closed() => return Ok(StreamOutcome::ClientGone { bytes_sent }),
        };

        let data = match fetched {
            Ok(data) => data,
            Err(UpstreamError::FloodWait { seconds }) => {
                warn!(offset, seconds, "upstream flood wait, sleeping");
                tokio::select! {
                    () = sleep(Duration::from_secs(u64::from(seconds))) => continue,
                    () = sink.closed() => return Ok(StreamOutcome::ClientGone { bytes_sent }),
                }
            }
            Err(UpstreamError::FileReferenceExpired) => {
                return Err(StreamError::StaleReference { offset });
            }
            Err(UpstreamError::Cancelled) => {
                return Ok(StreamOutcome::ClientGone { bytes_sent });
            }
            Err(source) => return Err(StreamError::Upstream { offset, source }),
        };

        let remaining = end - offset + 1;
        let data = if data.len() as u64 > remaining {
            data.slice(..remaining as usize)
        } else {
            data
        };
        if data.is_empty() {
            debug!(offset, "upstream returned no data before range end");
            return Ok(StreamOutcome::ShortRead { bytes_sent });
        }

        let written = data.len() as u64;
        if sink.send(data).await.is_err() {
            return Ok(StreamOutcome::ClientGone { bytes_sent });
        }
        offset += written;
        bytes_sent += written;
    }

    Ok(StreamOutcome::Completed { bytes_sent })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::streaming::sink::SinkClosed;
    use crate::upstream::document_from_reply;
    use crate::upstream::simulation::{ChunkFault, SimulatedUpstream};

    const CHANNEL: i64 = -1_000_888;
    const MESSAGE: i32 = 42;
    const MIB: u64 = 1_048_576;

    /// Collects everything, optionally refusing bytes past a limit the way
    /// a disconnected client would.
    struct CollectSink {
        received: Vec<u8>,
        accept_limit: Option<usize>,
    }

    impl CollectSink {
        fn new() -> Self {
            Self {
                received: Vec::new(),
                accept_limit: None,
            }
        }

        fn closing_after(limit: usize) -> Self {
            Self {
                received: Vec::new(),
                accept_limit: Some(limit),
            }
        }
    }

    #[async_trait]
    impl ByteSink for CollectSink {
        async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
            if let Some(limit) = self.accept_limit
                && self.received.len() + chunk.len() > limit
            {
                return Err(SinkClosed);
            }
            self.received.extend_from_slice(&chunk);
            Ok(())
        }

        async fn closed(&self) {
            std::future::pending::<()>().await
        }
    }

    fn fixture_bytes(len: u64) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn fixture(len: u64) -> (Arc<SimulatedUpstream>, Arc<dyn UpstreamApi>, FileDescriptor) {
        let world = SimulatedUpstream::builder(CHANNEL)
            .document(MESSAGE, fixture_bytes(len))
            .build();
        let api = SimulatedUpstream::session(&world);
        let reply = api
            .channel_messages(CHANNEL, 0x5EED_CAFE, &[MESSAGE])
            .await
            .unwrap();
        let descriptor = document_from_reply(reply).unwrap();
        (world, api, descriptor)
    }

    #[tokio::test]
    async fn test_full_range_is_byte_identical() {
        let len = 2 * MIB + 513;
        let (_, api, descriptor) = fixture(len).await;
        let mut sink = CollectSink::new();

        let outcome = stream_range(api.as_ref(), &descriptor, 0, len - 1, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed { bytes_sent: len });
        assert_eq!(sink.received, fixture_bytes(len));
    }

    #[tokio::test]
    async fn test_partial_ranges_across_chunk_alignments() {
        let len = 2 * MIB + 513;
        let (_, api, descriptor) = fixture(len).await;
        let reference = fixture_bytes(len);

        let ranges = [
            (0, 0),
            (0, MIB - 1),
            (MIB, 2 * MIB - 1),
            (MIB - 1, MIB + 1),
            (513, 2 * MIB + 100),
            (2 * MIB + 512, 2 * MIB + 512),
        ];
        for (start, end) in ranges {
            let mut sink = CollectSink::new();
            let outcome = stream_range(api.as_ref(), &descriptor, start, end, &mut sink)
                .await
                .unwrap();
            let expected = end - start + 1;
            assert_eq!(
                outcome,
                StreamOutcome::Completed {
                    bytes_sent: expected
                },
                "range {start}-{end}"
            );
            assert_eq!(
                sink.received,
                &reference[start as usize..=end as usize],
                "range {start}-{end}"
            );
        }
    }

    #[tokio::test]
    async fn test_flood_wait_sleeps_and_retries_same_offset() {
        let len = MIB / 2;
        let (world, api, descriptor) = fixture(len).await;
        world.inject_chunk_fault(0, ChunkFault::FloodWait(1));

        let started = Instant::now();
        let mut sink = CollectSink::new();
        let outcome = stream_range(api.as_ref(), &descriptor, 0, len - 1, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::Completed { bytes_sent: len });
        assert!(started.elapsed() >= Duration::from_secs(1));
        // Same (offset, limit) request repeated after the wait.
        assert_eq!(world.chunk_fetch_offsets(), vec![0, 0]);
        assert_eq!(sink.received, fixture_bytes(len));
    }

    #[tokio::test]
    async fn test_stale_reference_reports_resume_offset() {
        let len = 3 * MIB;
        let (world, api, descriptor) = fixture(len).await;
        world.inject_chunk_fault(2 * MIB, ChunkFault::StaleReference);

        let mut sink = CollectSink::new();
        let result = stream_range(api.as_ref(), &descriptor, 0, len - 1, &mut sink).await;

        match result {
            Err(StreamError::StaleReference { offset }) => assert_eq!(offset, 2 * MIB),
            other => panic!("expected stale reference, got {other:?}"),
        }
        assert_eq!(sink.received.len() as u64, 2 * MIB);
    }

    #[tokio::test]
    async fn test_expired_descriptor_is_stale_from_the_start() {
        let (world, api, descriptor) = fixture(MIB).await;
        world.expire_file_references();

        let mut sink = CollectSink::new();
        let result = stream_range(api.as_ref(), &descriptor, 0, MIB - 1, &mut sink).await;
        assert!(matches!(
            result,
            Err(StreamError::StaleReference { offset: 0 })
        ));
    }

    #[tokio::test]
    async fn test_client_disconnect_is_silent() {
        let len = 3 * MIB;
        let (_, api, descriptor) = fixture(len).await;
        let mut sink = CollectSink::closing_after(MIB as usize);

        let outcome = stream_range(api.as_ref(), &descriptor, 0, len - 1, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::ClientGone { bytes_sent: MIB });
    }

    #[tokio::test]
    async fn test_upstream_eof_before_range_end_is_short_read() {
        // The upstream only holds 2 MiB; ask for 3.
        let len = 2 * MIB;
        let (_, api, descriptor) = fixture(len).await;

        let mut sink = CollectSink::new();
        let outcome = stream_range(api.as_ref(), &descriptor, 0, 3 * MIB - 1, &mut sink)
            .await
            .unwrap();

        assert_eq!(outcome, StreamOutcome::ShortRead { bytes_sent: len });
        assert_eq!(sink.received, fixture_bytes(len));
    }

    #[tokio::test]
    async fn test_other_upstream_errors_fail_the_stream() {
        let (world, api, descriptor) = fixture(MIB).await;
        world.inject_chunk_fault(0, ChunkFault::Fail("INTERNAL".to_string()));

        let mut sink = CollectSink::new();
        let result = stream_range(api.as_ref(), &descriptor, 0, MIB - 1, &mut sink).await;
        assert!(matches!(
            result,
            Err(StreamError::Upstream { offset: 0, .. })
        ));
    }
}
