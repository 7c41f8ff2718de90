//! Deterministic in-memory upstream for tests and demo mode.
//!
//! Models the behaviors the gateway must survive: flood waits,
//! file-reference expiry, premature EOF, and the bot sign-in handshake.
//! Failures are scripted per chunk offset and consumed on first match, so
//! scenarios replay identically from run to run.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    ChannelMessage, ChatSummary, FileDescriptor, MessageMedia, MessagesReply, UPSTREAM_CHUNK_SIZE,
    UpstreamApi, UpstreamConnector, UpstreamError,
};
use crate::pool::BotCredential;

/// Scripted failure injected at a specific chunk offset, consumed once.
#[derive(Debug, Clone)]
pub enum ChunkFault {
    /// Rate-limit with the given wait in seconds.
    FloodWait(u32),
    /// File-reference expiry for this single fetch.
    StaleReference,
    /// Generic RPC failure with the given message.
    Fail(String),
}

#[derive(Debug, Clone)]
enum SimMessage {
    Document {
        file_id: i64,
        access_hash: i64,
        bytes: Bytes,
    },
    Photo,
    Service,
    Poll,
}

/// Shared state of the simulated platform.
///
/// All sessions opened through [`SimulatedConnector`] observe the same
/// world, the way every bot session observes the same channel.
pub struct SimulatedUpstream {
    channel_id: i64,
    channel_access_hash: u64,
    messages: HashMap<i32, SimMessage>,
    reference_generation: AtomicU64,
    chunk_fetches: AtomicU64,
    chunk_faults: Mutex<HashMap<u64, ChunkFault>>,
    fetch_log: Mutex<Vec<u64>>,
}

/// Builder for a [`SimulatedUpstream`] world.
pub struct SimulatedUpstreamBuilder {
    channel_id: i64,
    channel_access_hash: u64,
    messages: HashMap<i32, SimMessage>,
}

impl SimulatedUpstreamBuilder {
    /// Overrides the channel access handle (defaults to a fixed non-zero
    /// value).
    pub fn access_hash(mut self, access_hash: u64) -> Self {
        self.channel_access_hash = access_hash;
        self
    }

    /// Stores a document behind `message_id`.
    pub fn document(mut self, message_id: i32, bytes: impl Into<Bytes>) -> Self {
        self.messages.insert(
            message_id,
            SimMessage::Document {
                file_id: i64::from(message_id) * 1_000 + 7,
                access_hash: i64::from(message_id).wrapping_mul(-0x51_0B_AD),
                bytes: bytes.into(),
            },
        );
        self
    }

    /// Stores a photo message behind `message_id`.
    pub fn photo(mut self, message_id: i32) -> Self {
        self.messages.insert(message_id, SimMessage::Photo);
        self
    }

    /// Stores a service message behind `message_id`.
    pub fn service(mut self, message_id: i32) -> Self {
        self.messages.insert(message_id, SimMessage::Service);
        self
    }

    /// Stores a poll message behind `message_id`.
    pub fn poll(mut self, message_id: i32) -> Self {
        self.messages.insert(message_id, SimMessage::Poll);
        self
    }

    /// Finalizes the world.
    pub fn build(self) -> Arc<SimulatedUpstream> {
        Arc::new(SimulatedUpstream {
            channel_id: self.channel_id,
            channel_access_hash: self.channel_access_hash,
            messages: self.messages,
            reference_generation: AtomicU64::new(1),
            chunk_fetches: AtomicU64::new(0),
            chunk_faults: Mutex::new(HashMap::new()),
            fetch_log: Mutex::new(Vec::new()),
        })
    }
}

impl SimulatedUpstream {
    /// Starts building a world around one source channel.
    pub fn builder(channel_id: i64) -> SimulatedUpstreamBuilder {
        SimulatedUpstreamBuilder {
            channel_id,
            channel_access_hash: 0x5EED_CAFE,
            messages: HashMap::new(),
        }
    }

    /// Opens a session view onto `world` directly, bypassing the
    /// connector. Handy in unit tests.
    pub fn session(world: &Arc<Self>) -> Arc<dyn UpstreamApi> {
        Arc::new(SimulatedSession {
            world: Arc::clone(world),
            authorized: AtomicBool::new(false),
        })
    }

    /// Schedules `fault` for the next chunk fetch at `offset`.
    pub fn inject_chunk_fault(&self, offset: u64, fault: ChunkFault) {
        self.chunk_faults
            .lock()
            .expect("fault table poisoned")
            .insert(offset, fault);
    }

    /// Invalidates every file reference handed out so far; descriptors
    /// must be re-resolved before further chunk fetches succeed.
    pub fn expire_file_references(&self) {
        self.reference_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Total number of chunk fetches issued against this world.
    pub fn chunk_fetch_count(&self) -> u64 {
        self.chunk_fetches.load(Ordering::SeqCst)
    }

    /// Offsets of every chunk fetch, in arrival order.
    pub fn chunk_fetch_offsets(&self) -> Vec<u64> {
        self.fetch_log.lock().expect("fetch log poisoned").clone()
    }

    fn current_reference(&self) -> Vec<u8> {
        self.reference_generation
            .load(Ordering::SeqCst)
            .to_le_bytes()
            .to_vec()
    }

    fn message_for(&self, id: i32) -> ChannelMessage {
        match self.messages.get(&id) {
            Some(SimMessage::Document {
                file_id,
                access_hash,
                bytes,
            }) => ChannelMessage::Plain {
                id,
                media: Some(MessageMedia::Document(FileDescriptor {
                    id: *file_id,
                    access_hash: *access_hash,
                    file_reference: self.current_reference(),
                    size: bytes.len() as u64,
                })),
            },
            Some(SimMessage::Photo) => ChannelMessage::Plain {
                id,
                media: Some(MessageMedia::Photo),
            },
            Some(SimMessage::Service) => ChannelMessage::Service { id },
            Some(SimMessage::Poll) => ChannelMessage::Plain {
                id,
                media: Some(MessageMedia::Other),
            },
            None => ChannelMessage::Empty { id },
        }
    }
}

struct SimulatedSession {
    world: Arc<SimulatedUpstream>,
    authorized: AtomicBool,
}

#[async_trait]
impl UpstreamApi for SimulatedSession {
    async fn auth_status(&self) -> Result<bool, UpstreamError> {
        Ok(self.authorized.load(Ordering::SeqCst))
    }

    async fn sign_in_bot(&self, token: &str) -> Result<(), UpstreamError> {
        if token.is_empty() {
            return Err(UpstreamError::Unauthorized);
        }
        self.authorized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn channels_by_id(&self, _channel_id: i64) -> Result<Vec<ChatSummary>, UpstreamError> {
        Ok(vec![ChatSummary {
            id: self.world.channel_id,
            access_hash: self.world.channel_access_hash,
        }])
    }

    async fn channel_messages(
        &self,
        channel_id: i64,
        access_hash: u64,
        ids: &[i32],
    ) -> Result<MessagesReply, UpstreamError> {
        if channel_id != self.world.channel_id || access_hash != self.world.channel_access_hash {
            return Err(UpstreamError::Rpc {
                message: "CHANNEL_INVALID".to_string(),
            });
        }
        let messages: Vec<ChannelMessage> =
            ids.iter().map(|id| self.world.message_for(*id)).collect();
        let count = messages.len() as i32;
        Ok(MessagesReply::ChannelMessages { messages, count })
    }

    async fn file_chunk(
        &self,
        descriptor: &FileDescriptor,
        offset: u64,
        limit: u32,
    ) -> Result<Bytes, UpstreamError> {
        self.world.chunk_fetches.fetch_add(1, Ordering::SeqCst);
        self.world
            .fetch_log
            .lock()
            .expect("fetch log poisoned")
            .push(offset);

        if limit == 0 || !limit.is_power_of_two() || !UPSTREAM_CHUNK_SIZE.is_multiple_of(limit) {
            return Err(UpstreamError::Rpc {
                message: "LIMIT_INVALID".to_string(),
            });
        }

        let fault = self
            .world
            .chunk_faults
            .lock()
            .expect("fault table poisoned")
            .remove(&offset);
        match fault {
            Some(ChunkFault::FloodWait(seconds)) => {
                return Err(UpstreamError::FloodWait { seconds });
            }
            Some(ChunkFault::StaleReference) => {
                return Err(UpstreamError::FileReferenceExpired);
            }
            Some(ChunkFault::Fail(message)) => {
                return Err(UpstreamError::Rpc { message });
            }
            None => {}
        }

        if descriptor.file_reference != self.world.current_reference() {
            return Err(UpstreamError::FileReferenceExpired);
        }

        let bytes = self
            .world
            .messages
            .values()
            .find_map(|message| match message {
                SimMessage::Document {
                    file_id,
                    access_hash,
                    bytes,
                } if *file_id == descriptor.id && *access_hash == descriptor.access_hash => {
                    Some(bytes.clone())
                }
                _ => None,
            })
            .ok_or_else(|| UpstreamError::Rpc {
                message: "FILE_ID_INVALID".to_string(),
            })?;

        let len = bytes.len() as u64;
        if offset >= len {
            return Ok(Bytes::new());
        }
        let end = (offset + u64::from(limit)).min(len);
        Ok(bytes.slice(offset as usize..end as usize))
    }
}

/// Connector producing sessions that all observe the same simulated world.
pub struct SimulatedConnector {
    world: Arc<SimulatedUpstream>,
}

impl SimulatedConnector {
    /// Wraps a world into a connector.
    pub fn new(world: Arc<SimulatedUpstream>) -> Self {
        Self { world }
    }
}

#[async_trait]
impl UpstreamConnector for SimulatedConnector {
    async fn open_session(
        &self,
        _credential: &BotCredential,
    ) -> Result<Arc<dyn UpstreamApi>, UpstreamError> {
        Ok(SimulatedUpstream::session(&self.world))
    }
}
