//! Opaque façade over the upstream chat-platform RPC surface.
//!
//! Session persistence, authentication handshakes, and wire framing all
//! live behind [`UpstreamConnector`] and [`UpstreamApi`]; the gateway core
//! only sees typed requests and typed failures. The message and media
//! shapes are closed sum types covering the response forms the gateway
//! reacts to; anything the variants cannot express is simply not a file.

pub mod simulation;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::pool::BotCredential;

/// Stable numeric identity of one bot worker.
pub type WorkerId = i64;

/// Largest chunk the upstream serves per fetch. Fetch limits must be
/// power-of-two divisors of this value.
pub const UPSTREAM_CHUNK_SIZE: u32 = 1_048_576;

/// Chat record returned by the zero-hash channel probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSummary {
    /// Channel identifier.
    pub id: i64,
    /// Access handle this worker's session may use for the channel.
    pub access_hash: u64,
}

/// Resolvable identity of a file within the upstream platform.
///
/// Worker-scoped: a descriptor obtained through one worker's session is
/// not valid for another worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    /// 64-bit file identifier.
    pub id: i64,
    /// Opaque token required on every chunk fetch.
    pub access_hash: i64,
    /// Proof-of-access blob with an undocumented expiry window.
    pub file_reference: Vec<u8>,
    /// Total file length in bytes.
    pub size: u64,
}

/// A single message as seen through a worker's session.
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    /// Regular message, possibly carrying media.
    Plain {
        /// Message id within the channel.
        id: i32,
        /// Attached media, when present.
        media: Option<MessageMedia>,
    },
    /// Service message (join, pin, ...); never carries a file.
    Service {
        /// Message id within the channel.
        id: i32,
    },
    /// Deleted or inaccessible message slot.
    Empty {
        /// Message id within the channel.
        id: i32,
    },
}

/// Media attachment shapes the gateway distinguishes.
#[derive(Debug, Clone)]
pub enum MessageMedia {
    /// A document: the only shape that yields a streamable file.
    Document(FileDescriptor),
    /// Photos are served through a different upstream surface.
    Photo,
    /// Polls, geo points, contacts, and anything newer.
    Other,
}

/// The three known response shapes of a message fetch.
#[derive(Debug, Clone)]
pub enum MessagesReply {
    /// Complete result set.
    Messages(Vec<ChannelMessage>),
    /// Partial result set with a total count.
    Slice {
        /// Messages included in this slice.
        messages: Vec<ChannelMessage>,
        /// Total number of matching messages.
        count: i32,
    },
    /// Channel-scoped result set with a total count.
    ChannelMessages {
        /// Messages included in the reply.
        messages: Vec<ChannelMessage>,
        /// Total number of matching messages.
        count: i32,
    },
}

impl MessagesReply {
    /// Flattens the shape distinction; callers only need the messages.
    pub fn into_messages(self) -> Vec<ChannelMessage> {
        match self {
            MessagesReply::Messages(messages) => messages,
            MessagesReply::Slice { messages, .. } => messages,
            MessagesReply::ChannelMessages { messages, .. } => messages,
        }
    }
}

/// Why a message fetch did not yield a streamable document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    /// The reply contained no messages at all.
    #[error("no messages in reply")]
    NoMessage,

    /// The message exists but carries no document (photo, poll, service
    /// message, or no media at all).
    #[error("message carries no streamable document")]
    NotAFile,
}

/// Extracts the streamable document from the first message of a reply.
///
/// # Errors
///
/// - `ResolveError::NoMessage` - the reply was empty
/// - `ResolveError::NotAFile` - the first message has no document media
pub fn document_from_reply(reply: MessagesReply) -> Result<FileDescriptor, ResolveError> {
    let mut messages = reply.into_messages();
    if messages.is_empty() {
        return Err(ResolveError::NoMessage);
    }
    match messages.swap_remove(0) {
        ChannelMessage::Plain {
            media: Some(MessageMedia::Document(descriptor)),
            ..
        } => Ok(descriptor),
        _ => Err(ResolveError::NotAFile),
    }
}

/// Failures surfaced by the upstream façade.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    /// Structured rate-limit: the caller must wait before retrying.
    #[error("flood wait: retry after {seconds}s")]
    FloodWait {
        /// Seconds the upstream demands before the next attempt.
        seconds: u32,
    },

    /// The file reference presented with a chunk fetch has expired.
    #[error("file reference expired")]
    FileReferenceExpired,

    /// The request's context was cancelled (the client went away).
    #[error("request cancelled")]
    Cancelled,

    /// The session is not authorized to perform the call.
    #[error("session not authorized")]
    Unauthorized,

    /// Any other RPC-level failure.
    #[error("upstream rpc failed: {message}")]
    Rpc {
        /// Upstream error text.
        message: String,
    },
}

/// One authenticated session against the upstream platform.
///
/// Implementations multiplex internally and are safe for concurrent use
/// across request tasks.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Reports whether the session already holds a valid authorization.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` when the status call itself fails.
    async fn auth_status(&self) -> Result<bool, UpstreamError>;

    /// Performs the bot login handshake for this session.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError::Unauthorized` when the credential is
    /// rejected, or any other `UpstreamError` on transport failure.
    async fn sign_in_bot(&self, token: &str) -> Result<(), UpstreamError>;

    /// Zero-hash channel probe, accepted when this session's bot is a
    /// member of the channel. Returns the chats visible in the reply.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` when the probe call fails outright.
    async fn channels_by_id(&self, channel_id: i64) -> Result<Vec<ChatSummary>, UpstreamError>;

    /// Fetches messages by id from a channel addressed with its handle.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` on transport failure or when the handle is
    /// rejected for this session.
    async fn channel_messages(
        &self,
        channel_id: i64,
        access_hash: u64,
        ids: &[i32],
    ) -> Result<MessagesReply, UpstreamError>;

    /// Fetches one chunk of file bytes at `offset`, at most `limit` long.
    ///
    /// # Errors
    ///
    /// - `UpstreamError::FloodWait` - rate-limited, retry after the wait
    /// - `UpstreamError::FileReferenceExpired` - descriptor must be refreshed
    /// - `UpstreamError::Cancelled` - the request context was cancelled
    /// - `UpstreamError::Rpc` - any other upstream failure
    async fn file_chunk(
        &self,
        descriptor: &FileDescriptor,
        offset: u64,
        limit: u32,
    ) -> Result<Bytes, UpstreamError>;
}

/// Opens authenticated sessions, one per bot credential.
///
/// Implementations own session persistence; the credential's
/// [`BotCredential::session_name`] names the session file to resume from.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    /// Opens (or resumes) the session for one credential.
    ///
    /// # Errors
    ///
    /// Returns `UpstreamError` when the session cannot be established.
    async fn open_session(
        &self,
        credential: &BotCredential,
    ) -> Result<Arc<dyn UpstreamApi>, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> FileDescriptor {
        FileDescriptor {
            id: 77,
            access_hash: -12345,
            file_reference: vec![1, 2, 3],
            size: 9000,
        }
    }

    #[test]
    fn test_document_extraction_from_each_reply_shape() {
        let plain = ChannelMessage::Plain {
            id: 1,
            media: Some(MessageMedia::Document(descriptor())),
        };

        for reply in [
            MessagesReply::Messages(vec![plain.clone()]),
            MessagesReply::Slice {
                messages: vec![plain.clone()],
                count: 1,
            },
            MessagesReply::ChannelMessages {
                messages: vec![plain.clone()],
                count: 1,
            },
        ] {
            assert_eq!(document_from_reply(reply).unwrap(), descriptor());
        }
    }

    #[test]
    fn test_non_document_shapes_are_not_files() {
        let cases = vec![
            ChannelMessage::Plain { id: 1, media: None },
            ChannelMessage::Plain {
                id: 1,
                media: Some(MessageMedia::Photo),
            },
            ChannelMessage::Plain {
                id: 1,
                media: Some(MessageMedia::Other),
            },
            ChannelMessage::Service { id: 1 },
            ChannelMessage::Empty { id: 1 },
        ];

        for message in cases {
            let reply = MessagesReply::Messages(vec![message]);
            assert_eq!(document_from_reply(reply), Err(ResolveError::NotAFile));
        }
    }

    #[test]
    fn test_empty_reply_has_no_message() {
        let reply = MessagesReply::Messages(Vec::new());
        assert_eq!(document_from_reply(reply), Err(ResolveError::NoMessage));
    }

    #[test]
    fn test_only_first_message_is_considered() {
        let reply = MessagesReply::Messages(vec![
            ChannelMessage::Service { id: 1 },
            ChannelMessage::Plain {
                id: 2,
                media: Some(MessageMedia::Document(descriptor())),
            },
        ]);
        assert_eq!(document_from_reply(reply), Err(ResolveError::NotAFile));
    }
}
