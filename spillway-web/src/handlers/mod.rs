//! HTTP request handlers.

pub mod range;
pub mod request_meta;
pub mod stream;

// Re-export handler functions
pub use range::{RangeSpec, resolve_range};
pub use request_meta::{client_ip, request_id};
pub use stream::{StreamParams, stream_message};
