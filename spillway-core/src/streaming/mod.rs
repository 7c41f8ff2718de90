//! Range streaming: the chunk-fetch loop and its output seam.

pub mod engine;
pub mod sink;

pub use engine::{StreamError, StreamOutcome, stream_range};
pub use sink::{BodySink, ByteSink, SinkClosed};
