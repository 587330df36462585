//! mirador-video — camera ingest for the recognition pipeline.
//!
//! Connectors turn a scheme-prefixed source descriptor into a frame stream;
//! the frame source supervises one connection with reconnect/backoff and
//! surfaces live status to the rest of the daemon.

pub mod frame;
pub mod source;
pub mod v4l;

pub use frame::{Frame, FrameError, PixelFormat};
pub use source::{
    CameraConnector, ConnectorRegistry, FrameSourceHandle, FrameStream, SourceError, SourceEvent,
    SourceStatus,
};
pub use v4l::V4lConnector;
