//! Capability traits implemented outside the session.
//!
//! A [`FrameSource`] produces frames on request and receives error and
//! closure notifications. A [`TransportSink`] ships payloads and
//! out-of-band signals to the remote peer. Neither trait carries shared
//! state, so both are easy to replace with test doubles.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{SourceError, TransportError};
use crate::video::encoder::EncodedPayload;
use crate::video::types::{Canvas, CloseReason, VideoErrorKind};

/// One frame request's worth of output from a [`FrameSource`].
///
/// `data` is delivered to the client as is. With both fields empty
/// nothing is sent for this cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NextFrame {
    pub frame: Option<Canvas>,
    pub data: Option<Bytes>,
}

impl NextFrame {
    pub fn frame(canvas: Canvas) -> Self {
        Self {
            frame: Some(canvas),
            data: None,
        }
    }

    pub fn data(data: impl Into<Bytes>) -> Self {
        Self {
            frame: None,
            data: Some(data.into()),
        }
    }
}

/// Producer side of a session.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Produce the next frame. Called at most once per admitted
    /// frame-ready signal, never concurrently for one session.
    async fn next_frame(&self) -> Result<NextFrame, SourceError>;

    /// The last frame could not be encoded or sent.
    fn on_error(&self, kind: VideoErrorKind, message: &str);

    /// The session closed; no further calls will follow.
    fn on_closed(&self, reason: CloseReason);
}

/// Delivery side of a session.
///
/// Calls for one session are made sequentially, in the order the
/// session issued them, each bounded by the session's transport timeout.
#[async_trait]
pub trait TransportSink: Send + Sync {
    async fn send(&self, payload: &EncodedPayload) -> Result<(), TransportError>;

    async fn send_progress(
        &self,
        value: f64,
        area: &str,
        message: &str,
    ) -> Result<(), TransportError>;

    async fn send_error(&self, code: i32, message: &str) -> Result<(), TransportError>;

    async fn notify_closed(&self, reason: CloseReason) -> Result<(), TransportError>;
}
