//! TCP transport layer.
//!
//! Peers talk over plain TCP streams carrying length-prefixed frames. This
//! crate owns the framing and the listener/dialer helpers; encryption is layered
//! on top by the caller.

pub mod frame;
pub mod listener;

pub use frame::{read_frame, read_json, write_frame, write_json, FrameError, MAX_FRAME_LEN};
pub use listener::{bind_first_available, connect_timeout};
