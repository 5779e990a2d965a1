//! ttyhub-core: Shared protocol library for ttyhub.
//!
//! Provides the framed IPC message codec, control/status payload types,
//! and the typed error taxonomy shared by the session server and
//! out-of-process forwarders.

pub mod codec;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{encode_frame, Frame, FrameDecoder, FrameType, HEADER_LEN};
pub use error::{HubError, HubResult, SpawnFailure};
pub use messages::{ControlCommand, ErrorPayload, StatusUpdate};
