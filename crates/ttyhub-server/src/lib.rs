//! PTY session hub: spawn terminal-backed processes, record their output
//! to replayable JSON-lines files, and control them over per-session Unix
//! sockets.
//!
//! [`manager::SessionManager`] is the entry point; the surrounding modules
//! cover PTY plumbing, the on-disk session store, the recording writer,
//! terminal title management, and the IPC layer.

pub mod activity;
pub mod boundary;
pub mod cast;
pub mod config;
pub mod events;
pub mod forwarder;
pub mod ipc;
pub mod manager;
pub mod process;
pub mod pty;
pub mod store;
pub mod title;

pub use config::Config;
pub use events::SessionEvent;
pub use manager::{ResizeSource, SessionInput, SessionManager, SessionOptions};
pub use store::{SessionDescriptor, SessionStatus};
pub use title::TitleMode;
