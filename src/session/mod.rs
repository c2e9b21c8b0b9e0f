//! Recording session management
//!
//! - `SessionController` drives the lifecycle: join, active, recovery, stop
//! - `Session` owns the participant tracks of the running recording
//! - `SessionMetadata` is the `session.json` written when a session stops

mod config;
mod controller;
mod session;
mod stats;

pub use config::{SessionInfo, StartRequest};
pub use controller::{SessionController, SessionState};
pub use session::Session;
pub use stats::{ParticipantRecord, SessionMetadata, SessionReport, StopReason};
