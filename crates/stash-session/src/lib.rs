//! Multi-tenant session-task supervision engine.
//!
//! Coordinates a front-channel login handshake with a back-channel account
//! session task through one-shot rendezvous slots, supervises one running
//! task per user through the [`SessionRegistry`], and runs the media relay
//! inside the task's watch phase once authentication completes.

mod media_relay;
mod registry;
mod rendezvous;
mod session_task;
#[cfg(test)]
mod tests;

pub use media_relay::MediaRelayConfig;
pub use registry::{
    CancelReport, LogoutReport, RegisterOutcome, SessionHandle, SessionRegistry,
};
pub use rendezvous::{rendezvous, RendezvousFulfiller, RendezvousWaiter, WaitOutcome};
pub use session_task::{
    start_account_session, SessionTaskConfig, SessionTaskError, StartedSession,
    DEFAULT_CODE_WAIT, DEFAULT_PASSWORD_WAIT,
};
