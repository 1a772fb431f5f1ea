//! Upstream session: state machine, history buffer and the actor that runs them.

pub mod client;
pub mod events;
pub mod history;
pub mod machine;

pub use client::SessionClient;
pub use events::{ConnectionInfo, SessionEvent, SessionState};
pub use history::MessageHistory;
pub use machine::{Action, Input, SessionMachine, TimerKind, CLIENT_DISCONNECT_REASON};
