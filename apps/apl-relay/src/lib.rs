//! WebSocket relay that gives every admitted client its own sandboxed GNU APL
//! interpreter and shuttles text between the socket and the worker's
//! standard streams.

pub mod config;
pub mod error;
pub mod gatekeeper;
pub mod lifecycle;
pub mod multiplexer;
pub mod process;
pub mod server;
pub mod telemetry;

pub use config::{Cli, RelayConfig, SessionConfig, ShutdownPolicy};
pub use error::RelayError;
pub use gatekeeper::{OriginPolicy, SESSION_PROTOCOL};
pub use lifecycle::{run_session, CloseReason, LifecycleState, SessionReport, TeardownStep};
pub use multiplexer::BufferPolicy;
pub use process::{ExitState, LaunchContract, WorkerProcess};
pub use server::{RelayServer, RelayState};
