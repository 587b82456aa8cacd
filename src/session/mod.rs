//! Device session: the connection lifecycle for one BLE peripheral.
//!
//! The session repeatedly scans for peripherals advertising the configured
//! service, connects to the strongest one, and writes queued commands to its
//! characteristic. Every failure is recovered from by rescanning, so the
//! caller never sees a radio error.
//!
//! ```text
//!            window closed            connected
//!  Scanning ───────────────▶ Connecting ─────────▶ Idle ◀─┐ write ok
//!   ▲  │  ▲                      │                 │  └───┘
//!   │  │  └──── any failure ─────┘                 │
//!   │  │ scan error / no candidate                 │ write failed
//!   │  ▼                                           ▼
//!  RescanWait                                 FailureWait
//! ```
//!
//! Adapter refusal goes to `FailureWait` from any state. Both wait states
//! return to `Scanning` when their delay expires.
//!
//! [`Machine`] is the pure transition function; [`Session`] runs it on a
//! tokio task against a [`crate::radio::Radio`].

mod driver;
mod error;
mod machine;
mod request;
mod state;

pub use driver::{Session, SessionHandle};
pub use error::{SessionClosed, SessionError};
pub use machine::{Completion, Effect, Machine, Outcome, Ticket, Timer};
pub use request::Request;
pub use state::{Cause, SessionState, Transition};
