//! grabd - exclusive input-capture control daemon
//!
//! This crate provides the core infrastructure for the grabd daemon:
//! - `server` - control socket dispatch loop and start/stop lifecycle
//! - `session` - the Idle/Active client session state machine
//! - `watcher` - client process exit notifications
//! - `capture` - seam to the capture engine
//! - `console` - seam to console-user resolution
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       grabd daemon                           │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────┐ datagrams  ┌────────────────────────┐  │
//! │  │  ControlServer   │───────────▶│     ClientSession      │  │
//! │  │ (unix datagram)  │            │  (Idle / Active state) │  │
//! │  └────────┬─────────┘            └───────────┬────────────┘  │
//! │           │ exit events (mpsc)               │ owns          │
//! │           ▼                                  ▼               │
//! │  ┌──────────────────┐            ┌────────────────────────┐  │
//! │  │   ExitWatcher    │            │  capture instance +    │  │
//! │  │ (one per client) │            │  watcher registration  │  │
//! │  └──────────────────┘            └────────────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every mutation of the session state happens on the single dispatch task
//! inside `server`: inbound datagrams are handled there directly, and exit
//! notifications are marshalled into the same task over an mpsc channel
//! instead of touching the session from the watcher's own task.

pub mod capture;
pub mod console;
pub mod server;
pub mod session;
pub mod watcher;
