//! kbus-daemon - host process for kbus buses.
//!
//! The daemon owns a [`BusService`] with every configured bus, runs the
//! reply-deadline sweeper, and exposes the control surface as serde-tagged
//! request/response frames. Transports (a device node, a socket, the
//! `--stdio` mode of `kbusd`) only move frames in and out of
//! [`control::handle_frame`].
//!
//! # Modules
//!
//! - [`config`]: `kbusd.toml` with `[daemon]` settings and `[[bus]]` entries
//! - [`control`]: request/response model, dispatcher and line server
//! - [`service`]: the multi-bus host
//! - [`error`]: daemon error type

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod control;
pub mod error;
pub mod service;

pub use config::{DaemonConfig, DaemonSettings};
pub use control::{ControlRequest, ControlResponse, dispatch, handle_frame, serve_lines};
pub use error::{DaemonError, DaemonResult};
pub use service::BusService;
