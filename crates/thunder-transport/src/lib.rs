//! # THUNDER Transport
//!
//! Tokio TCP driver for the THUNDER peer manager.
//!
//! The peer manager in `thunder-core` is I/O-free: it consumes bytes and
//! writes through a [`thunder_core::SocketDescriptor`]. This crate supplies
//! that descriptor over tokio sockets and runs one task per connection.
//!
//! ```no_run
//! # async fn run(peer_manager: std::sync::Arc<thunder_transport::TokioPeerManager>) -> thunder_transport::error::TransportResult<()> {
//! use std::time::Duration;
//! use tokio::net::TcpListener;
//!
//! thunder_transport::spawn_timers(peer_manager.clone(), Duration::from_millis(100), Duration::from_secs(60));
//! let listener = TcpListener::bind("0.0.0.0:9735").await?;
//! thunder_transport::listen(peer_manager, listener).await
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

mod connection;
pub mod error;

pub use connection::{TokioDescriptor, TokioPeerManager, connect_outbound, listen, setup_inbound, spawn_timers};
