//! # THUNDER Core
//!
//! Lightning node logic for THUNDER: everything between an encrypted
//! socket and the bitcoin chain.
//!
//! This crate provides:
//! - BOLT wire messages and their encoding
//! - Commitment transaction construction and the per-channel state machine
//! - Channel monitors that watch the chain and punish or claim on-chain
//! - The `ChannelManager`, which owns every channel and routes HTLCs
//! - Sphinx onion construction, peeling and failure decoding
//! - The `PeerManager`, which runs BOLT-8 connections and dispatches messages
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        PeerManager                              │
//! │   (Noise sessions, init, ping/pong, gossip relay)               │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        ChannelManager         │   RoutingMessageHandler         │
//! │  (channels, HTLC forwarding)  │   (thunder-routing graph)       │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                  ChainMonitor / ChannelMonitor                  │
//! │   (persisted channel state, on-chain enforcement)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The embedder supplies the chain: fee estimates, a broadcaster, block
//! notifications and, for gossip checks, UTXO lookups. Nothing here does
//! I/O of its own except [`chain::FilesystemPersister`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod chain;
pub mod channel;
pub mod commitment;
pub mod config;
pub mod error;
pub mod events;
pub mod features;
pub mod keys;
pub mod logger;
pub mod manager;
pub mod msgs;
pub mod onion;
pub mod peer;
pub mod route;
pub mod ser;
pub mod types;
pub mod wire;

pub use config::UserConfig;
pub use error::{APIError, DecodeError, LightningError, PeerHandleError};
pub use manager::ChannelManager;
pub use peer::{MessageHandler, PeerManager, SocketDescriptor};
pub use types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
