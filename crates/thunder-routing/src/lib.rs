//! # THUNDER Routing
//!
//! Gossip-fed view of the Lightning network and payment pathfinding.
//!
//! This crate provides:
//! - [`NetworkGraph`]: announced channels, per-direction policies and nodes
//! - [`NetGraphMsgHandler`]: the `RoutingMessageHandler` that validates
//!   gossip (signatures, chain, funding UTXO) before it reaches the graph
//! - [`get_route`]: cheapest-fee pathfinding over the graph plus our own
//!   channels and invoice route hints
//!
//! ## Example
//!
//! ```rust,no_run
//! use bitcoin::blockdata::constants::ChainHash;
//! use thunder_routing::{NetGraphMsgHandler, get_route};
//! # fn demo(us: bitcoin::secp256k1::PublicKey, payee: bitcoin::secp256k1::PublicKey) {
//! let handler = NetGraphMsgHandler::new(ChainHash::TESTNET, None);
//! // ... feed it gossip through a PeerManager ...
//! let graph = handler.read_locked_graph();
//! let route = get_route(&us, &graph, &payee, None, &[], 10_000, 40);
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod gossip;
pub mod graph;
pub mod router;

pub use gossip::NetGraphMsgHandler;
pub use graph::{ChannelInfo, DirectionalChannelInfo, NetworkGraph, NodeAnnouncementInfo, NodeInfo};
pub use router::get_route;
