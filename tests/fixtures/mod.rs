//! Test fixtures.

mod network;
mod wire;

pub use network::{START_HEIGHT, TestBroadcaster, TestNetwork, TestNode, TogglePersister, header};
pub use wire::{WireDescriptor, WirePair};
