//! Feature bit vectors for `init`, node and channel announcements.
//!
//! Bits come in pairs: the even bit means "required", the odd bit
//! "optional". A peer that requires an even bit we do not understand
//! cannot be talked to.

use crate::error::DecodeError;
use crate::ser::{Readable, Reader, Writeable, Writer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// `option_data_loss_protect` (optional)
pub const DATA_LOSS_PROTECT_OPTIONAL: usize = 1;
/// `initial_routing_sync` (init only, odd by definition)
pub const INITIAL_ROUTING_SYNC: usize = 3;
/// `option_upfront_shutdown_script` (optional)
pub const UPFRONT_SHUTDOWN_SCRIPT_OPTIONAL: usize = 5;
/// `option_static_remotekey` (required: we only build static-remotekey commitments)
pub const STATIC_REMOTE_KEY_REQUIRED: usize = 12;
/// `var_onion_optin`: TLV hop payloads (optional)
pub const VAR_ONION_OPTIN_OPTIONAL: usize = 9;
/// `payment_secret` (optional)
pub const PAYMENT_SECRET_OPTIONAL: usize = 15;
/// `basic_mpp` (optional)
pub const BASIC_MPP_OPTIONAL: usize = 17;

/// Bits this implementation understands, for each context.
const KNOWN_INIT_BITS: &[usize] = &[0, 1, 3, 4, 5, 8, 9, 12, 13, 14, 15, 16, 17];
const KNOWN_NODE_BITS: &[usize] = &[0, 1, 4, 5, 8, 9, 12, 13, 14, 15, 16, 17];
const KNOWN_CHANNEL_BITS: &[usize] = &[];

mod sealed {
    pub trait Context {
        const NAME: &'static str;
        const KNOWN: &'static [usize];
    }
}

/// Context marker for `init` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitContext {}
/// Context marker for node announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeContext {}
/// Context marker for channel announcements
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelContext {}

impl sealed::Context for InitContext {
    const NAME: &'static str = "init";
    const KNOWN: &'static [usize] = KNOWN_INIT_BITS;
}
impl sealed::Context for NodeContext {
    const NAME: &'static str = "node";
    const KNOWN: &'static [usize] = KNOWN_NODE_BITS;
}
impl sealed::Context for ChannelContext {
    const NAME: &'static str = "channel";
    const KNOWN: &'static [usize] = KNOWN_CHANNEL_BITS;
}

/// A feature bit vector in a given context.
///
/// Stored little-endian by byte (bit 0 is the lowest bit of `flags[0]`);
/// the wire encoding is big-endian with a u16 length prefix.
#[derive(Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Features<T: sealed::Context> {
    flags: Vec<u8>,
    mark: PhantomData<T>,
}

/// Features sent in `init`
pub type InitFeatures = Features<InitContext>;
/// Features in `node_announcement`
pub type NodeFeatures = Features<NodeContext>;
/// Features in `channel_announcement`
pub type ChannelFeatures = Features<ChannelContext>;

impl<T: sealed::Context> Clone for Features<T> {
    fn clone(&self) -> Self {
        Self {
            flags: self.flags.clone(),
            mark: PhantomData,
        }
    }
}

impl<T: sealed::Context> PartialEq for Features<T> {
    fn eq(&self, other: &Self) -> bool {
        let len = self.flags.len().max(other.flags.len());
        (0..len).all(|i| self.flags.get(i).copied().unwrap_or(0) == other.flags.get(i).copied().unwrap_or(0))
    }
}

impl<T: sealed::Context> Eq for Features<T> {}

impl<T: sealed::Context> fmt::Debug for Features<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}Features(", T::NAME)?;
        let bits: Vec<usize> = (0..self.flags.len() * 8).filter(|&b| self.is_set(b)).collect();
        write!(f, "{bits:?})")
    }
}

impl<T: sealed::Context> Features<T> {
    /// No bits set
    #[must_use]
    pub fn empty() -> Self {
        Self {
            flags: Vec::new(),
            mark: PhantomData,
        }
    }

    /// Set a bit
    pub fn set(&mut self, bit: usize) {
        let byte = bit / 8;
        if self.flags.len() <= byte {
            self.flags.resize(byte + 1, 0);
        }
        self.flags[byte] |= 1 << (bit % 8);
    }

    /// Builder form of [`Features::set`]
    #[must_use]
    pub fn with(mut self, bit: usize) -> Self {
        self.set(bit);
        self
    }

    /// Test a bit
    #[must_use]
    pub fn is_set(&self, bit: usize) -> bool {
        self.flags
            .get(bit / 8)
            .is_some_and(|b| b & (1 << (bit % 8)) != 0)
    }

    /// True if either bit of the pair containing `bit` is set
    #[must_use]
    pub fn supports(&self, bit: usize) -> bool {
        let even = bit & !1;
        self.is_set(even) || self.is_set(even + 1)
    }

    /// True if the peer requires (even bit) something we do not understand
    #[must_use]
    pub fn requires_unknown_bits(&self) -> bool {
        (0..self.flags.len() * 8)
            .step_by(2)
            .any(|bit| self.is_set(bit) && !T::KNOWN.contains(&bit))
    }

    /// Bits this implementation advertises in this context
    #[must_use]
    pub fn known() -> Self {
        let mut features = Self::empty();
        for &bit in T::KNOWN {
            // Advertise the optional form unless we insist on the bit.
            // Routing sync is requested per peer.
            if (bit % 2 == 1 && bit != INITIAL_ROUTING_SYNC) || bit == STATIC_REMOTE_KEY_REQUIRED {
                features.set(bit);
            }
        }
        features
    }
}

impl InitFeatures {
    /// Ask the remote for a full gossip dump
    pub fn set_initial_routing_sync(&mut self) {
        self.set(INITIAL_ROUTING_SYNC);
    }

    /// True if the remote asked for a full gossip dump
    #[must_use]
    pub fn initial_routing_sync(&self) -> bool {
        self.is_set(INITIAL_ROUTING_SYNC)
    }

    /// True if the peer accepts TLV hop payloads
    #[must_use]
    pub fn supports_variable_length_onion(&self) -> bool {
        self.supports(VAR_ONION_OPTIN_OPTIONAL)
    }

    /// The node-announcement view of these features
    #[must_use]
    pub fn to_node_features(&self) -> NodeFeatures {
        let mut node = NodeFeatures::empty();
        for bit in 0..self.flags.len() * 8 {
            if self.is_set(bit) && bit != INITIAL_ROUTING_SYNC {
                node.set(bit);
            }
        }
        node
    }
}

impl NodeFeatures {
    /// True if the node accepts TLV hop payloads
    #[must_use]
    pub fn supports_variable_length_onion(&self) -> bool {
        self.supports(VAR_ONION_OPTIN_OPTIONAL)
    }

    /// True if the node understands payment secrets
    #[must_use]
    pub fn supports_payment_secret(&self) -> bool {
        self.supports(PAYMENT_SECRET_OPTIONAL)
    }
}

impl<T: sealed::Context> Default for Features<T> {
    fn default() -> Self {
        Self::known()
    }
}

impl<T: sealed::Context> Writeable for Features<T> {
    fn write(&self, w: &mut Writer) {
        let mut bytes = self.flags.clone();
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        bytes.reverse();
        bytes.write(w);
    }
}

impl<T: sealed::Context> Readable for Features<T> {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let mut flags = Vec::<u8>::read(r)?;
        flags.reverse();
        Ok(Self {
            flags,
            mark: PhantomData,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_features_not_unknown() {
        assert!(!InitFeatures::known().requires_unknown_bits());
        assert!(!NodeFeatures::known().requires_unknown_bits());
        assert!(InitFeatures::known().is_set(STATIC_REMOTE_KEY_REQUIRED));
        assert!(NodeFeatures::known().supports_variable_length_onion());
        assert!(NodeFeatures::known().supports_payment_secret());
        assert!(!InitFeatures::known().initial_routing_sync());
    }

    #[test]
    fn test_unknown_even_bit_detected() {
        let f = InitFeatures::empty().with(20);
        assert!(f.requires_unknown_bits());
        let f = InitFeatures::empty().with(21);
        assert!(!f.requires_unknown_bits());
    }

    #[test]
    fn test_wire_is_big_endian() {
        let f = InitFeatures::empty().with(0).with(12);
        // bit 12 lives in the second-lowest byte, sent first
        assert_eq!(f.encode(), vec![0, 2, 0x10, 0x01]);
        let back = InitFeatures::decode(&f.encode()).unwrap();
        assert_eq!(back, f);
    }

    #[test]
    fn test_equality_ignores_trailing_zero_bytes() {
        let mut a = InitFeatures::empty();
        a.set(30);
        let mut b = a.clone();
        b.flags.push(0);
        assert_eq!(a, b);
    }

    #[test]
    fn test_initial_routing_sync_not_in_node_features() {
        let mut f = InitFeatures::known();
        f.set_initial_routing_sync();
        assert!(f.initial_routing_sync());
        assert!(!f.to_node_features().is_set(INITIAL_ROUTING_SYNC));
    }
}
