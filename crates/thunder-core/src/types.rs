//! Identifier newtypes shared across the node core.

use bitcoin::hashes::{Hash, sha256};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte channel identifier.
///
/// Before the funding transaction is known a random temporary id is used.
/// Afterwards the id is the funding txid with the output index XORed into
/// its last two bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// All-zero id, which addresses every channel with a peer in `error`
    pub const ALL: Self = Self([0u8; 32]);

    /// Derive the permanent id from a funding outpoint
    #[must_use]
    pub fn from_funding_outpoint(txid: &bitcoin::Txid, output_index: u16) -> Self {
        let mut id = txid.to_byte_array();
        id[30] ^= (output_index >> 8) as u8;
        id[31] ^= (output_index & 0xff) as u8;
        Self(id)
    }

    /// Borrow the raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", hex::encode(self.0))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// SHA-256 hash locking an HTLC
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Preimage unlocking an HTLC
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentPreimage(pub [u8; 32]);

impl PaymentPreimage {
    /// The payment hash this preimage unlocks
    #[must_use]
    pub fn payment_hash(&self) -> PaymentHash {
        PaymentHash(sha256::Hash::hash(&self.0).to_byte_array())
    }
}

impl fmt::Debug for PaymentPreimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentPreimage(..)")
    }
}

/// Secret the payee hands out with an invoice to bind multi-path parts
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaymentSecret(pub [u8; 32]);

impl fmt::Debug for PaymentSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PaymentSecret(..)")
    }
}

/// Block height of a short channel id's funding transaction
#[must_use]
pub fn scid_block_height(short_channel_id: u64) -> u32 {
    (short_channel_id >> 40) as u32
}

/// Transaction index within the block of a short channel id
#[must_use]
pub fn scid_tx_index(short_channel_id: u64) -> u32 {
    ((short_channel_id >> 16) & 0x00ff_ffff) as u32
}

/// Output index of a short channel id's funding output
#[must_use]
pub fn scid_output_index(short_channel_id: u64) -> u16 {
    (short_channel_id & 0xffff) as u16
}

/// Build a short channel id from its parts, if each fits its field
#[must_use]
pub fn scid_from_parts(block: u32, tx_index: u32, output_index: u16) -> Option<u64> {
    if block > 0x00ff_ffff || tx_index > 0x00ff_ffff {
        return None;
    }
    Some((u64::from(block) << 40) | (u64::from(tx_index) << 16) | u64::from(output_index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scid_parts() {
        let scid = scid_from_parts(700_000, 1234, 1).unwrap();
        assert_eq!(scid_block_height(scid), 700_000);
        assert_eq!(scid_tx_index(scid), 1234);
        assert_eq!(scid_output_index(scid), 1);
        assert_eq!(scid_from_parts(1 << 24, 0, 0), None);
    }

    #[test]
    fn test_channel_id_from_outpoint() {
        let txid = bitcoin::Txid::from_byte_array([0xAA; 32]);
        let id = ChannelId::from_funding_outpoint(&txid, 0x0102);
        assert_eq!(id.0[30], 0xAA ^ 0x01);
        assert_eq!(id.0[31], 0xAA ^ 0x02);
        assert_eq!(id.0[..30], [0xAA; 30]);
    }

    #[test]
    fn test_preimage_hash() {
        let preimage = PaymentPreimage([1u8; 32]);
        assert_eq!(
            preimage.payment_hash().0,
            sha256::Hash::hash(&[1u8; 32]).to_byte_array()
        );
    }
}
