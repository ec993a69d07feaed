//! Wire message structs and the handler traits messages are dispatched to.
//!
//! Every struct here maps one-to-one onto a message body (without the
//! 2-byte type prefix, see [`crate::wire`]). Fields are listed in wire
//! order; [`impl_writeable!`] relies on that.
//!
//! Gossip messages are split into an `Unsigned*` part holding the signed
//! content and a wrapper carrying the signatures, so the signed bytes can
//! be re-serialized for verification.

use crate::error::{DecodeError, LightningError};
use crate::events::MessageSendEventsProvider;
use crate::features::{ChannelFeatures, InitFeatures, NodeFeatures};
use crate::impl_writeable;
use crate::ser::{Readable, Reader, Writeable, Writer};
use crate::types::{ChannelId, PaymentHash, PaymentPreimage};
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::hashes::{Hash, sha256d};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey};
use std::fmt;

/// Size of an onion routing packet carried in `update_add_htlc`
pub const ONION_PACKET_SIZE: usize = 1366;
/// Size of the per-hop data area of an onion packet
pub const ONION_HOP_DATA_SIZE: usize = 1300;

// ============ Connection Setup / Control ============

/// `init`: first message on every connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Init {
    /// Features the sender supports
    pub features: InitFeatures,
}

impl Writeable for Init {
    fn write(&self, w: &mut Writer) {
        // Legacy global features are always sent empty.
        0u16.write(w);
        self.features.write(w);
    }
}

impl Readable for Init {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let global = InitFeatures::read(r)?;
        let mut features = InitFeatures::read(r)?;
        for bit in (0..64).filter(|&b| global.is_set(b)) {
            features.set(bit);
        }
        Ok(Self { features })
    }
}

/// `error`: a fatal problem with one channel, or every channel if
/// `channel_id` is all zero
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    /// Channel the error applies to
    pub channel_id: ChannelId,
    /// Human-readable description. Must be printed sanitized.
    pub data: String,
}

impl Writeable for ErrorMessage {
    fn write(&self, w: &mut Writer) {
        self.channel_id.write(w);
        self.data.as_bytes().to_vec().write(w);
    }
}

impl Readable for ErrorMessage {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let channel_id = ChannelId::read(r)?;
        let raw = Vec::<u8>::read(r)?;
        Ok(Self {
            channel_id,
            data: String::from_utf8_lossy(&raw).into_owned(),
        })
    }
}

/// `ping`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    /// Requested pong payload size
    pub ponglen: u16,
    /// Size of our own zero padding
    pub byteslen: u16,
}

impl Writeable for Ping {
    fn write(&self, w: &mut Writer) {
        self.ponglen.write(w);
        vec![0u8; self.byteslen as usize].write(w);
    }
}

impl Readable for Ping {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let ponglen = u16::read(r)?;
        let byteslen = u16::read(r)?;
        r.read_bytes(byteslen as usize)?;
        Ok(Self { ponglen, byteslen })
    }
}

/// `pong`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    /// Size of the zero padding
    pub byteslen: u16,
}

impl Writeable for Pong {
    fn write(&self, w: &mut Writer) {
        vec![0u8; self.byteslen as usize].write(w);
    }
}

impl Readable for Pong {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let byteslen = u16::read(r)?;
        r.read_bytes(byteslen as usize)?;
        Ok(Self { byteslen })
    }
}

// ============ Channel Establishment ============

/// `open_channel`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct OpenChannel {
    pub chain_hash: ChainHash,
    pub temporary_channel_id: ChannelId,
    pub funding_satoshis: u64,
    pub push_msat: u64,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub htlc_minimum_msat: u64,
    pub feerate_per_kw: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_point: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
    pub channel_flags: u8,
    /// Upfront shutdown script, empty when not committed
    pub shutdown_scriptpubkey: Vec<u8>,
}

impl_writeable!(OpenChannel, {
    chain_hash,
    temporary_channel_id,
    funding_satoshis,
    push_msat,
    dust_limit_satoshis,
    max_htlc_value_in_flight_msat,
    channel_reserve_satoshis,
    htlc_minimum_msat,
    feerate_per_kw,
    to_self_delay,
    max_accepted_htlcs,
    funding_pubkey,
    revocation_basepoint,
    payment_point,
    delayed_payment_basepoint,
    htlc_basepoint,
    first_per_commitment_point,
    channel_flags,
    shutdown_scriptpubkey
});

/// `accept_channel`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AcceptChannel {
    pub temporary_channel_id: ChannelId,
    pub dust_limit_satoshis: u64,
    pub max_htlc_value_in_flight_msat: u64,
    pub channel_reserve_satoshis: u64,
    pub htlc_minimum_msat: u64,
    pub minimum_depth: u32,
    pub to_self_delay: u16,
    pub max_accepted_htlcs: u16,
    pub funding_pubkey: PublicKey,
    pub revocation_basepoint: PublicKey,
    pub payment_point: PublicKey,
    pub delayed_payment_basepoint: PublicKey,
    pub htlc_basepoint: PublicKey,
    pub first_per_commitment_point: PublicKey,
    /// Upfront shutdown script, empty when not committed
    pub shutdown_scriptpubkey: Vec<u8>,
}

impl_writeable!(AcceptChannel, {
    temporary_channel_id,
    dust_limit_satoshis,
    max_htlc_value_in_flight_msat,
    channel_reserve_satoshis,
    htlc_minimum_msat,
    minimum_depth,
    to_self_delay,
    max_accepted_htlcs,
    funding_pubkey,
    revocation_basepoint,
    payment_point,
    delayed_payment_basepoint,
    htlc_basepoint,
    first_per_commitment_point,
    shutdown_scriptpubkey
});

/// `funding_created`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FundingCreated {
    pub temporary_channel_id: ChannelId,
    /// Funding txid in internal byte order
    pub funding_txid: [u8; 32],
    pub funding_output_index: u16,
    pub signature: Signature,
}

impl_writeable!(FundingCreated, {
    temporary_channel_id,
    funding_txid,
    funding_output_index,
    signature
});

/// `funding_signed`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FundingSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
}

impl_writeable!(FundingSigned, { channel_id, signature });

/// `funding_locked`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct FundingLocked {
    pub channel_id: ChannelId,
    pub next_per_commitment_point: PublicKey,
}

impl_writeable!(FundingLocked, { channel_id, next_per_commitment_point });

// ============ Channel Close ============

/// `shutdown`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct Shutdown {
    pub channel_id: ChannelId,
    pub scriptpubkey: Vec<u8>,
}

impl_writeable!(Shutdown, { channel_id, scriptpubkey });

/// `closing_signed`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ClosingSigned {
    pub channel_id: ChannelId,
    pub fee_satoshis: u64,
    pub signature: Signature,
}

impl_writeable!(ClosingSigned, { channel_id, fee_satoshis, signature });

// ============ Normal Operation ============

/// The 1366-byte Sphinx packet carried in `update_add_htlc`
#[derive(Clone, PartialEq, Eq)]
pub struct OnionPacket {
    /// Packet version, 0
    pub version: u8,
    /// Ephemeral public key, left unparsed so a bad key can be answered
    /// with `update_fail_malformed_htlc`
    pub public_key: [u8; 33],
    /// Encrypted hop payloads
    pub hop_data: [u8; ONION_HOP_DATA_SIZE],
    /// HMAC over `hop_data` and the payment hash
    pub hmac: [u8; 32],
}

impl fmt::Debug for OnionPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnionPacket")
            .field("version", &self.version)
            .field("public_key", &hex::encode(self.public_key))
            .field("hmac", &hex::encode(self.hmac))
            .finish_non_exhaustive()
    }
}

impl_writeable!(OnionPacket, { version, public_key, hop_data, hmac });

/// `update_add_htlc`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UpdateAddHTLC {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub amount_msat: u64,
    pub payment_hash: PaymentHash,
    pub cltv_expiry: u32,
    pub onion_routing_packet: OnionPacket,
}

impl_writeable!(UpdateAddHTLC, {
    channel_id,
    htlc_id,
    amount_msat,
    payment_hash,
    cltv_expiry,
    onion_routing_packet
});

/// `update_fulfill_htlc`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UpdateFulfillHTLC {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub payment_preimage: PaymentPreimage,
}

impl_writeable!(UpdateFulfillHTLC, { channel_id, htlc_id, payment_preimage });

/// `update_fail_htlc`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UpdateFailHTLC {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    /// Encrypted failure onion
    pub reason: Vec<u8>,
}

impl_writeable!(UpdateFailHTLC, { channel_id, htlc_id, reason });

/// `update_fail_malformed_htlc`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UpdateFailMalformedHTLC {
    pub channel_id: ChannelId,
    pub htlc_id: u64,
    pub sha256_of_onion: [u8; 32],
    /// Always has the BADONION bit set
    pub failure_code: u16,
}

impl_writeable!(UpdateFailMalformedHTLC, {
    channel_id,
    htlc_id,
    sha256_of_onion,
    failure_code
});

/// `commitment_signed`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct CommitmentSigned {
    pub channel_id: ChannelId,
    pub signature: Signature,
    /// One signature per untrimmed HTLC output, in output order
    pub htlc_signatures: Vec<Signature>,
}

impl_writeable!(CommitmentSigned, { channel_id, signature, htlc_signatures });

/// `revoke_and_ack`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct RevokeAndACK {
    pub channel_id: ChannelId,
    pub per_commitment_secret: [u8; 32],
    pub next_per_commitment_point: PublicKey,
}

impl_writeable!(RevokeAndACK, {
    channel_id,
    per_commitment_secret,
    next_per_commitment_point
});

/// `update_fee`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UpdateFee {
    pub channel_id: ChannelId,
    pub feerate_per_kw: u32,
}

impl_writeable!(UpdateFee, { channel_id, feerate_per_kw });

/// `channel_reestablish`, always sent with the data-loss-protect fields
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChannelReestablish {
    pub channel_id: ChannelId,
    pub next_local_commitment_number: u64,
    pub next_remote_commitment_number: u64,
    pub your_last_per_commitment_secret: [u8; 32],
    pub my_current_per_commitment_point: PublicKey,
}

impl_writeable!(ChannelReestablish, {
    channel_id,
    next_local_commitment_number,
    next_remote_commitment_number,
    your_last_per_commitment_secret,
    my_current_per_commitment_point
});

// ============ Gossip ============

/// `announcement_signatures`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct AnnouncementSignatures {
    pub channel_id: ChannelId,
    pub short_channel_id: u64,
    pub node_signature: Signature,
    pub bitcoin_signature: Signature,
}

impl_writeable!(AnnouncementSignatures, {
    channel_id,
    short_channel_id,
    node_signature,
    bitcoin_signature
});

/// A reachable address advertised in `node_announcement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetAddress {
    /// IPv4 address and port
    IPv4 {
        /// Octets
        addr: [u8; 4],
        /// TCP port
        port: u16,
    },
    /// IPv6 address and port
    IPv6 {
        /// Octets
        addr: [u8; 16],
        /// TCP port
        port: u16,
    },
    /// Tor v2 onion service
    OnionV2 {
        /// Service id
        addr: [u8; 10],
        /// TCP port
        port: u16,
    },
    /// Tor v3 onion service
    OnionV3 {
        /// Service public key
        ed25519_pubkey: [u8; 32],
        /// Checksum
        checksum: u16,
        /// Version byte
        version: u8,
        /// TCP port
        port: u16,
    },
}

impl NetAddress {
    fn type_id(&self) -> u8 {
        match self {
            Self::IPv4 { .. } => 1,
            Self::IPv6 { .. } => 2,
            Self::OnionV2 { .. } => 3,
            Self::OnionV3 { .. } => 4,
        }
    }
}

impl Writeable for NetAddress {
    fn write(&self, w: &mut Writer) {
        self.type_id().write(w);
        match self {
            Self::IPv4 { addr, port } => {
                addr.write(w);
                port.write(w);
            }
            Self::IPv6 { addr, port } => {
                addr.write(w);
                port.write(w);
            }
            Self::OnionV2 { addr, port } => {
                addr.write(w);
                port.write(w);
            }
            Self::OnionV3 {
                ed25519_pubkey,
                checksum,
                version,
                port,
            } => {
                ed25519_pubkey.write(w);
                checksum.write(w);
                version.write(w);
                port.write(w);
            }
        }
    }
}

impl NetAddress {
    /// Read one address; `Ok(None)` for an unknown type, after which the
    /// rest of the address list cannot be parsed
    fn read_opt(r: &mut Reader<'_>) -> Result<Option<Self>, DecodeError> {
        Ok(Some(match u8::read(r)? {
            1 => Self::IPv4 {
                addr: Readable::read(r)?,
                port: Readable::read(r)?,
            },
            2 => Self::IPv6 {
                addr: Readable::read(r)?,
                port: Readable::read(r)?,
            },
            3 => Self::OnionV2 {
                addr: Readable::read(r)?,
                port: Readable::read(r)?,
            },
            4 => Self::OnionV3 {
                ed25519_pubkey: Readable::read(r)?,
                checksum: Readable::read(r)?,
                version: Readable::read(r)?,
                port: Readable::read(r)?,
            },
            _ => return Ok(None),
        }))
    }
}

/// Signed content of `node_announcement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedNodeAnnouncement {
    /// Node features
    pub features: NodeFeatures,
    /// Monotonic per node; older announcements are ignored
    pub timestamp: u32,
    /// Announcing node
    pub node_id: PublicKey,
    /// Display colour
    pub rgb: [u8; 3],
    /// UTF-8 alias, zero padded
    pub alias: [u8; 32],
    /// Known addresses, in type order
    pub addresses: Vec<NetAddress>,
    /// Address bytes we could not parse, kept so the signature still checks
    pub excess_address_data: Vec<u8>,
    /// Trailing bytes after the address list
    pub excess_data: Vec<u8>,
}

impl Writeable for UnsignedNodeAnnouncement {
    fn write(&self, w: &mut Writer) {
        self.features.write(w);
        self.timestamp.write(w);
        self.node_id.write(w);
        self.rgb.write(w);
        self.alias.write(w);
        let mut addrs = Writer::new();
        for addr in &self.addresses {
            addr.write(&mut addrs);
        }
        addrs.write_all(&self.excess_address_data);
        addrs.into_inner().write(w);
        w.write_all(&self.excess_data);
    }
}

impl Readable for UnsignedNodeAnnouncement {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let features = NodeFeatures::read(r)?;
        let timestamp = u32::read(r)?;
        let node_id = PublicKey::read(r)?;
        let rgb = Readable::read(r)?;
        let alias = Readable::read(r)?;

        let raw = Vec::<u8>::read(r)?;
        let mut ar = Reader::new(&raw);
        let mut addresses: Vec<NetAddress> = Vec::new();
        let mut excess_address_data = Vec::new();
        while ar.remaining() > 0 {
            let before = ar.remaining();
            let start = raw.len() - before;
            match NetAddress::read_opt(&mut ar) {
                Ok(Some(addr)) => {
                    if addresses.last().is_some_and(|last| last.type_id() > addr.type_id()) {
                        return Err(DecodeError::InvalidValue);
                    }
                    addresses.push(addr);
                }
                Ok(None) | Err(DecodeError::ShortRead) => {
                    excess_address_data = raw[start..].to_vec();
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            features,
            timestamp,
            node_id,
            rgb,
            alias,
            addresses,
            excess_address_data,
            excess_data: r.read_to_end().to_vec(),
        })
    }
}

/// `node_announcement`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnouncement {
    /// Signature by `contents.node_id`
    pub signature: Signature,
    /// Signed content
    pub contents: UnsignedNodeAnnouncement,
}

impl_writeable!(NodeAnnouncement, { signature, contents });

/// Signed content of `channel_announcement`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UnsignedChannelAnnouncement {
    pub features: ChannelFeatures,
    pub chain_hash: ChainHash,
    pub short_channel_id: u64,
    /// Lexicographically lesser node id
    pub node_id_1: PublicKey,
    pub node_id_2: PublicKey,
    pub bitcoin_key_1: PublicKey,
    pub bitcoin_key_2: PublicKey,
    /// Trailing bytes, covered by the signatures
    pub excess_data: Vec<u8>,
}

impl Writeable for UnsignedChannelAnnouncement {
    fn write(&self, w: &mut Writer) {
        self.features.write(w);
        self.chain_hash.write(w);
        self.short_channel_id.write(w);
        self.node_id_1.write(w);
        self.node_id_2.write(w);
        self.bitcoin_key_1.write(w);
        self.bitcoin_key_2.write(w);
        w.write_all(&self.excess_data);
    }
}

impl Readable for UnsignedChannelAnnouncement {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            features: Readable::read(r)?,
            chain_hash: Readable::read(r)?,
            short_channel_id: Readable::read(r)?,
            node_id_1: Readable::read(r)?,
            node_id_2: Readable::read(r)?,
            bitcoin_key_1: Readable::read(r)?,
            bitcoin_key_2: Readable::read(r)?,
            excess_data: r.read_to_end().to_vec(),
        })
    }
}

/// `channel_announcement`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ChannelAnnouncement {
    pub node_signature_1: Signature,
    pub node_signature_2: Signature,
    pub bitcoin_signature_1: Signature,
    pub bitcoin_signature_2: Signature,
    pub contents: UnsignedChannelAnnouncement,
}

impl_writeable!(ChannelAnnouncement, {
    node_signature_1,
    node_signature_2,
    bitcoin_signature_1,
    bitcoin_signature_2,
    contents
});

/// Signed content of `channel_update`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct UnsignedChannelUpdate {
    pub chain_hash: ChainHash,
    pub short_channel_id: u64,
    pub timestamp: u32,
    /// Bit 0: `htlc_maximum_msat` present
    pub message_flags: u8,
    /// Bit 0: direction, bit 1: disabled
    pub channel_flags: u8,
    pub cltv_expiry_delta: u16,
    pub htlc_minimum_msat: u64,
    pub fee_base_msat: u32,
    pub fee_proportional_millionths: u32,
    pub htlc_maximum_msat: Option<u64>,
    /// Trailing bytes, covered by the signature
    pub excess_data: Vec<u8>,
}

impl Writeable for UnsignedChannelUpdate {
    fn write(&self, w: &mut Writer) {
        let message_flags = if self.htlc_maximum_msat.is_some() {
            self.message_flags | 1
        } else {
            self.message_flags & !1
        };
        self.chain_hash.write(w);
        self.short_channel_id.write(w);
        self.timestamp.write(w);
        message_flags.write(w);
        self.channel_flags.write(w);
        self.cltv_expiry_delta.write(w);
        self.htlc_minimum_msat.write(w);
        self.fee_base_msat.write(w);
        self.fee_proportional_millionths.write(w);
        if let Some(max) = self.htlc_maximum_msat {
            max.write(w);
        }
        w.write_all(&self.excess_data);
    }
}

impl Readable for UnsignedChannelUpdate {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let chain_hash = Readable::read(r)?;
        let short_channel_id = Readable::read(r)?;
        let timestamp = Readable::read(r)?;
        let message_flags = u8::read(r)?;
        let channel_flags = Readable::read(r)?;
        let cltv_expiry_delta = Readable::read(r)?;
        let htlc_minimum_msat = Readable::read(r)?;
        let fee_base_msat = Readable::read(r)?;
        let fee_proportional_millionths = Readable::read(r)?;
        let htlc_maximum_msat = if message_flags & 1 == 1 {
            Some(u64::read(r)?)
        } else {
            None
        };
        Ok(Self {
            chain_hash,
            short_channel_id,
            timestamp,
            message_flags,
            channel_flags,
            cltv_expiry_delta,
            htlc_minimum_msat,
            fee_base_msat,
            fee_proportional_millionths,
            htlc_maximum_msat,
            excess_data: r.read_to_end().to_vec(),
        })
    }
}

/// `channel_update`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelUpdate {
    /// Signature by the node at the direction's origin
    pub signature: Signature,
    /// Signed content
    pub contents: UnsignedChannelUpdate,
}

impl_writeable!(ChannelUpdate, { signature, contents });

/// `query_channel_range`
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct QueryChannelRange {
    pub chain_hash: ChainHash,
    pub first_blocknum: u32,
    pub number_of_blocks: u32,
}

impl_writeable!(QueryChannelRange, {
    chain_hash,
    first_blocknum,
    number_of_blocks
});

/// `reply_channel_range` with uncompressed (type 0) id encoding
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct ReplyChannelRange {
    pub chain_hash: ChainHash,
    pub first_blocknum: u32,
    pub number_of_blocks: u32,
    /// True when this is the final reply for the query
    pub sync_complete: bool,
    pub short_channel_ids: Vec<u64>,
}

impl Writeable for ReplyChannelRange {
    fn write(&self, w: &mut Writer) {
        self.chain_hash.write(w);
        self.first_blocknum.write(w);
        self.number_of_blocks.write(w);
        u8::from(self.sync_complete).write(w);
        let mut ids = vec![0u8];
        for scid in &self.short_channel_ids {
            ids.extend_from_slice(&scid.to_be_bytes());
        }
        ids.write(w);
    }
}

impl Readable for ReplyChannelRange {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let chain_hash = Readable::read(r)?;
        let first_blocknum = Readable::read(r)?;
        let number_of_blocks = Readable::read(r)?;
        let sync_complete = match u8::read(r)? {
            0 => false,
            1 => true,
            _ => return Err(DecodeError::InvalidValue),
        };
        let encoded = Vec::<u8>::read(r)?;
        let mut er = Reader::new(&encoded);
        if u8::read(&mut er)? != 0 {
            // zlib-compressed id lists are not supported
            return Err(DecodeError::UnknownVersion);
        }
        if er.remaining() % 8 != 0 {
            return Err(DecodeError::BadLengthDescriptor);
        }
        let mut short_channel_ids = Vec::with_capacity(er.remaining() / 8);
        while er.remaining() > 0 {
            short_channel_ids.push(u64::read(&mut er)?);
        }
        Ok(Self {
            chain_hash,
            first_blocknum,
            number_of_blocks,
            sync_complete,
            short_channel_ids,
        })
    }
}

// ============ Signing helpers ============

fn double_sha256_message<T: Writeable>(content: &T) -> Message {
    let hash = sha256d::Hash::hash(&content.encode());
    Message::from_digest(hash.to_byte_array())
}

impl UnsignedChannelAnnouncement {
    /// The digest every announcement signature commits to
    #[must_use]
    pub fn signing_message(&self) -> Message {
        double_sha256_message(self)
    }
}

impl UnsignedNodeAnnouncement {
    /// The digest `node_id` signs
    #[must_use]
    pub fn signing_message(&self) -> Message {
        double_sha256_message(self)
    }
}

impl UnsignedChannelUpdate {
    /// The digest the direction's node signs
    #[must_use]
    pub fn signing_message(&self) -> Message {
        double_sha256_message(self)
    }
}

// ============ Handler Traits ============

/// A routing-relevant failure learned from a failed payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HTLCFailChannelUpdate {
    /// The failing node handed us a fresher `channel_update`
    ChannelUpdateMessage {
        /// The update to apply
        msg: ChannelUpdate,
    },
    /// A channel is unusable
    ChannelClosed {
        /// The channel
        short_channel_id: u64,
        /// Remove it from the graph rather than just disabling it
        is_permanent: bool,
    },
    /// A node is unusable
    NodeFailure {
        /// The node
        node_id: PublicKey,
        /// Remove it and its channels from the graph
        is_permanent: bool,
    },
}

/// Receives channel-level messages from the peer manager.
///
/// Outbound messages are returned through [`MessageSendEventsProvider`].
#[allow(missing_docs)]
pub trait ChannelMessageHandler: MessageSendEventsProvider + Send + Sync {
    fn handle_open_channel(&self, their_node_id: &PublicKey, their_features: InitFeatures, msg: &OpenChannel);
    fn handle_accept_channel(&self, their_node_id: &PublicKey, their_features: InitFeatures, msg: &AcceptChannel);
    fn handle_funding_created(&self, their_node_id: &PublicKey, msg: &FundingCreated);
    fn handle_funding_signed(&self, their_node_id: &PublicKey, msg: &FundingSigned);
    fn handle_funding_locked(&self, their_node_id: &PublicKey, msg: &FundingLocked);
    fn handle_shutdown(&self, their_node_id: &PublicKey, msg: &Shutdown);
    fn handle_closing_signed(&self, their_node_id: &PublicKey, msg: &ClosingSigned);
    fn handle_update_add_htlc(&self, their_node_id: &PublicKey, msg: &UpdateAddHTLC);
    fn handle_update_fulfill_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFulfillHTLC);
    fn handle_update_fail_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFailHTLC);
    fn handle_update_fail_malformed_htlc(&self, their_node_id: &PublicKey, msg: &UpdateFailMalformedHTLC);
    fn handle_commitment_signed(&self, their_node_id: &PublicKey, msg: &CommitmentSigned);
    fn handle_revoke_and_ack(&self, their_node_id: &PublicKey, msg: &RevokeAndACK);
    fn handle_update_fee(&self, their_node_id: &PublicKey, msg: &UpdateFee);
    fn handle_announcement_signatures(&self, their_node_id: &PublicKey, msg: &AnnouncementSignatures);
    fn handle_channel_reestablish(&self, their_node_id: &PublicKey, msg: &ChannelReestablish);

    /// The connection to the peer went away. `no_connection_possible`
    /// means we will never talk to it again and should close its channels.
    fn peer_disconnected(&self, their_node_id: &PublicKey, no_connection_possible: bool);
    /// The peer completed the `init` exchange
    fn peer_connected(&self, their_node_id: &PublicKey, msg: &Init);
    /// The peer sent an `error`
    fn handle_error(&self, their_node_id: &PublicKey, msg: &ErrorMessage);
}

/// Receives gossip from the peer manager and serves it back for syncs.
///
/// The `bool` returned from the `handle_*` calls says whether the message
/// should be relayed to other peers.
pub trait RoutingMessageHandler: Send + Sync {
    /// Handle a `node_announcement`
    ///
    /// # Errors
    ///
    /// Returns a [`LightningError`] whose action says how to treat the peer.
    fn handle_node_announcement(&self, msg: &NodeAnnouncement) -> Result<bool, LightningError>;

    /// Handle a `channel_announcement`
    ///
    /// # Errors
    ///
    /// Returns a [`LightningError`] whose action says how to treat the peer.
    fn handle_channel_announcement(&self, msg: &ChannelAnnouncement) -> Result<bool, LightningError>;

    /// Handle a `channel_update`
    ///
    /// # Errors
    ///
    /// Returns a [`LightningError`] whose action says how to treat the peer.
    fn handle_channel_update(&self, msg: &ChannelUpdate) -> Result<bool, LightningError>;

    /// Apply what a payment failure taught us about the graph
    fn handle_htlc_fail_channel_update(&self, update: &HTLCFailChannelUpdate);

    /// Up to `batch_amount` channels with id ≥ `starting_point`, each with
    /// its latest update per direction
    fn get_next_channel_announcements(
        &self,
        starting_point: u64,
        batch_amount: u8,
    ) -> Vec<(ChannelAnnouncement, Option<ChannelUpdate>, Option<ChannelUpdate>)>;

    /// Up to `batch_amount` node announcements after `starting_point`
    fn get_next_node_announcements(
        &self,
        starting_point: Option<&PublicKey>,
        batch_amount: u8,
    ) -> Vec<NodeAnnouncement>;

    /// Whether to ask this newly connected peer for a full gossip dump
    fn should_request_full_sync(&self, node_id: &PublicKey) -> bool;

    /// Answer a `query_channel_range` with the channels we know in it
    ///
    /// # Errors
    ///
    /// Returns a [`LightningError`] if the query is for another chain.
    fn handle_query_channel_range(
        &self,
        their_node_id: &PublicKey,
        msg: &QueryChannelRange,
    ) -> Result<Vec<ReplyChannelRange>, LightningError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Secp256k1, SecretKey};

    fn pubkey(byte: u8) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[byte; 32]).unwrap())
    }

    fn sig() -> Signature {
        Signature::from_compact(&[1u8; 64]).unwrap()
    }

    #[test]
    fn test_ping_encoding() {
        let ping = Ping {
            ponglen: 4,
            byteslen: 2,
        };
        assert_eq!(ping.encode(), vec![0, 4, 0, 2, 0, 0]);
        assert_eq!(Ping::decode(&ping.encode()).unwrap(), ping);
        assert_eq!(Pong::decode(&[0, 3, 0]), Err(DecodeError::ShortRead));
    }

    #[test]
    fn test_init_merges_global_features() {
        // global features byte 0x02 (bit 1), local features empty
        let init = Init::decode(&[0, 1, 0x02, 0, 0]).unwrap();
        assert!(init.features.is_set(1));
    }

    #[test]
    fn test_error_message_lossy_utf8() {
        let bytes = [&[0u8; 32][..], &[0, 2, 0xff, b'a']].concat();
        let msg = ErrorMessage::decode(&bytes).unwrap();
        assert!(msg.data.ends_with('a'));
    }

    #[test]
    fn test_channel_update_optional_max() {
        let mut update = UnsignedChannelUpdate {
            chain_hash: ChainHash::BITCOIN,
            short_channel_id: 42,
            timestamp: 100,
            message_flags: 0,
            channel_flags: 1,
            cltv_expiry_delta: 40,
            htlc_minimum_msat: 1,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1,
            htlc_maximum_msat: None,
            excess_data: Vec::new(),
        };
        let short = update.encode();
        update.htlc_maximum_msat = Some(5_000);
        let long = update.encode();
        assert_eq!(long.len(), short.len() + 8);

        let back = UnsignedChannelUpdate::decode(&long).unwrap();
        assert_eq!(back.htlc_maximum_msat, Some(5_000));
        assert_eq!(back.message_flags & 1, 1);
    }

    #[test]
    fn test_node_announcement_keeps_unknown_address_bytes() {
        let ann = UnsignedNodeAnnouncement {
            features: NodeFeatures::empty(),
            timestamp: 7,
            node_id: pubkey(3),
            rgb: [1, 2, 3],
            alias: [0; 32],
            addresses: vec![NetAddress::IPv4 {
                addr: [127, 0, 0, 1],
                port: 9735,
            }],
            excess_address_data: vec![9, 9, 9],
            excess_data: vec![0xAB],
        };
        let bytes = ann.encode();
        let back = UnsignedNodeAnnouncement::decode(&bytes).unwrap();
        assert_eq!(back, ann);
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn test_reply_channel_range_rejects_zlib() {
        let reply = ReplyChannelRange {
            chain_hash: ChainHash::BITCOIN,
            first_blocknum: 0,
            number_of_blocks: 10,
            sync_complete: true,
            short_channel_ids: vec![1, 2],
        };
        let mut bytes = reply.encode();
        assert_eq!(ReplyChannelRange::decode(&bytes).unwrap(), reply);
        // encoding type byte follows chain hash, two u32s, flag, u16 len
        bytes[32 + 4 + 4 + 1 + 2] = 1;
        assert_eq!(
            ReplyChannelRange::decode(&bytes),
            Err(DecodeError::UnknownVersion)
        );
    }

    #[test]
    fn test_commitment_signed_layout() {
        let msg = CommitmentSigned {
            channel_id: ChannelId([5; 32]),
            signature: sig(),
            htlc_signatures: vec![sig(), sig()],
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), 32 + 64 + 2 + 128);
        assert_eq!(CommitmentSigned::decode(&bytes).unwrap(), msg);
    }
}
