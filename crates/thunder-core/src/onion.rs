//! Sphinx onion construction, peeling and failure attribution.
//!
//! ```text
//!   sender                 hop 0                 hop 1 (payee)
//!   build_onion_packet --> peel_onion_packet --> peel_onion_packet
//!        ^                      |                      |
//!        |        crypt_failure_packet <-- build_failure_packet
//!        +-- process_onion_failure
//! ```
//!
//! Every hop derives its keys from the ECDH shared secret with the packet's
//! ephemeral key; the ephemeral key is re-blinded at each hop so no two
//! hops see the same point.

use crate::channel::BADONION;
use crate::error::{APIError, DecodeError};
use crate::keys::SECP;
use crate::msgs::{ChannelUpdate, HTLCFailChannelUpdate, ONION_HOP_DATA_SIZE, OnionPacket};
use crate::route::RouteHop;
use crate::ser::{BigSize, Readable, Reader, Writeable, Writer, read_truncated, write_truncated};
use crate::types::{PaymentHash, PaymentSecret};
use bitcoin::secp256k1::ecdh::SharedSecret;
use bitcoin::secp256k1::{PublicKey, Scalar, SecretKey};
use thiserror::Error;
use thunder_crypto::hash::{hmac_sha256, sha256_concat};
use thunder_crypto::stream::{apply_keystream, keystream};
use tracing::{debug, trace};

// ============ Failure Codes ============

/// Failure is permanent
pub const PERM: u16 = 0x4000;
/// Failure concerns the whole node
pub const NODE: u16 = 0x2000;
/// Failure data carries a `channel_update`
pub const UPDATE: u16 = 0x1000;

#[allow(missing_docs)]
pub const INVALID_ONION_VERSION: u16 = BADONION | PERM | 4;
#[allow(missing_docs)]
pub const INVALID_ONION_HMAC: u16 = BADONION | PERM | 5;
#[allow(missing_docs)]
pub const INVALID_ONION_KEY: u16 = BADONION | PERM | 6;
#[allow(missing_docs)]
pub const TEMPORARY_CHANNEL_FAILURE: u16 = UPDATE | 7;
#[allow(missing_docs)]
pub const PERMANENT_CHANNEL_FAILURE: u16 = PERM | 8;
#[allow(missing_docs)]
pub const UNKNOWN_NEXT_PEER: u16 = PERM | 10;
#[allow(missing_docs)]
pub const AMOUNT_BELOW_MINIMUM: u16 = UPDATE | 11;
#[allow(missing_docs)]
pub const FEE_INSUFFICIENT: u16 = UPDATE | 12;
#[allow(missing_docs)]
pub const INCORRECT_CLTV_EXPIRY: u16 = UPDATE | 13;
#[allow(missing_docs)]
pub const EXPIRY_TOO_SOON: u16 = UPDATE | 14;
#[allow(missing_docs)]
pub const INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS: u16 = PERM | 15;
#[allow(missing_docs)]
pub const FINAL_INCORRECT_CLTV_EXPIRY: u16 = 18;
#[allow(missing_docs)]
pub const FINAL_INCORRECT_HTLC_AMOUNT: u16 = 19;
#[allow(missing_docs)]
pub const CHANNEL_DISABLED: u16 = UPDATE | 20;
#[allow(missing_docs)]
pub const EXPIRY_TOO_FAR: u16 = 21;
#[allow(missing_docs)]
pub const INVALID_ONION_PAYLOAD: u16 = PERM | 22;

/// Legacy hop frames are this long, HMAC included
pub const LEGACY_HOP_DATA_SIZE: usize = 65;

/// Failure messages are padded to this length
const FAILURE_PAD_LEN: usize = 256;

/// Largest amount a route may move: 21M BTC
const MAX_VALUE_MSAT: u64 = 21_000_000 * 100_000_000 * 1000;

/// CLTV values at or above this are timestamps, not heights
const LOCKTIME_THRESHOLD: u32 = 500_000_000;

const HMAC_LEN: usize = 32;

// ============ Hop Payloads ============

/// Payment secret and multi-part total handed to the payee
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalPaymentData {
    /// Secret from the invoice
    pub payment_secret: PaymentSecret,
    /// Sum of all parts of the payment
    pub total_msat: u64,
}

/// Encoding of a hop payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HopPayloadFormat {
    /// Fixed 65-byte frame with realm 0
    Legacy,
    /// Length-prefixed TLV stream
    Tlv,
}

/// What one hop learns from the onion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnionHopData {
    /// Wire format of this payload
    pub format: HopPayloadFormat,
    /// Outgoing channel; `None` for a TLV payload at the payee
    pub short_channel_id: Option<u64>,
    /// Amount the next HTLC carries, or the amount delivered
    pub amt_to_forward: u64,
    /// Expiry of the next HTLC, or the final expiry
    pub outgoing_cltv_value: u32,
    /// Only for the payee
    pub payment_data: Option<FinalPaymentData>,
}

impl OnionHopData {
    fn write_payload(&self, w: &mut Writer) {
        match self.format {
            HopPayloadFormat::Legacy => {
                0u8.write(w);
                self.short_channel_id.unwrap_or(0).write(w);
                self.amt_to_forward.write(w);
                self.outgoing_cltv_value.write(w);
                [0u8; 12].write(w);
            }
            HopPayloadFormat::Tlv => {
                let mut tlv = Writer::new();
                write_tlv_truncated(&mut tlv, 2, self.amt_to_forward);
                write_tlv_truncated(&mut tlv, 4, u64::from(self.outgoing_cltv_value));
                if let Some(scid) = self.short_channel_id {
                    BigSize(6).write(&mut tlv);
                    BigSize(8).write(&mut tlv);
                    scid.write(&mut tlv);
                }
                if let Some(data) = &self.payment_data {
                    let mut value = Writer::new();
                    data.payment_secret.write(&mut value);
                    write_truncated(&mut value, data.total_msat);
                    let value = value.into_inner();
                    BigSize(8).write(&mut tlv);
                    BigSize(value.len() as u64).write(&mut tlv);
                    tlv.write_all(&value);
                }
                let tlv = tlv.into_inner();
                BigSize(tlv.len() as u64).write(w);
                w.write_all(&tlv);
            }
        }
    }

    /// Encoded size without the trailing HMAC
    fn payload_len(&self) -> usize {
        let mut w = Writer::new();
        self.write_payload(&mut w);
        w.len()
    }

    /// Decode a payload from the start of `r`, leaving the HMAC unread.
    ///
    /// # Errors
    ///
    /// Fails on a short buffer, unknown realm, unknown even TLV type or a
    /// missing required field.
    pub fn read_payload(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let first = r.read_array::<1>()?[0];
        if first == 0 {
            let short_channel_id = u64::read(r)?;
            let amt_to_forward = u64::read(r)?;
            let outgoing_cltv_value = u32::read(r)?;
            r.read_bytes(12)?;
            return Ok(Self {
                format: HopPayloadFormat::Legacy,
                short_channel_id: Some(short_channel_id),
                amt_to_forward,
                outgoing_cltv_value,
                payment_data: None,
            });
        }

        // The first byte was the start of a BigSize length
        let len = match first {
            0xfd => {
                let len = u64::from(u16::read(r)?);
                if len < 0xfd {
                    return Err(DecodeError::InvalidValue);
                }
                len
            }
            0xfe | 0xff => return Err(DecodeError::BadLengthDescriptor),
            n => u64::from(n),
        };
        let len = usize::try_from(len).map_err(|_| DecodeError::BadLengthDescriptor)?;
        let mut tlv = Reader::new(r.read_bytes(len)?);

        let mut amt_to_forward = None;
        let mut outgoing_cltv_value = None;
        let mut short_channel_id = None;
        let mut payment_data = None;
        let mut last_type = None;
        while tlv.remaining() > 0 {
            let BigSize(typ) = BigSize::read(&mut tlv)?;
            if last_type.is_some_and(|last| typ <= last) {
                return Err(DecodeError::InvalidValue);
            }
            last_type = Some(typ);
            let BigSize(value_len) = BigSize::read(&mut tlv)?;
            let value_len = usize::try_from(value_len).map_err(|_| DecodeError::BadLengthDescriptor)?;
            let value = tlv.read_bytes(value_len)?;
            match typ {
                2 => amt_to_forward = Some(read_truncated(value, 8)?),
                4 => {
                    let cltv = read_truncated(value, 4)?;
                    outgoing_cltv_value = Some(u32::try_from(cltv).map_err(|_| DecodeError::InvalidValue)?);
                }
                6 => {
                    if value.len() != 8 {
                        return Err(DecodeError::BadLengthDescriptor);
                    }
                    short_channel_id = Some(u64::decode(value)?);
                }
                8 => {
                    let mut vr = Reader::new(value);
                    let payment_secret = PaymentSecret::read(&mut vr)?;
                    let total_msat = read_truncated(vr.read_to_end(), 8)?;
                    payment_data = Some(FinalPaymentData {
                        payment_secret,
                        total_msat,
                    });
                }
                t if t % 2 == 0 => return Err(DecodeError::UnknownRequiredFeature),
                _ => {}
            }
        }

        Ok(Self {
            format: HopPayloadFormat::Tlv,
            short_channel_id,
            amt_to_forward: amt_to_forward.ok_or(DecodeError::InvalidValue)?,
            outgoing_cltv_value: outgoing_cltv_value.ok_or(DecodeError::InvalidValue)?,
            payment_data,
        })
    }
}

fn write_tlv_truncated(w: &mut Writer, typ: u64, value: u64) {
    let mut v = Writer::new();
    write_truncated(&mut v, value);
    BigSize(typ).write(w);
    BigSize(v.len() as u64).write(w);
    w.write_all(&v.into_inner());
}

// ============ Key Schedule ============

fn generate_key(label: &[u8], shared_secret: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(label, shared_secret)
}

fn blinding_factor(ephemeral_pubkey: &PublicKey, shared_secret: &[u8; 32]) -> Option<Scalar> {
    Scalar::from_be_bytes(sha256_concat(&[&ephemeral_pubkey.serialize(), shared_secret])).ok()
}

/// Per-hop keys the sender derives for a path
#[derive(Debug, Clone)]
pub struct OnionKeys {
    /// ECDH secret shared with the hop
    pub shared_secret: [u8; 32],
    /// Ephemeral key the hop sees
    pub ephemeral_pubkey: PublicKey,
    rho: [u8; 32],
    mu: [u8; 32],
}

/// Derive the keys for every hop of `path` from `session_priv`.
///
/// # Errors
///
/// [`APIError::RouteError`] if a hop key makes the blinding degenerate.
pub fn construct_onion_keys(path: &[RouteHop], session_priv: &SecretKey) -> Result<Vec<OnionKeys>, APIError> {
    let degenerate = || APIError::RouteError {
        err: "route contains an invalid node key".into(),
    };
    let mut ephemeral_priv = *session_priv;
    let mut keys = Vec::with_capacity(path.len());
    for hop in path {
        let ephemeral_pubkey = PublicKey::from_secret_key(&*SECP, &ephemeral_priv);
        let shared_secret = SharedSecret::new(&hop.pubkey, &ephemeral_priv).secret_bytes();
        let blinding = blinding_factor(&ephemeral_pubkey, &shared_secret).ok_or_else(degenerate)?;
        keys.push(OnionKeys {
            shared_secret,
            ephemeral_pubkey,
            rho: generate_key(b"rho", &shared_secret),
            mu: generate_key(b"mu", &shared_secret),
        });
        ephemeral_priv = ephemeral_priv.mul_tweak(&blinding).map_err(|_| degenerate())?;
    }
    Ok(keys)
}

// ============ Packet Construction ============

/// Hop payloads for `path`, with the amount and expiry of the first HTLC.
///
/// `starting_htlc_offset` is the current block height; every expiry is
/// relative to it.
///
/// # Errors
///
/// [`APIError::RouteError`] when the amounts or expiries overflow.
pub fn build_onion_payloads(
    path: &[RouteHop],
    total_msat: u64,
    payment_secret: Option<PaymentSecret>,
    starting_htlc_offset: u32,
) -> Result<(Vec<OnionHopData>, u64, u32), APIError> {
    let mut cur_value_msat = 0u64;
    let mut cur_cltv = starting_htlc_offset;
    let mut next_short_channel_id = 0u64;
    let mut payloads = Vec::with_capacity(path.len());

    for (idx, hop) in path.iter().rev().enumerate() {
        let payload = if idx == 0 {
            cur_value_msat = hop.fee_msat;
            cur_cltv = starting_htlc_offset.saturating_add(hop.cltv_expiry_delta);
            if payment_secret.is_some() || hop.node_features.supports_variable_length_onion() {
                OnionHopData {
                    format: HopPayloadFormat::Tlv,
                    short_channel_id: None,
                    amt_to_forward: cur_value_msat,
                    outgoing_cltv_value: cur_cltv,
                    payment_data: payment_secret.map(|payment_secret| FinalPaymentData {
                        payment_secret,
                        total_msat,
                    }),
                }
            } else {
                OnionHopData {
                    format: HopPayloadFormat::Legacy,
                    short_channel_id: Some(0),
                    amt_to_forward: cur_value_msat,
                    outgoing_cltv_value: cur_cltv,
                    payment_data: None,
                }
            }
        } else {
            let format = if hop.node_features.supports_variable_length_onion() {
                HopPayloadFormat::Tlv
            } else {
                HopPayloadFormat::Legacy
            };
            let payload = OnionHopData {
                format,
                short_channel_id: Some(next_short_channel_id),
                amt_to_forward: cur_value_msat,
                outgoing_cltv_value: cur_cltv,
                payment_data: None,
            };
            cur_value_msat = cur_value_msat.checked_add(hop.fee_msat).ok_or_else(|| APIError::RouteError {
                err: "route fees overflow".into(),
            })?;
            cur_cltv = cur_cltv.checked_add(hop.cltv_expiry_delta).ok_or_else(|| APIError::RouteError {
                err: "route CLTV overflow".into(),
            })?;
            payload
        };
        if cur_value_msat >= MAX_VALUE_MSAT {
            return Err(APIError::RouteError {
                err: "route amount exceeds the total bitcoin supply".into(),
            });
        }
        if cur_cltv >= LOCKTIME_THRESHOLD {
            return Err(APIError::RouteError {
                err: "route CLTV expiry is too far in the future".into(),
            });
        }
        next_short_channel_id = hop.short_channel_id;
        payloads.push(payload);
    }
    payloads.reverse();
    Ok((payloads, cur_value_msat, cur_cltv))
}

/// Bytes that end up at the tail of the packet after every shift but the
/// last; precomputed so the final hop's HMAC covers them
fn generate_filler(keys: &[OnionKeys], hop_lens: &[usize]) -> Vec<u8> {
    let mut filler = Vec::new();
    let mut pos = 0;
    for (key, len) in keys.iter().zip(hop_lens).take(hop_lens.len().saturating_sub(1)) {
        let stream = keystream(&key.rho, 2 * ONION_HOP_DATA_SIZE);
        let start = ONION_HOP_DATA_SIZE - pos;
        pos += len;
        filler.resize(pos, 0);
        for (byte, k) in filler.iter_mut().zip(&stream[start..]) {
            *byte ^= k;
        }
    }
    filler
}

/// Wrap `payloads` into a packet for the path `keys` was derived from.
///
/// # Errors
///
/// [`APIError::RouteError`] if the payloads do not fit the packet.
pub fn build_onion_packet(
    payloads: &[OnionHopData],
    keys: &[OnionKeys],
    session_priv: &SecretKey,
    payment_hash: &PaymentHash,
) -> Result<OnionPacket, APIError> {
    let hop_lens: Vec<usize> = payloads.iter().map(|p| p.payload_len() + HMAC_LEN).collect();
    if hop_lens.iter().sum::<usize>() > ONION_HOP_DATA_SIZE {
        return Err(APIError::RouteError {
            err: "hop payloads do not fit the onion".into(),
        });
    }
    let (Some(first_keys), true) = (keys.first(), keys.len() == payloads.len()) else {
        return Err(APIError::RouteError {
            err: "route must have at least one hop".into(),
        });
    };

    let filler = generate_filler(keys, &hop_lens);
    let pad_key = generate_key(b"pad", &session_priv.secret_bytes());
    let mut packet = [0u8; ONION_HOP_DATA_SIZE];
    packet.copy_from_slice(&keystream(&pad_key, ONION_HOP_DATA_SIZE));
    let mut hmac = [0u8; HMAC_LEN];

    for (i, (payload, key)) in payloads.iter().zip(keys).enumerate().rev() {
        let shift = hop_lens[i];
        packet.copy_within(0..ONION_HOP_DATA_SIZE - shift, shift);
        let mut w = Writer::new();
        payload.write_payload(&mut w);
        w.write_all(&hmac);
        packet[..shift].copy_from_slice(&w.into_inner());
        apply_keystream(&key.rho, &mut packet);
        if i == payloads.len() - 1 {
            packet[ONION_HOP_DATA_SIZE - filler.len()..].copy_from_slice(&filler);
        }
        hmac = hmac_sha256(&key.mu, &[&packet[..], &payment_hash.0[..]].concat());
    }

    trace!(hops = payloads.len(), "built onion packet");
    Ok(OnionPacket {
        version: 0,
        public_key: first_keys.ephemeral_pubkey.serialize(),
        hop_data: packet,
        hmac,
    })
}

// ============ Packet Processing ============

/// Why an inbound onion could not be processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum OnionDecodeError {
    /// The packet itself is bad; answer with `update_fail_malformed_htlc`
    #[error("malformed onion (failure code {failure_code:#06x})")]
    Malformed {
        /// A BADONION code
        failure_code: u16,
    },
    /// The packet authenticated but our payload is unusable
    #[error("invalid onion payload")]
    InvalidPayload {
        /// Secret to encrypt the failure with
        shared_secret: [u8; 32],
    },
}

/// The result of peeling one layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeeledOnion {
    /// ECDH secret with the sender, for wrapping failures
    pub shared_secret: [u8; 32],
    /// Our instructions
    pub payload: OnionHopData,
    /// Packet for the next hop; `None` when we are the payee
    pub next_packet: Option<OnionPacket>,
}

/// Peel our layer off `packet` with the node key.
///
/// # Errors
///
/// [`OnionDecodeError::Malformed`] for a bad version, key or HMAC;
/// [`OnionDecodeError::InvalidPayload`] if our payload cannot be read.
pub fn peel_onion_packet(
    node_secret: &SecretKey,
    packet: &OnionPacket,
    payment_hash: &PaymentHash,
) -> Result<PeeledOnion, OnionDecodeError> {
    if packet.version != 0 {
        return Err(OnionDecodeError::Malformed {
            failure_code: INVALID_ONION_VERSION,
        });
    }
    let Ok(ephemeral_pubkey) = PublicKey::from_slice(&packet.public_key) else {
        return Err(OnionDecodeError::Malformed {
            failure_code: INVALID_ONION_KEY,
        });
    };
    let shared_secret = SharedSecret::new(&ephemeral_pubkey, node_secret).secret_bytes();
    let mu = generate_key(b"mu", &shared_secret);
    let expected = hmac_sha256(&mu, &[&packet.hop_data[..], &payment_hash.0[..]].concat());
    if expected != packet.hmac {
        return Err(OnionDecodeError::Malformed {
            failure_code: INVALID_ONION_HMAC,
        });
    }

    let rho = generate_key(b"rho", &shared_secret);
    let mut decrypted = Vec::with_capacity(2 * ONION_HOP_DATA_SIZE);
    decrypted.extend_from_slice(&packet.hop_data);
    decrypted.resize(2 * ONION_HOP_DATA_SIZE, 0);
    apply_keystream(&rho, &mut decrypted);

    let invalid = OnionDecodeError::InvalidPayload { shared_secret };
    let mut r = Reader::new(&decrypted);
    let payload = OnionHopData::read_payload(&mut r).map_err(|_| invalid)?;
    let next_hmac: [u8; HMAC_LEN] = r.read_array().map_err(|_| invalid)?;
    let consumed = decrypted.len() - r.remaining();
    if consumed > ONION_HOP_DATA_SIZE {
        return Err(invalid);
    }

    if next_hmac == [0u8; HMAC_LEN] {
        debug!(payment_hash = %payment_hash, "onion terminates at this node");
        return Ok(PeeledOnion {
            shared_secret,
            payload,
            next_packet: None,
        });
    }

    if payload.short_channel_id.is_none() {
        return Err(invalid);
    }
    let mut hop_data = [0u8; ONION_HOP_DATA_SIZE];
    hop_data.copy_from_slice(&decrypted[consumed..consumed + ONION_HOP_DATA_SIZE]);
    let next_pubkey = blinding_factor(&ephemeral_pubkey, &shared_secret)
        .and_then(|blinding| ephemeral_pubkey.mul_tweak(&*SECP, &blinding).ok())
        .ok_or(OnionDecodeError::Malformed {
            failure_code: INVALID_ONION_KEY,
        })?;
    Ok(PeeledOnion {
        shared_secret,
        payload,
        next_packet: Some(OnionPacket {
            version: 0,
            public_key: next_pubkey.serialize(),
            hop_data,
            hmac: next_hmac,
        }),
    })
}

// ============ Failure Onions ============

/// The failure message at the node that failed the HTLC, before the first
/// layer of obfuscation
#[must_use]
pub fn build_failure_packet(shared_secret: &[u8; 32], failure_code: u16, data: &[u8]) -> Vec<u8> {
    let mut failure = Writer::new();
    failure_code.write(&mut failure);
    failure.write_all(data);
    let failure = failure.into_inner();
    let pad = vec![0u8; FAILURE_PAD_LEN.saturating_sub(failure.len())];

    let mut body = Writer::new();
    failure.write(&mut body);
    pad.write(&mut body);
    let body = body.into_inner();

    let um = generate_key(b"um", shared_secret);
    let mut packet = hmac_sha256(&um, &body).to_vec();
    packet.extend_from_slice(&body);
    packet
}

/// Add (or, at the origin, remove) one hop's obfuscation layer
pub fn crypt_failure_packet(shared_secret: &[u8; 32], packet: &mut [u8]) {
    let ammag = generate_key(b"ammag", shared_secret);
    apply_keystream(&ammag, packet);
}

/// Build and obfuscate a failure in one step
#[must_use]
pub fn build_first_hop_failure_packet(shared_secret: &[u8; 32], failure_code: u16, data: &[u8]) -> Vec<u8> {
    let mut packet = build_failure_packet(shared_secret, failure_code, data);
    crypt_failure_packet(shared_secret, &mut packet);
    packet
}

/// A failure attributed to a hop of our path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedOnionFailure {
    /// Index into the path of the node that produced it
    pub hop_index: usize,
    /// BOLT-4 failure code
    pub failure_code: u16,
    /// Code-specific data
    pub data: Vec<u8>,
}

/// Peel the failure onion layer by layer until one hop's HMAC verifies.
/// Returns `None` if no hop produced it.
#[must_use]
pub fn decode_onion_failure(
    path: &[RouteHop],
    session_priv: &SecretKey,
    packet: &[u8],
) -> Option<DecodedOnionFailure> {
    let keys = construct_onion_keys(path, session_priv).ok()?;
    let mut packet = packet.to_vec();
    for (hop_index, key) in keys.iter().enumerate() {
        crypt_failure_packet(&key.shared_secret, &mut packet);
        if packet.len() < HMAC_LEN {
            return None;
        }
        let um = generate_key(b"um", &key.shared_secret);
        if hmac_sha256(&um, &packet[HMAC_LEN..])[..] != packet[..HMAC_LEN] {
            continue;
        }
        let failure = Vec::<u8>::decode(&packet[HMAC_LEN..]).ok()?;
        let mut r = Reader::new(&failure);
        let failure_code = u16::read(&mut r).ok()?;
        return Some(DecodedOnionFailure {
            hop_index,
            failure_code,
            data: r.read_to_end().to_vec(),
        });
    }
    None
}

/// Bytes preceding the embedded `channel_update` in a failure's data
fn update_offset(failure_code: u16) -> usize {
    match failure_code {
        AMOUNT_BELOW_MINIMUM | FEE_INSUFFICIENT => 8,
        INCORRECT_CLTV_EXPIRY => 4,
        _ => 0,
    }
}

/// What a payment failure means for the payment and the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInterpretation {
    /// The payee rejected it; retrying is pointless
    pub rejected_by_dest: bool,
    /// What to tell the router
    pub network_update: Option<HTLCFailChannelUpdate>,
}

/// Decode a failure onion for one of our payments and decide what it means
#[must_use]
pub fn process_onion_failure(path: &[RouteHop], session_priv: &SecretKey, packet: &[u8]) -> FailureInterpretation {
    let Some(failure) = decode_onion_failure(path, session_priv, packet) else {
        debug!("could not attribute onion failure to any hop");
        return FailureInterpretation {
            rejected_by_dest: false,
            network_update: None,
        };
    };
    interpret_failure(path, &failure)
}

/// Map a decoded failure onto the payment outcome and graph update
#[must_use]
pub fn interpret_failure(path: &[RouteHop], failure: &DecodedOnionFailure) -> FailureInterpretation {
    let is_from_final_node = failure.hop_index + 1 == path.len();
    let code = failure.failure_code;
    debug!(hop = failure.hop_index, failure_code = code, is_from_final_node, "payment failed at hop");
    let Some(hop) = path.get(failure.hop_index) else {
        return FailureInterpretation {
            rejected_by_dest: false,
            network_update: None,
        };
    };
    let is_permanent = code & PERM != 0;

    let network_update = if code & NODE != 0 {
        Some(HTLCFailChannelUpdate::NodeFailure {
            node_id: hop.pubkey,
            is_permanent,
        })
    } else if is_from_final_node {
        None
    } else if code & UPDATE != 0 {
        let update = failure
            .data
            .get(update_offset(code)..)
            .and_then(|data| Vec::<u8>::decode(data).ok())
            .and_then(|bytes| ChannelUpdate::decode(&bytes).ok());
        Some(match update {
            Some(msg) => HTLCFailChannelUpdate::ChannelUpdateMessage { msg },
            None => HTLCFailChannelUpdate::NodeFailure {
                node_id: hop.pubkey,
                is_permanent: true,
            },
        })
    } else {
        path.get(failure.hop_index + 1).map(|next| HTLCFailChannelUpdate::ChannelClosed {
            short_channel_id: next.short_channel_id,
            is_permanent,
        })
    };

    FailureInterpretation {
        rejected_by_dest: is_from_final_node,
        network_update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{ChannelFeatures, NodeFeatures};

    fn node_secret(byte: u8) -> SecretKey {
        SecretKey::from_slice(&[byte; 32]).unwrap()
    }

    fn path(var_onion: &[bool]) -> Vec<RouteHop> {
        var_onion
            .iter()
            .enumerate()
            .map(|(i, &tlv)| {
                let byte = u8::try_from(i).unwrap() + 0x41;
                let mut node_features = NodeFeatures::empty();
                if tlv {
                    node_features.set(crate::features::VAR_ONION_OPTIN_OPTIONAL);
                }
                RouteHop {
                    pubkey: PublicKey::from_secret_key(&*SECP, &node_secret(byte)),
                    node_features,
                    short_channel_id: 100 + i as u64,
                    channel_features: ChannelFeatures::empty(),
                    fee_msat: if i + 1 == var_onion.len() { 50_000 } else { 1_000 },
                    cltv_expiry_delta: 40,
                }
            })
            .collect()
    }

    fn session() -> SecretKey {
        node_secret(0x33)
    }

    #[test]
    fn test_payload_amounts_and_expiries() {
        let path = path(&[false, false, false]);
        let (payloads, first_amt, first_cltv) = build_onion_payloads(&path, 50_000, None, 100).unwrap();
        assert_eq!(first_amt, 52_000);
        assert_eq!(first_cltv, 220);
        assert_eq!(payloads[0].amt_to_forward, 51_000);
        assert_eq!(payloads[0].outgoing_cltv_value, 180);
        assert_eq!(payloads[0].short_channel_id, Some(101));
        assert_eq!(payloads[1].short_channel_id, Some(102));
        assert_eq!(payloads[2].amt_to_forward, 50_000);
        assert_eq!(payloads[2].outgoing_cltv_value, 140);
        assert_eq!(payloads[2].format, HopPayloadFormat::Legacy);
    }

    #[test]
    fn test_payment_secret_forces_tlv_final_hop() {
        let path = path(&[false, false]);
        let secret = PaymentSecret([9; 32]);
        let (payloads, _, _) = build_onion_payloads(&path, 70_000, Some(secret), 0).unwrap();
        assert_eq!(payloads[0].format, HopPayloadFormat::Legacy);
        assert_eq!(payloads[1].format, HopPayloadFormat::Tlv);
        assert_eq!(
            payloads[1].payment_data,
            Some(FinalPaymentData {
                payment_secret: secret,
                total_msat: 70_000
            })
        );
    }

    #[test]
    fn test_cltv_overflow_rejected() {
        let mut path = path(&[false, false]);
        path[0].cltv_expiry_delta = u32::MAX;
        assert!(matches!(
            build_onion_payloads(&path, 1, None, 10),
            Err(APIError::RouteError { .. })
        ));
    }

    #[test]
    fn test_peel_hop_by_hop() {
        let path = path(&[true, false, true]);
        let hash = PaymentHash([7; 32]);
        let secret = PaymentSecret([5; 32]);
        let keys = construct_onion_keys(&path, &session()).unwrap();
        let (payloads, _, _) = build_onion_payloads(&path, 50_000, Some(secret), 500).unwrap();
        let mut packet = build_onion_packet(&payloads, &keys, &session(), &hash).unwrap();

        for (i, expected) in payloads.iter().enumerate() {
            let peeled = peel_onion_packet(&node_secret(0x41 + i as u8), &packet, &hash).unwrap();
            assert_eq!(&peeled.payload, expected);
            assert_eq!(peeled.shared_secret, keys[i].shared_secret);
            match peeled.next_packet {
                Some(next) => {
                    assert!(i + 1 < payloads.len());
                    packet = next;
                }
                None => assert_eq!(i + 1, payloads.len()),
            }
        }
    }

    #[test]
    fn test_tampered_onion_is_malformed() {
        let path = path(&[false, false]);
        let hash = PaymentHash([7; 32]);
        let keys = construct_onion_keys(&path, &session()).unwrap();
        let (payloads, _, _) = build_onion_payloads(&path, 1_000, None, 0).unwrap();
        let mut packet = build_onion_packet(&payloads, &keys, &session(), &hash).unwrap();

        let wrong_hash = peel_onion_packet(&node_secret(0x41), &packet, &PaymentHash([8; 32]));
        assert_eq!(
            wrong_hash,
            Err(OnionDecodeError::Malformed {
                failure_code: INVALID_ONION_HMAC
            })
        );

        packet.version = 1;
        assert_eq!(
            peel_onion_packet(&node_secret(0x41), &packet, &hash),
            Err(OnionDecodeError::Malformed {
                failure_code: INVALID_ONION_VERSION
            })
        );
    }

    #[test]
    fn test_failure_attributed_to_origin_hop() {
        let path = path(&[false, false, false]);
        let keys = construct_onion_keys(&path, &session()).unwrap();

        // Hop 1 fails; hop 0 wraps it on the way back
        let mut packet = build_first_hop_failure_packet(&keys[1].shared_secret, PERMANENT_CHANNEL_FAILURE, &[]);
        crypt_failure_packet(&keys[0].shared_secret, &mut packet);

        let decoded = decode_onion_failure(&path, &session(), &packet).unwrap();
        assert_eq!(decoded.hop_index, 1);
        assert_eq!(decoded.failure_code, PERMANENT_CHANNEL_FAILURE);

        let outcome = interpret_failure(&path, &decoded);
        assert!(!outcome.rejected_by_dest);
        assert_eq!(
            outcome.network_update,
            Some(HTLCFailChannelUpdate::ChannelClosed {
                short_channel_id: 102,
                is_permanent: true
            })
        );
    }

    #[test]
    fn test_final_node_rejection() {
        let path = path(&[false, false]);
        let keys = construct_onion_keys(&path, &session()).unwrap();
        let mut packet =
            build_first_hop_failure_packet(&keys[1].shared_secret, INCORRECT_OR_UNKNOWN_PAYMENT_DETAILS, &[0; 8]);
        crypt_failure_packet(&keys[0].shared_secret, &mut packet);

        let outcome = process_onion_failure(&path, &session(), &packet);
        assert!(outcome.rejected_by_dest);
        assert_eq!(outcome.network_update, None);
    }

    #[test]
    fn test_garbage_failure_unattributed() {
        let path = path(&[false, false]);
        assert_eq!(decode_onion_failure(&path, &session(), &[0xab; 292]), None);
    }

    #[test]
    fn test_unknown_even_tlv_rejected() {
        // length 3: type 10, len 1, value 0
        let bytes = [3u8, 10, 1, 0];
        assert_eq!(
            OnionHopData::read_payload(&mut Reader::new(&bytes)),
            Err(DecodeError::UnknownRequiredFeature)
        );
        // odd types are skipped, but amount and expiry stay required
        let bytes = [3u8, 11, 1, 0];
        assert_eq!(
            OnionHopData::read_payload(&mut Reader::new(&bytes)),
            Err(DecodeError::InvalidValue)
        );
    }
}
