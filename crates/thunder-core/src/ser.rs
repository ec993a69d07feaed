//! Big-endian wire serialization.
//!
//! Every wire message is a fixed sequence of fields; [`impl_writeable!`]
//! derives both directions from the field list so the read and write
//! orders cannot drift apart.

use crate::error::DecodeError;
use crate::types::{ChannelId, PaymentHash, PaymentPreimage, PaymentSecret};
use bitcoin::blockdata::constants::ChainHash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::secp256k1::ecdsa::Signature;

/// Growable output buffer
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes
    pub fn write_all(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes written so far
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an input buffer
#[derive(Debug)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Start reading at the beginning of `buf`
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consume exactly `len` bytes
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShortRead`] if fewer bytes remain.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::ShortRead);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Consume a fixed-size array
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::ShortRead`] if fewer bytes remain.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Consume everything left
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// A type with a wire encoding
pub trait Writeable {
    /// Append the encoding to `w`
    fn write(&self, w: &mut Writer);

    /// Encode into a fresh buffer
    fn encode(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.write(&mut w);
        w.into_inner()
    }
}

/// A type decodable from the wire
pub trait Readable: Sized {
    /// Decode from `r`
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on short or invalid input.
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode from a complete buffer, ignoring trailing bytes
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on short or invalid input.
    fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        Self::read(&mut Reader::new(buf))
    }
}

macro_rules! impl_int {
    ($($ty:ty),*) => {
        $(
            impl Writeable for $ty {
                fn write(&self, w: &mut Writer) {
                    w.write_all(&self.to_be_bytes());
                }
            }

            impl Readable for $ty {
                fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    Ok(<$ty>::from_be_bytes(r.read_array()?))
                }
            }
        )*
    };
}

impl_int!(u8, u16, u32, u64);

impl<const N: usize> Writeable for [u8; N] {
    fn write(&self, w: &mut Writer) {
        w.write_all(self);
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        r.read_array()
    }
}

/// Variable-length byte strings carry a u16 length prefix
impl Writeable for Vec<u8> {
    fn write(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        (self.len() as u16).write(w);
        w.write_all(self);
    }
}

impl Readable for Vec<u8> {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = u16::read(r)? as usize;
        Ok(r.read_bytes(len)?.to_vec())
    }
}

impl Writeable for PublicKey {
    fn write(&self, w: &mut Writer) {
        w.write_all(&self.serialize());
    }
}

impl Readable for PublicKey {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let bytes: [u8; 33] = r.read_array()?;
        PublicKey::from_slice(&bytes).map_err(|_| DecodeError::InvalidValue)
    }
}

impl Writeable for Signature {
    fn write(&self, w: &mut Writer) {
        w.write_all(&self.serialize_compact());
    }
}

impl Readable for Signature {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let bytes: [u8; 64] = r.read_array()?;
        Signature::from_compact(&bytes).map_err(|_| DecodeError::InvalidValue)
    }
}

impl Writeable for Vec<Signature> {
    fn write(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        (self.len() as u16).write(w);
        for sig in self {
            sig.write(w);
        }
    }
}

impl Readable for Vec<Signature> {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = u16::read(r)? as usize;
        if r.remaining() < count * 64 {
            return Err(DecodeError::ShortRead);
        }
        (0..count).map(|_| Signature::read(r)).collect()
    }
}

impl Writeable for ChainHash {
    fn write(&self, w: &mut Writer) {
        w.write_all(self.as_bytes());
    }
}

impl Readable for ChainHash {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(ChainHash::from(r.read_array::<32>()?))
    }
}

/// Variable-length integer used for TLV types and lengths.
///
/// Encodings must be minimal; a value that fits a shorter form is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BigSize(pub u64);

impl Writeable for BigSize {
    fn write(&self, w: &mut Writer) {
        #[allow(clippy::cast_possible_truncation)]
        match self.0 {
            0..=0xfc => (self.0 as u8).write(w),
            0xfd..=0xffff => {
                0xfdu8.write(w);
                (self.0 as u16).write(w);
            }
            0x1_0000..=0xffff_ffff => {
                0xfeu8.write(w);
                (self.0 as u32).write(w);
            }
            _ => {
                0xffu8.write(w);
                self.0.write(w);
            }
        }
    }
}

impl Readable for BigSize {
    fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let (value, min) = match u8::read(r)? {
            0xff => (u64::read(r)?, 0x1_0000_0000),
            0xfe => (u64::from(u32::read(r)?), 0x1_0000),
            0xfd => (u64::from(u16::read(r)?), 0xfd),
            n => return Ok(Self(u64::from(n))),
        };
        if value < min {
            return Err(DecodeError::InvalidValue);
        }
        Ok(Self(value))
    }
}

/// Write `value` big-endian with leading zero bytes stripped
pub fn write_truncated(w: &mut Writer, value: u64) {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    w.write_all(&bytes[skip..]);
}

/// Read a truncated integer occupying all of `bytes`.
///
/// # Errors
///
/// [`DecodeError::InvalidValue`] for a non-minimal encoding,
/// [`DecodeError::BadLengthDescriptor`] if it does not fit `max_len` bytes.
pub fn read_truncated(bytes: &[u8], max_len: usize) -> Result<u64, DecodeError> {
    if bytes.len() > max_len {
        return Err(DecodeError::BadLengthDescriptor);
    }
    if bytes.first() == Some(&0) {
        return Err(DecodeError::InvalidValue);
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

macro_rules! impl_bytes_newtype {
    ($($ty:ident),*) => {
        $(
            impl Writeable for $ty {
                fn write(&self, w: &mut Writer) {
                    w.write_all(&self.0);
                }
            }

            impl Readable for $ty {
                fn read(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    Ok($ty(r.read_array()?))
                }
            }
        )*
    };
}

impl_bytes_newtype!(ChannelId, PaymentHash, PaymentPreimage, PaymentSecret);

/// Derive [`Writeable`] and [`Readable`] for a struct from its field list.
#[macro_export]
macro_rules! impl_writeable {
    ($ty:ident, { $($field:ident),* $(,)? }) => {
        impl $crate::ser::Writeable for $ty {
            fn write(&self, w: &mut $crate::ser::Writer) {
                $( $crate::ser::Writeable::write(&self.$field, w); )*
            }
        }

        impl $crate::ser::Readable for $ty {
            fn read(
                r: &mut $crate::ser::Reader<'_>,
            ) -> Result<Self, $crate::error::DecodeError> {
                Ok(Self {
                    $( $field: $crate::ser::Readable::read(r)?, )*
                })
            }
        }
    };
}
