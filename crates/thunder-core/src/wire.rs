//! Type-prefixed message framing.
//!
//! ```text
//! +-----------+------------------------------+
//! | type (2B) | body (Writeable of a msgs::*) |
//! +-----------+------------------------------+
//! ```
//!
//! Unknown odd types are surfaced as [`Message::Unknown`] so the caller
//! can ignore them; unknown even types are a decoding error.

use crate::error::DecodeError;
use crate::msgs;
use crate::ser::{Readable, Reader, Writeable, Writer};

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
    Init(msgs::Init),
    Error(msgs::ErrorMessage),
    Ping(msgs::Ping),
    Pong(msgs::Pong),
    OpenChannel(msgs::OpenChannel),
    AcceptChannel(msgs::AcceptChannel),
    FundingCreated(msgs::FundingCreated),
    FundingSigned(msgs::FundingSigned),
    FundingLocked(msgs::FundingLocked),
    Shutdown(msgs::Shutdown),
    ClosingSigned(msgs::ClosingSigned),
    UpdateAddHTLC(msgs::UpdateAddHTLC),
    UpdateFulfillHTLC(msgs::UpdateFulfillHTLC),
    UpdateFailHTLC(msgs::UpdateFailHTLC),
    CommitmentSigned(msgs::CommitmentSigned),
    RevokeAndACK(msgs::RevokeAndACK),
    UpdateFee(msgs::UpdateFee),
    UpdateFailMalformedHTLC(msgs::UpdateFailMalformedHTLC),
    ChannelReestablish(msgs::ChannelReestablish),
    AnnouncementSignatures(msgs::AnnouncementSignatures),
    ChannelAnnouncement(msgs::ChannelAnnouncement),
    NodeAnnouncement(msgs::NodeAnnouncement),
    ChannelUpdate(msgs::ChannelUpdate),
    QueryChannelRange(msgs::QueryChannelRange),
    ReplyChannelRange(msgs::ReplyChannelRange),
    /// A message type we don't understand, which was odd and so may be ignored
    Unknown(u16),
}

macro_rules! message_types {
    ($($variant:ident = $id:literal),* $(,)?) => {
        /// Wire type ids
        #[allow(missing_docs)]
        pub mod types {
            $(
                #[allow(non_upper_case_globals)]
                pub const $variant: u16 = $id;
            )*
        }

        impl Message {
            /// The wire type id of this message
            #[must_use]
            pub fn type_id(&self) -> u16 {
                match self {
                    $( Self::$variant(_) => $id, )*
                    Self::Unknown(t) => *t,
                }
            }

            fn write_body(&self, w: &mut Writer) {
                match self {
                    $( Self::$variant(msg) => msg.write(w), )*
                    Self::Unknown(_) => {}
                }
            }

            fn read_body(type_id: u16, r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                match type_id {
                    $( $id => Ok(Self::$variant(Readable::read(r)?)), )*
                    t if t % 2 == 1 => Ok(Self::Unknown(t)),
                    _ => Err(DecodeError::UnknownRequiredFeature),
                }
            }
        }
    };
}

message_types! {
    Error = 17,
    Init = 16,
    Ping = 18,
    Pong = 19,
    OpenChannel = 32,
    AcceptChannel = 33,
    FundingCreated = 34,
    FundingSigned = 35,
    FundingLocked = 36,
    Shutdown = 38,
    ClosingSigned = 39,
    UpdateAddHTLC = 128,
    UpdateFulfillHTLC = 130,
    UpdateFailHTLC = 131,
    CommitmentSigned = 132,
    RevokeAndACK = 133,
    UpdateFee = 134,
    UpdateFailMalformedHTLC = 135,
    ChannelReestablish = 136,
    ChannelAnnouncement = 256,
    NodeAnnouncement = 257,
    ChannelUpdate = 258,
    AnnouncementSignatures = 259,
    QueryChannelRange = 263,
    ReplyChannelRange = 264,
}

impl Message {
    /// True for messages relayed as gossip
    #[must_use]
    pub fn is_gossip(&self) -> bool {
        matches!(
            self,
            Self::ChannelAnnouncement(_) | Self::NodeAnnouncement(_) | Self::ChannelUpdate(_)
        )
    }
}

/// Encode a message with its type prefix
#[must_use]
pub fn write(msg: &Message) -> Vec<u8> {
    let mut w = Writer::new();
    msg.type_id().write(&mut w);
    msg.write_body(&mut w);
    w.into_inner()
}

/// Encode a bare message struct with the given type prefix
pub fn encode_msg<M: Writeable>(type_id: u16, msg: &M) -> Vec<u8> {
    let mut w = Writer::new();
    type_id.write(&mut w);
    msg.write(&mut w);
    w.into_inner()
}

/// Decode a type-prefixed message
///
/// # Errors
///
/// Returns [`DecodeError::UnknownRequiredFeature`] for unknown even types,
/// or the body's decoding error.
pub fn read(buf: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader::new(buf);
    let type_id = u16::read(&mut r)?;
    Message::read_body(type_id, &mut r)
}
