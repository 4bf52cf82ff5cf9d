//! Command tags of packets exchanged with the access point.

use std::fmt;

use crate::error::Error;

/// Known access point command tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketType {
    SecretBlock = 0x02,
    Ping = 0x04,
    StreamChunk = 0x08,
    StreamChunkRes = 0x09,
    ChannelError = 0x0a,
    ChannelAbort = 0x0b,
    RequestKey = 0x0c,
    AesKey = 0x0d,
    AesKeyError = 0x0e,
    Unknown0x0f = 0x0f,
    Unknown0x10 = 0x10,
    Image = 0x19,
    CountryCode = 0x1b,
    UnknownDataAllZeros = 0x1f,
    Pong = 0x49,
    PongAck = 0x4a,
    Pause = 0x4b,
    Unknown0x4f = 0x4f,
    ProductInfo = 0x50,
    LegacyWelcome = 0x69,
    PreferredLocale = 0x74,
    LicenseVersion = 0x76,
    TrackEndedTime = 0x82,
    Login = 0xab,
    APWelcome = 0xac,
    AuthFailure = 0xad,
    MercuryReq = 0xb2,
    MercurySub = 0xb3,
    MercuryUnsub = 0xb4,
    MercuryEvent = 0xb5,
    Unknown0xb6 = 0xb6,
}

impl PacketType {
    /// Whether packets with this tag belong to the Mercury multiplexer.
    #[must_use]
    pub fn is_mercury(self) -> bool {
        matches!(
            self,
            Self::MercuryReq | Self::MercurySub | Self::MercuryUnsub | Self::MercuryEvent
        )
    }
}

impl From<PacketType> for u8 {
    fn from(packet_type: PacketType) -> Self {
        packet_type as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let packet_type = match value {
            0x02 => Self::SecretBlock,
            0x04 => Self::Ping,
            0x08 => Self::StreamChunk,
            0x09 => Self::StreamChunkRes,
            0x0a => Self::ChannelError,
            0x0b => Self::ChannelAbort,
            0x0c => Self::RequestKey,
            0x0d => Self::AesKey,
            0x0e => Self::AesKeyError,
            0x0f => Self::Unknown0x0f,
            0x10 => Self::Unknown0x10,
            0x19 => Self::Image,
            0x1b => Self::CountryCode,
            0x1f => Self::UnknownDataAllZeros,
            0x49 => Self::Pong,
            0x4a => Self::PongAck,
            0x4b => Self::Pause,
            0x4f => Self::Unknown0x4f,
            0x50 => Self::ProductInfo,
            0x69 => Self::LegacyWelcome,
            0x74 => Self::PreferredLocale,
            0x76 => Self::LicenseVersion,
            0x82 => Self::TrackEndedTime,
            0xab => Self::Login,
            0xac => Self::APWelcome,
            0xad => Self::AuthFailure,
            0xb2 => Self::MercuryReq,
            0xb3 => Self::MercurySub,
            0xb4 => Self::MercuryUnsub,
            0xb5 => Self::MercuryEvent,
            0xb6 => Self::Unknown0xb6,
            other => {
                return Err(Error::data_loss(format!(
                    "unknown packet type {other:#04x}"
                )))
            }
        };
        Ok(packet_type)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({:#04x})", u8::from(*self))
    }
}
