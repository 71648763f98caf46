use bitflags::bitflags;

/// Wire opcode. Values are fixed by the remote server and must never be
/// renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    ChannelSetup = 1,
    ChannelSetupAck = 2,
    Status = 5,
    Ping = 10,
    Socks = 150,
    SocksClose = 151,
    SocksDisconnected = 152,
    UninstallSelf = 240,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::ChannelSetup,
            2 => Self::ChannelSetupAck,
            5 => Self::Status,
            10 => Self::Ping,
            150 => Self::Socks,
            151 => Self::SocksClose,
            152 => Self::SocksDisconnected,
            240 => Self::UninstallSelf,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ChannelSetup => "CHANNEL_SETUP",
            Self::ChannelSetupAck => "CHANNEL_SETUP_ACK",
            Self::Status => "STATUS",
            Self::Ping => "PING",
            Self::Socks => "SOCKS",
            Self::SocksClose => "SOCKS_CLOSE",
            Self::SocksDisconnected => "SOCKS_DISCONNECTED",
            Self::UninstallSelf => "UNINSTALL_SELF",
        }
    }
}

bitflags! {
    /// Channel-setup bitfield. The handshake only ever sends `READ` or
    /// `WRITE` individually, one per pipe; `DUPLEX` exists on the wire
    /// format but this client never has occasion to set both bits at once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelSetupFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const DUPLEX = Self::READ.bits() | Self::WRITE.bits();
    }
}

/// `STATUS` payload value. `Unknown` preserves an out-of-range byte instead
/// of failing decode, matching the original's "log and keep going" behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Unsupported,
    Unknown(u8),
}

impl Status {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ok,
            1 => Self::Unsupported,
            other => Self::Unknown(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Unsupported => 1,
            Self::Unknown(value) => value,
        }
    }
}
