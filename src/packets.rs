use thiserror::Error;

/// Every client message is exactly this many bytes on the wire: a one byte
/// tag followed by two big-endian `i32` arguments.
pub const FRAME_LENGTH: usize = 9;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("Frame ended after {0} bytes")]
    ShortFrame(usize),
    #[error("Unknown message type {0:#04x}")]
    UnknownMessageType(u8),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClientPacket {
    Insert { timestamp: i32, price: i32 },
    Query { min_time: i32, max_time: i32 },
}

#[derive(Debug)]
pub enum ServerPacket {
    QueryResponse { mean_price: i32 },
}

impl ClientPacket {
    pub fn parse(frame: &[u8]) -> Result<ClientPacket, PacketError> {
        if frame.len() < FRAME_LENGTH {
            return Err(PacketError::ShortFrame(frame.len()));
        }

        let arg1 = i32::from_be_bytes(frame[1..5].try_into().unwrap());
        let arg2 = i32::from_be_bytes(frame[5..9].try_into().unwrap());

        match frame[0] {
            b'I' => Ok(ClientPacket::Insert {
                timestamp: arg1,
                price: arg2,
            }),
            b'Q' => Ok(ClientPacket::Query {
                min_time: arg1,
                max_time: arg2,
            }),
            other => Err(PacketError::UnknownMessageType(other)),
        }
    }
}

impl ServerPacket {
    pub fn to_bytes(&self) -> [u8; 4] {
        match self {
            ServerPacket::QueryResponse { mean_price } => mean_price.to_be_bytes(),
        }
    }
}
