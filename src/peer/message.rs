use std::fmt;
use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};

use crate::bitfield::Bitfield;
use crate::buffers::Buffer;

/// BEP 3/6/10 message set. Handshakes are negotiated before a
/// connection reaches this layer and never appear here.
#[derive(Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    Uninterested,
    Have(u32),
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, length: u32, data: Buffer },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    AllowedFast(u32),
    Extension { id: u8, payload: Vec<u8> },
}

pub mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const UNINTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 13;
    pub const HAVE_ALL: u8 = 14;
    pub const HAVE_NONE: u8 = 15;
    pub const REJECT: u8 = 16;
    pub const ALLOWED_FAST: u8 = 17;
    pub const EXTENSION: u8 = 20;
}

impl Message {
    pub fn request(index: u32, begin: u32, length: u32) -> Message {
        Message::Request {
            index,
            begin,
            length,
        }
    }

    pub fn reject(index: u32, begin: u32, length: u32) -> Message {
        Message::Reject {
            index,
            begin,
            length,
        }
    }

    pub fn piece(index: u32, begin: u32, length: u32, data: Buffer) -> Message {
        Message::Piece {
            index,
            begin,
            length,
            data,
        }
    }

    pub fn is_piece(&self) -> bool {
        match *self {
            Message::Piece { .. } => true,
            _ => false,
        }
    }

    /// Messages whose encoding doesn't fit the fixed 17 byte scratch
    /// buffer and needs a heap allocation.
    pub fn is_variable(&self) -> bool {
        match *self {
            Message::Bitfield(_) | Message::Extension { .. } => true,
            _ => false,
        }
    }

    /// Total encoded length, including the length prefix.
    pub fn len(&self) -> usize {
        match *self {
            Message::KeepAlive => 4,
            Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::Uninterested
            | Message::HaveAll
            | Message::HaveNone => 5,
            Message::Have(_) | Message::Suggest(_) | Message::AllowedFast(_) => 9,
            Message::Bitfield(ref pf) => 5 + pf.bytes(),
            Message::Request { .. } | Message::Cancel { .. } | Message::Reject { .. } => 17,
            Message::Piece { length, .. } => 13 + length as usize,
            Message::Port(_) => 7,
            Message::Extension { ref payload, .. } => 6 + payload.len(),
        }
    }

    pub fn encode(&self, mut buf: &mut [u8]) -> io::Result<()> {
        match *self {
            Message::KeepAlive => {
                buf.write_u32::<BigEndian>(0)?;
            }
            Message::Choke => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::CHOKE)?;
            }
            Message::Unchoke => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::UNCHOKE)?;
            }
            Message::Interested => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::INTERESTED)?;
            }
            Message::Uninterested => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::UNINTERESTED)?;
            }
            Message::HaveAll => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::HAVE_ALL)?;
            }
            Message::HaveNone => {
                buf.write_u32::<BigEndian>(1)?;
                buf.write_u8(id::HAVE_NONE)?;
            }
            Message::Have(piece) => {
                buf.write_u32::<BigEndian>(5)?;
                buf.write_u8(id::HAVE)?;
                buf.write_u32::<BigEndian>(piece)?;
            }
            Message::Suggest(piece) => {
                buf.write_u32::<BigEndian>(5)?;
                buf.write_u8(id::SUGGEST)?;
                buf.write_u32::<BigEndian>(piece)?;
            }
            Message::AllowedFast(piece) => {
                buf.write_u32::<BigEndian>(5)?;
                buf.write_u8(id::ALLOWED_FAST)?;
                buf.write_u32::<BigEndian>(piece)?;
            }
            Message::Bitfield(ref pf) => {
                buf.write_u32::<BigEndian>(1 + pf.bytes() as u32)?;
                buf.write_u8(id::BITFIELD)?;
                for i in 0..pf.bytes() {
                    buf.write_u8(pf.byte_at(i))?;
                }
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                buf.write_u32::<BigEndian>(13)?;
                buf.write_u8(id::REQUEST)?;
                buf.write_u32::<BigEndian>(index)?;
                buf.write_u32::<BigEndian>(begin)?;
                buf.write_u32::<BigEndian>(length)?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.write_u32::<BigEndian>(13)?;
                buf.write_u8(id::CANCEL)?;
                buf.write_u32::<BigEndian>(index)?;
                buf.write_u32::<BigEndian>(begin)?;
                buf.write_u32::<BigEndian>(length)?;
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                buf.write_u32::<BigEndian>(13)?;
                buf.write_u8(id::REJECT)?;
                buf.write_u32::<BigEndian>(index)?;
                buf.write_u32::<BigEndian>(begin)?;
                buf.write_u32::<BigEndian>(length)?;
            }
            Message::Piece {
                index,
                begin,
                length,
                ..
            } => {
                buf.write_u32::<BigEndian>(9 + length)?;
                buf.write_u8(id::PIECE)?;
                buf.write_u32::<BigEndian>(index)?;
                buf.write_u32::<BigEndian>(begin)?;
            }
            Message::Port(port) => {
                buf.write_u32::<BigEndian>(3)?;
                buf.write_u8(id::PORT)?;
                buf.write_u16::<BigEndian>(port)?;
            }
            Message::Extension { id: eid, ref payload } => {
                buf.write_u32::<BigEndian>(2 + payload.len() as u32)?;
                buf.write_u8(id::EXTENSION)?;
                buf.write_u8(eid)?;
                buf.write_all(payload)?;
            }
        };
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Message::KeepAlive => write!(f, "Message::KeepAlive"),
            Message::Choke => write!(f, "Message::Choke"),
            Message::Unchoke => write!(f, "Message::Unchoke"),
            Message::Interested => write!(f, "Message::Interested"),
            Message::Uninterested => write!(f, "Message::Uninterested"),
            Message::Have(p) => write!(f, "Message::Have({})", p),
            Message::Bitfield(_) => write!(f, "Message::Bitfield"),
            Message::Request {
                index,
                begin,
                length,
            } => write!(
                f,
                "Message::Request {{ idx: {}, begin: {}, len: {} }}",
                index, begin, length
            ),
            Message::Piece { index, begin, .. } => {
                write!(f, "Message::Piece {{ idx: {}, begin: {} }}", index, begin)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => write!(
                f,
                "Message::Cancel {{ idx: {}, begin: {}, len: {} }}",
                index, begin, length
            ),
            Message::Port(p) => write!(f, "Message::Port({})", p),
            Message::Suggest(p) => write!(f, "Message::Suggest({})", p),
            Message::HaveAll => write!(f, "Message::HaveAll"),
            Message::HaveNone => write!(f, "Message::HaveNone"),
            Message::Reject {
                index,
                begin,
                length,
            } => write!(
                f,
                "Message::Reject {{ idx: {}, begin: {}, len: {} }}",
                index, begin, length
            ),
            Message::AllowedFast(p) => write!(f, "Message::AllowedFast({})", p),
            Message::Extension { id, ref payload } => write!(
                f,
                "Message::Extension {{ id: {}, len: {} }}",
                id,
                payload.len()
            ),
        }
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Message) -> bool {
        match (self, other) {
            (&Message::KeepAlive, &Message::KeepAlive)
            | (&Message::Choke, &Message::Choke)
            | (&Message::Unchoke, &Message::Unchoke)
            | (&Message::Interested, &Message::Interested)
            | (&Message::Uninterested, &Message::Uninterested)
            | (&Message::HaveAll, &Message::HaveAll)
            | (&Message::HaveNone, &Message::HaveNone) => true,
            (&Message::Have(a), &Message::Have(b))
            | (&Message::Suggest(a), &Message::Suggest(b))
            | (&Message::AllowedFast(a), &Message::AllowedFast(b)) => a == b,
            (&Message::Port(a), &Message::Port(b)) => a == b,
            (
                &Message::Request {
                    index,
                    begin,
                    length,
                },
                &Message::Request {
                    index: i,
                    begin: b,
                    length: l,
                },
            )
            | (
                &Message::Cancel {
                    index,
                    begin,
                    length,
                },
                &Message::Cancel {
                    index: i,
                    begin: b,
                    length: l,
                },
            )
            | (
                &Message::Reject {
                    index,
                    begin,
                    length,
                },
                &Message::Reject {
                    index: i,
                    begin: b,
                    length: l,
                },
            ) => index == i && begin == b && length == l,
            (&Message::Bitfield(ref a), &Message::Bitfield(ref b)) => a == b,
            (
                &Message::Piece {
                    index,
                    begin,
                    length,
                    ..
                },
                &Message::Piece {
                    index: i,
                    begin: b,
                    length: l,
                    ..
                },
            ) => index == i && begin == b && length == l,
            (
                &Message::Extension { id, ref payload },
                &Message::Extension {
                    id: i,
                    payload: ref p,
                },
            ) => id == i && payload == p,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Message;

    #[test]
    fn test_encode_fixed() {
        let mut buf = [0u8; 17];
        Message::Choke.encode(&mut buf[..5]).unwrap();
        assert_eq!(buf[..5], [0, 0, 0, 1, 0]);

        Message::Have(1).encode(&mut buf[..9]).unwrap();
        assert_eq!(buf[..9], [0, 0, 0, 5, 4, 0, 0, 0, 1]);

        Message::reject(1, 2, 3).encode(&mut buf[..17]).unwrap();
        assert_eq!(
            buf,
            [0, 0, 0, 13, 16, 0, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0, 3]
        );

        Message::Port(6881).encode(&mut buf[..7]).unwrap();
        assert_eq!(buf[..7], [0, 0, 0, 3, 9, 0x1A, 0xE1]);
    }

    #[test]
    fn test_encode_fast_ext() {
        let mut buf = [0u8; 9];
        Message::HaveAll.encode(&mut buf[..5]).unwrap();
        assert_eq!(buf[..5], [0, 0, 0, 1, 14]);
        Message::AllowedFast(7).encode(&mut buf[..9]).unwrap();
        assert_eq!(buf, [0, 0, 0, 5, 17, 0, 0, 0, 7]);
    }

    #[test]
    fn test_encode_extension() {
        let m = Message::Extension {
            id: 3,
            payload: b"d1:ai1ee".to_vec(),
        };
        let mut buf = vec![0u8; m.len()];
        m.encode(&mut buf).unwrap();
        assert_eq!(&buf[..6], &[0, 0, 0, 10, 20, 3]);
        assert_eq!(&buf[6..], b"d1:ai1ee");
    }
}
