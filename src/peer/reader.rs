use std::io::{self, Read};
use std::mem;

use byteorder::{BigEndian, ReadBytesExt};

use crate::bitfield::Bitfield;
use crate::buffers::Buffer;
use crate::peer::message::{id, Message};
use crate::util::{aread, io_err, IOR};
use crate::BLOCK_SZ;

/// Largest accepted bitfield payload, enough for 32M pieces.
const MAX_BITFIELD_BYTES: usize = 4 * 1024 * 1024;
/// Largest accepted extension message payload.
const MAX_EXT_BYTES: usize = 1024 * 1024;

/// Incremental wire decoder. Every message's declared length is
/// validated against its id before any payload is buffered, so a bad
/// length fails the connection without allocating.
pub struct Reader {
    state: State,
    prefix: [u8; 17],
    idx: usize,
    piece_bytes: u64,
}

enum State {
    Len,
    Id,
    Fixed { total: usize },
    PiecePrefix,
    Piece { data: Option<Buffer>, len: u32 },
    Bitfield { data: Vec<u8> },
    ExtId,
    Ext { id: u8, payload: Vec<u8> },
}

impl Reader {
    pub fn new() -> Reader {
        Reader {
            state: State::Len,
            prefix: [0u8; 17],
            idx: 0,
            piece_bytes: 0,
        }
    }

    /// Piece payload bytes streamed off the socket since the last
    /// call, counted even for partially read blocks.
    pub fn take_piece_bytes(&mut self) -> u64 {
        mem::replace(&mut self.piece_bytes, 0)
    }

    pub fn readable<R: Read>(&mut self, conn: &mut R) -> io::Result<Option<Message>> {
        let res = self.readable_(conn);
        if res.as_ref().ok().map(|o| o.is_some()).unwrap_or(false) {
            self.state = State::Len;
            self.idx = 0;
        }
        res
    }

    fn readable_<R: Read>(&mut self, conn: &mut R) -> io::Result<Option<Message>> {
        loop {
            let len = self.state.len();
            match self.state {
                State::Len => match aread(&mut self.prefix[self.idx..len], conn) {
                    IOR::Complete => {
                        let mlen = (&self.prefix[0..4]).read_u32::<BigEndian>().unwrap();
                        if mlen == 0 {
                            return Ok(Some(Message::KeepAlive));
                        } else {
                            self.idx = 4;
                            self.state = State::Id;
                        }
                    }
                    IOR::Incomplete(a) => self.idx += a,
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
                State::Id => match aread(&mut self.prefix[self.idx..len], conn) {
                    IOR::Complete => {
                        self.idx = 5;
                        let mlen = (&self.prefix[0..4]).read_u32::<BigEndian>().unwrap();
                        match self.prefix[4] {
                            id::CHOKE
                            | id::UNCHOKE
                            | id::INTERESTED
                            | id::UNINTERESTED
                            | id::HAVE_ALL
                            | id::HAVE_NONE => {
                                if mlen != 1 {
                                    return io_err("bad length for 1 byte message");
                                }
                                return Ok(Some(match self.prefix[4] {
                                    id::CHOKE => Message::Choke,
                                    id::UNCHOKE => Message::Unchoke,
                                    id::INTERESTED => Message::Interested,
                                    id::UNINTERESTED => Message::Uninterested,
                                    id::HAVE_ALL => Message::HaveAll,
                                    _ => Message::HaveNone,
                                }));
                            }
                            id::HAVE | id::SUGGEST | id::ALLOWED_FAST => {
                                if mlen != 5 {
                                    return io_err("bad length for piece index message");
                                }
                                self.state = State::Fixed { total: 9 };
                            }
                            id::REQUEST | id::CANCEL | id::REJECT => {
                                if mlen != 13 {
                                    return io_err("bad length for block message");
                                }
                                self.state = State::Fixed { total: 17 };
                            }
                            id::PORT => {
                                if mlen != 3 {
                                    return io_err("bad length for port message");
                                }
                                self.state = State::Fixed { total: 7 };
                            }
                            id::BITFIELD => {
                                let plen = mlen as usize - 1;
                                if mlen < 2 || plen > MAX_BITFIELD_BYTES {
                                    return io_err("bad bitfield length");
                                }
                                self.idx = 0;
                                self.state = State::Bitfield {
                                    data: vec![0u8; plen],
                                };
                            }
                            id::PIECE => {
                                if mlen <= 9 || mlen as usize > 9 + BLOCK_SZ {
                                    return io_err("bad piece length");
                                }
                                self.state = State::PiecePrefix;
                            }
                            id::EXTENSION => {
                                if mlen < 2 || mlen as usize - 2 > MAX_EXT_BYTES {
                                    return io_err("bad extension length");
                                }
                                self.state = State::ExtId;
                            }
                            _ => return io_err("unknown message id"),
                        }
                    }
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                    IOR::Incomplete(_) => unreachable!(),
                },
                State::Fixed { .. } => match aread(&mut self.prefix[self.idx..len], conn) {
                    IOR::Complete => {
                        let a = (&self.prefix[5..9]).read_u32::<BigEndian>().unwrap();
                        return Ok(Some(match self.prefix[4] {
                            id::HAVE => Message::Have(a),
                            id::SUGGEST => Message::Suggest(a),
                            id::ALLOWED_FAST => Message::AllowedFast(a),
                            id::PORT => {
                                let port =
                                    (&self.prefix[5..7]).read_u16::<BigEndian>().unwrap();
                                Message::Port(port)
                            }
                            _ => {
                                let begin =
                                    (&self.prefix[9..13]).read_u32::<BigEndian>().unwrap();
                                let length =
                                    (&self.prefix[13..17]).read_u32::<BigEndian>().unwrap();
                                match self.prefix[4] {
                                    id::REQUEST => Message::request(a, begin, length),
                                    id::CANCEL => Message::Cancel {
                                        index: a,
                                        begin,
                                        length,
                                    },
                                    _ => Message::reject(a, begin, length),
                                }
                            }
                        }));
                    }
                    IOR::Incomplete(a) => self.idx += a,
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
                State::PiecePrefix => match aread(&mut self.prefix[self.idx..len], conn) {
                    IOR::Complete => {
                        let plen = (&self.prefix[0..4]).read_u32::<BigEndian>().unwrap() - 9;
                        let data = match Buffer::get() {
                            Some(b) => b,
                            None => return io_err("block buffers exhausted"),
                        };
                        self.idx = 0;
                        self.state = State::Piece {
                            data: Some(data),
                            len: plen,
                        };
                    }
                    IOR::Incomplete(a) => self.idx += a,
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
                State::Piece {
                    ref mut data,
                    len: length,
                } => match aread(&mut data.as_mut().unwrap()[self.idx..len], conn) {
                    IOR::Complete => {
                        self.piece_bytes += (len - self.idx) as u64;
                        let index = (&self.prefix[5..9]).read_u32::<BigEndian>().unwrap();
                        let begin = (&self.prefix[9..13]).read_u32::<BigEndian>().unwrap();
                        return Ok(Some(Message::Piece {
                            index,
                            begin,
                            length,
                            data: data.take().unwrap(),
                        }));
                    }
                    IOR::Incomplete(a) => {
                        self.piece_bytes += a as u64;
                        self.idx += a;
                    }
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
                State::Bitfield { ref mut data } => match aread(&mut data[self.idx..len], conn) {
                    IOR::Complete => {
                        let d = mem::replace(data, vec![]).into_boxed_slice();
                        let bf = Bitfield::from(d, len as u64 * 8);
                        return Ok(Some(Message::Bitfield(bf)));
                    }
                    IOR::Incomplete(a) => self.idx += a,
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
                State::ExtId => match aread(&mut self.prefix[5..6], conn) {
                    IOR::Complete => {
                        let eid = self.prefix[5];
                        let plen = (&self.prefix[0..4]).read_u32::<BigEndian>().unwrap() - 2;
                        self.idx = 0;
                        self.state = State::Ext {
                            id: eid,
                            payload: vec![0u8; plen as usize],
                        };
                    }
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                    IOR::Incomplete(_) => unreachable!(),
                },
                State::Ext {
                    id: eid,
                    ref mut payload,
                } => match aread(&mut payload[self.idx..len], conn) {
                    IOR::Complete => {
                        let p = mem::replace(payload, Vec::with_capacity(0));
                        return Ok(Some(Message::Extension {
                            id: eid,
                            payload: p,
                        }));
                    }
                    IOR::Incomplete(a) => self.idx += a,
                    IOR::Blocked => return Ok(None),
                    IOR::EOF => return io_err("EOF"),
                    IOR::Err(e) => return Err(e),
                },
            }
        }
    }
}

impl State {
    fn len(&self) -> usize {
        match *self {
            State::Len => 4,
            State::Id => 5,
            State::Fixed { total } => total,
            State::PiecePrefix => 13,
            State::Piece { len, .. } => len as usize,
            State::Bitfield { ref data } => data.len(),
            State::ExtId => 6,
            State::Ext { ref payload, .. } => payload.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::message::Message;
    use assert_matches::assert_matches;
    use std::io::{self, Read};

    /// Read double that hands out its data then blocks like a
    /// nonblocking socket.
    struct Cursor<'a> {
        data: &'a [u8],
        idx: usize,
    }

    impl<'a> Cursor<'a> {
        fn new(data: &'a [u8]) -> Cursor<'a> {
            Cursor { data, idx: 0 }
        }
    }

    impl<'a> Read for Cursor<'a> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.idx >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, ""));
            }
            let start = self.idx;
            for i in 0..buf.len() {
                if self.idx >= self.data.len() {
                    break;
                }
                buf[i] = self.data[self.idx];
                self.idx += 1;
            }
            Ok(self.idx - start)
        }
    }

    fn read_one(data: &[u8]) -> Message {
        let mut r = Reader::new();
        let mut c = Cursor::new(data);
        r.readable(&mut c).unwrap().unwrap()
    }

    #[test]
    fn test_read_keepalive() {
        assert_eq!(read_one(&[0, 0, 0, 0]), Message::KeepAlive);
    }

    #[test]
    fn test_read_single_byte() {
        assert_eq!(read_one(&[0, 0, 0, 1, 0]), Message::Choke);
        assert_eq!(read_one(&[0, 0, 0, 1, 1]), Message::Unchoke);
        assert_eq!(read_one(&[0, 0, 0, 1, 2]), Message::Interested);
        assert_eq!(read_one(&[0, 0, 0, 1, 3]), Message::Uninterested);
        assert_eq!(read_one(&[0, 0, 0, 1, 14]), Message::HaveAll);
        assert_eq!(read_one(&[0, 0, 0, 1, 15]), Message::HaveNone);
    }

    #[test]
    fn test_read_have() {
        assert_eq!(read_one(&[0, 0, 0, 5, 4, 0, 0, 0, 1]), Message::Have(1));
        assert_eq!(read_one(&[0, 0, 0, 5, 13, 0, 0, 0, 2]), Message::Suggest(2));
        assert_eq!(
            read_one(&[0, 0, 0, 5, 17, 0, 0, 0, 3]),
            Message::AllowedFast(3)
        );
    }

    #[test]
    fn test_read_block_messages() {
        let body = [0u8, 0, 0, 1, 0, 0, 0, 2, 0, 0, 0x40, 0];
        for &(mid, ctor) in &[
            (6u8, Message::request as fn(u32, u32, u32) -> Message),
            (16u8, Message::reject as fn(u32, u32, u32) -> Message),
        ] {
            let mut v = vec![0, 0, 0, 13, mid];
            v.extend_from_slice(&body);
            assert_eq!(read_one(&v), ctor(1, 2, 16_384));
        }
        let mut v = vec![0, 0, 0, 13, 8];
        v.extend_from_slice(&body);
        assert_eq!(
            read_one(&v),
            Message::Cancel {
                index: 1,
                begin: 2,
                length: 16_384,
            }
        );
    }

    #[test]
    fn test_read_port() {
        assert_eq!(read_one(&[0, 0, 0, 3, 9, 0x1A, 0xE1]), Message::Port(6881));
    }

    #[test]
    fn test_read_bitfield() {
        match read_one(&[0, 0, 0, 5, 5, 0xff, 0xff, 0xff, 0xff]) {
            Message::Bitfield(ref pf) => {
                for i in 0..32 {
                    assert!(pf.has_bit(i));
                }
            }
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn test_read_extension() {
        let mut v = vec![0, 0, 0, 10, 20, 3];
        v.extend_from_slice(b"d1:ai1ee");
        assert_eq!(
            read_one(&v),
            Message::Extension {
                id: 3,
                payload: b"d1:ai1ee".to_vec(),
            }
        );
    }

    #[test]
    fn test_read_piece_split() {
        let mut v = vec![0u8, 0, 0x40, 0x09, 7, 0, 0, 0, 1, 0, 0, 0, 1];
        v.extend(vec![1u8; 16_384]);

        let mut r = Reader::new();
        let mut p1 = Cursor::new(&v[0..10]);
        let mut p2 = Cursor::new(&v[10..100]);
        let mut p3 = Cursor::new(&v[100..]);
        assert_matches!(r.readable(&mut p1), Ok(None));
        assert_matches!(r.readable(&mut p2), Ok(None));
        // 87 payload bytes arrived with the second chunk
        assert_eq!(r.take_piece_bytes(), 87);
        match r.readable(&mut p3).unwrap().unwrap() {
            Message::Piece {
                index,
                begin,
                length,
                ref data,
            } => {
                assert_eq!((index, begin, length), (1, 1, 16_384));
                assert!(data.iter().all(|b| *b == 1));
            }
            m => panic!("unexpected {:?}", m),
        }
        assert_eq!(r.take_piece_bytes(), 16_384 - 87);
    }

    #[test]
    fn test_read_back_to_back() {
        let mut v = vec![0, 0, 0, 1, 2, 0, 0, 0, 5, 4, 0, 0, 0, 9];
        v.extend_from_slice(&[0, 0, 0, 0]);
        let mut r = Reader::new();
        let mut c = Cursor::new(&v);
        assert_eq!(r.readable(&mut c).unwrap().unwrap(), Message::Interested);
        assert_eq!(r.readable(&mut c).unwrap().unwrap(), Message::Have(9));
        assert_eq!(r.readable(&mut c).unwrap().unwrap(), Message::KeepAlive);
        assert!(r.readable(&mut c).unwrap().is_none());
    }

    #[test]
    fn test_read_bad_lengths() {
        // Choke with a payload
        let mut r = Reader::new();
        assert!(r.readable(&mut Cursor::new(&[0, 0, 0, 2, 0, 0])).is_err());
        // Piece shorter than its header
        let mut r = Reader::new();
        assert!(r.readable(&mut Cursor::new(&[0, 0, 0, 9, 7])).is_err());
        // Piece longer than a block
        let mut r = Reader::new();
        assert!(r
            .readable(&mut Cursor::new(&[0, 1, 0, 0, 7]))
            .is_err());
        // Unknown id
        let mut r = Reader::new();
        assert!(r.readable(&mut Cursor::new(&[0, 0, 0, 1, 12])).is_err());
    }
}
