use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};
use std::mem;

use crate::buffers::Buffer;
use crate::peer::message::Message;
use crate::util::io_err;

pub struct Writer {
    // Exposed so the connection can drop queued blocks on Cancel or
    // a choke without flushing them first.
    pub write_queue: VecDeque<Message>,
    piece_bytes: u64,
    writable: bool,
    state: WriteState,
}

enum WriteState {
    Idle,
    WritingMsg { data: [u8; 17], len: u8, idx: u8 },
    WritingOther { data: Vec<u8>, idx: u16 },
    WritingPiece {
        prefix: [u8; 17],
        data: Buffer,
        len: u16,
        idx: u16,
    },
}

impl Writer {
    pub fn new() -> Writer {
        Writer {
            writable: true,
            write_queue: VecDeque::new(),
            state: WriteState::Idle,
            piece_bytes: 0,
        }
    }

    /// True once everything queued has hit the socket.
    pub fn is_idle(&self) -> bool {
        match self.state {
            WriteState::Idle => self.write_queue.is_empty(),
            _ => false,
        }
    }

    /// Piece payload bytes pushed onto the socket since the last call.
    pub fn take_piece_bytes(&mut self) -> u64 {
        mem::replace(&mut self.piece_bytes, 0)
    }

    pub fn writable<W: Write>(&mut self, conn: &mut W) -> io::Result<()> {
        self.writable = true;
        self.write(conn)
    }

    pub fn write_message<W: Write>(&mut self, msg: Message, conn: &mut W) -> io::Result<()> {
        if let WriteState::Idle = self.state {
            self.setup_write(msg);
        } else {
            self.write_queue.push_back(msg);
        }
        if self.writable {
            self.write(conn)
        } else {
            Ok(())
        }
    }

    fn setup_write(&mut self, msg: Message) {
        self.state = if !msg.is_variable() {
            let mut buf = [0; 17];
            let len = msg.len();
            // Fixed encodings always fit the scratch buffer
            msg.encode(&mut buf).unwrap();
            match msg {
                Message::Piece { length, data, .. } => WriteState::WritingPiece {
                    prefix: buf,
                    data,
                    len: length as u16,
                    idx: 0,
                },
                _ => WriteState::WritingMsg {
                    data: buf,
                    len: len as u8,
                    idx: 0,
                },
            }
        } else {
            let mut buf = vec![0; msg.len()];
            msg.encode(&mut buf).unwrap();
            WriteState::WritingOther { data: buf, idx: 0 }
        };
    }

    fn write<W: Write>(&mut self, conn: &mut W) -> io::Result<()> {
        if let WriteState::Idle = self.state {
            if let Some(msg) = self.write_queue.pop_front() {
                self.setup_write(msg);
            } else {
                return Ok(());
            }
        }
        loop {
            match self.write_(conn) {
                Ok(true) => {
                    if let Some(msg) = self.write_queue.pop_front() {
                        self.setup_write(msg);
                    } else {
                        self.state = WriteState::Idle;
                        break;
                    }
                }
                Ok(false) => {
                    if !self.writable {
                        break;
                    }
                }
                Err(e) => {
                    if e.kind() == ErrorKind::WouldBlock
                        || e.kind() == ErrorKind::NotConnected
                        || e.kind() == ErrorKind::BrokenPipe
                    {
                        self.writable = false;
                        break;
                    } else {
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }

    fn write_<W: Write>(&mut self, conn: &mut W) -> io::Result<bool> {
        match self.state {
            WriteState::Idle => Ok(false),
            WriteState::WritingMsg {
                ref data,
                ref len,
                ref mut idx,
            } => {
                let amnt = conn.write(&data[(*idx as usize)..(*len as usize)])?;
                if amnt == 0 {
                    return io_err("EOF");
                }
                *idx += amnt as u8;
                if idx == len {
                    Ok(true)
                } else {
                    self.writable = false;
                    Ok(false)
                }
            }
            WriteState::WritingPiece {
                ref prefix,
                ref data,
                len,
                ref mut idx,
            } => {
                if *idx < 13 {
                    let amnt = conn.write(&prefix[(*idx as usize)..13])? as u16;
                    if amnt == 0 {
                        return io_err("EOF");
                    }
                    *idx += amnt;
                    if *idx != 13 {
                        self.writable = false;
                        return Ok(false);
                    }
                }

                let amnt = conn.write(&data[(*idx - 13) as usize..len as usize])?;
                if amnt == 0 {
                    return io_err("EOF");
                }
                self.piece_bytes += amnt as u64;
                *idx += amnt as u16;
                if *idx == 13 + len {
                    Ok(true)
                } else {
                    self.writable = false;
                    Ok(false)
                }
            }
            WriteState::WritingOther {
                ref data,
                ref mut idx,
            } => {
                let amnt = conn.write(&data[(*idx as usize)..])?;
                if amnt == 0 {
                    return io_err("EOF");
                }
                *idx += amnt as u16;
                if *idx == data.len() as u16 {
                    Ok(true)
                } else {
                    self.writable = false;
                    Ok(false)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use crate::bitfield::Bitfield;
    use crate::buffers::Buffer;
    use crate::peer::message::Message;

    #[test]
    fn test_write_keepalive() {
        let mut w = Writer::new();
        let mut buf = [1u8; 4];
        w.write_message(Message::KeepAlive, &mut &mut buf[..]).unwrap();
        assert_eq!(buf, [0u8; 4]);
        assert!(w.is_idle());
    }

    #[test]
    fn test_write_choke() {
        let mut w = Writer::new();
        let mut buf = [0u8; 5];
        w.write_message(Message::Choke, &mut &mut buf[..]).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 0])
    }

    #[test]
    fn test_write_split() {
        let mut w = Writer::new();
        let mut buf = [0u8; 5];
        w.write_message(Message::Interested, &mut &mut buf[..]).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 2]);
        w.writable(&mut &mut buf[0..1]).unwrap();
        w.writable(&mut &mut buf[1..3]).unwrap();
        w.writable(&mut &mut buf[3..]).unwrap();
        assert_eq!(buf, [0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_write_bitfield() {
        let mut w = Writer::new();
        let mut buf = [0u8; 9];
        let mut pf = Bitfield::new(32);
        pf.set_all();
        w.write_message(Message::Bitfield(pf), &mut &mut buf[..]).unwrap();
        assert_eq!(buf, [0, 0, 0, 5, 5, 0xff, 0xff, 0xff, 0xff])
    }

    #[test]
    fn test_write_request() {
        let mut w = Writer::new();
        let mut buf = [0u8; 17];
        w.write_message(Message::request(1, 1, 1), &mut &mut buf[..]).unwrap();
        assert_eq!(buf, [0, 0, 0, 13, 6, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 1])
    }

    #[test]
    fn test_write_piece() {
        use std::io::Cursor;
        let mut w = Writer::new();
        let mut piece = Buffer::get().unwrap();
        for b in piece.iter_mut() {
            *b = 1;
        }
        let mut sbuf = [0u8; 16_384 + 13];
        let mut buf = Cursor::new(&mut sbuf[..]);
        let m = Message::piece(1, 1, 16_384, piece);
        w.write_message(m, &mut buf).unwrap();
        let buf = buf.into_inner();
        assert_eq!(buf[0..13], [0, 0, 0x40, 0x09, 7, 0, 0, 0, 1, 0, 0, 0, 1]);
        assert!(buf[13..].iter().all(|b| *b == 1));
        assert_eq!(w.take_piece_bytes(), 16_384);
        assert_eq!(w.take_piece_bytes(), 0);
    }

    #[test]
    fn test_write_short_piece() {
        use std::io::Cursor;
        let mut w = Writer::new();
        let piece = Buffer::get().unwrap();
        let mut sbuf = [0u8; 1_024 + 13];
        let mut buf = Cursor::new(&mut sbuf[..]);
        w.write_message(Message::piece(0, 0, 1_024, piece), &mut buf).unwrap();
        assert!(w.is_idle());
        assert_eq!(w.take_piece_bytes(), 1_024);
    }

    #[test]
    fn test_write_queue_order() {
        use std::io::{self, Write};

        struct Blocked;
        impl Write for Blocked {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::WouldBlock, ""))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut w = Writer::new();
        w.write_message(Message::Choke, &mut Blocked).unwrap();
        w.write_message(Message::Have(1), &mut Blocked).unwrap();
        w.write_message(Message::Have(2), &mut Blocked).unwrap();
        assert!(!w.is_idle());

        let mut buf = [0u8; 5 + 9 + 9];
        w.writable(&mut &mut buf[..]).unwrap();
        assert_eq!(&buf[..5], &[0, 0, 0, 1, 0]);
        assert_eq!(&buf[5..14], &[0, 0, 0, 5, 4, 0, 0, 0, 1]);
        assert_eq!(&buf[14..], &[0, 0, 0, 5, 4, 0, 0, 0, 2]);
        assert!(w.is_idle());
    }
}
