use std::io::{self, ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Instant;

use net2::{TcpBuilder, TcpStreamExt};

use crate::bandwidth::{Direction, Handle};

const EINPROGRESS: i32 = 115;

/// Nonblocking TCP stream with an optional bandwidth handle. Reads
/// and writes are clamped to the remaining budget along the handle's
/// path and reported the moment they happen, so a burst inside one
/// readiness loop can never overdraw the period.
pub struct Socket {
    conn: TcpStream,
    addr: SocketAddr,
    pub bw: Option<Handle>,
}

impl Socket {
    pub fn new(addr: &SocketAddr) -> io::Result<Socket> {
        let sock = (match *addr {
            SocketAddr::V4(..) => TcpBuilder::new_v4(),
            SocketAddr::V6(..) => TcpBuilder::new_v6(),
        })?;
        let conn = sock.to_tcp_stream()?;
        conn.set_nonblocking(true)?;
        if let Err(e) = conn.connect(addr) {
            // OSX gives the AddrNotAvailable error sometimes
            if Some(EINPROGRESS) != e.raw_os_error() && e.kind() != ErrorKind::AddrNotAvailable {
                return Err(e);
            }
        }
        Ok(Socket {
            conn,
            bw: None,
            addr: *addr,
        })
    }

    pub fn from_stream(conn: TcpStream) -> io::Result<Socket> {
        conn.set_nonblocking(true)?;
        let addr = conn.peer_addr()?;
        Ok(Socket {
            conn,
            bw: None,
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.conn.as_raw_fd()
    }
}

impl Read for Socket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        // Don't bother rate limiting small requests
        if buf.len() < 20 {
            return self.conn.read(buf);
        }
        if let Some(ref bw) = self.bw {
            let allowed = bw.clamp(Direction::Down, buf.len());
            if allowed == 0 {
                return Err(io::Error::new(ErrorKind::WouldBlock, ""));
            }
            let amnt = self.conn.read(&mut buf[..allowed])?;
            bw.notify_consumed(Direction::Down, amnt as u64, false, Instant::now());
            Ok(amnt)
        } else {
            self.conn.read(buf)
        }
    }
}

impl Write for Socket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.len() < 20 {
            return self.conn.write(buf);
        }
        if let Some(ref bw) = self.bw {
            let allowed = bw.clamp(Direction::Up, buf.len());
            if allowed == 0 {
                return Err(io::Error::new(ErrorKind::WouldBlock, ""));
            }
            let amnt = self.conn.write(&buf[..allowed])?;
            bw.notify_consumed(Direction::Up, amnt as u64, false, Instant::now());
            Ok(amnt)
        } else {
            self.conn.write(buf)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}
