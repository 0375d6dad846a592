pub mod message;
mod reader;
mod writer;

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::mem;
use std::time::{Duration, Instant};

pub use self::message::Message;
use self::reader::Reader;
use self::writer::Writer;
use crate::alloc::PeerKey;
use crate::bandwidth::{Direction, Handle};
use crate::bitfield::Bitfield;
use crate::cio::{BlockCache, BlockSpan, ErrorKind, PeerMgr, Result};
use crate::config::Config;
use crate::BLOCK_SZ;

/// Hard cap on requests a remote may have queued against us.
const MAX_QUEUE: usize = 512;
/// Queued blocks prefetched ahead of serving.
const PREFETCH: usize = 18;
/// Floor and protocol ceiling for our own request pipeline.
const MIN_REQS: usize = 32;
const MAX_REQS: usize = 250;
/// Outbound keepalive interval.
const KEEPALIVE_SECS: u64 = 100;
/// Minimum gap between choke state flips toward the same peer.
const FLIP_GUARD_SECS: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Urgency {
    /// Coalesced for up to the low batch delay.
    Low,
    /// Coalesced for up to the high batch delay.
    High,
    /// Flushes everything pending, in order, right now.
    Immediate,
}

pub struct Status {
    pub choked: bool,
    pub interested: bool,
}

impl Status {
    fn new() -> Status {
        Status {
            choked: true,
            interested: false,
        }
    }
}

/// Collaborators a connection needs while processing events. Borrowed
/// per call so one cache and one peer mgr serve every connection.
pub struct Ctx<'a, D: BlockCache, M: PeerMgr> {
    pub cache: &'a mut D,
    pub mgr: &'a mut M,
    pub cfg: &'a Config,
}

impl<'a, D: BlockCache, M: PeerMgr> Ctx<'a, D, M> {
    pub fn new(cache: &'a mut D, mgr: &'a mut M, cfg: &'a Config) -> Ctx<'a, D, M> {
        Ctx { cache, mgr, cfg }
    }
}

/// Driver for one established connection. The handshake happened
/// before construction; this only speaks the symmetric message
/// protocol, tracks both sides' choke/interest state, serves the
/// remote's block requests and keeps our own request pipeline sized.
pub struct PeerConn<C: Read + Write> {
    conn: C,
    key: PeerKey,
    reader: Reader,
    writer: Writer,
    /// Our state toward the remote.
    local_status: Status,
    /// The remote's state toward us.
    remote_status: Status,
    /// Pieces the remote claims to hold.
    pieces: Bitfield,
    /// Pieces we hold and may serve.
    own: Bitfield,
    fext: bool,
    ltep: bool,
    /// Remote's advertised request queue depth.
    reqq: usize,
    desired_reqs: usize,
    /// Inbound LTEP traffic awaiting pickup by the embedder.
    exts: Vec<(u8, Vec<u8>)>,
    /// Block requests the remote has queued against us, FIFO.
    queue: VecDeque<BlockSpan>,
    bw: Option<Handle>,
    last_tx: Instant,
    last_flip: Option<Instant>,
    pending: Vec<Message>,
    flush_at: Option<Instant>,
}

impl<C: Read + Write> PeerConn<C> {
    pub fn new(
        key: PeerKey,
        conn: C,
        num_pieces: u64,
        fext: bool,
        ltep: bool,
        bw: Option<Handle>,
    ) -> PeerConn<C> {
        PeerConn {
            conn,
            key,
            reader: Reader::new(),
            writer: Writer::new(),
            local_status: Status::new(),
            remote_status: Status::new(),
            pieces: Bitfield::new(num_pieces),
            own: Bitfield::new(num_pieces),
            fext,
            ltep,
            reqq: MAX_REQS,
            desired_reqs: MIN_REQS,
            exts: Vec::new(),
            queue: VecDeque::new(),
            bw,
            last_tx: Instant::now(),
            last_flip: None,
            pending: Vec::new(),
            flush_at: None,
        }
    }

    pub fn key(&self) -> PeerKey {
        self.key
    }

    pub fn pieces(&self) -> &Bitfield {
        &self.pieces
    }

    pub fn own_pieces(&self) -> &Bitfield {
        &self.own
    }

    pub fn being_choked(&self) -> bool {
        self.remote_status.choked
    }

    pub fn remote_interested(&self) -> bool {
        self.remote_status.interested
    }

    pub fn choking(&self) -> bool {
        self.local_status.choked
    }

    /// How deep our request pipeline toward this peer should be.
    pub fn desired_request_count(&self) -> usize {
        self.desired_reqs
    }

    /// Remote's advertised request queue depth, parsed by the embedder
    /// from the extended handshake. Takes effect at the next resize.
    pub fn set_reqq(&mut self, reqq: usize) {
        self.reqq = reqq.max(1).min(MAX_REQS);
    }

    /// Extension messages received since the last call. Payloads are
    /// opaque here; the embedder owns the LTEP session.
    pub fn take_extensions(&mut self) -> Vec<(u8, Vec<u8>)> {
        mem::replace(&mut self.exts, Vec::new())
    }

    pub fn queued_requests(&self) -> usize {
        self.queue.len()
    }

    /// True when requesting from this peer can make progress.
    pub fn download_allowed(&self) -> bool {
        self.local_status.interested
            && !self.remote_status.choked
            && self
                .bw
                .as_ref()
                .and_then(|h| h.effective_limit_bps(Direction::Down))
                != Some(0)
    }

    /// Drains readable socket data, dispatching every complete message.
    pub fn readable<D: BlockCache, M: PeerMgr>(&mut self, ctx: &mut Ctx<'_, D, M>) -> Result<()> {
        let res: Result<()> = (|| {
            while let Some(msg) = self.reader.readable(&mut self.conn)? {
                self.handle_msg(ctx, msg)?;
            }
            Ok(())
        })();
        let pb = self.reader.take_piece_bytes();
        if pb > 0 {
            if let Some(h) = &self.bw {
                h.notify_piece(Direction::Down, pb, Instant::now());
            }
        }
        res?;
        self.serve(ctx)
    }

    /// Socket became writable again; resume any stalled flush.
    pub fn writable<D: BlockCache, M: PeerMgr>(&mut self, ctx: &mut Ctx<'_, D, M>) -> Result<()> {
        self.writer.writable(&mut self.conn)?;
        self.account_upload();
        self.serve(ctx)
    }

    fn handle_msg<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.remote_status.choked = true,
            Message::Unchoke => self.remote_status.choked = false,
            Message::Interested => self.remote_status.interested = true,
            Message::Uninterested => self.remote_status.interested = false,
            Message::Have(idx) => {
                if u64::from(idx) >= self.pieces.len() {
                    return Err(ErrorKind::Protocol("have index out of range").into());
                }
                self.pieces.set_bit(u64::from(idx));
            }
            Message::Bitfield(bf) => {
                if bf.bytes() != self.pieces.bytes() {
                    return Err(ErrorKind::Protocol("bitfield size mismatch").into());
                }
                let data: Vec<u8> = (0..bf.bytes()).map(|i| bf.byte_at(i)).collect();
                self.pieces = Bitfield::from(data.into_boxed_slice(), self.pieces.len());
            }
            Message::HaveAll => {
                if !self.fext {
                    return Err(ErrorKind::Protocol("fast message without fast ext").into());
                }
                self.pieces.set_all();
            }
            Message::HaveNone => {
                if !self.fext {
                    return Err(ErrorKind::Protocol("fast message without fast ext").into());
                }
                self.pieces.unset_all();
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                self.handle_request(ctx, BlockSpan {
                    piece: index,
                    offset: begin,
                    length,
                })?;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let span = BlockSpan {
                    piece: index,
                    offset: begin,
                    length,
                };
                self.queue.retain(|s| *s != span);
                self.writer.write_queue.retain(|m| match *m {
                    Message::Piece {
                        index: i,
                        begin: b,
                        ..
                    } => !(i == span.piece && b == span.offset),
                    _ => true,
                });
                if self.fext {
                    self.send(Message::reject(span.piece, span.offset, span.length))?;
                }
            }
            Message::Piece {
                index,
                begin,
                length,
                data,
            } => {
                let span = BlockSpan {
                    piece: index,
                    offset: begin,
                    length,
                };
                if !ctx.mgr.did_peer_request(self.key, span) {
                    return Err(ErrorKind::Protocol("unsolicited block").into());
                }
                ctx.mgr.mark_complete(self.key, span);
                ctx.cache.write_block(span, &data[..length as usize])?;
            }
            Message::Port(_) => {}
            Message::Suggest(idx) => {
                if !self.fext {
                    return Err(ErrorKind::Protocol("fast message without fast ext").into());
                }
                if u64::from(idx) >= self.pieces.len() {
                    return Err(ErrorKind::Protocol("suggest index out of range").into());
                }
            }
            Message::AllowedFast(idx) => {
                if !self.fext {
                    return Err(ErrorKind::Protocol("fast message without fast ext").into());
                }
                if u64::from(idx) >= self.pieces.len() {
                    return Err(ErrorKind::Protocol("allowed fast index out of range").into());
                }
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                if !self.fext {
                    return Err(ErrorKind::Protocol("fast message without fast ext").into());
                }
                let span = BlockSpan {
                    piece: index,
                    offset: begin,
                    length,
                };
                if ctx.mgr.did_peer_request(self.key, span) {
                    ctx.mgr.mark_complete(self.key, span);
                }
            }
            Message::Extension { id, payload } => {
                if !self.ltep {
                    return Err(ErrorKind::Protocol("extension message without ltep").into());
                }
                self.exts.push((id, payload));
            }
        }
        Ok(())
    }

    fn handle_request<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        span: BlockSpan,
    ) -> Result<()> {
        if span.length == 0 || span.length as usize > BLOCK_SZ {
            return Err(ErrorKind::Protocol("bad request length").into());
        }
        if u64::from(span.piece) >= self.own.len() {
            return Err(ErrorKind::Protocol("request index out of range").into());
        }
        let deny = self.local_status.choked
            || self.queue.len() >= MAX_QUEUE
            || !self.own.has_bit(u64::from(span.piece));
        if deny {
            if self.fext {
                self.send(Message::reject(span.piece, span.offset, span.length))?;
            }
            return Ok(());
        }
        self.queue.push_back(span);
        if self.queue.len() <= PREFETCH {
            ctx.cache.prefetch_block(span);
        }
        Ok(())
    }

    /// Sends up to `n` new block requests picked by the peer mgr.
    pub fn grant_requests<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        n: usize,
    ) -> Result<()> {
        if n == 0 || !self.download_allowed() {
            return Ok(());
        }
        for span in ctx.mgr.next_request_spans(self.key, n) {
            self.send(Message::request(span.piece, span.offset, span.length))?;
            ctx.mgr.mark_sent(self.key, span);
        }
        Ok(())
    }

    /// Declare or retract interest in the remote's pieces.
    pub fn set_interested<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        interested: bool,
    ) -> Result<()> {
        if self.local_status.interested == interested {
            return Ok(());
        }
        self.local_status.interested = interested;
        let msg = if interested {
            Message::Interested
        } else {
            Message::Uninterested
        };
        self.batch(ctx.cfg, msg, Urgency::High)
    }

    /// Chokes the remote, rejecting everything it had queued. Returns
    /// false when suppressed by the flip guard.
    pub fn choke<D: BlockCache, M: PeerMgr>(
        &mut self,
        _ctx: &mut Ctx<'_, D, M>,
        now: Instant,
    ) -> Result<bool> {
        if self.local_status.choked || self.flip_guarded(now) {
            return Ok(false);
        }
        self.local_status.choked = true;
        self.last_flip = Some(now);
        self.send(Message::Choke)?;
        let spans: Vec<BlockSpan> = self.queue.drain(..).collect();
        if self.fext {
            for span in spans {
                self.send(Message::reject(span.piece, span.offset, span.length))?;
            }
        }
        Ok(true)
    }

    pub fn unchoke<D: BlockCache, M: PeerMgr>(
        &mut self,
        _ctx: &mut Ctx<'_, D, M>,
        now: Instant,
    ) -> Result<bool> {
        if !self.local_status.choked || self.flip_guarded(now) {
            return Ok(false);
        }
        self.local_status.choked = false;
        self.last_flip = Some(now);
        self.send(Message::Unchoke)?;
        Ok(true)
    }

    fn flip_guarded(&self, now: Instant) -> bool {
        match self.last_flip {
            Some(at) => now.saturating_duration_since(at) < Duration::from_secs(FLIP_GUARD_SECS),
            None => false,
        }
    }

    /// Queues an LTEP message the embedder already encoded.
    pub fn send_extension<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        id: u8,
        payload: Vec<u8>,
    ) -> Result<()> {
        if !self.ltep {
            return Ok(());
        }
        self.batch(ctx.cfg, Message::Extension { id, payload }, Urgency::High)
    }

    /// We completed verification of a piece and can serve it.
    pub fn piece_available<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        idx: u32,
    ) -> Result<()> {
        self.own.set_bit(u64::from(idx));
        self.batch(ctx.cfg, Message::Have(idx), Urgency::Low)
    }

    /// Periodic maintenance: keepalive, pipeline sizing, serving the
    /// remote's queue and flushing any expired batch.
    pub fn pulse<D: BlockCache, M: PeerMgr>(
        &mut self,
        ctx: &mut Ctx<'_, D, M>,
        now: Instant,
    ) -> Result<()> {
        if now.saturating_duration_since(self.last_tx) >= Duration::from_secs(KEEPALIVE_SECS) {
            self.send(Message::KeepAlive)?;
        }
        self.resize_pipeline(ctx.cfg, now);
        self.serve(ctx)?;
        if self.flush_at.map(|at| at <= now).unwrap_or(false) {
            self.flush()?;
        }
        Ok(())
    }

    /// Sizes our request pipeline so roughly `lookahead_secs` of
    /// payload at the current rate stays in flight, clamped to the
    /// remote's queue depth and the protocol ceiling.
    fn resize_pipeline(&mut self, cfg: &Config, now: Instant) {
        let mut bps = self
            .bw
            .as_ref()
            .map(|h| h.piece_speed_bps(Direction::Down, now))
            .unwrap_or(0);
        if let Some(limit) = self
            .bw
            .as_ref()
            .and_then(|h| h.effective_limit_bps(Direction::Down))
        {
            bps = bps.min(limit);
        }
        let target = (bps.saturating_mul(cfg.lookahead_secs) / BLOCK_SZ as u64) as usize;
        self.desired_reqs = target.max(MIN_REQS).min(self.reqq.min(MAX_REQS));
    }

    /// Feeds queued blocks to the writer while it has room. A stalled
    /// writer pauses serving until the socket drains.
    fn serve<D: BlockCache, M: PeerMgr>(&mut self, ctx: &mut Ctx<'_, D, M>) -> Result<()> {
        while self.writer.is_idle() {
            let span = match self.queue.pop_front() {
                Some(s) => s,
                None => break,
            };
            let data = match ctx.cache.read_block(span) {
                Ok(d) => d,
                // A failed read rejects the one block when the remote
                // can understand that; otherwise the connection goes.
                Err(e) if self.fext => {
                    debug!("Dropping block {:?}: {}", span, e);
                    self.send(Message::reject(span.piece, span.offset, span.length))?;
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.send(Message::piece(span.piece, span.offset, span.length, data))?;
            if self.queue.len() >= PREFETCH {
                ctx.cache.prefetch_block(self.queue[PREFETCH - 1]);
            }
        }
        Ok(())
    }

    fn batch(&mut self, cfg: &Config, msg: Message, urgency: Urgency) -> Result<()> {
        let delay = match urgency {
            Urgency::Immediate => return self.send(msg),
            Urgency::High => Duration::from_millis(cfg.batch_high_ms),
            Urgency::Low => Duration::from_millis(cfg.batch_low_ms),
        };
        self.pending.push(msg);
        let deadline = Instant::now() + delay;
        self.flush_at = Some(match self.flush_at {
            Some(at) if at <= deadline => at,
            _ => deadline,
        });
        Ok(())
    }

    /// Writes a message now, flushing anything batched ahead of it so
    /// ordering holds.
    fn send(&mut self, msg: Message) -> Result<()> {
        self.flush()?;
        self.last_tx = Instant::now();
        self.writer.write_message(msg, &mut self.conn)?;
        self.account_upload();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            self.flush_at = None;
            return Ok(());
        }
        self.last_tx = Instant::now();
        for msg in self.pending.drain(..) {
            self.writer.write_message(msg, &mut self.conn)?;
        }
        self.flush_at = None;
        self.account_upload();
        Ok(())
    }

    fn account_upload(&mut self) {
        let pb = self.writer.take_piece_bytes();
        if pb > 0 {
            if let Some(h) = &self.bw {
                h.notify_piece(Direction::Up, pb, Instant::now());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn conn_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}
