use std::cell::RefCell;
use std::io::{Read, Write};
use std::rc::Rc;
use std::sync::mpsc;
use std::time::Instant;

use crate::alloc::{self, Mediator, PeerKey, PoolKey};
use crate::bandwidth::{Direction, Handle, NodeId, Tree, HISTORY_MS};
use crate::cio::{BlockCache, PeerMgr};
use crate::config::Config;
use crate::peer::{Ctx, PeerConn};
use crate::util::{FHashMap, UHashMap};

/// Pool every peer draws request slots from.
pub const SESSION_POOL: PoolKey = 0;

/// New-request budget used while no rate has been observed yet.
const KICKSTART_BUDGET: usize = 128;

fn torrent_pool(tid: usize) -> PoolKey {
    tid + 1
}

/// Closure shipped from other threads; runs on the network thread
/// with full access to the engine. The only cross thread primitive.
pub type Task<C, D, M> = Box<dyn FnOnce(&mut Control<C, D, M>) + Send>;

struct TorrentCtl {
    node: NodeId,
}

/// Single threaded engine core: owns the bandwidth tree, every
/// connection, and the cache/peer-mgr collaborators. Driven by socket
/// readiness callbacks plus a periodic tick.
pub struct Control<C: Read + Write, D: BlockCache, M: PeerMgr> {
    cfg: Config,
    tree: Rc<RefCell<Tree>>,
    cache: D,
    mgr: M,
    torrents: UHashMap<TorrentCtl>,
    peers: UHashMap<PeerConn<C>>,
    peer_torrent: UHashMap<usize>,
    peer_node: UHashMap<NodeId>,
    node_peer: FHashMap<NodeId, PeerKey>,
    tasks: mpsc::Receiver<Task<C, D, M>>,
    last_tick: Instant,
}

impl<C: Read + Write, D: BlockCache, M: PeerMgr> Control<C, D, M> {
    pub fn new(cfg: Config, cache: D, mgr: M) -> (Control<C, D, M>, mpsc::Sender<Task<C, D, M>>) {
        let (tx, rx) = mpsc::channel();
        let tree = Rc::new(RefCell::new(Tree::new()));
        {
            let mut t = tree.borrow_mut();
            let root = t.root();
            if cfg.rate_ul > 0 {
                t.set_limited(root, Direction::Up, true);
                t.set_rate(root, Direction::Up, cfg.rate_ul);
            }
            if cfg.rate_dl > 0 {
                t.set_limited(root, Direction::Down, true);
                t.set_rate(root, Direction::Down, cfg.rate_dl);
            }
        }
        let ctl = Control {
            cfg,
            tree,
            cache,
            mgr,
            torrents: UHashMap::default(),
            peers: UHashMap::default(),
            peer_torrent: UHashMap::default(),
            peer_node: UHashMap::default(),
            node_peer: FHashMap::default(),
            tasks: rx,
            last_tick: Instant::now(),
        };
        (ctl, tx)
    }

    pub fn add_torrent(&mut self, tid: usize) {
        let node = {
            let mut t = self.tree.borrow_mut();
            let root = t.root();
            t.add_node(root)
        };
        self.torrents.insert(tid, TorrentCtl { node });
        debug!("Added torrent {}", tid);
    }

    pub fn remove_torrent(&mut self, tid: usize) {
        let ctl = match self.torrents.remove(&tid) {
            Some(c) => c,
            None => return,
        };
        let keys: Vec<PeerKey> = self
            .peer_torrent
            .iter()
            .filter(|&(_, t)| *t == tid)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.remove_peer(key);
        }
        self.tree.borrow_mut().remove_node(ctl.node);
        debug!("Removed torrent {}", tid);
    }

    /// Per torrent rate cap. `None` lifts the cap, `Some(0)` pauses.
    pub fn set_torrent_rate(&mut self, tid: usize, dir: Direction, rate: Option<u64>) {
        if let Some(ctl) = self.torrents.get(&tid) {
            let mut t = self.tree.borrow_mut();
            t.set_limited(ctl.node, dir, rate.is_some());
            t.set_rate(ctl.node, dir, rate.unwrap_or(0));
        }
    }

    /// Registers an established connection under a torrent. The
    /// transport is built by the caller around the connection's
    /// bandwidth handle so socket level clamping shares the same node.
    pub fn add_peer<F: FnOnce(Handle) -> C>(
        &mut self,
        tid: usize,
        key: PeerKey,
        make_conn: F,
        num_pieces: u64,
        fext: bool,
        ltep: bool,
    ) -> bool {
        let tnode = match self.torrents.get(&tid) {
            Some(c) => c.node,
            None => return false,
        };
        let node = self.tree.borrow_mut().add_node(tnode);
        let handle = Handle::new(Rc::clone(&self.tree), node);
        let conn = make_conn(handle.clone());
        let peer = PeerConn::new(key, conn, num_pieces, fext, ltep, Some(handle));
        self.peers.insert(key, peer);
        self.peer_torrent.insert(key, tid);
        self.peer_node.insert(key, node);
        self.node_peer.insert(node, key);
        debug!("Added peer {} to torrent {}", key, tid);
        true
    }

    pub fn remove_peer(&mut self, key: PeerKey) {
        if self.peers.remove(&key).is_none() {
            return;
        }
        self.peer_torrent.remove(&key);
        if let Some(node) = self.peer_node.remove(&key) {
            self.node_peer.remove(&node);
            self.tree.borrow_mut().remove_node(node);
        }
        debug!("Removed peer {}", key);
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }

    /// Socket readiness callbacks. A failing connection is torn down
    /// here; nothing else is affected. Returns any LTEP messages the
    /// peer delivered, for the embedder to interpret.
    pub fn on_readable(&mut self, key: PeerKey) -> Vec<(u8, Vec<u8>)> {
        let (failed, exts) = {
            let Control {
                ref mut peers,
                ref mut cache,
                ref mut mgr,
                ref cfg,
                ..
            } = *self;
            let mut ctx = Ctx::new(cache, mgr, cfg);
            match peers.get_mut(&key) {
                Some(p) => match p.readable(&mut ctx) {
                    Ok(()) => (false, p.take_extensions()),
                    Err(e) => {
                        info!("Peer {} read failed: {}", key, e);
                        (true, Vec::new())
                    }
                },
                None => (false, Vec::new()),
            }
        };
        if failed {
            self.remove_peer(key);
        }
        exts
    }

    pub fn on_writable(&mut self, key: PeerKey) {
        let failed = {
            let Control {
                ref mut peers,
                ref mut cache,
                ref mut mgr,
                ref cfg,
                ..
            } = *self;
            let mut ctx = Ctx::new(cache, mgr, cfg);
            match peers.get_mut(&key) {
                Some(p) => match p.writable(&mut ctx) {
                    Ok(()) => false,
                    Err(e) => {
                        info!("Peer {} write failed: {}", key, e);
                        true
                    }
                },
                None => false,
            }
        };
        if failed {
            self.remove_peer(key);
        }
    }

    /// Advertised request queue depth from the peer's extended
    /// handshake, parsed by the embedder.
    pub fn set_peer_reqq(&mut self, key: PeerKey, reqq: usize) {
        if let Some(p) = self.peers.get_mut(&key) {
            p.set_reqq(reqq);
        }
    }

    pub fn set_interested(&mut self, key: PeerKey, interested: bool) {
        let Control {
            ref mut peers,
            ref mut cache,
            ref mut mgr,
            ref cfg,
            ..
        } = *self;
        let mut ctx = Ctx::new(cache, mgr, cfg);
        if let Some(p) = peers.get_mut(&key) {
            if let Err(e) = p.set_interested(&mut ctx, interested) {
                info!("Peer {} interest update failed: {}", key, e);
            }
        }
    }

    pub fn choke(&mut self, key: PeerKey, now: Instant) {
        let Control {
            ref mut peers,
            ref mut cache,
            ref mut mgr,
            ref cfg,
            ..
        } = *self;
        let mut ctx = Ctx::new(cache, mgr, cfg);
        if let Some(p) = peers.get_mut(&key) {
            let _ = p.choke(&mut ctx, now);
        }
    }

    pub fn unchoke(&mut self, key: PeerKey, now: Instant) {
        let Control {
            ref mut peers,
            ref mut cache,
            ref mut mgr,
            ref cfg,
            ..
        } = *self;
        let mut ctx = Ctx::new(cache, mgr, cfg);
        if let Some(p) = peers.get_mut(&key) {
            let _ = p.unchoke(&mut ctx, now);
        }
    }

    /// A piece finished verification; announce to the torrent's peers.
    pub fn piece_verified(&mut self, tid: usize, idx: u32) {
        let Control {
            ref mut peers,
            ref mut cache,
            ref mut mgr,
            ref cfg,
            ref peer_torrent,
            ..
        } = *self;
        let mut ctx = Ctx::new(cache, mgr, cfg);
        for (key, t) in peer_torrent.iter() {
            if *t != tid {
                continue;
            }
            if let Some(p) = peers.get_mut(key) {
                if let Err(e) = p.piece_available(&mut ctx, idx) {
                    info!("Peer {} have announce failed: {}", key, e);
                }
            }
        }
    }

    /// Periodic driver: runs queued tasks, refreshes byte budgets,
    /// sizes and distributes the new-request budget, then pulses every
    /// connection in bandwidth priority order.
    pub fn tick(&mut self, now: Instant) {
        while let Ok(task) = self.tasks.try_recv() {
            task(self);
        }

        let period_ms = (now.saturating_duration_since(self.last_tick).as_millis() as u64)
            .max(1)
            .min(HISTORY_MS);
        self.last_tick = now;

        let (up_order, down_order, observed_bps) = {
            let mut t = self.tree.borrow_mut();
            let up = t.allocate(Direction::Up, period_ms);
            let down = t.allocate(Direction::Down, period_ms);
            let root = t.root();
            (up, down, t.piece_speed_bps(root, Direction::Down, now))
        };

        let snap = self.snapshot(observed_bps);
        let mut budget = alloc::decide_new_request_budget(&snap);
        if budget == 0 && snap.peers.iter().all(|p| snap.active_count(*p) == 0) {
            budget = KICKSTART_BUDGET;
        }
        let grants = alloc::allocate(&snap, budget);

        let mut failed = Vec::new();
        {
            let Control {
                ref mut peers,
                ref mut cache,
                ref mut mgr,
                ref cfg,
                ref node_peer,
                ..
            } = *self;
            let mut ctx = Ctx::new(cache, mgr, cfg);

            // High priority connections draw on contended budgets first.
            for node in &down_order {
                let key = match node_peer.get(node) {
                    Some(k) => *k,
                    None => continue,
                };
                let n = grants.get(&key).cloned().unwrap_or(0);
                if let Some(p) = peers.get_mut(&key) {
                    if let Err(e) = p.grant_requests(&mut ctx, n) {
                        info!("Peer {} request grant failed: {}", key, e);
                        failed.push(key);
                    }
                }
            }

            for node in &up_order {
                let key = match node_peer.get(node) {
                    Some(k) => *k,
                    None => continue,
                };
                if failed.contains(&key) {
                    continue;
                }
                if let Some(p) = peers.get_mut(&key) {
                    if let Err(e) = p.pulse(&mut ctx, now) {
                        info!("Peer {} pulse failed: {}", key, e);
                        failed.push(key);
                    }
                }
            }
        }
        for key in failed {
            self.remove_peer(key);
        }
    }

    /// Freezes the mediator queries the allocator runs over, so the
    /// round is computed against one consistent view.
    fn snapshot(&self, observed_bps: u64) -> Snapshot {
        let mut snap = Snapshot {
            peers: Vec::new(),
            active: FHashMap::default(),
            pools: FHashMap::default(),
            limits: FHashMap::default(),
            caps: FHashMap::default(),
            observed_bps,
            period: self.cfg.request_period_secs,
        };
        snap.limits.insert(SESSION_POOL, self.cfg.session_reqs);
        for (key, peer) in self.peers.iter() {
            if !peer.download_allowed() {
                continue;
            }
            let tid = match self.peer_torrent.get(key) {
                Some(t) => *t,
                None => continue,
            };
            snap.peers.push(*key);
            snap.active.insert(*key, self.mgr.count_active_requests(*key));
            snap.pools
                .insert(*key, vec![torrent_pool(tid), SESSION_POOL]);
            snap.limits
                .insert(torrent_pool(tid), self.cfg.torrent_reqs);
            snap.caps.insert(*key, peer.desired_request_count());
        }
        snap
    }

    #[cfg(test)]
    fn peer_mut(&mut self, key: PeerKey) -> &mut PeerConn<C> {
        self.peers.get_mut(&key).unwrap()
    }
}

/// Point in time mediator the allocator schedules over.
struct Snapshot {
    peers: Vec<PeerKey>,
    active: FHashMap<PeerKey, usize>,
    pools: FHashMap<PeerKey, Vec<PoolKey>>,
    limits: FHashMap<PoolKey, usize>,
    caps: FHashMap<PeerKey, usize>,
    observed_bps: u64,
    period: u64,
}

impl Mediator for Snapshot {
    fn peers(&self) -> Vec<PeerKey> {
        self.peers.clone()
    }

    fn active_count(&self, peer: PeerKey) -> usize {
        self.active.get(&peer).cloned().unwrap_or(0)
    }

    fn pools(&self, peer: PeerKey) -> Vec<PoolKey> {
        self.pools.get(&peer).cloned().unwrap_or_default()
    }

    fn pool_limit(&self, pool: PoolKey) -> usize {
        self.limits.get(&pool).cloned().unwrap_or(usize::max_value())
    }

    fn observed_download_bps(&self) -> u64 {
        self.observed_bps
    }

    fn request_period_secs(&self) -> u64 {
        self.period
    }

    fn max_active(&self, peer: PeerKey) -> Option<usize> {
        self.caps.get(&peer).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cio::test::{TCache, TPeerMgr};
    use crate::cio::BlockSpan;
    use crate::peer::Message;
    use std::io::{self, Read, Write};
    use std::time::Duration;

    /// Loopback-free socket double.
    struct TConn {
        incoming: Vec<u8>,
        pos: usize,
        outgoing: Vec<u8>,
    }

    impl TConn {
        fn new(_bw: Handle) -> TConn {
            TConn {
                incoming: Vec::new(),
                pos: 0,
                outgoing: Vec::new(),
            }
        }
    }

    impl Read for TConn {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.incoming.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, ""));
            }
            let n = buf.len().min(self.incoming.len() - self.pos);
            buf[..n].copy_from_slice(&self.incoming[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Write for TConn {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    type TControl = Control<TConn, TCache, TPeerMgr>;

    fn engine(cfg: Config) -> (TControl, mpsc::Sender<Task<TConn, TCache, TPeerMgr>>) {
        Control::new(cfg, TCache::new(), TPeerMgr::new())
    }

    fn push_msg(ctl: &mut TControl, key: PeerKey, msg: &Message) {
        let conn = ctl.peer_mut(key).conn_mut();
        let start = conn.incoming.len();
        conn.incoming.resize(start + msg.len(), 0);
        msg.encode(&mut conn.incoming[start..]).unwrap();
    }

    fn make_downloader(ctl: &mut TControl, key: PeerKey) {
        ctl.set_interested(key, true);
        push_msg(ctl, key, &Message::Unchoke);
        ctl.on_readable(key);
    }

    fn span(piece: u32, offset: u32) -> BlockSpan {
        BlockSpan {
            piece,
            offset,
            length: 16_384,
        }
    }

    #[test]
    fn test_peer_lifecycle() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        assert!(ctl.add_peer(1, 10, TConn::new, 64, false, false));
        assert!(!ctl.add_peer(2, 11, TConn::new, 64, false, false));
        assert_eq!(ctl.num_peers(), 1);

        ctl.remove_torrent(1);
        assert_eq!(ctl.num_peers(), 0);
        // Stale keys are harmless
        ctl.on_readable(10);
        ctl.remove_peer(10);
    }

    #[test]
    fn test_tick_grants_requests() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, false);
        make_downloader(&mut ctl, 10);
        ctl.mgr
            .queued
            .insert(10, (0..4).map(|i| span(0, i * 16_384)).collect());

        ctl.tick(Instant::now());
        assert_eq!(ctl.mgr.sent.len(), 4);
        let out = &ctl.peer_mut(10).conn_mut().outgoing;
        assert!(!out.is_empty());
    }

    #[test]
    fn test_tick_respects_session_pool() {
        let mut cfg = Config::default();
        cfg.session_reqs = 10;
        let (mut ctl, _tx) = engine(cfg);
        ctl.add_torrent(1);
        for key in 10..12 {
            ctl.add_peer(1, key, TConn::new, 64, false, false);
            make_downloader(&mut ctl, key);
            ctl.mgr
                .queued
                .insert(key, (0..50).map(|i| span(0, i * 16_384)).collect());
        }

        ctl.tick(Instant::now());
        assert!(ctl.mgr.sent.len() <= 10);
        assert!(!ctl.mgr.sent.is_empty());
    }

    #[test]
    fn test_choked_peer_gets_nothing() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, false);
        ctl.set_interested(10, true);
        // Never unchoked by the remote
        ctl.mgr.queued.insert(10, vec![span(0, 0)]);
        ctl.tick(Instant::now());
        assert!(ctl.mgr.sent.is_empty());
    }

    #[test]
    fn test_paused_torrent_gets_nothing() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, false);
        make_downloader(&mut ctl, 10);
        ctl.set_torrent_rate(1, Direction::Down, Some(0));
        ctl.mgr.queued.insert(10, vec![span(0, 0)]);
        ctl.tick(Instant::now());
        assert!(ctl.mgr.sent.is_empty());

        ctl.set_torrent_rate(1, Direction::Down, None);
        ctl.tick(Instant::now() + Duration::from_secs(2));
        assert_eq!(ctl.mgr.sent.len(), 1);
    }

    #[test]
    fn test_tasks_run_on_tick() {
        let (mut ctl, tx) = engine(Config::default());
        ctl.add_torrent(1);
        tx.send(Box::new(|c: &mut TControl| {
            c.set_torrent_rate(1, Direction::Up, Some(5_000));
        }))
        .unwrap();
        ctl.tick(Instant::now());
        let node = ctl.torrents.get(&1).unwrap().node;
        assert_eq!(
            ctl.tree.borrow().effective_limit_bps(node, Direction::Up),
            Some(5_000)
        );
    }

    #[test]
    fn test_bad_wire_data_removes_peer() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, false);
        // Unknown message id
        let conn = ctl.peer_mut(10).conn_mut();
        conn.incoming.extend_from_slice(&[0, 0, 0, 1, 12]);
        ctl.on_readable(10);
        assert_eq!(ctl.num_peers(), 0);
        // Its bandwidth node went too; only the torrent node remains
        assert_eq!(
            ctl.tree.borrow_mut().allocate(Direction::Down, 1_000).len(),
            1
        );
    }

    #[test]
    fn test_extension_reaches_embedder() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, true);
        push_msg(
            &mut ctl,
            10,
            &Message::Extension {
                id: 0,
                payload: b"d4:reqqi20ee".to_vec(),
            },
        );
        let exts = ctl.on_readable(10);
        assert_eq!(exts, vec![(0, b"d4:reqqi20ee".to_vec())]);

        // The embedder feeds the advertised depth back; it caps the
        // pipeline at the next tick.
        ctl.set_peer_reqq(10, 20);
        ctl.tick(Instant::now());
        assert_eq!(ctl.peer_mut(10).desired_request_count(), 20);
    }

    #[test]
    fn test_piece_verified_announces() {
        let (mut ctl, _tx) = engine(Config::default());
        ctl.add_torrent(1);
        ctl.add_peer(1, 10, TConn::new, 64, false, false);
        ctl.piece_verified(1, 5);
        // Haves are batched at low urgency; a pulse past the deadline
        // flushes them.
        ctl.tick(Instant::now() + Duration::from_secs(11));
        let out = &ctl.peer_mut(10).conn_mut().outgoing;
        assert_eq!(&out[..], &[0, 0, 0, 5, 4, 0, 0, 0, 5]);
    }
}
