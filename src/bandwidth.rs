use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::{self, Rng};

/// Trailing interval a rate estimate is computed over.
pub const HISTORY_MS: u64 = 2_000;
/// Sample bucket width of the rate window.
const GRANULARITY_MS: u64 = 250;
const WINDOW_SLOTS: usize = (HISTORY_MS / GRANULARITY_MS) as usize;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Direction {
    Up = 0,
    Down = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeId(usize);

/// Fixed size circular sample buffer answering "bytes moved in the
/// last N ms".
pub struct RateWindow {
    slots: [Sample; WINDOW_SLOTS],
    newest: usize,
}

#[derive(Clone, Copy)]
struct Sample {
    at: Option<Instant>,
    bytes: u64,
}

impl RateWindow {
    pub fn new() -> RateWindow {
        RateWindow {
            slots: [Sample {
                at: None,
                bytes: 0,
            }; WINDOW_SLOTS],
            newest: 0,
        }
    }

    pub fn record(&mut self, now: Instant, bytes: u64) {
        let granularity = Duration::from_millis(GRANULARITY_MS);
        let cur = &mut self.slots[self.newest];
        match cur.at {
            Some(at) if now.saturating_duration_since(at) < granularity => {
                cur.bytes += bytes;
            }
            _ => {
                self.newest = (self.newest + 1) % WINDOW_SLOTS;
                self.slots[self.newest] = Sample {
                    at: Some(now),
                    bytes,
                };
            }
        }
    }

    pub fn bytes_in(&self, now: Instant, interval_ms: u64) -> u64 {
        let cutoff = now.checked_sub(Duration::from_millis(interval_ms));
        self.slots
            .iter()
            .filter(|s| match (s.at, cutoff) {
                (Some(at), Some(c)) => at >= c,
                (Some(_), None) => true,
                (None, _) => false,
            })
            .map(|s| s.bytes)
            .sum()
    }

    pub fn speed_bps(&self, now: Instant) -> u64 {
        self.bytes_in(now, HISTORY_MS) * 1_000 / HISTORY_MS
    }
}

struct Band {
    raw: RateWindow,
    piece: RateWindow,
    bytes_left: u64,
    desired_bps: u64,
    limited: bool,
    honors_parent: bool,
}

impl Band {
    fn new() -> Band {
        Band {
            raw: RateWindow::new(),
            piece: RateWindow::new(),
            bytes_left: 0,
            desired_bps: 0,
            limited: false,
            honors_parent: true,
        }
    }
}

struct Node {
    bands: [Band; 2],
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    priority: Priority,
}

/// Tree of byte rate budgets: root = session, inner nodes = torrents,
/// leaves = peer connections. Nodes live in an arena and are addressed
/// by index; the parent link is a plain index used only for upward
/// walks in `clamp` and `notify_consumed`.
pub struct Tree {
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    root: NodeId,
}

impl Tree {
    pub fn new() -> Tree {
        let root = Node {
            bands: [Band::new(), Band::new()],
            parent: None,
            children: Vec::new(),
            priority: Priority::Normal,
        };
        Tree {
            nodes: vec![Some(root)],
            free: Vec::new(),
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0).and_then(|n| n.as_ref())
    }

    fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0).and_then(|n| n.as_mut())
    }

    pub fn add_node(&mut self, parent: NodeId) -> NodeId {
        let node = Node {
            bands: [Band::new(), Band::new()],
            parent: Some(parent),
            children: Vec::new(),
            priority: Priority::Normal,
        };
        let id = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                NodeId(idx)
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        };
        if let Some(p) = self.get_mut(parent) {
            p.children.push(id);
        }
        id
    }

    /// Removes a node and its entire subtree. Removing the root or an
    /// already removed node is a no-op.
    pub fn remove_node(&mut self, id: NodeId) {
        if id == self.root {
            return;
        }
        let parent = match self.get(id) {
            Some(n) => n.parent,
            None => return,
        };
        if let Some(p) = parent.and_then(|p| self.get_mut(p)) {
            p.children.retain(|c| *c != id);
        }
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes[cur.0].take() {
                stack.extend(node.children);
                self.free.push(cur.0);
            }
        }
    }

    pub fn set_rate(&mut self, id: NodeId, dir: Direction, bps: u64) {
        if let Some(n) = self.get_mut(id) {
            n.bands[dir as usize].desired_bps = bps;
        }
    }

    pub fn set_limited(&mut self, id: NodeId, dir: Direction, limited: bool) {
        if let Some(n) = self.get_mut(id) {
            n.bands[dir as usize].limited = limited;
        }
    }

    pub fn set_honors_parent(&mut self, id: NodeId, dir: Direction, honors: bool) {
        if let Some(n) = self.get_mut(id) {
            n.bands[dir as usize].honors_parent = honors;
        }
    }

    pub fn set_priority(&mut self, id: NodeId, priority: Priority) {
        if let Some(n) = self.get_mut(id) {
            n.priority = priority;
        }
    }

    /// Records moved bytes against the node and every ancestor that
    /// the chain below it honors, deducting from each limited budget.
    /// Calls against removed nodes are no-ops.
    pub fn notify_consumed(
        &mut self,
        id: NodeId,
        dir: Direction,
        bytes: u64,
        is_piece: bool,
        now: Instant,
    ) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = match self.get_mut(c) {
                Some(n) => n,
                None => break,
            };
            let band = &mut node.bands[dir as usize];
            band.raw.record(now, bytes);
            if is_piece {
                band.piece.record(now, bytes);
            }
            if band.limited {
                band.bytes_left = band.bytes_left.saturating_sub(bytes);
            }
            cur = if band.honors_parent { node.parent } else { None };
        }
    }

    /// Records payload bytes in the piece windows along the honoring
    /// path without touching any budget. Raw consumption was already
    /// deducted at the socket; this only reclassifies it.
    pub fn notify_piece(&mut self, id: NodeId, dir: Direction, bytes: u64, now: Instant) {
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = match self.get_mut(c) {
                Some(n) => n,
                None => break,
            };
            let band = &mut node.bands[dir as usize];
            band.piece.record(now, bytes);
            cur = if band.honors_parent { node.parent } else { None };
        }
    }

    /// Refreshes every node's byte budget for the next period and
    /// returns the leaf (connection) ids, shuffled within a priority
    /// class and ordered high priority first. Flushing connections in
    /// that order is what hands higher priority peers their full share
    /// of a contended ancestor budget before lower priority ones see
    /// any remainder.
    pub fn allocate(&mut self, dir: Direction, period_ms: u64) -> Vec<NodeId> {
        self.alloc_node(self.root, dir, period_ms, None);
        let mut peers: Vec<NodeId> = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| match n {
                Some(node) if node.children.is_empty() && NodeId(i) != self.root => {
                    Some(NodeId(i))
                }
                _ => None,
            })
            .collect();
        rand::thread_rng().shuffle(&mut peers);
        peers.sort_by(|a, b| {
            let pa = self.get(*a).map(|n| n.priority).unwrap_or(Priority::Normal);
            let pb = self.get(*b).map(|n| n.priority).unwrap_or(Priority::Normal);
            pb.cmp(&pa)
        });
        peers
    }

    fn alloc_node(
        &mut self,
        id: NodeId,
        dir: Direction,
        period_ms: u64,
        supply: Option<u64>,
    ) {
        let (children, child_supply) = {
            let node = match self.get_mut(id) {
                Some(n) => n,
                None => return,
            };
            let band = &mut node.bands[dir as usize];
            let child_supply = if band.limited {
                let own = band.desired_bps.saturating_mul(period_ms) / 1_000;
                let effective = match (band.honors_parent, supply) {
                    (true, Some(s)) => own.min(s),
                    _ => own,
                };
                band.bytes_left = effective;
                Some(effective)
            } else {
                band.bytes_left = 0;
                if band.honors_parent {
                    supply
                } else {
                    None
                }
            };
            (node.children.clone(), child_supply)
        };
        for c in children {
            self.alloc_node(c, dir, period_ms, child_supply);
        }
    }

    /// How many of `wanted` bytes may move right now: the minimum
    /// remaining budget along the honoring path to the root.
    pub fn clamp(&self, id: NodeId, dir: Direction, wanted: usize) -> usize {
        let mut allowed = wanted as u64;
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = match self.get(c) {
                Some(n) => n,
                None => break,
            };
            let band = &node.bands[dir as usize];
            if band.limited {
                allowed = allowed.min(band.bytes_left);
            }
            cur = if band.honors_parent { node.parent } else { None };
        }
        allowed as usize
    }

    pub fn speed_bps(&self, id: NodeId, dir: Direction, now: Instant) -> u64 {
        self.get(id)
            .map(|n| n.bands[dir as usize].raw.speed_bps(now))
            .unwrap_or(0)
    }

    pub fn piece_speed_bps(&self, id: NodeId, dir: Direction, now: Instant) -> u64 {
        self.get(id)
            .map(|n| n.bands[dir as usize].piece.speed_bps(now))
            .unwrap_or(0)
    }

    /// Smallest configured rate along the honoring path, if any node
    /// on it is limited. Used to bound request queue sizing.
    pub fn effective_limit_bps(&self, id: NodeId, dir: Direction) -> Option<u64> {
        let mut limit: Option<u64> = None;
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = match self.get(c) {
                Some(n) => n,
                None => break,
            };
            let band = &node.bands[dir as usize];
            if band.limited {
                limit = Some(limit.map_or(band.desired_bps, |l| l.min(band.desired_bps)));
            }
            cur = if band.honors_parent { node.parent } else { None };
        }
        limit
    }
}

/// Clone-able per connection view of one tree node, shared with the
/// socket layer for clamping and consumption accounting. The tree is
/// only ever touched from the network thread.
#[derive(Clone)]
pub struct Handle {
    tree: Rc<RefCell<Tree>>,
    node: NodeId,
}

impl Handle {
    pub fn new(tree: Rc<RefCell<Tree>>, node: NodeId) -> Handle {
        Handle { tree, node }
    }

    pub fn id(&self) -> NodeId {
        self.node
    }

    pub fn clamp(&self, dir: Direction, wanted: usize) -> usize {
        self.tree.borrow().clamp(self.node, dir, wanted)
    }

    pub fn notify_consumed(&self, dir: Direction, bytes: u64, is_piece: bool, now: Instant) {
        self.tree
            .borrow_mut()
            .notify_consumed(self.node, dir, bytes, is_piece, now);
    }

    pub fn notify_piece(&self, dir: Direction, bytes: u64, now: Instant) {
        self.tree
            .borrow_mut()
            .notify_piece(self.node, dir, bytes, now);
    }

    pub fn piece_speed_bps(&self, dir: Direction, now: Instant) -> u64 {
        self.tree.borrow().piece_speed_bps(self.node, dir, now)
    }

    pub fn effective_limit_bps(&self, dir: Direction) -> Option<u64> {
        self.tree.borrow().effective_limit_bps(self.node, dir)
    }
}
