use crate::util::FHashMap;
use crate::BLOCK_SZ;

pub type PeerKey = usize;
pub type PoolKey = usize;

/// Read-only snapshot the allocator schedules over. Production state
/// and test doubles both sit behind this; it is the sole coupling
/// point between the scheduler and the rest of the engine.
pub trait Mediator {
    fn peers(&self) -> Vec<PeerKey>;
    fn active_count(&self, peer: PeerKey) -> usize;
    /// Pools the peer draws from, most specific first.
    fn pools(&self, peer: PeerKey) -> Vec<PoolKey>;
    fn pool_limit(&self, pool: PoolKey) -> usize;
    fn observed_download_bps(&self) -> u64;
    fn request_period_secs(&self) -> u64;
    fn max_active(&self, peer: PeerKey) -> Option<usize>;
}

/// Global sizing of how many new requests should be issued this round:
/// enough to keep the pipe full for one period at the observed rate,
/// less what is already in flight.
pub fn decide_new_request_budget<M: Mediator>(m: &M) -> usize {
    let window = m
        .observed_download_bps()
        .saturating_mul(m.request_period_secs()) as usize
        / BLOCK_SZ;
    let active: usize = m.peers().iter().map(|p| m.active_count(*p)).sum();
    window.saturating_sub(active)
}

struct PeerState {
    key: PeerKey,
    active: usize,
    cap: Option<usize>,
    total: usize,
    frozen: bool,
}

struct Pool {
    limit: usize,
    members: Vec<usize>,
}

fn aggregate(peers: &[PeerState], pool: &Pool) -> usize {
    pool.members.iter().map(|&i| peers[i].total).sum()
}

fn can_take(peers: &[PeerState], pools: &[Pool], idx: usize) -> bool {
    let p = &peers[idx];
    if let Some(c) = p.cap {
        if p.total + 1 > c {
            return false;
        }
    }
    pools
        .iter()
        .all(|pool| !pool.members.contains(&idx) || aggregate(peers, pool) + 1 <= pool.limit)
}

/// Max-min fair water-fill: raise a common target total uniformly over
/// every unconstrained peer until a pool saturates, a peer hits its
/// cap, or the budget runs out; freeze whatever bound and keep raising
/// the rest. Pure function of the snapshot; nothing carries over
/// between rounds.
pub fn allocate<M: Mediator>(m: &M, budget: usize) -> FHashMap<PeerKey, usize> {
    let mut keys = m.peers();
    keys.sort_unstable();
    keys.dedup();

    let mut peers: Vec<PeerState> = keys
        .iter()
        .map(|&k| {
            let active = m.active_count(k);
            PeerState {
                key: k,
                active,
                cap: m.max_active(k),
                total: active,
                frozen: false,
            }
        })
        .collect();

    let mut pool_keys: Vec<PoolKey> = Vec::new();
    let mut memberships: Vec<Vec<PoolKey>> = Vec::with_capacity(peers.len());
    for p in &peers {
        let ps = m.pools(p.key);
        for &pk in &ps {
            if !pool_keys.contains(&pk) {
                pool_keys.push(pk);
            }
        }
        memberships.push(ps);
    }
    pool_keys.sort_unstable();
    let pools: Vec<Pool> = pool_keys
        .iter()
        .map(|&pk| Pool {
            limit: m.pool_limit(pk),
            members: (0..peers.len())
                .filter(|&i| memberships[i].contains(&pk))
                .collect(),
        })
        .collect();

    let mut t = 0usize;
    let mut left = budget;

    loop {
        // Freeze whatever already sits on a bound.
        for i in 0..peers.len() {
            if !peers[i].frozen && peers[i].cap.map_or(false, |c| peers[i].total >= c) {
                peers[i].frozen = true;
            }
        }
        let mut froze_pool = false;
        for pool in &pools {
            if aggregate(&peers, pool) >= pool.limit {
                for &i in &pool.members {
                    if !peers[i].frozen {
                        peers[i].frozen = true;
                        froze_pool = true;
                    }
                }
            }
        }
        if froze_pool {
            continue;
        }

        if left == 0 {
            break;
        }

        let growing: Vec<usize> = (0..peers.len())
            .filter(|&i| !peers[i].frozen && peers[i].active <= t)
            .collect();
        let dormant_min = peers
            .iter()
            .filter(|p| !p.frozen && p.active > t)
            .map(|p| p.active)
            .min();

        if growing.is_empty() {
            match dormant_min {
                Some(a) => {
                    t = a;
                    continue;
                }
                None => break,
            }
        }

        let g = growing.len();
        let mut step = left / g;
        if let Some(a) = dormant_min {
            step = step.min(a - t);
        }
        for &i in &growing {
            if let Some(c) = peers[i].cap {
                step = step.min(c - t);
            }
        }
        for pool in &pools {
            let gp = pool
                .members
                .iter()
                .filter(|&&i| growing.contains(&i))
                .count();
            if gp > 0 {
                step = step.min(pool.limit.saturating_sub(aggregate(&peers, pool)) / gp);
            }
        }

        if step > 0 {
            t += step;
            left -= step * g;
            for &i in &growing {
                peers[i].total = t;
            }
            continue;
        }

        // A constraint binds before every growing peer can take one
        // more unit. Hand out the integer remainder a unit at a time.
        let mut partial_pool = None;
        for (pi, pool) in pools.iter().enumerate() {
            let gp = pool
                .members
                .iter()
                .filter(|&&i| growing.contains(&i))
                .count();
            if gp > 0 && pool.limit.saturating_sub(aggregate(&peers, pool)) < gp {
                partial_pool = Some(pi);
                break;
            }
        }
        if let Some(pi) = partial_pool {
            let members: Vec<usize> = pools[pi]
                .members
                .iter()
                .cloned()
                .filter(|i| growing.contains(i))
                .collect();
            for &i in &members {
                if left == 0 {
                    break;
                }
                if can_take(&peers, &pools, i) {
                    peers[i].total += 1;
                    left -= 1;
                }
            }
            for &i in &pools[pi].members {
                peers[i].frozen = true;
            }
            continue;
        }

        // Budget remainder: fewer units left than growing peers.
        for &i in &growing {
            if left == 0 {
                break;
            }
            if can_take(&peers, &pools, i) {
                peers[i].total += 1;
                left -= 1;
            }
        }
        break;
    }

    peers
        .iter()
        .map(|p| (p.key, p.total - p.active))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::FHashMap;

    /// In-memory snapshot double.
    struct TestMediator {
        peers: Vec<PeerKey>,
        active: FHashMap<PeerKey, usize>,
        pools: FHashMap<PeerKey, Vec<PoolKey>>,
        limits: FHashMap<PoolKey, usize>,
        caps: FHashMap<PeerKey, usize>,
        dl_bps: u64,
        period: u64,
    }

    impl TestMediator {
        fn new() -> TestMediator {
            TestMediator {
                peers: Vec::new(),
                active: FHashMap::default(),
                pools: FHashMap::default(),
                limits: FHashMap::default(),
                caps: FHashMap::default(),
                dl_bps: 0,
                period: 1,
            }
        }

        fn add_peer(&mut self, key: PeerKey, active: usize, pools: Vec<PoolKey>) {
            self.peers.push(key);
            self.active.insert(key, active);
            self.pools.insert(key, pools);
        }
    }

    impl Mediator for TestMediator {
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
            self.dl_bps
        }

        fn request_period_secs(&self) -> u64 {
            self.period
        }

        fn max_active(&self, peer: PeerKey) -> Option<usize> {
            self.caps.get(&peer).cloned()
        }
    }

    fn check_invariants(m: &TestMediator, budget: usize, res: &FHashMap<PeerKey, usize>) {
        assert!(res.values().sum::<usize>() <= budget);
        for (&pool, &limit) in &m.limits {
            let total: usize = m
                .peers
                .iter()
                .filter(|p| m.pools(**p).contains(&pool))
                .map(|p| m.active_count(*p) + res.get(p).cloned().unwrap_or(0))
                .sum();
            assert!(total <= limit, "pool {} over limit: {} > {}", pool, total, limit);
        }
        for (&peer, &cap) in &m.caps {
            let total = m.active_count(peer) + res.get(&peer).cloned().unwrap_or(0);
            assert!(total <= cap);
        }
    }

    #[test]
    fn test_budget_sizing() {
        let mut m = TestMediator::new();
        m.dl_bps = 16_384 * 10;
        m.period = 1;
        assert_eq!(decide_new_request_budget(&m), 10);
        // Linear in the period
        m.period = 2;
        assert_eq!(decide_new_request_budget(&m), 20);
        // Linear in the rate
        m.dl_bps *= 3;
        assert_eq!(decide_new_request_budget(&m), 60);
        // Active requests subtract exactly
        m.add_peer(1, 14, vec![]);
        assert_eq!(decide_new_request_budget(&m), 46);
        m.add_peer(2, 50, vec![]);
        assert_eq!(decide_new_request_budget(&m), 0);
    }

    #[test]
    fn test_even_split() {
        let mut m = TestMediator::new();
        for k in 0..3 {
            m.add_peer(k, 0, vec![]);
        }
        let res = allocate(&m, 12);
        for k in 0..3 {
            assert_eq!(res[&k], 4);
        }
        check_invariants(&m, 12, &res);
    }

    #[test]
    fn test_pool_limits() {
        let mut m = TestMediator::new();
        const TOR: PoolKey = 10;
        const SES: PoolKey = 11;
        m.limits.insert(TOR, 50);
        m.limits.insert(SES, 100);
        m.add_peer(1, 0, vec![TOR, SES]);
        m.add_peer(2, 0, vec![TOR, SES]);
        m.add_peer(3, 0, vec![SES]);
        let res = allocate(&m, 1_000);
        assert_eq!(res[&1], 25);
        assert_eq!(res[&2], 25);
        assert_eq!(res[&3], 50);
        check_invariants(&m, 1_000, &res);
    }

    #[test]
    fn test_pool_limits_with_backlog() {
        let mut m = TestMediator::new();
        const TOR: PoolKey = 10;
        const SES: PoolKey = 11;
        m.limits.insert(TOR, 50);
        m.limits.insert(SES, 100);
        m.add_peer(1, 10, vec![TOR, SES]);
        m.add_peer(2, 0, vec![TOR, SES]);
        m.add_peer(3, 0, vec![SES]);
        let res = allocate(&m, 1_000);
        assert_eq!(res[&1], 15);
        assert_eq!(res[&2], 25);
        assert_eq!(res[&3], 50);
        check_invariants(&m, 1_000, &res);
    }

    #[test]
    fn test_budget_exhaustion_equalizes() {
        let mut m = TestMediator::new();
        m.add_peer(1, 10, vec![]);
        m.add_peer(2, 0, vec![]);
        m.add_peer(3, 0, vec![]);
        let res = allocate(&m, 23);
        assert_eq!(res[&1], 1);
        assert_eq!(res[&2], 11);
        assert_eq!(res[&3], 11);
        check_invariants(&m, 23, &res);
    }

    #[test]
    fn test_peer_cap() {
        let mut m = TestMediator::new();
        m.add_peer(1, 15, vec![]);
        m.add_peer(2, 0, vec![]);
        m.add_peer(3, 0, vec![]);
        m.caps.insert(1, 40);
        let res = allocate(&m, 200);
        // The capped peer stops at 25 new; the rest flows on.
        assert_eq!(res[&1], 25);
        assert_eq!(res[&2] + res[&3], 175);
        assert!((res[&2] as i64 - res[&3] as i64).abs() <= 1);
        check_invariants(&m, 200, &res);
    }

    #[test]
    fn test_cap_below_active() {
        let mut m = TestMediator::new();
        m.add_peer(1, 30, vec![]);
        m.caps.insert(1, 10);
        let res = allocate(&m, 100);
        assert_eq!(res[&1], 0);
    }

    #[test]
    fn test_overfull_pool_absorbed() {
        // A pool limit below the existing load is not an error, just
        // zero new allocation for its members.
        let mut m = TestMediator::new();
        const TOR: PoolKey = 7;
        m.limits.insert(TOR, 10);
        m.add_peer(1, 20, vec![TOR]);
        m.add_peer(2, 5, vec![TOR]);
        m.add_peer(3, 0, vec![]);
        let res = allocate(&m, 40);
        assert_eq!(res[&1], 0);
        assert_eq!(res[&2], 0);
        assert_eq!(res[&3], 40);
    }

    #[test]
    fn test_pool_remainder_split() {
        let mut m = TestMediator::new();
        const TOR: PoolKey = 3;
        m.limits.insert(TOR, 7);
        m.add_peer(1, 0, vec![TOR]);
        m.add_peer(2, 0, vec![TOR]);
        let res = allocate(&m, 100);
        assert_eq!(res[&1] + res[&2], 7);
        assert!((res[&1] as i64 - res[&2] as i64).abs() <= 1);
        check_invariants(&m, 100, &res);
    }

    #[test]
    fn test_absent_peers_absent() {
        let mut m = TestMediator::new();
        m.add_peer(4, 0, vec![]);
        let res = allocate(&m, 10);
        assert_eq!(res.len(), 1);
        assert!(res.get(&9).is_none());
    }

    #[test]
    fn test_zero_budget() {
        let mut m = TestMediator::new();
        m.add_peer(1, 5, vec![]);
        let res = allocate(&m, 0);
        assert_eq!(res[&1], 0);
    }
}
