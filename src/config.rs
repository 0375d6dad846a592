use serde_derive::{Deserialize, Serialize};

/// Engine configuration. A rate of 0 means unlimited.
#[derive(Debug, Clone)]
pub struct Config {
    /// Session wide upload cap, bytes/sec
    pub rate_ul: u64,
    /// Session wide download cap, bytes/sec
    pub rate_dl: u64,
    /// Max concurrent block requests across the whole session
    pub session_reqs: usize,
    /// Max concurrent block requests per torrent
    pub torrent_reqs: usize,
    /// Sizing period for the per-round new-request budget
    pub request_period_secs: u64,
    /// Look-ahead window used to size a connection's request queue
    pub lookahead_secs: u64,
    /// Flush delay for low urgency outbound messages, ms
    pub batch_low_ms: u64,
    /// Flush delay for high urgency outbound messages, ms
    pub batch_high_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct ConfigFile {
    pub rate_ul: Option<u64>,
    pub rate_dl: Option<u64>,
    pub session_reqs: Option<usize>,
    pub torrent_reqs: Option<usize>,
    pub request_period_secs: Option<u64>,
    pub lookahead_secs: Option<u64>,
    pub batch_low_ms: Option<u64>,
    pub batch_high_ms: Option<u64>,
}

impl Config {
    pub fn from_file(file: ConfigFile) -> Config {
        let mut base: Config = Default::default();
        if let Some(r) = file.rate_ul {
            base.rate_ul = r
        }
        if let Some(r) = file.rate_dl {
            base.rate_dl = r
        }
        if let Some(r) = file.session_reqs {
            base.session_reqs = r
        }
        if let Some(r) = file.torrent_reqs {
            base.torrent_reqs = r
        }
        if let Some(p) = file.request_period_secs {
            base.request_period_secs = p
        }
        if let Some(w) = file.lookahead_secs {
            base.lookahead_secs = w
        }
        if let Some(d) = file.batch_low_ms {
            base.batch_low_ms = d
        }
        if let Some(d) = file.batch_high_ms {
            base.batch_high_ms = d
        }
        base
    }

    pub fn load(data: &str) -> Config {
        match toml::from_str(data) {
            Ok(file) => Config::from_file(file),
            Err(e) => {
                error!("Could not parse config: {}", e);
                Default::default()
            }
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            rate_ul: 0,
            rate_dl: 0,
            session_reqs: 1024,
            torrent_reqs: 256,
            request_period_secs: 2,
            lookahead_secs: 10,
            batch_low_ms: 10_000,
            batch_high_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Config;

    #[test]
    fn test_load_partial() {
        let cfg = Config::load("rate_dl = 1000000\ntorrent_reqs = 50\n");
        assert_eq!(cfg.rate_dl, 1_000_000);
        assert_eq!(cfg.torrent_reqs, 50);
        assert_eq!(cfg.rate_ul, 0);
        assert_eq!(cfg.session_reqs, 1024);
    }

    #[test]
    fn test_load_bad() {
        let cfg = Config::load("rate_dl = [1, 2]");
        assert_eq!(cfg.rate_dl, 0);
    }
}
