#[macro_use]
pub mod log;
pub mod alloc;
pub mod bandwidth;
pub mod bitfield;
pub mod buffers;
pub mod cio;
pub mod config;
pub mod control;
pub mod peer;
pub mod socket;
pub mod util;

use lazy_static::lazy_static;

/// Fixed transfer unit requested and sent over the wire.
pub const BLOCK_SZ: usize = 16_384;

lazy_static! {
    pub static ref PEER_ID: [u8; 20] = {
        use rand::Rng;

        let mut id = [0u8; 20];
        id[..8].copy_from_slice(b"-SL0010-");
        let mut rng = rand::thread_rng();
        for b in id.iter_mut().skip(8) {
            *b = rng.gen_range(b'0', b'9' + 1);
        }
        id
    };
}
