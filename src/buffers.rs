use std::ops::{Deref, DerefMut};
use std::sync::atomic;

use crate::BLOCK_SZ;

/// Upper bound on simultaneously live block buffers (64 MiB of payload).
const MAX_BUFS: usize = 4096;
static BUF_COUNT: atomic::AtomicUsize = atomic::AtomicUsize::new(0);

/// A pooled 16 KiB block buffer. Acquisition fails once the global
/// cap is reached, which backpressures piece serving.
pub struct Buffer {
    data: Box<[u8; BLOCK_SZ]>,
}

impl Buffer {
    pub fn get() -> Option<Buffer> {
        Buffer::get_under(MAX_BUFS)
    }

    fn get_under(cap: usize) -> Option<Buffer> {
        if BUF_COUNT.load(atomic::Ordering::Acquire) >= cap {
            return None;
        }
        BUF_COUNT.fetch_add(1, atomic::Ordering::AcqRel);
        Some(Buffer {
            data: Box::new([0u8; BLOCK_SZ]),
        })
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Buffer {
        BUF_COUNT.fetch_add(1, atomic::Ordering::AcqRel);
        Buffer {
            data: self.data.clone(),
        }
    }
}

impl Deref for Buffer {
    type Target = [u8; BLOCK_SZ];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.data
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        BUF_COUNT.fetch_sub(1, atomic::Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::Buffer;

    #[test]
    fn test_cap_blocks_acquisition() {
        let held = Buffer::get().unwrap();
        // The held buffer keeps the live count at one or more, so a
        // cap of one is already exhausted regardless of what other
        // tests hold concurrently.
        assert!(Buffer::get_under(1).is_none());
        drop(held);
        assert!(Buffer::get().is_some());
    }
}
