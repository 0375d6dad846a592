use std::fmt;

/// Tracks which pieces a side of a connection holds. Indices are u64
/// to match the wire's 4-byte big endian piece numbers without casts
/// sprinkled through callers.
#[derive(Clone, PartialEq)]
pub struct Bitfield {
    len: u64,
    data: Box<[u8]>,
}

impl Bitfield {
    pub fn new(len: u64) -> Bitfield {
        let size = (len + 7) / 8;
        Bitfield {
            len,
            data: vec![0; size as usize].into_boxed_slice(),
        }
    }

    pub fn from(data: Box<[u8]>, len: u64) -> Bitfield {
        Bitfield { len, data }
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn bytes(&self) -> usize {
        self.data.len()
    }

    pub fn byte_at(&self, pos: usize) -> u8 {
        self.data[pos]
    }

    pub fn complete(&self) -> bool {
        (0..self.len).all(|i| self.has_bit(i))
    }

    pub fn has_bit(&self, pos: u64) -> bool {
        debug_assert!(pos < self.len);
        if pos >= self.len {
            false
        } else {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            let block = self.data[block_pos as usize];
            ((block >> index) & 1) == 1
        }
    }

    pub fn set_bit(&mut self, pos: u64) {
        debug_assert!(pos < self.len);
        if pos < self.len {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            self.data[block_pos as usize] |= 1 << index;
        }
    }

    pub fn unset_bit(&mut self, pos: u64) {
        debug_assert!(pos < self.len);
        if pos < self.len {
            let block_pos = pos / 8;
            let index = 7 - (pos % 8);
            self.data[block_pos as usize] &= !(1 << index);
        }
    }

    pub fn set_all(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0xff;
        }
    }

    pub fn unset_all(&mut self) {
        for b in self.data.iter_mut() {
            *b = 0;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.len).filter(move |i| self.has_bit(*i))
    }
}

impl fmt::Debug for Bitfield {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitfield {{ len: {}, set: {} }}", self.len, self.iter().count())
    }
}
