use std::ops::Range;

use bitvec::prelude::*;
use log::warn;

/// a bit-per-resource free space tracker, a set bit means "in use"
///
/// [Bitmap::mark_used] and [Bitmap::mark_free] are the only mutation points,
/// they keep `free` equal to the number of zero bits
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitmap {
    bits: BitVec<u8, Lsb0>,
    free: u32,
}

/// for serialize and deserialize
impl Bitmap {
    /// an all-free bitmap tracking `len` elements
    pub fn new(len: u32) -> Self {
        Bitmap {
            bits: BitVec::repeat(false, len as usize),
            free: len,
        }
    }

    /// restore a bitmap from its persisted bytes,
    /// bits past `len` are ignored and missing bytes read as free
    pub fn from_raw(raw: &[u8], len: u32) -> Self {
        let mut bits = BitVec::<u8, Lsb0>::from_slice(raw);
        bits.resize(len as usize, false);
        let free = bits.count_zeros() as u32;
        Bitmap { bits, free }
    }

    /// the bytes to persist, bits past `len` are zero
    pub fn to_raw(&self) -> Vec<u8> {
        let mut raw = self.bits.as_raw_slice().to_vec();
        let tail = self.bits.len() % 8;
        if let (Some(last), true) = (raw.last_mut(), tail != 0) {
            *last &= (1u8 << tail) - 1;
        }
        raw
    }
}

impl Bitmap {
    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// the number of free elements
    pub fn free(&self) -> u32 {
        self.free
    }

    /// check if element `i` is in use, out of range elements are not
    pub fn is_used(&self, i: u32) -> bool {
        self.bits.get(i as usize).as_deref() == Some(&true)
    }

    /// whether every element of `range` exists and is free
    pub fn is_range_free(&self, range: Range<u32>) -> bool {
        range.end <= self.len()
            && range.start <= range.end
            && self.bits[range.start as usize..range.end as usize].not_any()
    }

    /// first-fit search for `n` consecutive free elements
    /// # Return
    /// index of the first element of the run
    pub fn find_free_run(&self, n: u32) -> Option<u32> {
        let n = n as usize;
        if n == 0 || n > self.free as usize {
            return None;
        }
        let mut start = 0;
        while start + n <= self.bits.len() {
            match self.bits[start..start + n].last_one() {
                None => return Some(start as u32),
                // no run can start at or before the last used bit of this window
                Some(used) => start += used + 1,
            }
        }
        None
    }

    /// mark every element of `range` used
    /// # Return
    /// the number of bits that flipped
    pub fn mark_used(&mut self, range: Range<u32>) -> u32 {
        self.mark(range, true)
    }

    /// mark every element of `range` free
    /// # Return
    /// the number of bits that flipped
    pub fn mark_free(&mut self, range: Range<u32>) -> u32 {
        self.mark(range, false)
    }

    /// the free counter agrees with the bits
    pub fn is_consistent(&self) -> bool {
        self.free as usize == self.bits.count_zeros()
    }

    fn mark(&mut self, range: Range<u32>, used: bool) -> u32 {
        let mut flipped = 0;
        for i in range {
            let Some(old) = self.bits.get(i as usize).map(|bit| *bit) else {
                warn!("bitmap index {i} is out of range({}), ignored", self.len());
                continue;
            };
            if old == used {
                continue;
            }
            self.bits.set(i as usize, used);
            flipped += 1;
        }
        if used {
            self.free -= flipped;
        } else {
            self.free += flipped;
        }
        flipped
    }
}
