use crate::base::constants::{ALLOCATION_GRANULARITY, PAGE_SIZE};

pub const BITS_PER_CELL: usize = u8::BITS as usize;
pub const CELL_MASK: usize = BITS_PER_CELL - 1;
pub const BITMAP_SIZE: usize = PAGE_SIZE / (BITS_PER_CELL * ALLOCATION_GRANULARITY);

/// One bit per allocation granule of a normal page, set where an object or
/// free-list entry starts. Lets interior pointers find their header.
pub struct ObjectStartBitmap {
    offset: usize,
    cells: [u8; BITMAP_SIZE],
}

impl ObjectStartBitmap {
    pub fn new(offset: usize) -> Self {
        Self {
            offset,
            cells: [0; BITMAP_SIZE],
        }
    }

    #[inline]
    fn index_bit(&self, addr: usize) -> (usize, usize) {
        debug_assert!(addr >= self.offset);
        let number = (addr - self.offset) / ALLOCATION_GRANULARITY;
        (number / BITS_PER_CELL, number & CELL_MASK)
    }

    #[inline]
    pub fn set_bit(&mut self, addr: usize) {
        let (index, bit) = self.index_bit(addr);
        self.cells[index] |= 1 << bit;
    }

    pub fn clear_bit(&mut self, addr: usize) {
        let (index, bit) = self.index_bit(addr);
        self.cells[index] &= !(1 << bit);
    }

    pub fn check_bit(&self, addr: usize) -> bool {
        let (index, bit) = self.index_bit(addr);
        self.cells[index] & (1 << bit) != 0
    }

    pub fn clear(&mut self) {
        self.cells.fill(0);
    }

    /// Returns the closest object start at or below `addr`, or 0 when there is
    /// none.
    pub fn find_header(&self, addr: usize) -> usize {
        if addr < self.offset {
            return 0;
        }
        let (mut index, bit) = self.index_bit(addr);
        let mut byte = self.cells[index] & (((1u16 << (bit + 1)) - 1) as u8);
        while byte == 0 && index > 0 {
            index -= 1;
            byte = self.cells[index];
        }
        if byte == 0 {
            return 0;
        }
        let highest = BITS_PER_CELL - 1 - byte.leading_zeros() as usize;
        self.offset + (index * BITS_PER_CELL + highest) * ALLOCATION_GRANULARITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x10000;

    #[test]
    fn test_set_and_clear() {
        let mut bitmap = ObjectStartBitmap::new(BASE);
        bitmap.set_bit(BASE + 64);
        assert!(bitmap.check_bit(BASE + 64));
        assert!(!bitmap.check_bit(BASE + 72));
        bitmap.clear_bit(BASE + 64);
        assert!(!bitmap.check_bit(BASE + 64));
    }

    #[test]
    fn test_find_header_for_interior_pointers() {
        let mut bitmap = ObjectStartBitmap::new(BASE);
        bitmap.set_bit(BASE);
        bitmap.set_bit(BASE + 48);
        bitmap.set_bit(BASE + 4096);

        assert_eq!(bitmap.find_header(BASE), BASE);
        assert_eq!(bitmap.find_header(BASE + 47), BASE);
        assert_eq!(bitmap.find_header(BASE + 48), BASE + 48);
        assert_eq!(bitmap.find_header(BASE + 4000), BASE + 48);
        assert_eq!(bitmap.find_header(BASE + 4100), BASE + 4096);
    }

    #[test]
    fn test_find_header_without_start() {
        let mut bitmap = ObjectStartBitmap::new(BASE);
        assert_eq!(bitmap.find_header(BASE + 128), 0);
        bitmap.set_bit(BASE + 256);
        assert_eq!(bitmap.find_header(BASE + 128), 0);
        assert_eq!(bitmap.find_header(BASE - 8), 0);
        bitmap.clear();
        assert_eq!(bitmap.find_header(BASE + 300), 0);
    }
}
