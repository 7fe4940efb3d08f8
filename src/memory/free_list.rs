use std::ptr::null_mut;

use crate::base::constants::*;

use super::{object_header::ObjectHeader, page::NormalPage};

pub const NUM_BUCKETS: usize = usize::BITS as usize;

#[repr(C)]
struct FreeListEntry {
    header: ObjectHeader,
    next: *mut FreeListEntry,
}

impl FreeListEntry {
    fn size(&self) -> usize {
        self.header.allocated_size()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct FreeListBlock {
    pub address: usize,
    pub size: usize,
}

unsafe impl Send for FreeListBlock {}

/// Segregated free list of a normal space. Bucket `i` holds entries of size
/// `[2^i, 2^(i+1))`.
pub struct FreeList {
    heads: [*mut FreeListEntry; NUM_BUCKETS],
    tails: [*mut FreeListEntry; NUM_BUCKETS],
    biggest_index: usize,
}

unsafe impl Send for FreeList {}

fn bucket_index_for_size(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            heads: [null_mut(); NUM_BUCKETS],
            tails: [null_mut(); NUM_BUCKETS],
            biggest_index: 0,
        }
    }

    /// Turns `block` into a free-list entry. Blocks smaller than an entry
    /// become unlinked fillers so the page stays iterable.
    pub unsafe fn add(&mut self, block: FreeListBlock) {
        debug_assert!(block.size >= OBJECT_HEADER_SIZE);
        debug_assert_eq!(block.size & ALLOCATION_MASK, 0);
        (*NormalPage::from_payload(block.address)).bitmap.set_bit(block.address);

        if block.size < FREE_LIST_ENTRY_SIZE {
            ObjectHeader::format_free(block.address, block.size);
            return;
        }

        ObjectHeader::format_free(block.address, block.size);
        let entry = block.address as *mut FreeListEntry;
        let index = bucket_index_for_size(block.size);
        (*entry).next = self.heads[index];
        self.heads[index] = entry;
        if self.tails[index].is_null() {
            self.tails[index] = entry;
        }
        self.biggest_index = self.biggest_index.max(index);
    }

    /// Takes the first entry guaranteed to hold `size` bytes.
    pub unsafe fn allocate(&mut self, size: usize) -> Option<FreeListBlock> {
        let mut bucket = bucket_index_for_size(size);
        if !size.is_power_of_two() {
            bucket += 1;
        }

        let mut index = self.biggest_index;
        while index >= bucket && index < NUM_BUCKETS {
            let entry = self.heads[index];
            if !entry.is_null() && (*entry).size() >= size {
                self.heads[index] = (*entry).next;
                if self.heads[index].is_null() {
                    self.tails[index] = null_mut();
                }
                return Some(FreeListBlock {
                    address: entry as usize,
                    size: (*entry).size(),
                });
            }
            if entry.is_null() && index == self.biggest_index && index > 0 {
                self.biggest_index -= 1;
            }
            if index == 0 {
                break;
            }
            index -= 1;
        }
        None
    }

    /// Moves all entries of `other` into this list.
    pub fn append(&mut self, other: &mut FreeList) {
        for index in 0..NUM_BUCKETS {
            let head = other.heads[index];
            if head.is_null() {
                continue;
            }
            unsafe { (*other.tails[index]).next = self.heads[index] };
            if self.tails[index].is_null() {
                self.tails[index] = other.tails[index];
            }
            self.heads[index] = head;
            self.biggest_index = self.biggest_index.max(index);
        }
        other.clear();
    }

    pub fn clear(&mut self) {
        self.heads = [null_mut(); NUM_BUCKETS];
        self.tails = [null_mut(); NUM_BUCKETS];
        self.biggest_index = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.heads.iter().all(|head| head.is_null())
    }

    fn for_each_entry(&self, mut f: impl FnMut(&FreeListEntry)) {
        for head in self.heads.iter() {
            let mut entry = *head;
            while !entry.is_null() {
                unsafe {
                    f(&*entry);
                    entry = (*entry).next;
                }
            }
        }
    }

    /// Total bytes held by entries.
    pub fn size(&self) -> usize {
        let mut size = 0;
        self.for_each_entry(|entry| size += entry.size());
        size
    }

    pub fn entry_count(&self) -> usize {
        let mut count = 0;
        self.for_each_entry(|_| count += 1);
        count
    }

    /// Whether some entry covers all of `block`.
    pub fn contains(&self, block: FreeListBlock) -> bool {
        let mut found = false;
        self.for_each_entry(|entry| {
            let start = entry as *const FreeListEntry as usize;
            if start <= block.address && block.address + block.size <= start + entry.size() {
                found = true;
            }
        });
        found
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}
