use std::{fmt, time::Duration};

use crate::base::formatted_size;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpaceStatistics {
    pub name: String,
    pub pages: usize,
    pub free_list_bytes: usize,
    pub free_list_entries: usize,
}

/// Snapshot of heap counters. Figures about the last cycle refer to the
/// most recently finished collection.
#[derive(Clone, Debug, Default)]
pub struct HeapStats {
    pub committed_size: usize,
    pub max_heap_size: Option<usize>,
    pub collections: usize,
    pub allocated_since_last_gc: usize,
    pub marked_bytes: usize,
    pub last_marking_time: Duration,
    pub finalized_objects: usize,
    pub released_pages: usize,
    pub extensions: usize,
    pub extension_bytes: usize,
    pub spaces: Vec<SpaceStatistics>,
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "committed: {}", formatted_size(self.committed_size))?;
        if let Some(max) = self.max_heap_size {
            write!(f, " (max {})", formatted_size(max))?;
        }
        writeln!(f)?;
        writeln!(
            f,
            "collections: {}, allocated since last: {}",
            self.collections,
            formatted_size(self.allocated_since_last_gc)
        )?;
        writeln!(
            f,
            "last cycle: {} marked in {:.2}ms, {} finalized, {} pages released",
            formatted_size(self.marked_bytes),
            self.last_marking_time.as_micros() as f64 / 1000.0,
            self.finalized_objects,
            self.released_pages
        )?;
        writeln!(
            f,
            "external extensions: {} ({})",
            self.extensions,
            formatted_size(self.extension_bytes)
        )?;
        for space in self.spaces.iter() {
            writeln!(
                f,
                "  {:<10} pages: {:<5} free list: {} in {} entries",
                space.name,
                space.pages,
                formatted_size(space.free_list_bytes),
                space.free_list_entries
            )?;
        }
        Ok(())
    }
}
