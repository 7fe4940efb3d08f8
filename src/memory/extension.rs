use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc,
};

use parking_lot::RwLock;

use crate::base::formatted_size;

/// Survival state of an extension across young collections.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum YoungGcState {
    Dead = 0,
    Copied = 1,
    Promoted = 2,
}

impl YoungGcState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Copied,
            2 => Self::Promoted,
            _ => Self::Dead,
        }
    }
}

/// Native storage owned by an extension.
pub struct BackingStore {
    data: Box<[u8]>,
}

impl BackingStore {
    pub fn new(byte_length: usize) -> Self {
        Self {
            data: vec![0; byte_length].into_boxed_slice(),
        }
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Stable handle of a record. The generation guards against reuse of a
/// freed slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ExtensionId {
    index: u32,
    generation: u32,
}

struct ExternalExtension {
    marked: AtomicBool,
    young_gc_state: AtomicU8,
    backing_store: Option<Arc<BackingStore>>,
    /// Payload address of the managed owner. Not traced.
    owner: usize,
    accounting_length: usize,
    young: bool,
    prev: Option<u32>,
    next: Option<u32>,
}

impl ExternalExtension {
    fn young_mark(&self) {
        let _ = self.young_gc_state.compare_exchange(
            YoungGcState::Dead as u8,
            YoungGcState::Copied as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn young_state(&self) -> YoungGcState {
        YoungGcState::from_u8(self.young_gc_state.load(Ordering::Acquire))
    }
}

struct Slot {
    generation: u32,
    extension: Option<ExternalExtension>,
}

#[derive(Default)]
struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    young_head: Option<u32>,
    old_head: Option<u32>,
    young_len: usize,
    old_len: usize,
    accounted_bytes: usize,
}

impl Arena {
    fn get(&self, id: ExtensionId) -> Option<&ExternalExtension> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.extension.as_ref()
    }

    fn get_mut(&mut self, id: ExtensionId) -> Option<&mut ExternalExtension> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.extension.as_mut()
    }

    fn push(&mut self, index: u32, young: bool) {
        let head = if young { &mut self.young_head } else { &mut self.old_head };
        let next = head.replace(index);
        if let Some(extension) = self.slots[index as usize].extension.as_mut() {
            extension.prev = None;
            extension.next = next;
            extension.young = young;
        }
        if let Some(next) = next {
            if let Some(extension) = self.slots[next as usize].extension.as_mut() {
                extension.prev = Some(index);
            }
        }
        if young {
            self.young_len += 1;
        } else {
            self.old_len += 1;
        }
    }

    /// Detaches a whole list, returning its indices in list order.
    fn take_list(&mut self, young: bool) -> Vec<u32> {
        let mut current = if young {
            self.young_len = 0;
            self.young_head.take()
        } else {
            self.old_len = 0;
            self.old_head.take()
        };
        let mut indices = Vec::new();
        while let Some(index) = current {
            indices.push(index);
            current = self.slots[index as usize].extension.as_ref().and_then(|ext| ext.next);
        }
        indices
    }

    fn free(&mut self, index: u32) -> Option<ExternalExtension> {
        let slot = &mut self.slots[index as usize];
        let extension = slot.extension.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.accounted_bytes -= extension.accounting_length;
        Some(extension)
    }

    fn unlink(&mut self, index: u32) {
        let (young, prev, next) = match self.slots[index as usize].extension.as_mut() {
            Some(extension) => (extension.young, extension.prev.take(), extension.next.take()),
            None => return,
        };
        match prev {
            Some(prev) => {
                if let Some(extension) = self.slots[prev as usize].extension.as_mut() {
                    extension.next = next;
                }
            }
            None if young => self.young_head = next,
            None => self.old_head = next,
        }
        if let Some(next) = next {
            if let Some(extension) = self.slots[next as usize].extension.as_mut() {
                extension.prev = prev;
            }
        }
        if young {
            self.young_len -= 1;
        } else {
            self.old_len -= 1;
        }
    }
}

/// Arena of native records attached to managed buffers. Each record holds
/// its backing store strongly and its owner only by address.
pub struct ExtensionTable {
    arena: RwLock<Arena>,
}

impl ExtensionTable {
    pub fn new() -> Self {
        Self {
            arena: RwLock::new(Arena::default()),
        }
    }

    /// Registers a new young record.
    pub fn insert(&self, owner: *const u8, backing_store: Option<Arc<BackingStore>>) -> ExtensionId {
        self.insert_with_mark(owner, backing_store, false)
    }

    /// Registers a new young record that survives the next `sweep_full`
    /// when `marked` is set.
    pub fn insert_with_mark(
        &self,
        owner: *const u8,
        backing_store: Option<Arc<BackingStore>>,
        marked: bool,
    ) -> ExtensionId {
        let accounting_length = backing_store.as_ref().map_or(0, |store| store.byte_length());
        let extension = ExternalExtension {
            marked: AtomicBool::new(marked),
            young_gc_state: AtomicU8::new(YoungGcState::Dead as u8),
            backing_store,
            owner: owner as usize,
            accounting_length,
            young: true,
            prev: None,
            next: None,
        };

        let mut arena = self.arena.write();
        let index = match arena.free.pop() {
            Some(index) => {
                arena.slots[index as usize].extension = Some(extension);
                index
            }
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    extension: Some(extension),
                });
                (arena.slots.len() - 1) as u32
            }
        };
        arena.accounted_bytes += accounting_length;
        arena.push(index, true);
        ExtensionId {
            index,
            generation: arena.slots[index as usize].generation,
        }
    }

    /// Frees a record right away and returns its backing store.
    pub fn remove(&self, id: ExtensionId) -> Option<Arc<BackingStore>> {
        let mut arena = self.arena.write();
        arena.get(id)?;
        arena.unlink(id.index);
        arena.free(id.index)?.backing_store
    }

    pub fn contains(&self, id: ExtensionId) -> bool {
        self.arena.read().get(id).is_some()
    }

    pub fn mark(&self, id: ExtensionId) {
        if let Some(extension) = self.arena.read().get(id) {
            extension.marked.store(true, Ordering::Release);
        }
    }

    pub fn unmark(&self, id: ExtensionId) {
        if let Some(extension) = self.arena.read().get(id) {
            extension.marked.store(false, Ordering::Release);
        }
    }

    pub fn is_marked(&self, id: ExtensionId) -> bool {
        self.arena
            .read()
            .get(id)
            .map_or(false, |extension| extension.marked.load(Ordering::Acquire))
    }

    /// `Dead -> Copied`. Other states are left alone.
    pub fn young_mark(&self, id: ExtensionId) {
        if let Some(extension) = self.arena.read().get(id) {
            extension.young_mark();
        }
    }

    pub fn young_mark_promoted(&self, id: ExtensionId) {
        if let Some(extension) = self.arena.read().get(id) {
            extension
                .young_gc_state
                .store(YoungGcState::Promoted as u8, Ordering::Release);
        }
    }

    pub fn young_unmark(&self, id: ExtensionId) {
        if let Some(extension) = self.arena.read().get(id) {
            extension
                .young_gc_state
                .store(YoungGcState::Dead as u8, Ordering::Release);
        }
    }

    pub fn young_state(&self, id: ExtensionId) -> Option<YoungGcState> {
        self.arena.read().get(id).map(|extension| extension.young_state())
    }

    pub fn is_young(&self, id: ExtensionId) -> Option<bool> {
        self.arena.read().get(id).map(|extension| extension.young)
    }

    pub fn backing_store(&self, id: ExtensionId) -> Option<Arc<BackingStore>> {
        self.arena.read().get(id)?.backing_store.clone()
    }

    /// Detaches the backing store, leaving the record in place.
    pub fn remove_backing_store(&self, id: ExtensionId) -> Option<Arc<BackingStore>> {
        let mut arena = self.arena.write();
        let extension = arena.get_mut(id)?;
        let store = extension.backing_store.take();
        let length = std::mem::take(&mut extension.accounting_length);
        arena.accounted_bytes -= length;
        store
    }

    pub fn owner(&self, id: ExtensionId) -> Option<*const u8> {
        self.arena.read().get(id).map(|extension| extension.owner as *const u8)
    }

    pub fn len(&self) -> usize {
        let arena = self.arena.read();
        arena.young_len + arena.old_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn young_len(&self) -> usize {
        self.arena.read().young_len
    }

    pub fn old_len(&self) -> usize {
        self.arena.read().old_len
    }

    /// Bytes held by live backing stores.
    pub fn accounted_bytes(&self) -> usize {
        self.arena.read().accounted_bytes
    }

    /// Old-generation pass: unmarked records are freed, marked ones are
    /// unmarked and end up on the old list.
    pub fn sweep_full(&self) {
        let mut arena = self.arena.write();
        let mut freed = 0;
        let mut freed_bytes = 0;
        for young in [true, false] {
            for index in arena.take_list(young).into_iter().rev() {
                let marked = arena.slots[index as usize]
                    .extension
                    .as_ref()
                    .map_or(false, |extension| extension.marked.swap(false, Ordering::AcqRel));
                if marked {
                    arena.push(index, false);
                } else if let Some(extension) = arena.free(index) {
                    freed += 1;
                    freed_bytes += extension.accounting_length;
                }
            }
        }
        log::debug!(
            target: "gc-extensions",
            "full sweep freed {} extensions ({}), {} remain",
            freed,
            formatted_size(freed_bytes),
            arena.old_len
        );
    }

    /// Young pass over the young list: records nobody young-marked are
    /// freed, promoted ones move to the old list and copied ones stay young.
    /// Survivors have their young state reset.
    pub fn sweep_young(&self) {
        let mut arena = self.arena.write();
        let mut freed = 0;
        for index in arena.take_list(true).into_iter().rev() {
            let state = match arena.slots[index as usize].extension.as_ref() {
                Some(extension) => extension.young_state(),
                None => continue,
            };
            match state {
                YoungGcState::Dead => {
                    if arena.free(index).is_some() {
                        freed += 1;
                    }
                }
                YoungGcState::Copied | YoungGcState::Promoted => {
                    if let Some(extension) = arena.slots[index as usize].extension.as_ref() {
                        extension
                            .young_gc_state
                            .store(YoungGcState::Dead as u8, Ordering::Relaxed);
                    }
                    arena.push(index, state == YoungGcState::Copied);
                }
            }
        }
        log::debug!(
            target: "gc-extensions",
            "young sweep freed {} extensions, {} young, {} old",
            freed,
            arena.young_len,
            arena.old_len
        );
    }
}

impl Default for ExtensionTable {
    fn default() -> Self {
        Self::new()
    }
}
