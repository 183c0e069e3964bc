//! The registry of live thread metadata blocks and the global thread/GC lock.
//!
//! Locally the registry is an arena with index links. Each link change is
//! mirrored into the `FORWARD_LINK`/`BACKWARD_LINK` words of the affected thread
//! locals areas and the head into the boot image, so an out-of-process reader
//! sees a conventional null-terminated doubly-linked list.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::Arc;

use serde::Serialize;

use super::block::ThreadLocalsBlock;
use super::layout::ThreadLocalsLayout;
use crate::error::SubstrateResult;
use crate::image::BootImage;
use crate::sync::{OsMutex, OsMutexGuard};

/// Stable handle of a registered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

struct Entry {
    block: ThreadLocalsBlock,
    forward: Option<BlockId>,
    backward: Option<BlockId>,
}

/// Summary of one registered thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegisteredThread {
    pub id: i32,
    pub tla: usize,
    pub handle: usize,
    pub stack_base: usize,
    pub stack_size: usize,
}

/// Registry contents. Only reachable through a [`RegistryGuard`].
pub struct RegistryState {
    entries: Vec<Option<Entry>>,
    free: Vec<u32>,
    head: Option<BlockId>,
    len: usize,
    image: Arc<BootImage>,
    forward_slot: usize,
    backward_slot: usize,
    id_slot: usize,
}

impl RegistryState {
    fn entry(&self, id: BlockId) -> Option<&Entry> {
        self.entries.get(id.0 as usize)?.as_ref()
    }

    fn entry_mut(&mut self, id: BlockId) -> Option<&mut Entry> {
        self.entries.get_mut(id.0 as usize)?.as_mut()
    }

    fn tla_of(&self, id: Option<BlockId>) -> usize {
        id.and_then(|id| self.entry(id)).map_or(0, |e| e.block.tla())
    }

    /// Insert `block` at the head of the list.
    pub fn link(&mut self, block: ThreadLocalsBlock) -> BlockId {
        let old_head = self.head;
        let old_head_tla = self.tla_of(old_head);
        block.set_tla_word(self.forward_slot, old_head_tla);
        block.set_tla_word(self.backward_slot, 0);
        let tla = block.tla();
        let entry = Entry {
            block,
            forward: old_head,
            backward: None,
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize] = Some(entry);
                BlockId(slot)
            }
            None => {
                self.entries.push(Some(entry));
                BlockId((self.entries.len() - 1) as u32)
            }
        };
        let backward_slot = self.backward_slot;
        if let Some(old) = old_head.and_then(|h| self.entry_mut(h)) {
            old.backward = Some(id);
            old.block.set_tla_word(backward_slot, tla);
        }
        self.head = Some(id);
        self.image.set_registry_head(tla);
        self.len += 1;
        id
    }

    /// Remove the block registered as `id` and hand it back.
    pub fn unlink(&mut self, id: BlockId) -> Option<ThreadLocalsBlock> {
        let (forward, backward) = {
            let entry = self.entry(id)?;
            (entry.forward, entry.backward)
        };
        let forward_tla = self.tla_of(forward);
        let backward_tla = self.tla_of(backward);
        let (forward_slot, backward_slot) = (self.forward_slot, self.backward_slot);
        match backward.and_then(|b| self.entry_mut(b)) {
            Some(prev) => {
                prev.forward = forward;
                prev.block.set_tla_word(forward_slot, forward_tla);
            }
            None => {
                self.head = forward;
                self.image.set_registry_head(forward_tla);
            }
        }
        if let Some(next) = forward.and_then(|f| self.entry_mut(f)) {
            next.backward = backward;
            next.block.set_tla_word(backward_slot, backward_tla);
        }
        let entry = self.entries[id.0 as usize].take()?;
        self.free.push(id.0);
        self.len -= 1;
        entry.block.set_tla_word(forward_slot, 0);
        entry.block.set_tla_word(backward_slot, 0);
        Some(entry.block)
    }

    #[must_use]
    pub fn get(&self, id: BlockId) -> Option<&ThreadLocalsBlock> {
        self.entry(id).map(|e| &e.block)
    }

    #[must_use]
    pub const fn head(&self) -> Option<BlockId> {
        self.head
    }

    /// TLA address of the head, or 0 for an empty list.
    #[must_use]
    pub fn head_tla(&self) -> usize {
        self.tla_of(self.head)
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Blocks from the head (most recently linked) to the tail.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &ThreadLocalsBlock)> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let id = cursor?;
            let entry = self.entry(id)?;
            cursor = entry.forward;
            Some((id, &entry.block))
        })
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<RegisteredThread> {
        self.iter()
            .map(|(_, block)| {
                let native = block.native();
                RegisteredThread {
                    id: block.tla_word(self.id_slot) as isize as i32,
                    tla: block.tla(),
                    handle: native.handle,
                    stack_base: native.stack_base,
                    stack_size: native.stack_size,
                }
            })
            .collect()
    }
}

/// Owner of the global thread/GC lock and the registry it protects.
///
/// The lock has two contracts: registry mutation, and collector exclusion. A
/// thread registering itself (or running its attach upcall) under
/// [`ThreadRegistry::enter`] blocks collection, and a collection in progress
/// under [`ThreadRegistry::enter_for_collection`] blocks registration.
pub struct ThreadRegistry {
    lock: OsMutex,
    state: UnsafeCell<RegistryState>,
}

// SAFETY: `state` is only reached through a guard that holds `lock`.
unsafe impl Sync for ThreadRegistry {}
// SAFETY: all contents are `Send`; the mutex may be unlocked from any thread
// once no guard exists.
unsafe impl Send for ThreadRegistry {}

impl ThreadRegistry {
    /// Registry over `image`'s thread list, which it resets to empty.
    ///
    /// An image has at most one live registry; a second one is refused with
    /// [`crate::SubstrateError::ImageInUse`] until the first is dropped.
    pub fn new(image: Arc<BootImage>, layout: &ThreadLocalsLayout) -> SubstrateResult<Self> {
        image.claim_registry()?;
        image.set_registry_head(0);
        Ok(Self {
            lock: OsMutex::new(),
            state: UnsafeCell::new(RegistryState {
                entries: Vec::new(),
                free: Vec::new(),
                head: None,
                len: 0,
                image,
                forward_slot: layout.forward_link,
                backward_slot: layout.backward_link,
                id_slot: layout.id,
            }),
        })
    }

    /// Take the global lock for registry access.
    pub fn enter(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            guard: self.lock.lock(),
            state: &self.state,
        }
    }

    /// Take the global lock to exclude thread registration during a collection.
    pub fn enter_for_collection(&self) -> RegistryGuard<'_> {
        self.enter()
    }

    /// The global lock, for callers that pair it with a [`crate::Condition`].
    #[must_use]
    pub const fn lock(&self) -> &OsMutex {
        &self.lock
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.enter().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enter().is_empty()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<RegisteredThread> {
        self.enter().snapshot()
    }
}

impl Drop for ThreadRegistry {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        state.image.set_registry_head(0);
        state.image.release_registry();
    }
}

/// Holds the global lock; dereferences to the registry.
pub struct RegistryGuard<'a> {
    guard: OsMutexGuard<'a>,
    state: &'a UnsafeCell<RegistryState>,
}

impl<'a> RegistryGuard<'a> {
    pub fn link(&mut self, block: ThreadLocalsBlock) -> BlockId {
        // SAFETY: the lock is held and `&mut self` excludes outstanding shared
        // borrows handed out through `Deref`.
        unsafe { &mut *self.state.get() }.link(block)
    }

    pub fn unlink(&mut self, id: BlockId) -> Option<ThreadLocalsBlock> {
        // SAFETY: as in `link`.
        unsafe { &mut *self.state.get() }.unlink(id)
    }

    /// The underlying mutex guard, for waiting on a condition with the global lock.
    pub fn os_guard(&mut self) -> &mut OsMutexGuard<'a> {
        &mut self.guard
    }
}

impl Deref for RegistryGuard<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        // SAFETY: the lock is held for the life of the guard and mutation needs
        // `&mut self`.
        unsafe { &*self.state.get() }
    }
}
