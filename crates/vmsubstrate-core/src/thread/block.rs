use std::sync::atomic::{AtomicUsize, Ordering};

use super::layout::{NATIVE_INFO_WORDS, NativeThreadLocals, ThreadLocalsLayout};
use super::os::{NativeThread, StackInfo};
use crate::error::{SubstrateError, SubstrateResult};

const WORD: usize = std::mem::size_of::<usize>();

/// Storage for one thread's metadata, at an address that never changes.
///
/// Word layout:
///
/// ```text
/// [ triggered TLA | enabled TLA | disabled TLA | NativeThreadLocals | reference map ]
/// ```
///
/// The enabled area is the thread's canonical TLA: it is what the runtime is
/// handed and what the registry links together.
pub struct ThreadLocalsBlock {
    words: Box<[AtomicUsize]>,
    tla_words: usize,
    ref_map_bytes: usize,
}

impl ThreadLocalsBlock {
    /// Allocate and initialize the block for a thread with reserved `id`.
    ///
    /// `layout` must describe host-sized words.
    pub fn allocate(
        layout: &ThreadLocalsLayout,
        id: i32,
        handle: NativeThread,
        stack: StackInfo,
        page_size: usize,
    ) -> SubstrateResult<Self> {
        debug_assert_eq!(layout.word_size, WORD);
        let tla_words = layout.tla_words();
        // One bit per stack word.
        let ref_map_bytes = stack.size.div_ceil(WORD * 8);
        let total = 3 * tla_words + NATIVE_INFO_WORDS + ref_map_bytes.div_ceil(WORD);

        let mut storage = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|_| SubstrateError::AllocationFailed(total * WORD))?;
        storage.resize_with(total, || AtomicUsize::new(0));
        let block = Self {
            words: storage.into_boxed_slice(),
            tla_words,
            ref_map_bytes,
        };

        let triggered = block.area_address(0);
        let enabled = block.area_address(1);
        let disabled = block.area_address(2);
        for area in 0..3 {
            block.set_area_word(area, layout.safepoints_triggered, triggered);
            block.set_area_word(area, layout.safepoints_enabled, enabled);
            block.set_area_word(area, layout.safepoints_disabled, disabled);
            block.set_area_word(area, layout.safepoint_latch, enabled);
            block.set_area_word(area, layout.id, id as isize as usize);
            block.set_area_word(area, layout.native_thread_locals, block.native_address());
            block.set_area_word(area, layout.stack_reference_map, block.ref_map_address());
            block.set_area_word(area, layout.stack_reference_map_size, ref_map_bytes);
        }

        let native = NativeThreadLocals {
            handle: handle.0,
            stack_base: stack.base,
            stack_size: stack.size,
            stack_yellow_zone: stack.base + page_size,
            tl_block: block.address(),
            tl_block_size: block.size(),
        };
        for (i, word) in native.to_words().into_iter().enumerate() {
            block.words[block.native_index() + i].store(word, Ordering::Relaxed);
        }
        Ok(block)
    }

    fn area_address(&self, area: usize) -> usize {
        self.address() + area * self.tla_words * WORD
    }

    fn set_area_word(&self, area: usize, index: usize, value: usize) {
        self.words[area * self.tla_words + index].store(value, Ordering::Release);
    }

    const fn native_index(&self) -> usize {
        3 * self.tla_words
    }

    /// Start of the block.
    #[must_use]
    pub fn address(&self) -> usize {
        self.words.as_ptr() as usize
    }

    /// Size of the block in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * WORD
    }

    /// Address of the safepoints-enabled thread locals area.
    #[must_use]
    pub fn tla(&self) -> usize {
        self.area_address(1)
    }

    #[must_use]
    pub fn triggered_tla(&self) -> usize {
        self.area_address(0)
    }

    #[must_use]
    pub fn disabled_tla(&self) -> usize {
        self.area_address(2)
    }

    #[must_use]
    pub fn native_address(&self) -> usize {
        self.address() + self.native_index() * WORD
    }

    #[must_use]
    pub fn native(&self) -> NativeThreadLocals {
        let base = self.native_index();
        let mut words = [0usize; NATIVE_INFO_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = self.words[base + i].load(Ordering::Relaxed);
        }
        NativeThreadLocals::from_words(words)
    }

    #[must_use]
    pub fn ref_map_address(&self) -> usize {
        self.native_address() + NATIVE_INFO_WORDS * WORD
    }

    #[must_use]
    pub const fn ref_map_size(&self) -> usize {
        self.ref_map_bytes
    }

    /// Read slot `index` of the enabled thread locals area.
    #[must_use]
    pub fn tla_word(&self, index: usize) -> usize {
        self.words[self.tla_words + index].load(Ordering::Acquire)
    }

    /// Write slot `index` of the enabled thread locals area.
    pub fn set_tla_word(&self, index: usize, value: usize) {
        self.set_area_word(1, index, value);
    }

    /// Address of slot `index` of the enabled thread locals area.
    #[must_use]
    pub fn tla_slot_address(&self, index: usize) -> usize {
        self.tla() + index * WORD
    }
}

impl std::fmt::Debug for ThreadLocalsBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadLocalsBlock")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("size", &self.size())
            .field("tla", &format_args!("{:#x}", self.tla()))
            .finish()
    }
}
