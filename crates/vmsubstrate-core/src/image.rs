//! Boot image contract.
//!
//! The substrate never parses or relocates an image. It only needs the header
//! fields that locate its hooks into the runtime: the thread upcalls, the word
//! holding the registry head, the primordial thread locals and the slot indices
//! of a thread locals area. Offsets are relative to the start of the image heap.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{SubstrateError, SubstrateResult};

/// Status the attach upcall returns on success.
pub const JNI_OK: i32 = 0;
/// Status the attach upcall returns once the runtime's main thread has exited.
pub const JNI_EDETACHED: i32 = -2;

/// Number of word slots in the default thread locals area.
pub const DEFAULT_TLA_SLOTS: i32 = 16;

const WORD: usize = std::mem::size_of::<usize>();

/// Run upcall: `(id, native, stack_base, stack_end, tla, ref_map, yellow_zone)`.
pub type RunUpcall = unsafe extern "C" fn(i32, usize, usize, usize, usize, usize, usize);

/// Attach upcall:
/// `(native, name, group, daemon, stack_base, stack_end, tla, ref_map, yellow_zone) -> status`.
pub type AttachUpcall =
    unsafe extern "C" fn(usize, usize, usize, i32, usize, usize, usize, usize, usize) -> i32;

/// Detach upcall: `(tla)`.
pub type DetachUpcall = unsafe extern "C" fn(usize);

/// Fixed-layout image header. Field order is part of the on-disk format.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// 0 for little endian, anything else for big endian.
    pub is_big_endian: i32,
    pub identification: i32,
    pub version: i32,
    pub random_id: i32,
    /// 4 or 8.
    pub word_size: i32,
    pub cache_alignment: i32,
    pub page_size: i32,
    pub vm_run_method_offset: i32,
    pub vm_thread_add_method_offset: i32,
    pub vm_thread_run_method_offset: i32,
    pub vm_thread_attach_method_offset: i32,
    /// Negative when the image has no detach hook.
    pub vm_thread_detach_method_offset: i32,
    pub class_registry_offset: i32,
    pub string_data_size: i32,
    pub relocation_data_size: i32,
    pub heap_size: i32,
    pub code_size: i32,
    pub dynamic_heap_regions_array_offset: i32,
    pub auxiliary_space_size: i32,
    pub thread_locals_list_head_offset: i32,
    pub primordial_thread_locals_offset: i32,
    /// Size in bytes of one thread locals area.
    pub thread_locals_area_size: i32,

    // Word indices into a thread locals area.
    pub safepoint_latch: i32,
    pub safepoints_enabled_thread_locals: i32,
    pub safepoints_disabled_thread_locals: i32,
    pub safepoints_triggered_thread_locals: i32,
    pub native_thread_locals: i32,
    pub forward_link: i32,
    pub backward_link: i32,
    pub id: i32,
    pub jni_env: i32,
    pub last_java_frame_anchor: i32,
    pub trap_number: i32,
    pub trap_instruction_pointer: i32,
    pub trap_fault_address: i32,
    pub trap_latch_register: i32,
    pub stack_reference_map: i32,
    pub stack_reference_map_size: i32,
}

impl ImageHeader {
    /// Header describing a host-native image with the default slot assignment.
    ///
    /// The registry head lives at heap offset 0 and the primordial thread locals
    /// area at offset 64. No upcall offsets are set.
    #[must_use]
    pub fn host_default() -> Self {
        let word = WORD as i32;
        Self {
            is_big_endian: i32::from(cfg!(target_endian = "big")),
            identification: 0x0ba5_e1a1,
            version: 1,
            random_id: 0,
            word_size: word,
            cache_alignment: 64,
            page_size: i32::try_from(crate::vm::page_size()).unwrap_or(4096),
            vm_run_method_offset: -1,
            vm_thread_add_method_offset: -1,
            vm_thread_run_method_offset: -1,
            vm_thread_attach_method_offset: -1,
            vm_thread_detach_method_offset: -1,
            class_registry_offset: -1,
            string_data_size: 0,
            relocation_data_size: 0,
            heap_size: 4096,
            code_size: 0,
            dynamic_heap_regions_array_offset: -1,
            auxiliary_space_size: 0,
            thread_locals_list_head_offset: 0,
            primordial_thread_locals_offset: 64,
            thread_locals_area_size: DEFAULT_TLA_SLOTS * word,
            safepoint_latch: 0,
            safepoints_enabled_thread_locals: 1,
            safepoints_disabled_thread_locals: 2,
            safepoints_triggered_thread_locals: 3,
            native_thread_locals: 4,
            forward_link: 5,
            backward_link: 6,
            id: 7,
            jni_env: 8,
            last_java_frame_anchor: 9,
            trap_number: 10,
            trap_instruction_pointer: 11,
            trap_fault_address: 12,
            trap_latch_register: 13,
            stack_reference_map: 14,
            stack_reference_map_size: 15,
        }
    }

    #[must_use]
    pub const fn big_endian(&self) -> bool {
        self.is_big_endian != 0
    }

    /// Check that the header describes an image this host can run.
    pub fn validate_for_host(&self, heap_len: usize) -> SubstrateResult<()> {
        if self.word_size as usize != WORD {
            return Err(invalid(format!(
                "word size {} does not match host word size {WORD}",
                self.word_size
            )));
        }
        if self.big_endian() != cfg!(target_endian = "big") {
            return Err(invalid("byte order does not match host".to_string()));
        }
        let tla_size = usize::try_from(self.thread_locals_area_size)
            .map_err(|_| invalid("negative thread locals area size".to_string()))?;
        if tla_size == 0 || tla_size % WORD != 0 {
            return Err(invalid(format!(
                "thread locals area size {tla_size} is not a positive multiple of the word size"
            )));
        }
        check_word_offset("threadLocalsListHeadOffset", self.thread_locals_list_head_offset, WORD, heap_len)?;
        check_word_offset(
            "primordialThreadLocalsOffset",
            self.primordial_thread_locals_offset,
            tla_size,
            heap_len,
        )
    }
}

fn invalid(reason: String) -> SubstrateError {
    SubstrateError::InvalidImage(reason)
}

fn check_word_offset(name: &str, offset: i32, extent: usize, heap_len: usize) -> SubstrateResult<()> {
    let offset = usize::try_from(offset).map_err(|_| invalid(format!("{name} is negative")))?;
    if offset % WORD != 0 {
        return Err(invalid(format!("{name} {offset:#x} is not word aligned")));
    }
    match offset.checked_add(extent) {
        Some(end) if end <= heap_len => Ok(()),
        _ => Err(invalid(format!(
            "{name} {offset:#x} (+{extent}) lies outside the {heap_len}-byte heap"
        ))),
    }
}

/// Runtime entry points the substrate calls into.
#[derive(Clone, Copy, Default)]
pub struct Upcalls {
    pub run: Option<RunUpcall>,
    pub attach: Option<AttachUpcall>,
    pub detach: Option<DetachUpcall>,
}

impl fmt::Debug for Upcalls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upcalls")
            .field("run", &self.run.map(|p| p as usize))
            .field("attach", &self.attach.map(|p| p as usize))
            .field("detach", &self.detach.map(|p| p as usize))
            .finish()
    }
}

enum Heap {
    Owned(Box<[AtomicUsize]>),
    Mapped { base: usize, len: usize },
}

/// A boot image as seen by the substrate: header, heap region and resolved upcalls.
pub struct BootImage {
    header: ImageHeader,
    heap: Heap,
    upcalls: Upcalls,
    registry_claimed: AtomicBool,
}

impl fmt::Debug for BootImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootImage")
            .field("heap", &format_args!("{:#x}+{}", self.heap_start(), self.heap_len()))
            .field("upcalls", &self.upcalls)
            .finish_non_exhaustive()
    }
}

impl BootImage {
    /// Build an image whose heap is allocated here and whose upcalls are given
    /// directly instead of being resolved from code offsets.
    pub fn synthetic(header: ImageHeader, upcalls: Upcalls) -> SubstrateResult<Self> {
        let heap_len = usize::try_from(header.heap_size)
            .map_err(|_| invalid("negative heap size".to_string()))?;
        header.validate_for_host(heap_len)?;
        let words = heap_len.div_ceil(WORD);
        let heap: Box<[AtomicUsize]> = (0..words).map(|_| AtomicUsize::new(0)).collect();
        Ok(Self {
            header,
            heap: Heap::Owned(heap),
            upcalls,
            registry_claimed: AtomicBool::new(false),
        })
    }

    /// Wrap an already mapped and relocated image.
    ///
    /// Upcalls are resolved once from the header's method offsets. A negative
    /// offset means the image does not provide that hook.
    ///
    /// # Safety
    ///
    /// `base..base + len` must be a readable and writable, word-aligned mapping
    /// that stays valid for the life of the returned value, and every
    /// non-negative method offset must be the entry of a function with the
    /// matching upcall signature.
    pub unsafe fn from_mapped(header: ImageHeader, base: usize, len: usize) -> SubstrateResult<Self> {
        if base == 0 || base % WORD != 0 {
            return Err(invalid(format!("heap base {base:#x} is not word aligned")));
        }
        header.validate_for_host(len)?;
        let entry = |offset: i32| usize::try_from(offset).ok().map(|off| base + off);
        // SAFETY: the caller guarantees each non-negative offset is the entry of a
        // function with the corresponding signature.
        let upcalls = unsafe {
            Upcalls {
                run: entry(header.vm_thread_run_method_offset)
                    .map(|addr| std::mem::transmute::<*const (), RunUpcall>(addr as *const ())),
                attach: entry(header.vm_thread_attach_method_offset)
                    .map(|addr| std::mem::transmute::<*const (), AttachUpcall>(addr as *const ())),
                detach: entry(header.vm_thread_detach_method_offset)
                    .map(|addr| std::mem::transmute::<*const (), DetachUpcall>(addr as *const ())),
            }
        };
        Ok(Self {
            header,
            heap: Heap::Mapped { base, len },
            upcalls,
            registry_claimed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn header(&self) -> &ImageHeader {
        &self.header
    }

    #[must_use]
    pub const fn upcalls(&self) -> &Upcalls {
        &self.upcalls
    }

    #[must_use]
    pub fn heap_start(&self) -> usize {
        match &self.heap {
            Heap::Owned(words) => words.as_ptr() as usize,
            Heap::Mapped { base, .. } => *base,
        }
    }

    #[must_use]
    pub fn heap_len(&self) -> usize {
        match &self.heap {
            Heap::Owned(words) => words.len() * WORD,
            Heap::Mapped { len, .. } => *len,
        }
    }

    /// `heap_start + offset`.
    #[must_use]
    pub fn offset_as_address(&self, offset: i32) -> usize {
        self.heap_start().wrapping_add_signed(offset as isize)
    }

    fn slot(&self, offset: usize) -> Option<&AtomicUsize> {
        if offset % WORD != 0 || offset.checked_add(WORD)? > self.heap_len() {
            return None;
        }
        match &self.heap {
            Heap::Owned(words) => words.get(offset / WORD),
            // SAFETY: in bounds and aligned within a mapping the constructor's
            // caller keeps valid for our lifetime.
            Heap::Mapped { base, .. } => Some(unsafe { &*((base + offset) as *const AtomicUsize) }),
        }
    }

    /// Read the heap word at `offset`.
    pub fn read_word(&self, offset: usize) -> SubstrateResult<usize> {
        self.slot(offset)
            .map(|w| w.load(Ordering::Acquire))
            .ok_or_else(|| invalid(format!("word offset {offset:#x} outside heap")))
    }

    /// Write the heap word at `offset`.
    pub fn write_word(&self, offset: usize, value: usize) -> SubstrateResult<()> {
        let slot = self
            .slot(offset)
            .ok_or_else(|| invalid(format!("word offset {offset:#x} outside heap")))?;
        slot.store(value, Ordering::Release);
        Ok(())
    }

    /// Address of the word holding the registry head.
    #[must_use]
    pub fn registry_head_address(&self) -> usize {
        self.offset_as_address(self.header.thread_locals_list_head_offset)
    }

    /// Current registry head as published in the image.
    #[must_use]
    pub fn registry_head(&self) -> usize {
        self.read_word(self.header.thread_locals_list_head_offset as usize)
            .unwrap_or(0)
    }

    /// Publish a new registry head. Offset validity was checked at construction.
    pub(crate) fn set_registry_head(&self, tla: usize) {
        let _ = self.write_word(self.header.thread_locals_list_head_offset as usize, tla);
    }

    /// Take ownership of the image's thread list. Fails while another registry
    /// holds it.
    pub(crate) fn claim_registry(&self) -> SubstrateResult<()> {
        if self.registry_claimed.swap(true, Ordering::AcqRel) {
            return Err(SubstrateError::ImageInUse);
        }
        Ok(())
    }

    pub(crate) fn release_registry(&self) {
        self.registry_claimed.store(false, Ordering::Release);
    }

    /// Address of the primordial thread locals area.
    #[must_use]
    pub fn primordial_address(&self) -> usize {
        self.offset_as_address(self.header.primordial_thread_locals_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_default_validates() {
        let header = ImageHeader::host_default();
        header.validate_for_host(header.heap_size as usize).unwrap();
        assert_eq!(header.word_size as usize, WORD);
        assert_eq!(header.thread_locals_area_size as usize, 16 * WORD);
    }

    #[test]
    fn rejects_foreign_word_size() {
        let mut header = ImageHeader::host_default();
        header.word_size = if WORD == 8 { 4 } else { 8 };
        let err = BootImage::synthetic(header, Upcalls::default()).unwrap_err();
        assert!(matches!(err, SubstrateError::InvalidImage(_)));
    }

    #[test]
    fn rejects_primordial_outside_heap() {
        let mut header = ImageHeader::host_default();
        header.primordial_thread_locals_offset = header.heap_size - WORD as i32;
        assert!(BootImage::synthetic(header, Upcalls::default()).is_err());
        header.primordial_thread_locals_offset = 3;
        assert!(BootImage::synthetic(header, Upcalls::default()).is_err());
    }

    #[test]
    fn words_round_trip_and_bounds_are_checked() {
        let image = BootImage::synthetic(ImageHeader::host_default(), Upcalls::default()).unwrap();
        assert_eq!(image.registry_head(), 0);
        image.set_registry_head(0xdead_0000);
        assert_eq!(image.registry_head(), 0xdead_0000);
        assert_eq!(image.read_word(0).unwrap(), 0xdead_0000);
        image.write_word(8 * WORD, 7).unwrap();
        assert_eq!(image.read_word(8 * WORD).unwrap(), 7);
        assert!(image.read_word(image.heap_len()).is_err());
        assert!(image.write_word(1, 0).is_err());
    }

    #[test]
    fn thread_list_has_one_owner_at_a_time() {
        let image = BootImage::synthetic(ImageHeader::host_default(), Upcalls::default()).unwrap();
        image.claim_registry().unwrap();
        assert_eq!(image.claim_registry(), Err(SubstrateError::ImageInUse));
        image.release_registry();
        image.claim_registry().unwrap();
    }

    #[test]
    fn offsets_are_relative_to_heap() {
        let image = BootImage::synthetic(ImageHeader::host_default(), Upcalls::default()).unwrap();
        assert_eq!(image.registry_head_address(), image.heap_start());
        assert_eq!(image.primordial_address(), image.heap_start() + 64);
        assert!(image.upcalls().run.is_none());
    }
}
