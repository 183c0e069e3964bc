//! Word layout of a thread locals area, as dictated by the boot image header.

use crate::error::{SubstrateError, SubstrateResult};
use crate::image::ImageHeader;

/// Number of words in [`NativeThreadLocals`].
pub const NATIVE_INFO_WORDS: usize = 6;

/// Per-thread native information, laid out as consecutive machine words.
///
/// Word order is fixed: remote readers decode it by index.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NativeThreadLocals {
    /// OS thread handle.
    pub handle: usize,
    pub stack_base: usize,
    pub stack_size: usize,
    /// First address above the stack guard page.
    pub stack_yellow_zone: usize,
    /// Address of the owning thread locals block.
    pub tl_block: usize,
    pub tl_block_size: usize,
}

impl NativeThreadLocals {
    pub(crate) const HANDLE: usize = 0;
    pub(crate) const STACK_BASE: usize = 1;
    pub(crate) const STACK_SIZE: usize = 2;
    pub(crate) const STACK_YELLOW_ZONE: usize = 3;
    pub(crate) const TL_BLOCK: usize = 4;
    pub(crate) const TL_BLOCK_SIZE: usize = 5;

    #[must_use]
    pub(crate) const fn to_words(self) -> [usize; NATIVE_INFO_WORDS] {
        [
            self.handle,
            self.stack_base,
            self.stack_size,
            self.stack_yellow_zone,
            self.tl_block,
            self.tl_block_size,
        ]
    }

    #[must_use]
    pub(crate) const fn from_words(words: [usize; NATIVE_INFO_WORDS]) -> Self {
        Self {
            handle: words[Self::HANDLE],
            stack_base: words[Self::STACK_BASE],
            stack_size: words[Self::STACK_SIZE],
            stack_yellow_zone: words[Self::STACK_YELLOW_ZONE],
            tl_block: words[Self::TL_BLOCK],
            tl_block_size: words[Self::TL_BLOCK_SIZE],
        }
    }

    /// `stack_base <= sp < stack_base + stack_size`.
    #[must_use]
    pub const fn stack_contains(&self, sp: usize) -> bool {
        sp >= self.stack_base && sp - self.stack_base < self.stack_size
    }
}

/// Validated slot indices of a thread locals area plus the target's word shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadLocalsLayout {
    pub word_size: usize,
    pub big_endian: bool,
    /// Size in bytes of one thread locals area.
    pub tla_size: usize,
    pub safepoint_latch: usize,
    pub safepoints_enabled: usize,
    pub safepoints_disabled: usize,
    pub safepoints_triggered: usize,
    pub native_thread_locals: usize,
    pub forward_link: usize,
    pub backward_link: usize,
    pub id: usize,
    pub jni_env: usize,
    pub last_java_frame_anchor: usize,
    pub trap_number: usize,
    pub trap_instruction_pointer: usize,
    pub trap_fault_address: usize,
    pub trap_latch_register: usize,
    pub stack_reference_map: usize,
    pub stack_reference_map_size: usize,
}

impl ThreadLocalsLayout {
    /// Extract and check the layout described by `header`.
    ///
    /// The word size may be 4 or 8 and need not match the host, so a debugger can
    /// decode a foreign target.
    pub fn from_header(header: &ImageHeader) -> SubstrateResult<Self> {
        let word_size = match header.word_size {
            4 => 4,
            8 => 8,
            other => return Err(invalid(format!("unsupported word size {other}"))),
        };
        let tla_size = usize::try_from(header.thread_locals_area_size)
            .ok()
            .filter(|&size| size > 0 && size % word_size == 0)
            .ok_or_else(|| {
                invalid(format!(
                    "thread locals area size {} is not a positive multiple of {word_size}",
                    header.thread_locals_area_size
                ))
            })?;
        let words = tla_size / word_size;
        let mut seen = vec![false; words];
        let mut slot = |name: &str, index: i32| -> SubstrateResult<usize> {
            let index = usize::try_from(index)
                .ok()
                .filter(|&i| i < words)
                .ok_or_else(|| invalid(format!("{name} index {index} outside a {words}-word area")))?;
            if std::mem::replace(&mut seen[index], true) {
                return Err(invalid(format!("{name} index {index} is assigned twice")));
            }
            Ok(index)
        };
        Ok(Self {
            word_size,
            big_endian: header.big_endian(),
            tla_size,
            safepoint_latch: slot("SAFEPOINT_LATCH", header.safepoint_latch)?,
            safepoints_enabled: slot(
                "SAFEPOINTS_ENABLED_THREAD_LOCALS",
                header.safepoints_enabled_thread_locals,
            )?,
            safepoints_disabled: slot(
                "SAFEPOINTS_DISABLED_THREAD_LOCALS",
                header.safepoints_disabled_thread_locals,
            )?,
            safepoints_triggered: slot(
                "SAFEPOINTS_TRIGGERED_THREAD_LOCALS",
                header.safepoints_triggered_thread_locals,
            )?,
            native_thread_locals: slot("NATIVE_THREAD_LOCALS", header.native_thread_locals)?,
            forward_link: slot("FORWARD_LINK", header.forward_link)?,
            backward_link: slot("BACKWARD_LINK", header.backward_link)?,
            id: slot("ID", header.id)?,
            jni_env: slot("JNI_ENV", header.jni_env)?,
            last_java_frame_anchor: slot("LAST_JAVA_FRAME_ANCHOR", header.last_java_frame_anchor)?,
            trap_number: slot("TRAP_NUMBER", header.trap_number)?,
            trap_instruction_pointer: slot(
                "TRAP_INSTRUCTION_POINTER",
                header.trap_instruction_pointer,
            )?,
            trap_fault_address: slot("TRAP_FAULT_ADDRESS", header.trap_fault_address)?,
            trap_latch_register: slot("TRAP_LATCH_REGISTER", header.trap_latch_register)?,
            stack_reference_map: slot("STACK_REFERENCE_MAP", header.stack_reference_map)?,
            stack_reference_map_size: slot(
                "STACK_REFERENCE_MAP_SIZE",
                header.stack_reference_map_size,
            )?,
        })
    }

    /// Words in one thread locals area.
    #[must_use]
    pub const fn tla_words(&self) -> usize {
        self.tla_size / self.word_size
    }

    /// Byte offset of slot `index` within an area.
    #[must_use]
    pub const fn slot_offset(&self, index: usize) -> usize {
        index * self.word_size
    }

    /// Bytes occupied by [`NativeThreadLocals`] on the target.
    #[must_use]
    pub const fn native_info_size(&self) -> usize {
        NATIVE_INFO_WORDS * self.word_size
    }
}

fn invalid(reason: String) -> SubstrateError {
    SubstrateError::InvalidImage(reason)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_header_yields_sixteen_word_layout() {
        let layout = ThreadLocalsLayout::from_header(&ImageHeader::host_default()).unwrap();
        assert_eq!(layout.tla_words(), 16);
        assert_eq!(layout.forward_link, 5);
        assert_eq!(layout.slot_offset(layout.id), 7 * layout.word_size);
        assert_eq!(layout.native_info_size(), 6 * layout.word_size);
    }

    #[test]
    fn accepts_foreign_word_size() {
        let mut header = ImageHeader::host_default();
        header.word_size = 4;
        header.is_big_endian = 1;
        header.thread_locals_area_size = 64;
        let layout = ThreadLocalsLayout::from_header(&header).unwrap();
        assert_eq!(layout.word_size, 4);
        assert!(layout.big_endian);
        assert_eq!(layout.tla_words(), 16);
    }

    #[test]
    fn rejects_out_of_range_and_duplicate_slots() {
        let mut header = ImageHeader::host_default();
        header.jni_env = 16;
        assert!(ThreadLocalsLayout::from_header(&header).is_err());

        let mut header = ImageHeader::host_default();
        header.backward_link = header.forward_link;
        let err = ThreadLocalsLayout::from_header(&header).unwrap_err();
        assert!(err.to_string().contains("assigned twice"));

        let mut header = ImageHeader::host_default();
        header.word_size = 2;
        assert!(ThreadLocalsLayout::from_header(&header).is_err());
    }

    #[test]
    fn native_info_words_round_trip_in_order() {
        let ntl = NativeThreadLocals {
            handle: 1,
            stack_base: 0x1000,
            stack_size: 0x2000,
            stack_yellow_zone: 0x2000,
            tl_block: 5,
            tl_block_size: 6,
        };
        assert_eq!(ntl.to_words(), [1, 0x1000, 0x2000, 0x2000, 5, 6]);
        assert_eq!(NativeThreadLocals::from_words(ntl.to_words()), ntl);
        assert!(ntl.stack_contains(0x1000));
        assert!(ntl.stack_contains(0x2fff));
        assert!(!ntl.stack_contains(0x3000));
        assert!(!ntl.stack_contains(0xfff));
    }
}
