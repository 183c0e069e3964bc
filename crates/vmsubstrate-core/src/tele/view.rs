//! Decoding of thread locals copied out of a target process.

use super::process::ProcessMemory;
use crate::thread::{NATIVE_INFO_WORDS, NativeThreadLocals, ThreadLocalsLayout};

/// Word shape of the target: size (4 or 8) and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetWord {
    pub size: usize,
    pub big_endian: bool,
}

impl TargetWord {
    #[must_use]
    pub const fn of(layout: &ThreadLocalsLayout) -> Self {
        Self {
            size: layout.word_size,
            big_endian: layout.big_endian,
        }
    }

    /// Decode the word at the start of `bytes`. Missing bytes read as zero.
    #[must_use]
    pub fn decode(&self, bytes: &[u8]) -> u64 {
        let bytes = &bytes[..self.size.min(bytes.len())];
        if self.big_endian {
            bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
        } else {
            bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
        }
    }

    /// Encode `value` into the first `size` bytes of `out`.
    pub fn encode(&self, value: u64, out: &mut [u8]) {
        for (i, byte) in out.iter_mut().take(self.size).enumerate() {
            let shift = if self.big_endian {
                8 * (self.size - 1 - i)
            } else {
                8 * i
            };
            *byte = (value >> shift) as u8;
        }
    }

    /// Sign-correct 32-bit view of a decoded word.
    #[must_use]
    pub const fn as_i32(&self, value: u64) -> i32 {
        if self.size == 4 {
            value as u32 as i32
        } else {
            value as i64 as i32
        }
    }
}

/// Reusable buffers for copies of one thread locals area and its native info.
#[derive(Debug, Default)]
pub struct TeleScratch {
    tla: Vec<u8>,
    native: Vec<u8>,
    native_valid: bool,
}

/// Result of copying one thread locals area out of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loaded {
    /// The area itself could not be read.
    Unreadable,
    /// The area was read; its native info may or may not have been.
    Area,
}

impl TeleScratch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the area at `tla` and then the native info it points to.
    pub(crate) fn load(
        &mut self,
        process: &dyn ProcessMemory,
        layout: &ThreadLocalsLayout,
        tla: usize,
    ) -> Loaded {
        self.tla.clear();
        self.tla.resize(layout.tla_size, 0);
        self.native.clear();
        self.native.resize(layout.native_info_size(), 0);
        self.native_valid = false;
        if process.read_exact(tla, &mut self.tla).is_err() {
            return Loaded::Unreadable;
        }
        let native_address = self.word(layout, layout.native_thread_locals);
        if native_address != 0 {
            self.native_valid = process.read_exact(native_address, &mut self.native).is_ok();
        }
        Loaded::Area
    }

    fn word(&self, layout: &ThreadLocalsLayout, index: usize) -> usize {
        let offset = layout.slot_offset(index);
        TargetWord::of(layout).decode(&self.tla[offset..]) as usize
    }

    pub(crate) fn forward_link(&self, layout: &ThreadLocalsLayout) -> usize {
        self.word(layout, layout.forward_link)
    }

    pub(crate) fn stack_contains(&self, layout: &ThreadLocalsLayout, sp: usize) -> bool {
        self.native_valid
            && decode_native(layout, &self.native).is_some_and(|n| n.stack_contains(sp))
    }

    pub(crate) fn view<'a>(&'a self, layout: &'a ThreadLocalsLayout, address: usize) -> ThreadLocalsView<'a> {
        let native = if self.native_valid {
            decode_native(layout, &self.native)
        } else {
            None
        };
        ThreadLocalsView::new(layout, address, &self.tla, native)
    }
}

fn decode_native(layout: &ThreadLocalsLayout, bytes: &[u8]) -> Option<NativeThreadLocals> {
    let word = TargetWord::of(layout);
    if bytes.len() < NATIVE_INFO_WORDS * word.size {
        return None;
    }
    let mut words = [0usize; NATIVE_INFO_WORDS];
    for (i, slot) in words.iter_mut().enumerate() {
        *slot = word.decode(&bytes[i * word.size..]) as usize;
    }
    Some(NativeThreadLocals::from_words(words))
}

/// A decoded copy of one thread locals area from the target.
#[derive(Debug, Clone, Copy)]
pub struct ThreadLocalsView<'a> {
    layout: &'a ThreadLocalsLayout,
    address: usize,
    tla: &'a [u8],
    native: Option<NativeThreadLocals>,
}

impl<'a> ThreadLocalsView<'a> {
    /// View over raw area bytes copied from `address`.
    #[must_use]
    pub fn new(
        layout: &'a ThreadLocalsLayout,
        address: usize,
        tla: &'a [u8],
        native: Option<NativeThreadLocals>,
    ) -> Self {
        Self {
            layout,
            address,
            tla,
            native,
        }
    }

    #[must_use]
    pub const fn layout(&self) -> &'a ThreadLocalsLayout {
        self.layout
    }

    /// Address of the area in the target.
    #[must_use]
    pub const fn address(&self) -> usize {
        self.address
    }

    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.tla
    }

    /// Slot `index` of the area.
    #[must_use]
    pub fn word(&self, index: usize) -> usize {
        let offset = self.layout.slot_offset(index);
        self.tla
            .get(offset..)
            .map_or(0, |bytes| TargetWord::of(self.layout).decode(bytes) as usize)
    }

    #[must_use]
    pub fn id(&self) -> i32 {
        let word = TargetWord::of(self.layout);
        word.as_i32(self.word(self.layout.id) as u64)
    }

    #[must_use]
    pub fn forward_link(&self) -> usize {
        self.word(self.layout.forward_link)
    }

    #[must_use]
    pub fn backward_link(&self) -> usize {
        self.word(self.layout.backward_link)
    }

    #[must_use]
    pub fn native_address(&self) -> usize {
        self.word(self.layout.native_thread_locals)
    }

    /// Native info, if it could be copied.
    #[must_use]
    pub const fn native(&self) -> Option<NativeThreadLocals> {
        self.native
    }

    #[must_use]
    pub fn contains(&self, sp: usize) -> bool {
        self.native.is_some_and(|n| n.stack_contains(sp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::ImageHeader;

    #[test]
    fn decodes_both_byte_orders() {
        let le = TargetWord { size: 4, big_endian: false };
        let be = TargetWord { size: 4, big_endian: true };
        let bytes = [0x78, 0x56, 0x34, 0x12, 0xff];
        assert_eq!(le.decode(&bytes), 0x1234_5678);
        assert_eq!(be.decode(&bytes), 0x7856_3412);
        let mut out = [0u8; 4];
        be.encode(0xdead_beef, &mut out);
        assert_eq!(out, [0xde, 0xad, 0xbe, 0xef]);
        le.encode(0xdead_beef, &mut out);
        assert_eq!(out, [0xef, 0xbe, 0xad, 0xde]);
    }

    #[test]
    fn ids_keep_their_sign() {
        let narrow = TargetWord { size: 4, big_endian: false };
        let wide = TargetWord { size: 8, big_endian: false };
        assert_eq!(narrow.as_i32(0xffff_fffe), -2);
        assert_eq!(wide.as_i32(u64::MAX), -1);
        assert_eq!(wide.as_i32(7), 7);
    }

    #[test]
    fn view_decodes_a_big_endian_32_bit_area() {
        let mut header = ImageHeader::host_default();
        header.word_size = 4;
        header.is_big_endian = 1;
        header.thread_locals_area_size = 64;
        let layout = ThreadLocalsLayout::from_header(&header).unwrap();
        let word = TargetWord::of(&layout);
        let mut area = vec![0u8; 64];
        word.encode((-9i32) as u32 as u64, &mut area[layout.slot_offset(layout.id)..]);
        word.encode(0x4000, &mut area[layout.slot_offset(layout.forward_link)..]);
        word.encode(0x5000, &mut area[layout.slot_offset(layout.native_thread_locals)..]);
        let native = NativeThreadLocals {
            stack_base: 0x8000,
            stack_size: 0x1000,
            ..NativeThreadLocals::default()
        };
        let view = ThreadLocalsView::new(&layout, 0x3000, &area, Some(native));
        assert_eq!(view.id(), -9);
        assert_eq!(view.forward_link(), 0x4000);
        assert_eq!(view.native_address(), 0x5000);
        assert!(view.contains(0x8000));
        assert!(!view.contains(0x9000));
    }
}
