//! Virtual-memory helpers consumed from the host.

use std::sync::atomic::{AtomicUsize, Ordering};

const FALLBACK_PAGE_SIZE: usize = 4096;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Host page size in bytes, queried once.
#[must_use]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf has no preconditions.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = if raw > 0 && (raw as usize).is_power_of_two() {
        raw as usize
    } else {
        FALLBACK_PAGE_SIZE
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

fn page_offset(address: usize) -> usize {
    address & (page_size() - 1)
}

#[must_use]
pub fn is_page_aligned(value: usize) -> bool {
    page_offset(value) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_a_power_of_two() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert!(page >= 4096);
        assert_eq!(page, page_size());
    }

    #[test]
    fn alignment_helpers_agree() {
        let page = page_size();
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(page * 3));
        assert!(!is_page_aligned(page + 1));
        assert_eq!(page_offset(page * 2 + 17), 17);
    }
}
