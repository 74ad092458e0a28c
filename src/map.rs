//! Helpers for obtaining the `MAP_SHARED` mappings that host a slab
//! pool's segment.
//!
//! The slab allocator itself is agnostic to how its `[base, end)` byte
//! range was obtained — that is the caller's responsibility — but a
//! crate in this position still needs a small, well-isolated seam for
//! acquiring such memory, both for its own tests and for embedding
//! code that doesn't want to hand-roll `mmap` calls: one narrow module
//! other code calls into, instead of `libc::mmap` calls scattered
//! throughout the allocator.

use std::ffi::c_void;
use std::fs::File;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::OomError;

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    lazy_static::lazy_static! {
        static ref PAGE_SIZE: usize = {
            let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            assert!(ret > 0, "sysconf(_SC_PAGESIZE) failed");
            ret as usize
        };
    }

    *PAGE_SIZE
}

/// Rounds `size` up to the next multiple of the page size.
pub fn round_up_to_page(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) / page * page
}

/// A `MAP_SHARED` mapping, backed either by anonymous memory or by a
/// temporary file, and the size it spans.
///
/// Dropping a `SharedSegment` unmaps it. Any pool header or page data
/// living inside must have been torn down first: unmapping is purely
/// an address-space operation and does not run the pool's own
/// teardown.
pub struct SharedSegment {
    base: NonNull<u8>,
    len: usize,
    // Kept alive only to hold the backing file open for the lifetime
    // of the mapping; `None` for anonymous segments.
    _file: Option<File>,
}

impl SharedSegment {
    /// Reserves and backs `len` bytes of anonymous shared memory.
    /// `len` is rounded up to a whole number of pages.
    ///
    /// Two distinct processes can only share an anonymous mapping if
    /// one is forked from the other (`MAP_ANONYMOUS | MAP_SHARED`
    /// survives `fork`, not arbitrary process attachment); use
    /// [`SharedSegment::new_file_backed`] for unrelated processes.
    pub fn new_anonymous(len: usize) -> Result<Self, OomError> {
        let len = round_up_to_page(len.max(1));

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(OomError);
        }

        Ok(SharedSegment {
            base: NonNull::new(addr as *mut u8).expect("mmap returned non-null on success"),
            len,
            _file: None,
        })
    }

    /// Reserves and backs `len` bytes of shared memory through a
    /// temporary file in `dir` (or the system temp directory when
    /// `dir` is `None`), so unrelated processes can attach to the same
    /// segment by sharing the file descriptor or re-opening the path.
    pub fn new_file_backed(len: usize, dir: Option<&Path>) -> Result<Self, OomError> {
        let len = round_up_to_page(len.max(1));

        let file = match dir {
            Some(dir) => tempfile::tempfile_in(dir),
            None => tempfile::tempfile(),
        }
        .map_err(|_| OomError)?;

        file.set_len(len as u64).map_err(|_| OomError)?;

        let addr = unsafe {
            use std::os::unix::io::AsRawFd;
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(OomError);
        }

        Ok(SharedSegment {
            base: NonNull::new(addr as *mut u8).expect("mmap returned non-null on success"),
            len,
            _file: Some(file),
        })
    }

    /// The first byte of the mapping.
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The number of bytes spanned by the mapping (a multiple of the
    /// page size, possibly larger than what was requested).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The mapping as a byte slice. Other processes may be writing to
    /// this memory concurrently through the slab pool's own mutex
    /// discipline; callers outside the pool's locked section must not
    /// assume exclusive access.
    ///
    /// # Safety
    ///
    /// The caller must not alias this slice with a `&mut [u8]` view of
    /// the same bytes while either is live.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base.as_ptr(), self.len)
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut c_void, self.len);
        }
    }
}

// `SharedSegment` can be sent to another thread (the memory behind it
// is process-wide, not thread-local); it is not `Sync` on its own,
// since aliased mutable access to the raw bytes is the caller's
// responsibility, not this type's.
unsafe impl Send for SharedSegment {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn page_size_is_sane() {
        let size = page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "page size must be a power of two");
    }

    #[test]
    fn anonymous_segment_round_trips() {
        let segment = SharedSegment::new_anonymous(4096 * 4).expect("mmap should succeed");
        assert!(segment.len() >= 4096 * 4);

        unsafe {
            std::ptr::write_bytes(segment.base().as_ptr(), 0x42, segment.len());
            let slice = segment.as_slice();
            assert!(slice.iter().all(|&b| b == 0x42));
        }
    }

    #[test]
    fn file_backed_segment_round_trips() {
        let segment =
            SharedSegment::new_file_backed(4096 * 2, None).expect("tempfile mmap should succeed");
        assert!(segment.len() >= 4096 * 2);

        unsafe {
            std::ptr::write_bytes(segment.base().as_ptr(), 0x7a, segment.len());
            let slice = segment.as_slice();
            assert!(slice.iter().all(|&b| b == 0x7a));
        }
    }
}
