//! Cleanup hooks run at region teardown.
//!
//! A cleanup is a function pointer plus an opaque data pointer, both
//! themselves allocated out of the owning region (see
//! [`crate::region::Region::register_cleanup`]), the same way
//! `ngx_pool_cleanup_t` records live inside the pool they clean up
//! after. Records are plain-old-data: nothing in this module owns a
//! heap allocation that would need `Drop` to run, since the memory
//! backing them is reclaimed as raw bytes when the region's blocks are
//! freed.

use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::error::{pool_error, PoolLog};

/// Signature for a cleanup callback: takes the opaque data pointer
/// stashed alongside it in the same [`CleanupRecord`].
pub type CleanupHandler = unsafe fn(*mut u8);

/// One entry in a region's cleanup chain.
#[repr(C)]
pub(crate) struct CleanupRecord {
    pub(crate) handler: Option<CleanupHandler>,
    pub(crate) data: *mut u8,
    pub(crate) next: Option<NonNull<CleanupRecord>>,
}

/// Payload for [`file_cleanup`] and [`delete_file_cleanup`].
///
/// `name` points at a byte buffer the caller also allocated from the
/// region (or otherwise guarantees outlives the cleanup record); it is
/// not an owned string, matching `data`'s plain-old-data discipline.
#[repr(C)]
pub struct FileCleanupData {
    pub fd: RawFd,
    pub name: Option<(*const u8, usize)>,
    pub log: PoolLog,
}

impl FileCleanupData {
    /// Returns the file name as a string, if one was provided and is
    /// valid UTF-8.
    ///
    /// # Safety
    ///
    /// The `name` buffer must still be alive and must not have been
    /// mutated since it was recorded.
    pub unsafe fn name(&self) -> Option<&str> {
        self.name.and_then(|(ptr, len)| {
            std::str::from_utf8(std::slice::from_raw_parts(ptr, len)).ok()
        })
    }
}

/// Closes `data.fd`, logging a failure through `data.log`.
///
/// # Safety
///
/// `data` must point to a live, correctly-typed [`FileCleanupData`].
pub unsafe fn file_cleanup(data: *mut u8) {
    let cleanup = &*(data as *const FileCleanupData);

    if libc::close(cleanup.fd) == -1 {
        pool_error!(
            cleanup.log,
            "close fd {} failed: {}",
            cleanup.fd,
            std::io::Error::last_os_error()
        );
    }
}

/// Deletes the named file (if any), then closes `data.fd`: the
/// "cleanup file, then remove it from disk" handler used for
/// temporary files.
///
/// # Safety
///
/// `data` must point to a live, correctly-typed [`FileCleanupData`].
pub unsafe fn delete_file_cleanup(data: *mut u8) {
    let cleanup = &*(data as *const FileCleanupData);

    if let Some(name) = cleanup.name() {
        if let Err(e) = std::fs::remove_file(name) {
            if e.kind() != std::io::ErrorKind::NotFound {
                pool_error!(cleanup.log, "delete {:?} failed: {}", name, e);
            }
        }
    }

    file_cleanup(data);
}
