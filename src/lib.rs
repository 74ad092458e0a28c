//! A region (arena) allocator and a shared-memory slab allocator for a
//! network server runtime, plus the cross-process mutex the slab pool
//! needs to be usable from more than one worker at a time.
//!
//! - [`region`] is a single-process bump allocator meant for one
//!   request's or one connection's lifetime: fast allocation, no
//!   per-object free, bulk teardown.
//! - [`slab`] is a size-classed allocator meant to live in memory
//!   shared by several processes: individually freeable chunks, a
//!   little slower per call, coordinated by [`mutex::SharedMutex`].
//! - [`map`] is the narrow seam that gets either of the above its
//!   backing memory (anonymous or file-backed `MAP_SHARED` segments).

mod cleanup;
mod error;
mod map;
mod mutex;
mod region;
mod slab;

use std::os::raw::c_char;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

pub use cleanup::{CleanupHandler, FileCleanupData};
pub use error::{OomError, PoolLog, SlabFault};
pub use map::{page_size, SharedSegment};
pub use mutex::SharedMutex;
pub use region::{FreeLargeResult, Region};
pub use slab::{SlabConfig, SlabPool};

/// Creates a region with the given block size.
///
/// # Safety
///
/// `out` must be a valid, aligned, writable pointer for a
/// `*mut Region`. On success this writes the new region's handle
/// through it and returns `true`; on failure `out` is left untouched
/// and this returns `false`.
#[no_mangle]
pub unsafe extern "C" fn region_create(block_size: usize, out: *mut *mut Region) -> bool {
    match Region::create(block_size, PoolLog::silent()) {
        Ok(region) => {
            *out = Box::into_raw(Box::new(region));
            true
        }
        Err(_) => false,
    }
}

/// Destroys a region created by [`region_create`], running every
/// registered cleanup and releasing all of its memory.
///
/// # Safety
///
/// `region` must be a pointer previously returned by [`region_create`],
/// not already destroyed.
#[no_mangle]
pub unsafe extern "C" fn region_destroy(region: *mut Region) {
    if !region.is_null() {
        drop(Box::from_raw(region));
    }
}

/// Allocates `n` aligned bytes from `region`. Returns null on failure.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_alloc(region: *mut Region, n: usize) -> *mut u8 {
    (*region)
        .allocate(n)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Like [`region_alloc`], but small allocations are packed without
/// rounding up to the region's alignment; use for byte buffers with no
/// alignment requirement of their own.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_alloc_unaligned(region: *mut Region, n: usize) -> *mut u8 {
    (*region)
        .allocate_unaligned(n)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Like [`region_alloc`], but the returned memory is zero-filled.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_alloc_zeroed(region: *mut Region, n: usize) -> *mut u8 {
    (*region)
        .allocate_zeroed(n)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Allocates `n` bytes aligned to `align`, always through the
/// large-object path.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_alloc_memalign(
    region: *mut Region,
    n: usize,
    align: usize,
) -> *mut u8 {
    (*region)
        .allocate_aligned(n, align)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Frees a large allocation previously returned by `region_alloc*`.
/// Returns `false` for a pointer the region does not recognize as one
/// of its large allocations (including pointers carved out of a
/// block, which are reclaimed only at reset/destroy).
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`]; `ptr` must
/// either be null or a pointer this region previously returned.
#[no_mangle]
pub unsafe extern "C" fn region_free_large(region: *mut Region, ptr: *mut u8) -> bool {
    match NonNull::new(ptr) {
        Some(ptr) => (*region).free_large(ptr) == FreeLargeResult::Freed,
        None => false,
    }
}

/// Resets `region` to its just-created state without running cleanup
/// handlers; see [`Region::reset`].
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_reset(region: *mut Region) {
    (*region).reset();
}

/// Registers `handler` as a cleanup running at region teardown, with
/// `aux_size` bytes of handler-owned scratch space. Returns that
/// scratch buffer for the caller to fill in, or null on failure; a
/// zero `aux_size` still returns a valid (zero-sized) non-null pointer
/// on success.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`]. `handler`
/// must be safe to call with a pointer to `aux_size` bytes of region
/// memory once the region is torn down.
#[no_mangle]
pub unsafe extern "C" fn region_add_cleanup(
    region: *mut Region,
    aux_size: usize,
    handler: CleanupHandler,
) -> *mut u8 {
    match (*region).add_cleanup(aux_size, handler) {
        Some(record) => {
            let data = (*record.as_ptr()).data;
            if data.is_null() {
                // `aux_size == 0`: hand back the record itself as a
                // non-null sentinel, never dereferenced as data.
                record.as_ptr() as *mut u8
            } else {
                data
            }
        }
        None => std::ptr::null_mut(),
    }
}

/// Registers a cleanup that closes (and, if `delete` is set, unlinks)
/// `fd` when `region` is eventually destroyed.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`]. `name`, if
/// non-null, must point to a NUL-terminated, valid UTF-8 path.
#[no_mangle]
pub unsafe extern "C" fn region_add_file_cleanup(
    region: *mut Region,
    fd: RawFd,
    name: *const c_char,
    delete: bool,
) -> bool {
    let name_bytes = if name.is_null() {
        None
    } else {
        Some(std::ffi::CStr::from_ptr(name).to_bytes())
    };

    (*region).add_file_cleanup(fd, name_bytes, delete).is_some()
}

/// Runs the registered file cleanup for `fd` immediately, rather than
/// waiting for `region_destroy`. A no-op if no such cleanup exists.
///
/// # Safety
///
/// `region` must be a live pointer from [`region_create`].
#[no_mangle]
pub unsafe extern "C" fn region_run_file_cleanup(region: *mut Region, fd: RawFd) {
    (*region).run_file_cleanup(fd);
}

/// Initializes a slab pool inside `[base, base + len)`, which the
/// caller must have already mapped `MAP_SHARED` (see
/// [`SharedSegment`]). Returns null on failure.
///
/// # Safety
///
/// `base` must be valid for reads and writes for `len` bytes and must
/// outlive every handle obtained from it, in every attached process.
#[no_mangle]
pub unsafe extern "C" fn slab_init(base: *mut u8, len: usize, min_shift: u32) -> *mut SlabPool {
    let base = match NonNull::new(base) {
        Some(base) => base,
        None => return std::ptr::null_mut(),
    };

    match SlabPool::init(base, len, SlabConfig { min_shift }, PoolLog::silent()) {
        Ok(pool) => Box::into_raw(Box::new(pool)),
        Err(_) => std::ptr::null_mut(),
    }
}

/// Attaches to a slab pool a previous process already initialized with
/// [`slab_init`], at the same address it was mapped there.
///
/// # Safety
///
/// `base` must point at memory a prior `slab_init` call set up, still
/// mapped at this same address in the calling process.
#[no_mangle]
pub unsafe extern "C" fn slab_attach(base: *mut u8) -> *mut SlabPool {
    match NonNull::new(base) {
        Some(base) => Box::into_raw(Box::new(SlabPool::attach(base))),
        None => std::ptr::null_mut(),
    }
}

/// Releases a pool handle obtained from [`slab_init`] or
/// [`slab_attach`]. Does not unmap or otherwise affect the underlying
/// shared memory: other processes may still be attached to it.
///
/// # Safety
///
/// `pool` must be a pointer previously returned by [`slab_init`] or
/// [`slab_attach`], not already released.
#[no_mangle]
pub unsafe extern "C" fn slab_pool_release(pool: *mut SlabPool) {
    if !pool.is_null() {
        drop(Box::from_raw(pool));
    }
}

/// Takes `pool`'s mutex, for a caller batching several `_locked`
/// operations under one critical section.
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`].
/// The caller must release the lock with [`slab_pool_unlock`] before
/// any other thread or process can make progress against `pool`.
#[no_mangle]
pub unsafe extern "C" fn slab_pool_lock(pool: *const SlabPool) {
    (*pool).lock();
}

/// Releases the mutex acquired by [`slab_pool_lock`].
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`],
/// currently locked by the calling thread via [`slab_pool_lock`].
#[no_mangle]
pub unsafe extern "C" fn slab_pool_unlock(pool: *const SlabPool) {
    (*pool).unlock();
}

/// Allocates `size` bytes from `pool`. Returns null on failure.
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`].
#[no_mangle]
pub unsafe extern "C" fn slab_alloc(pool: *const SlabPool, size: usize) -> *mut u8 {
    (*pool)
        .slab_alloc(size)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Like [`slab_alloc`], but assumes the caller already holds `pool`'s
/// mutex (see [`slab_pool_lock`]).
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`],
/// locked by the calling thread.
#[no_mangle]
pub unsafe extern "C" fn slab_alloc_locked(pool: *const SlabPool, size: usize) -> *mut u8 {
    (*pool)
        .slab_alloc_locked(size)
        .map_or(std::ptr::null_mut(), NonNull::as_ptr)
}

/// Frees a chunk previously returned by [`slab_alloc`]. A foreign or
/// already-freed pointer is logged and otherwise ignored, rather than
/// causing undefined behavior.
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`];
/// `ptr`, if non-null, must either be a pointer this pool previously
/// returned or otherwise satisfy that same contract.
#[no_mangle]
pub unsafe extern "C" fn slab_free(pool: *const SlabPool, ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        (*pool).slab_free(ptr);
    }
}

/// Like [`slab_free`], but assumes the caller already holds `pool`'s
/// mutex (see [`slab_pool_lock`]).
///
/// # Safety
///
/// `pool` must be a live pointer from [`slab_init`] or [`slab_attach`],
/// locked by the calling thread; `ptr`, if non-null, must either be a
/// pointer this pool previously returned or otherwise satisfy that
/// same contract.
#[no_mangle]
pub unsafe extern "C" fn slab_free_locked(pool: *const SlabPool, ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        let _ = (*pool).slab_free_locked(ptr);
    }
}
