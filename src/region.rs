//! A region (arena) allocator: a chain of fixed-size blocks bump-
//! allocated within, plus a side list for allocations too large to fit
//! a block and a LIFO chain of cleanup callbacks run at destruction.
//!
//! This is a direct translation of `ngx_palloc.c`'s pool allocator:
//! same block-chain-with-soft-eviction structure, same large-object
//! list, same cleanup-record chain living inside the pool's own
//! memory, including one deliberate simplification: block memory is
//! never returned to the allocator individually, only all at once
//! when the whole region is torn down.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts")))]
use disabled_contracts::*;

use std::alloc::{alloc, alloc_zeroed, dealloc, Layout};
use std::mem::{align_of, size_of};
use std::os::unix::io::RawFd;
use std::ptr::NonNull;

use crate::cleanup::{delete_file_cleanup, file_cleanup, CleanupHandler, CleanupRecord, FileCleanupData};
use crate::error::{pool_debug, pool_error, OomError, PoolLog};

/// Alignment granted to every `allocate` (but not `allocate_unaligned`)
/// call. 16 covers the common SIMD and `repr(align)` cases without
/// wasting a whole page the way page alignment would.
const ALIGN: usize = 16;

/// A request larger than this fraction of a block's payload bypasses
/// the block chain entirely and is satisfied as its own system
/// allocation, same cutoff nginx's `ngx_pnalloc`/`ngx_palloc` use
/// (`pool->max`, computed once at pool creation).
fn max_small_size(block_size: usize, header: usize) -> usize {
    let payload = block_size.saturating_sub(header);
    std::cmp::min(payload, crate::map::page_size() - 1)
}

/// Per-block bookkeeping, replicated at the front of every block in
/// the chain (including, as its first field, the head block — see
/// [`RegionHead`]).
#[repr(C)]
struct BlockData {
    cursor: *mut u8,
    end: *mut u8,
    next: Option<NonNull<BlockData>>,
    fail_count: u32,
}

/// A node in the large-object side list: one entry per `allocate_over`
/// result, holding the raw pointer returned to the caller (or `None`
/// once freed, so the slot can be reused without unlinking it).
#[repr(C)]
struct LargeRecord {
    ptr: Option<NonNull<u8>>,
    // `size`/`align` pin down the exact `Layout` the allocation was
    // made with, so freeing it can pass `dealloc` a matching layout:
    // the allocator contract requires the freed layout to be identical
    // to the one used to allocate, not merely large enough.
    size: usize,
    align: usize,
    next: Option<NonNull<LargeRecord>>,
}

/// The head block's extra state, in addition to the `BlockData` every
/// block carries. Laid out so that a `*mut RegionHead` is also a valid
/// `*mut BlockData` (the first field), so every block in the chain can
/// be walked through the same `BlockData` view while only the first
/// block's struct has the rest of the fields populated.
#[repr(C)]
struct RegionHead {
    data: BlockData,
    block_size: usize,
    max: usize,
    current: NonNull<BlockData>,
    large: Option<NonNull<LargeRecord>>,
    cleanup: Option<NonNull<CleanupRecord>>,
    log: PoolLog,
}

/// How many consecutive failed-to-satisfy attempts a block tolerates
/// before allocation stops trying it and moves on to the next block.
const FAIL_THRESHOLD: u32 = 4;

/// How many large-object slots `free_over`/allocation scan for a
/// reusable (freed) entry before giving up and appending a new one.
const LARGE_SCAN_CAP: usize = 4;

/// Outcome of freeing a large allocation, so callers can tell "freed"
/// from "not a large allocation we know about" without a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeLargeResult {
    Freed,
    Declined,
}

/// A region (arena) allocator.
///
/// Not `Sync`, not `Send`: a region is meant to be owned and driven by
/// a single thread. Dropping a `Region` runs every registered cleanup
/// (in reverse registration order — see `DESIGN.md`), releases every
/// large allocation, and frees every block.
pub struct Region {
    head: NonNull<RegionHead>,
}

impl Region {
    /// Creates a region whose blocks are each `block_size` bytes
    /// (rounded up to the allocator's alignment). `log` receives
    /// diagnostics for faults the region detects in its own callers
    /// (double-frees, unknown pointers); pass [`PoolLog::silent`] to
    /// suppress them.
    pub fn create(block_size: usize, log: PoolLog) -> Result<Region, OomError> {
        let header = size_of::<RegionHead>();
        let block_size = round_up(block_size.max(header + 2 * size_of::<LargeRecord>()), ALIGN);

        let layout = block_layout(block_size).map_err(|_| OomError)?;
        let raw = unsafe { alloc(layout) };
        let head = NonNull::new(raw as *mut RegionHead).ok_or(OomError)?;

        let max = max_small_size(block_size, header);

        unsafe {
            let end = raw.add(block_size);
            head.as_ptr().write(RegionHead {
                data: BlockData {
                    cursor: raw.add(header),
                    end,
                    next: None,
                    fail_count: 0,
                },
                block_size,
                max,
                current: NonNull::new_unchecked(head.as_ptr() as *mut BlockData),
                large: None,
                cleanup: None,
                log,
            });
        }

        Ok(Region { head })
    }

    fn head(&self) -> &RegionHead {
        unsafe { self.head.as_ref() }
    }

    fn head_mut(&mut self) -> &mut RegionHead {
        unsafe { self.head.as_mut() }
    }

    /// Allocates `n` bytes aligned to [`ALIGN`]. Requests larger than
    /// the region's small-allocation threshold are satisfied as their
    /// own system allocation and tracked on the large-object list.
    #[ensures(ret.is_some() -> ret.unwrap().as_ptr() as usize % ALIGN == 0,
              "every `allocate` result is ALIGN-aligned")]
    pub fn allocate(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n <= self.head().max {
            self.allocate_small(n, ALIGN)
        } else {
            self.allocate_large(n, ALIGN)
        }
    }

    /// Like [`Region::allocate`], but small allocations are packed
    /// without rounding up to [`ALIGN`] (nginx's `ngx_pnalloc`): use
    /// for byte buffers (strings, wire reads) that have no alignment
    /// requirement of their own, to avoid wasting the padding.
    pub fn allocate_unaligned(&mut self, n: usize) -> Option<NonNull<u8>> {
        if n <= self.head().max {
            self.allocate_small(n, 1)
        } else {
            self.allocate_large(n, ALIGN)
        }
    }

    /// Like [`Region::allocate`], but the returned memory is
    /// zero-filled.
    pub fn allocate_zeroed(&mut self, n: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(n)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, n) };
        Some(ptr)
    }

    /// Allocates `n` bytes aligned to `align`, always through the
    /// large-object path (matches `ngx_pmemalign`, which never tries
    /// to satisfy an over-aligned request from a block, since a
    /// block's own bump cursor has no guaranteed alignment beyond
    /// [`ALIGN`]).
    #[requires(align.is_power_of_two(), "alignment must be a power of two")]
    #[ensures(ret.is_some() -> ret.unwrap().as_ptr() as usize % align == 0,
              "the returned address honors the requested alignment")]
    pub fn allocate_aligned(&mut self, n: usize, align: usize) -> Option<NonNull<u8>> {
        self.allocate_large(n, align)
    }

    fn allocate_small(&mut self, n: usize, align: usize) -> Option<NonNull<u8>> {
        let mut block_ptr = Some(self.head().current);

        while let Some(block) = block_ptr {
            let data = unsafe { block.as_ref() };
            let aligned = round_up_ptr(data.cursor, align);
            let fits = unsafe { aligned.add(n) <= data.end };

            if fits {
                unsafe {
                    (*block.as_ptr()).cursor = aligned.add(n);
                }
                return NonNull::new(aligned);
            }

            block_ptr = data.next;
        }

        // No existing block had room: allocate a new block, same as
        // `ngx_palloc_block` (not yet linked onto the chain — linked
        // below, after the skip pass, in the same order the source
        // does it).
        let new_block = self.push_block()?;

        // Soft-eviction, matching `ngx_palloc_block` exactly: walk from
        // `current` to the chain's existing tail, incrementing each
        // block's `fail_count` along the way and advancing the
        // `current` candidate past any block whose *pre-increment*
        // count already exceeded the threshold. Only blocks that
        // failed to satisfy *this* allocation (i.e. every block before
        // the tail) get counted; the tail itself is excluded, same as
        // nginx's `for (p = current; p->d.next; p = p->d.next)`
        // stopping before the still-unlinked last block.
        let mut p = self.head().current;
        let mut new_current = p;
        while let Some(next) = unsafe { p.as_ref().next } {
            let before = unsafe { p.as_ref().fail_count };
            unsafe {
                (*p.as_ptr()).fail_count = before + 1;
            }
            if before > FAIL_THRESHOLD {
                new_current = next;
            }
            p = next;
        }

        unsafe {
            (*p.as_ptr()).next = Some(new_block);
        }
        self.head_mut().current = new_current;

        let data = unsafe { new_block.as_ref() };
        let aligned = round_up_ptr(data.cursor, align);
        unsafe {
            (*new_block.as_ptr()).cursor = aligned.add(n);
        }
        NonNull::new(aligned)
    }

    fn push_block(&mut self) -> Option<NonNull<BlockData>> {
        let block_size = self.head().block_size;
        let header = size_of::<BlockData>();

        let layout = block_layout(block_size).ok()?;
        let raw = unsafe { alloc(layout) };
        let block = NonNull::new(raw as *mut BlockData)?;

        unsafe {
            block.as_ptr().write(BlockData {
                cursor: raw.add(header),
                end: raw.add(block_size),
                next: None,
                fail_count: 0,
            });
        }

        // Linking onto the chain is the caller's responsibility
        // (`allocate_small`), since `ngx_palloc_block` links its new
        // block only after the skip pass over the existing chain.
        Some(block)
    }

    fn allocate_large(&mut self, n: usize, align: usize) -> Option<NonNull<u8>> {
        let size = n.max(1);
        let layout = Layout::from_size_align(size, align).ok()?;
        let raw = unsafe { alloc(layout) };
        let ptr = NonNull::new(raw)?;

        // Reuse a vacated slot if one turns up within the scan cap, so
        // a long-lived region doesn't pay for an unbounded scan on
        // every large allocation.
        let mut slot = self.head().large;
        let mut scanned = 0;
        while let Some(record) = slot {
            if scanned >= LARGE_SCAN_CAP {
                break;
            }
            let data = unsafe { record.as_ref() };
            if data.ptr.is_none() {
                unsafe {
                    (*record.as_ptr()).ptr = Some(ptr);
                    (*record.as_ptr()).size = size;
                    (*record.as_ptr()).align = align;
                }
                return Some(ptr);
            }
            slot = data.next;
            scanned += 1;
        }

        let record = self.allocate_small(size_of::<LargeRecord>(), align_of::<LargeRecord>())?;
        let record = record.cast::<LargeRecord>();
        unsafe {
            record.as_ptr().write(LargeRecord {
                ptr: Some(ptr),
                size,
                align,
                next: self.head().large,
            });
        }
        self.head_mut().large = Some(record);

        Some(ptr)
    }

    /// Frees a large allocation previously returned by this region.
    /// Returns [`FreeLargeResult::Declined`] for any pointer not
    /// currently tracked on the large-object list (including pointers
    /// that came from a block, or were already freed).
    pub fn free_large(&mut self, addr: NonNull<u8>) -> FreeLargeResult {
        let mut slot = self.head().large;
        while let Some(record) = slot {
            let data = unsafe { record.as_ref() };
            if data.ptr == Some(addr) {
                unsafe {
                    let layout = Layout::from_size_align_unchecked(data.size, data.align);
                    dealloc(addr.as_ptr(), layout);
                    (*record.as_ptr()).ptr = None;
                }
                pool_debug!(self.head().log, "freed large allocation");
                return FreeLargeResult::Freed;
            }
            slot = data.next;
        }
        FreeLargeResult::Declined
    }

    /// Resets the region to its just-created state: every block's
    /// cursor moves back past its header, `current` returns to the
    /// head block, and every tracked large allocation is released.
    /// Cleanup handlers are *not* run (matches `ngx_reset_pool`, which
    /// is meant for reuse within a request, not teardown).
    #[ensures(self.head().large.is_none(), "reset releases every large allocation")]
    #[ensures(self.head().cleanup.is_none(), "reset drops the cleanup chain along with its backing memory")]
    pub fn reset(&mut self) {
        let mut slot = self.head().large;
        while let Some(record) = slot {
            let data = unsafe { record.as_ref() };
            if let Some(ptr) = data.ptr {
                unsafe {
                    let layout = Layout::from_size_align_unchecked(data.size, data.align);
                    dealloc(ptr.as_ptr(), layout);
                }
            }
            slot = data.next;
        }
        self.head_mut().large = None;
        self.head_mut().cleanup = None;

        let header = size_of::<BlockData>();
        let mut block = Some(NonNull::new(self.head.as_ptr() as *mut BlockData).unwrap());
        let mut first = true;
        while let Some(b) = block {
            let base = b.as_ptr() as *mut u8;
            let skip = if first { size_of::<RegionHead>() } else { header };
            unsafe {
                (*b.as_ptr()).cursor = base.add(skip);
                (*b.as_ptr()).fail_count = 0;
            }
            block = unsafe { b.as_ref().next };
            first = false;
        }

        self.head_mut().current = NonNull::new(self.head.as_ptr() as *mut BlockData).unwrap();
    }

    /// Reserves `aux_size` bytes of region memory for a cleanup
    /// record's payload and links the record onto the region's
    /// cleanup chain. The handler starts unset; callers must set it
    /// (directly, or through [`Region::add_file_cleanup`] /
    /// [`Region::add_delete_file_cleanup`]) before it will run.
    pub fn register_cleanup(&mut self, aux_size: usize) -> Option<NonNull<CleanupRecord>> {
        let record = self.allocate_small(size_of::<CleanupRecord>(), align_of::<CleanupRecord>())?;
        let record = record.cast::<CleanupRecord>();

        let data = if aux_size > 0 {
            self.allocate_unaligned(aux_size)?.as_ptr()
        } else {
            std::ptr::null_mut()
        };

        unsafe {
            record.as_ptr().write(CleanupRecord {
                handler: None,
                data,
                next: self.head().cleanup,
            });
        }
        self.head_mut().cleanup = Some(record);

        Some(record)
    }

    /// Registers `handler` as a cleanup with `aux_size` bytes of
    /// handler-owned scratch space, and returns the record so the
    /// caller can read or overwrite that scratch space (`data`) before
    /// teardown runs the handler against it.
    pub fn add_cleanup(
        &mut self,
        aux_size: usize,
        handler: CleanupHandler,
    ) -> Option<NonNull<CleanupRecord>> {
        let record = self.register_cleanup(aux_size)?;
        unsafe {
            (*record.as_ptr()).handler = Some(handler);
        }
        Some(record)
    }

    /// Registers a cleanup that closes `fd` at region teardown (and,
    /// if `name` is given, deletes that path first), the same
    /// `ngx_pool_cleanup_file` / `ngx_pool_cleanup_add` pairing used
    /// for temporary request files.
    pub fn add_file_cleanup(&mut self, fd: RawFd, name: Option<&[u8]>, delete: bool) -> Option<()> {
        let name_copy = match name {
            Some(bytes) => {
                let buf = self.allocate_unaligned(bytes.len())?;
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.as_ptr(), bytes.len());
                }
                Some((buf.as_ptr() as *const u8, bytes.len()))
            }
            None => None,
        };

        let log = self.head().log.clone();
        let record = self.register_cleanup(size_of::<FileCleanupData>())?;
        unsafe {
            let data_ptr = (*record.as_ptr()).data as *mut FileCleanupData;
            data_ptr.write(FileCleanupData {
                fd,
                name: name_copy,
                log,
            });
            (*record.as_ptr()).handler = Some(if delete {
                delete_file_cleanup
            } else {
                file_cleanup
            });
        }

        Some(())
    }

    /// Convenience for the common non-deleting case.
    pub fn add_delete_file_cleanup(&mut self, fd: RawFd, name: &[u8]) -> Option<()> {
        self.add_file_cleanup(fd, Some(name), true)
    }

    /// Runs (and unlinks the effect of) the file-cleanup handler
    /// registered for `fd`, without waiting for region teardown.
    /// Matches `ngx_pool_run_cleanup_file`'s early-close-on-request
    /// use: a file handle closed before the request ends should not
    /// be closed again at teardown.
    pub unsafe fn run_file_cleanup(&mut self, fd: RawFd) {
        let mut slot = self.head().cleanup;
        while let Some(record) = slot {
            let rec = record.as_ref();
            if let Some(handler) = rec.handler {
                if handler == file_cleanup || handler == delete_file_cleanup {
                    let data = &*(rec.data as *const FileCleanupData);
                    if data.fd == fd {
                        handler(rec.data);
                        (*record.as_ptr()).handler = None;
                        return;
                    }
                }
            }
            slot = rec.next;
        }
    }

    /// Runs every registered cleanup, releases every large
    /// allocation, and frees every block. Called automatically by
    /// `Drop`; exposed under this name so callers can spell out the
    /// teardown point explicitly instead of relying on scope exit.
    pub fn destroy(self) {
        // `Drop::drop` does the work; this exists purely for the
        // caller-facing name.
    }

    unsafe fn teardown(&mut self) {
        // Cleanup handlers run in the reverse of registration order:
        // the chain is built by prepending (`register_cleanup` always
        // links the new record in front of `head.cleanup`), and this
        // walk visits it head-to-tail, so the most recently registered
        // handler fires first. See `DESIGN.md` for why this, and not
        // insertion order, is the contract this crate commits to.
        let mut slot = self.head().cleanup;
        while let Some(record) = slot {
            let rec = record.as_ref();
            if let Some(handler) = rec.handler {
                handler(rec.data);
            }
            slot = rec.next;
        }

        let mut large = self.head().large;
        while let Some(record) = large {
            let data = record.as_ref();
            if let Some(ptr) = data.ptr {
                let layout = Layout::from_size_align_unchecked(data.size, data.align);
                dealloc(ptr.as_ptr(), layout);
            }
            large = data.next;
        }

        let block_size = self.head().block_size;
        let layout = block_layout(block_size).expect("block_size was validated at create time");

        let mut block = unsafe { self.head.as_ref().data.next };
        while let Some(b) = block {
            let next = b.as_ref().next;
            dealloc(b.as_ptr() as *mut u8, layout);
            block = next;
        }

        pool_debug!(self.head().log, "region destroyed");
        dealloc(self.head.as_ptr() as *mut u8, layout);
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe { self.teardown() };
    }
}

/// The layout every block in a region's chain is allocated with,
/// including the head block. `ALIGN` satisfies both `RegionHead`'s and
/// `BlockData`'s natural alignment, so a single layout shape can be
/// reused for every `alloc`/`dealloc` pair regardless of which struct
/// sits at the front of a given block.
fn block_layout(block_size: usize) -> Result<Layout, std::alloc::LayoutError> {
    Layout::from_size_align(block_size, ALIGN)
}

fn round_up(n: usize, align: usize) -> usize {
    (n + align - 1) / align * align
}

fn round_up_ptr(ptr: *mut u8, align: usize) -> *mut u8 {
    let addr = ptr as usize;
    let rounded = (addr + align - 1) & !(align - 1);
    rounded as *mut u8
}

#[cfg(test)]
mod test {
    use super::*;

    fn region() -> Region {
        Region::create(4096, PoolLog::silent()).unwrap()
    }

    #[test]
    fn small_allocations_round_trip() {
        let mut r = region();
        let a = r.allocate(64).unwrap();
        let b = r.allocate(64).unwrap();
        assert_ne!(a, b);
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0xaa, 64);
            std::ptr::write_bytes(b.as_ptr(), 0xbb, 64);
            assert_eq!(*a.as_ptr(), 0xaa);
            assert_eq!(*b.as_ptr(), 0xbb);
        }
    }

    #[test]
    fn small_allocations_are_aligned() {
        let mut r = region();
        for n in [1usize, 3, 7, 15, 100] {
            let p = r.allocate(n).unwrap();
            assert_eq!(p.as_ptr() as usize % ALIGN, 0);
        }
    }

    #[test]
    fn chain_grows_past_one_block() {
        let mut r = region();
        let mut last = None;
        for _ in 0..200 {
            last = r.allocate(64);
        }
        assert!(last.is_some());
    }

    #[test]
    fn large_allocation_round_trips_and_frees() {
        let mut r = region();
        let big = r.allocate(8192).unwrap();
        unsafe {
            std::ptr::write_bytes(big.as_ptr(), 0x55, 8192);
        }
        assert_eq!(r.free_large(big), FreeLargeResult::Freed);
        assert_eq!(r.free_large(big), FreeLargeResult::Declined);
    }

    #[test]
    fn free_large_declines_small_pointer() {
        let mut r = region();
        let small = r.allocate(16).unwrap();
        assert_eq!(r.free_large(small), FreeLargeResult::Declined);
    }

    #[test]
    fn reset_reclaims_large_allocations_and_cursor() {
        let mut r = region();
        let _ = r.allocate(8192).unwrap();
        let before = r.allocate(16).unwrap();
        r.reset();
        let after = r.allocate(16).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn cleanup_handlers_run_in_reverse_registration_order() {
        use std::cell::RefCell;

        thread_local! {
            static ORDER: RefCell<Vec<u8>> = RefCell::new(Vec::new());
        }

        unsafe fn mark_1(_: *mut u8) {
            ORDER.with(|o| o.borrow_mut().push(1));
        }
        unsafe fn mark_2(_: *mut u8) {
            ORDER.with(|o| o.borrow_mut().push(2));
        }
        unsafe fn mark_3(_: *mut u8) {
            ORDER.with(|o| o.borrow_mut().push(3));
        }

        {
            let mut r = region();
            for handler in [mark_1 as crate::cleanup::CleanupHandler, mark_2, mark_3] {
                let record = r.register_cleanup(0).unwrap();
                unsafe {
                    (*record.as_ptr()).handler = Some(handler);
                }
            }
        }

        ORDER.with(|o| assert_eq!(*o.borrow(), vec![3, 2, 1]));
    }

    #[test]
    fn run_file_cleanup_fires_once_and_is_not_repeated_at_destroy() {
        let mut fds = [0 as std::os::unix::io::RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let [read_fd, write_fd] = fds;

        let mut r = region();
        r.add_file_cleanup(read_fd, None, false).unwrap();

        unsafe {
            r.run_file_cleanup(read_fd);
        }

        // Already closed: a second close must fail with EBADF, proving
        // `run_file_cleanup` actually ran the handler rather than just
        // clearing the record.
        assert_eq!(unsafe { libc::close(read_fd) }, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EBADF));

        // Dropping the region must not attempt to close `read_fd` again
        // (its cleanup handler was already cleared by `run_file_cleanup`).
        drop(r);

        unsafe {
            libc::close(write_fd);
        }
    }

    proptest::proptest! {
        // Replay a random-ish sequence of large-allocate/free choices;
        // every currently-live large allocation must keep a distinct
        // address, whatever order the operations arrived in.
        #[test]
        fn random_order_large_allocations_never_alias(
            ops in proptest::collection::vec((0usize..3, 8192usize..16384), 1..80),
        ) {
            let mut r = region();
            let mut live: Vec<NonNull<u8>> = Vec::new();

            for (choice, size) in ops {
                if choice == 0 || live.is_empty() {
                    if let Some(p) = r.allocate(size) {
                        proptest::prop_assert!(!live.contains(&p));
                        live.push(p);
                    }
                } else {
                    let idx = (choice + size) % live.len();
                    let p = live.swap_remove(idx);
                    let _ = r.free_large(p);
                }
            }
        }
    }
}
