//! Packet buffer pool backing the in-tree drivers.
//!
//! Buffers are carved out of large raw arenas, huge-page backed when the
//! system allows, and recycled through a free list. A [`PoolPacket`] keeps
//! its arena alive, so packets may outlive the driver that produced them
//! (the transport retains received packets during message reassembly).

use std::cell::RefCell;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::slice;

use libc::*;

use crate::util::likely::*;

const HUGE_PAGE_SIZE: usize = 1 << 21;
const CACHELINE_SIZE: usize = 64;

enum AllocType {
    Mmap,
    Malloc,
}

/// One large raw allocation.
struct RawArena {
    ptr: *mut u8,
    len: usize,
    alloc_type: AllocType,
}

impl Drop for RawArena {
    fn drop(&mut self) {
        // SAFETY: FFI; `ptr`/`len` are exactly what the allocation returned.
        unsafe {
            match self.alloc_type {
                AllocType::Mmap => {
                    assert!(munmap(self.ptr as *mut c_void, self.len) == 0, "munmap failed")
                }
                AllocType::Malloc => free(self.ptr as *mut c_void),
            }
        };
    }
}

#[inline]
fn alloc_mmap(len: usize, flags: i32) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        ) as *mut u8
    };

    if ret != MAP_FAILED as _ {
        ret
    } else {
        ptr::null_mut()
    }
}

/// Allocate a raw arena of at least `len` bytes, preferring huge pages.
fn alloc_arena(len: usize) -> RawArena {
    // Roundup to huge page size.
    let len = (len + HUGE_PAGE_SIZE - 1) & !(HUGE_PAGE_SIZE - 1);

    // 1. Try to allocate huge pages. Anonymous mmap memory is zero-filled.
    let ptr = alloc_mmap(len, MAP_HUGETLB);
    if !ptr.is_null() {
        return RawArena {
            ptr,
            len,
            alloc_type: AllocType::Mmap,
        };
    }

    log::warn!(
        "failed to mmap {}MB hugepages, trying normal pages; performance can be low.",
        len >> 20
    );

    // 2. Try to allocate normal pages.
    let ptr = alloc_mmap(len, 0);
    if likely(!ptr.is_null()) {
        return RawArena {
            ptr,
            len,
            alloc_type: AllocType::Mmap,
        };
    }

    log::warn!(
        "failed to mmap {}MB normal pages, trying posix_memalign; performance can be low.",
        len >> 20
    );

    // 3. Fall back to posix_memalign, aligned to page size.
    let mut raw = ptr::null_mut();
    // SAFETY: FFI.
    let rc = unsafe { posix_memalign(&mut raw, 1 << 12, len) };
    if likely(rc == 0) {
        // posix_memalign memory is uninitialized; zero it so packet buffers
        // can always be viewed as initialized byte slices.
        unsafe { ptr::write_bytes(raw as *mut u8, 0, len) };
        return RawArena {
            ptr: raw as *mut u8,
            len,
            alloc_type: AllocType::Malloc,
        };
    }

    panic!("failed to allocate {}MB memory", len >> 20);
}

struct PoolShared {
    /// Allocated arena registry. Only released when the last packet is gone.
    arenas: Vec<RawArena>,

    /// Recycled buffer slots.
    free: Vec<NonNull<u8>>,

    /// Size of one buffer slot.
    unit: usize,
}

/// A pool of fixed-size packet buffers.
pub(crate) struct PacketPool {
    shared: Rc<RefCell<PoolShared>>,
}

impl PacketPool {
    const ARENA_SIZE: usize = 1 << 21;

    /// Create a pool handing out buffers of at least `unit` bytes.
    pub fn new(unit: usize) -> Self {
        // Roundup to cacheline size so slots do not share lines.
        let unit = (unit + CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1);
        assert!(unit <= Self::ARENA_SIZE, "PacketPool: unit size too large");
        Self {
            shared: Rc::new(RefCell::new(PoolShared {
                arenas: Vec::new(),
                free: Vec::new(),
                unit,
            })),
        }
    }

    /// Pool exhausted, so carve a fresh arena into buffer slots.
    #[cold]
    fn grow(shared: &mut PoolShared) {
        let arena = alloc_arena(Self::ARENA_SIZE);
        let mut offset = 0;
        while offset + shared.unit <= arena.len {
            // SAFETY: within the arena just allocated, never null.
            let slot = unsafe { NonNull::new_unchecked(arena.ptr.add(offset)) };
            shared.free.push(slot);
            offset += shared.unit;
        }
        shared.arenas.push(arena);
    }

    /// Take a buffer out of the pool.
    pub fn alloc(&self) -> PoolPacket {
        let mut shared = self.shared.borrow_mut();
        if unlikely(shared.free.is_empty()) {
            Self::grow(&mut shared);
        }

        let ptr = shared.free.pop().unwrap();
        let cap = shared.unit;
        drop(shared);
        PoolPacket {
            ptr,
            cap,
            len: 0,
            shared: self.shared.clone(),
        }
    }
}

/// A packet buffer on loan from a [`PacketPool`]; returns to the pool's
/// free list when dropped.
pub struct PoolPacket {
    ptr: NonNull<u8>,
    cap: usize,
    len: usize,
    shared: Rc<RefCell<PoolShared>>,
}

impl PoolPacket {
    /// The full writable storage of the buffer, for filling by the driver.
    #[inline]
    pub(crate) fn storage_mut(&mut self) -> &mut [u8] {
        // SAFETY: the slot is `cap` bytes of initialized, exclusively owned
        // memory inside a live arena.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }

    /// Set the number of valid bytes in the buffer.
    #[inline]
    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.cap, "len {} > capacity {}", len, self.cap);
        self.len = len;
    }

    /// Number of valid bytes in the buffer.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the buffer holds no valid bytes.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl AsRef<[u8]> for PoolPacket {
    #[inline(always)]
    fn as_ref(&self) -> &[u8] {
        // SAFETY: same as `storage_mut`, restricted to the valid prefix.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolPacket {
    fn drop(&mut self) {
        self.shared.borrow_mut().free.push(self.ptr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_recycle() {
        let pool = PacketPool::new(1500);

        let mut pkt = pool.alloc();
        let storage = pkt.storage_mut();
        assert!(storage.len() >= 1500);
        storage[..4].copy_from_slice(b"abcd");
        pkt.set_len(4);
        assert_eq!(pkt.as_ref(), b"abcd");

        let slot = pkt.ptr;
        drop(pkt);
        // The freed slot is handed out again.
        let pkt2 = pool.alloc();
        assert_eq!(pkt2.ptr, slot);
    }

    #[test]
    fn test_packets_outlive_pool() {
        let pool = PacketPool::new(256);
        let mut pkt = pool.alloc();
        pkt.set_len(16);
        drop(pool);
        // The arena stays alive through the packet's shared handle.
        assert_eq!(pkt.as_ref().len(), 16);
    }
}
