use crate::crypto;
use ctor::dtor;
use lazy_static::lazy_static;
use std::mem;
use std::ptr;
use std::sync::Mutex;

/// Alignment of every block, the platform's widest scalar.
const ALIGN: usize = mem::size_of::<usize>();

/// Hidden word kept in front of every allocation.
const HEADER_SIZE: usize = mem::size_of::<usize>();

/// Smallest region that can stand alone on the free list.
const MIN_BLOCK_SIZE: usize = mem::size_of::<MemoryBlock>();

/// Marker pattern written over freshly allocated payloads.
const FRESH_FILL: u8 = 0x42;

/// Header at the start of every managed region. The link fields are only
/// meaningful while the block sits on the free list; an allocated block
/// retains just the size word, which is why allocations are inflated by
/// `HEADER_SIZE` rather than the full header.
///
/// The low bit of the size word flags the page leader. Sizes are always
/// multiples of `ALIGN`, so the bit never collides with the size itself.
#[repr(C)]
struct MemoryBlock {
    size: usize,
    prev: *mut MemoryBlock,
    next: *mut MemoryBlock,
}

impl MemoryBlock {
    #[inline]
    fn size(&self) -> usize {
        self.size & !1
    }

    #[inline]
    fn set_size(&mut self, value: usize) {
        self.size = value | (self.size & 1);
    }

    #[inline]
    fn mark_as_leader(&mut self) {
        self.size |= 1;
    }

    #[inline]
    fn is_leader(&self) -> bool {
        self.size & 1 == 1
    }
}

/// Free blocks in ascending address order. All blocks live inside pages
/// mapped by `add_page`, so the raw pointers stay valid until the page is
/// retired.
struct FreeList {
    head: *mut MemoryBlock,
    page_size: usize,
}

// The list only ever refers to pages it mapped itself.
unsafe impl Send for FreeList {}

impl FreeList {
    fn new() -> FreeList {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

        FreeList {
            head: ptr::null_mut(),
            page_size,
        }
    }

    unsafe fn add_before(&mut self, target: *mut MemoryBlock, before: *mut MemoryBlock) {
        if (*before).prev.is_null() {
            self.head = target;
        } else {
            (*(*before).prev).next = target;
        }
        (*target).next = before;
        (*target).prev = (*before).prev;
        (*before).prev = target;
    }

    unsafe fn add_after(&mut self, target: *mut MemoryBlock, after: *mut MemoryBlock) {
        (*target).prev = after;
        (*target).next = (*after).next;
        if !(*after).next.is_null() {
            (*(*after).next).prev = target;
        }
        (*after).next = target;
    }

    unsafe fn remove(&mut self, target: *mut MemoryBlock) {
        if (*target).prev.is_null() {
            debug_assert_eq!(self.head, target);
            self.head = (*target).next;
        } else {
            (*(*target).prev).next = (*target).next;
        }
        if !(*target).next.is_null() {
            (*(*target).next).prev = (*target).prev;
        }
    }

    /// Merges two list neighbours when they are also address neighbours.
    unsafe fn try_merge(&mut self, first: *mut MemoryBlock, second: *mut MemoryBlock) -> bool {
        if (first as *mut u8).add((*first).size()) == second as *mut u8 {
            let merged = (*first).size() + (*second).size();
            self.remove(second);
            (*first).set_size(merged);
            return true;
        }
        false
    }

    /// Coalesces `target` with its neighbours. Merges never cross a page
    /// leader, keeping every page an independent unit.
    unsafe fn merge(&mut self, target: *mut MemoryBlock) {
        let mut target = target;

        if !(*target).is_leader() && !(*target).prev.is_null() {
            let prev = (*target).prev;
            if self.try_merge(prev, target) {
                target = prev;
            }
        }

        let next = (*target).next;
        if !next.is_null() && !(*next).is_leader() {
            self.try_merge(target, next);
        }
    }

    /// Inserts `entry` at its address ordered position and coalesces.
    unsafe fn insert(&mut self, entry: *mut MemoryBlock) {
        if self.head.is_null() {
            self.head = entry;
            (*entry).prev = ptr::null_mut();
            (*entry).next = ptr::null_mut();
            return;
        }

        let mut target = self.head;
        while !(*target).next.is_null() {
            if target > entry {
                break;
            }
            target = (*target).next;
        }

        if target > entry {
            self.add_before(entry, target);
        } else {
            self.add_after(entry, target);
        }

        self.merge(entry);
    }

    /// First fit in ascending address order.
    unsafe fn find_suitable(&self, size: usize) -> *mut MemoryBlock {
        let mut entry = self.head;
        while !entry.is_null() {
            if (*entry).size() >= size {
                break;
            }
            entry = (*entry).next;
        }
        entry
    }

    /// Maps one anonymous, private, locked, non reserved page and inserts it
    /// as a single leader block.
    unsafe fn add_page(&mut self) {
        let page = libc::mmap(
            ptr::null_mut(),
            self.page_size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_LOCKED | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if page == libc::MAP_FAILED {
            panic!("Failure mapping a hardened page");
        }
        if libc::mlock(page, self.page_size) == -1 {
            libc::munmap(page, self.page_size);
            panic!("Failure locking a hardened page into memory");
        }

        let entry = page as *mut MemoryBlock;
        (*entry).size = 0;
        (*entry).set_size(self.page_size);
        (*entry).mark_as_leader();
        self.insert(entry);
    }

    /// Scrubs, unlocks and unmaps a fully coalesced page.
    unsafe fn remove_page(&mut self, entry: *mut MemoryBlock) {
        debug_assert!((*entry).is_leader() && (*entry).size() == self.page_size);

        self.remove(entry);
        crypto::random_fill(entry as *mut u8, self.page_size);
        libc::munlock(entry as *const libc::c_void, self.page_size);
        libc::munmap(entry as *mut libc::c_void, self.page_size);
    }
}

/// Page granular allocator for secret material. Every page is pinned into
/// physical memory and never reserved from swap; released payloads are
/// overwritten with entropy before they rejoin the free list, and retired
/// pages are overwritten wholesale before `munmap`.
pub struct HardenedHeap {
    page_size: usize,
    list: Mutex<FreeList>,
}

impl HardenedHeap {
    pub fn new() -> HardenedHeap {
        let list = FreeList::new();

        HardenedHeap {
            page_size: list.page_size,
            list: Mutex::new(list),
        }
    }

    /// Size of the pages backing this heap.
    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Allocates `request` payload bytes inside a locked page and returns
    /// the payload address. The payload arrives filled with a constant
    /// marker pattern.
    ///
    /// Requests that cannot fit in a single page, and failures to map or
    /// lock a fresh page, are fatal.
    pub fn allocate(&self, request: usize) -> *mut u8 {
        let mut size = request + HEADER_SIZE;
        if size < MIN_BLOCK_SIZE {
            size = MIN_BLOCK_SIZE;
        }
        if size % ALIGN != 0 {
            size = (size / ALIGN + 1) * ALIGN;
        }

        if size > self.page_size {
            panic!(
                "hardened allocation of {} bytes exceeds the page size ({})",
                request, self.page_size
            );
        }

        let target;
        unsafe {
            let mut list = self.list.lock().expect("hardened heap mutex poisoned");

            let mut found = list.find_suitable(size);
            if found.is_null() {
                list.add_page();
                found = list.find_suitable(size);
            }
            if found.is_null() {
                panic!("no suitable block after mapping a fresh page");
            }
            list.remove(found);

            // Split off the tail when the remainder can stand alone.
            if (*found).size() - size >= MIN_BLOCK_SIZE {
                let remainder = (found as *mut u8).add(size) as *mut MemoryBlock;
                (*remainder).size = 0;
                (*remainder).set_size((*found).size() - size);
                list.insert(remainder);
                (*found).set_size(size);
            }

            target = found;
        }

        // The block is detached, so the fill can happen outside the lock.
        unsafe {
            let payload = (target as *mut u8).add(HEADER_SIZE);
            ptr::write_bytes(payload, FRESH_FILL, (*target).size() - HEADER_SIZE);
            payload
        }
    }

    /// Returns a payload previously handed out by `allocate`. The payload is
    /// overwritten with entropy before the block rejoins the free list.
    ///
    /// The caller must pass an address obtained from `allocate` on this heap
    /// and must not touch the payload afterwards.
    pub unsafe fn deallocate(&self, address: *mut u8) {
        let entry = address.sub(HEADER_SIZE) as *mut MemoryBlock;
        crypto::random_fill(address, (*entry).size() - HEADER_SIZE);

        let mut list = self.list.lock().expect("hardened heap mutex poisoned");
        list.insert(entry);
    }

    /// Retires every fully coalesced page. Other blocks are free fragments
    /// of pages that still hold live payloads; those pages stay mapped.
    pub fn retire_all(&self) {
        // Runs on teardown paths as well, so a poisoned lock must not stop
        // the scrub; the list is only ever mutated in consistent steps.
        let mut list = match self.list.lock() {
            Ok(list) => list,
            Err(poisoned) => poisoned.into_inner(),
        };

        unsafe {
            let mut entry = list.head;
            while !entry.is_null() {
                let next = (*entry).next;
                if (*entry).is_leader() && (*entry).size() == list.page_size {
                    list.remove_page(entry);
                }
                entry = next;
            }
        }
    }

    #[cfg(test)]
    fn snapshot(&self) -> Vec<(usize, usize, bool)> {
        let list = self.list.lock().expect("hardened heap mutex poisoned");

        let mut blocks = Vec::new();
        unsafe {
            let mut entry = list.head;
            while !entry.is_null() {
                blocks.push((entry as usize, (*entry).size(), (*entry).is_leader()));
                entry = (*entry).next;
            }
        }
        blocks
    }
}

impl Drop for HardenedHeap {
    fn drop(&mut self) {
        self.retire_all();
    }
}

lazy_static! {
    static ref HEAP: HardenedHeap = HardenedHeap::new();
}

/// The process wide heap backing every secured buffer.
#[inline]
pub fn heap() -> &'static HardenedHeap {
    &HEAP
}

/// Scrubs and unmaps all pages of the process wide heap on exit.
#[dtor]
fn RETIRE_PAGES() {
    HEAP.retire_all();
}
