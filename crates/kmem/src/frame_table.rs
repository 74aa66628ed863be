//! The Page Frame Table and the intrusive free lists threaded through it.
//!
//! Free-list links are frame numbers stored in the descriptors themselves, so list
//! operations never allocate and every insert or removal is O(1).

use core::mem::MaybeUninit;

use crate::{FrameNumber, PageDescriptor};

/// A flat array of page descriptors, one per physical frame.
pub struct PageFrameTable {
    descriptors: &'static mut [PageDescriptor],
}

impl PageFrameTable {
    /// Creates a table over `storage`, initializing every descriptor as reserved.
    ///
    /// Frames only become allocatable once they are released into a buddy allocator.
    pub fn new(storage: &'static mut [MaybeUninit<PageDescriptor>]) -> Self {
        for slot in storage.iter_mut() {
            slot.write(PageDescriptor::reserved());
        }

        // SAFETY: every element was initialized above.
        let descriptors = unsafe {
            &mut *(storage as *mut [MaybeUninit<PageDescriptor>] as *mut [PageDescriptor])
        };
        Self { descriptors }
    }

    /// Returns the number of frames described by the table.
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Returns true if the table describes no frames.
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Returns true if `frame` is described by the table.
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame.as_usize() < self.descriptors.len()
    }

    /// Returns the descriptor for `frame`.
    pub fn get(&self, frame: FrameNumber) -> Option<&PageDescriptor> {
        self.descriptors.get(frame.as_usize())
    }

    /// Returns the descriptor for `frame` mutably.
    pub fn get_mut(&mut self, frame: FrameNumber) -> Option<&mut PageDescriptor> {
        self.descriptors.get_mut(frame.as_usize())
    }

    /// Returns the descriptors for `count` frames starting at `frame`.
    ///
    /// # Panics
    /// Panics if the run extends past the end of the table.
    pub fn run_mut(&mut self, frame: FrameNumber, count: usize) -> &mut [PageDescriptor] {
        let start = frame.as_usize();
        &mut self.descriptors[start..start + count]
    }

    /// Returns the descriptors for `count` frames starting at `frame`.
    ///
    /// # Panics
    /// Panics if the run extends past the end of the table.
    pub fn run(&self, frame: FrameNumber, count: usize) -> &[PageDescriptor] {
        let start = frame.as_usize();
        &self.descriptors[start..start + count]
    }

    fn desc(&self, frame: FrameNumber) -> &PageDescriptor {
        &self.descriptors[frame.as_usize()]
    }

    fn desc_mut(&mut self, frame: FrameNumber) -> &mut PageDescriptor {
        &mut self.descriptors[frame.as_usize()]
    }
}

/// A doubly linked list of block heads, linked through their descriptors.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<FrameNumber>,
    len: usize,
}

impl FreeList {
    /// Creates an empty free list.
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Returns the number of blocks on the list.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the list is empty.
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Returns the first block on the list.
    pub fn first(&self) -> Option<FrameNumber> {
        self.head
    }

    /// Inserts `frame` at the head of the list.
    pub fn push_front(&mut self, table: &mut PageFrameTable, frame: FrameNumber) {
        let old_head = self.head;
        {
            let desc = table.desc_mut(frame);
            desc.prev = None;
            desc.next = old_head;
        }
        if let Some(old) = old_head {
            table.desc_mut(old).prev = Some(frame);
        }
        self.head = Some(frame);
        self.len += 1;
    }

    /// Unlinks `frame` from the list. The frame must be on this list.
    pub fn remove(&mut self, table: &mut PageFrameTable, frame: FrameNumber) {
        let (prev, next) = {
            let desc = table.desc(frame);
            (desc.prev, desc.next)
        };

        match prev {
            Some(prev) => table.desc_mut(prev).next = next,
            None => {
                debug_assert_eq!(self.head, Some(frame), "frame is not on this list");
                self.head = next;
            }
        }
        if let Some(next) = next {
            table.desc_mut(next).prev = prev;
        }

        let desc = table.desc_mut(frame);
        desc.prev = None;
        desc.next = None;
        self.len -= 1;
    }

    /// Removes and returns the first block on the list.
    pub fn pop_front(&mut self, table: &mut PageFrameTable) -> Option<FrameNumber> {
        let frame = self.head?;
        self.remove(table, frame);
        Some(frame)
    }

    /// Iterates over the blocks on the list, head first.
    pub fn iter<'a>(&self, table: &'a PageFrameTable) -> FreeListIter<'a> {
        FreeListIter {
            table,
            next: self.head,
        }
    }
}

/// Iterator over the blocks of a [`FreeList`].
pub struct FreeListIter<'a> {
    table: &'a PageFrameTable,
    next: Option<FrameNumber>,
}

impl Iterator for FreeListIter<'_> {
    type Item = FrameNumber;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = self.table.desc(current).next;
        Some(current)
    }
}
