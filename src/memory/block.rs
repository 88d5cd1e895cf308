//! Block list for a single arena.
//!
//! [BlockList] is a doubly linked list of [Block]s describing how one arena's byte range is
//! carved up. Nodes live in a slab (`Vec<Option<Block>>`) and link to each other by slot index,
//! so splitting and merging are O(1) splices and nothing is reference-counted. The list is always
//! a sorted, gap-free partition of `[0, size)`.

use std::fmt;

/// Arena-local identifier of a block. Ids are never recycled within an arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u64);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block#{}", self.0)
    }
}

/// One contiguous region of an arena, either free or in use.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub id: BlockId,
    pub offset: u64,
    pub size: u64,
    pub free: bool,
    prev: Option<usize>,
    next: Option<usize>,
}

impl Block {
    /// One past the last byte of this block.
    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

#[derive(Debug)]
pub struct BlockList {
    slots: Vec<Option<Block>>,
    vacant: Vec<usize>,
    head: usize,
    next_block_id: u64,
    size: u64,
}

impl BlockList {
    /// Creates a list holding a single free block that spans `size` bytes.
    pub fn new(size: u64) -> Self {
        let head = Block {
            id: BlockId(0),
            offset: 0,
            size,
            free: true,
            prev: None,
            next: None,
        };
        BlockList {
            slots: vec![Some(head)],
            vacant: Vec::new(),
            head: 0,
            next_block_id: 1,
            size,
        }
    }

    /// Total number of bytes this list partitions.
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&Block> {
        self.slots.get(index).and_then(|slot| slot.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Block> {
        self.slots.get_mut(index).and_then(|slot| slot.as_mut())
    }

    /// Walks the blocks in offset order.
    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            list: self,
            cursor: Some(self.head),
        }
    }

    /// Slot indices in offset order. Useful when the caller needs to mutate while walking.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            out.push(index);
            cursor = self.node(index).next;
        }
        out
    }

    /// Slot index of the live block with the given id, by linear scan.
    pub fn find(&self, id: BlockId) -> Option<usize> {
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let block = self.node(index);
            if block.id == id {
                return Some(index);
            }
            cursor = block.next;
        }
        None
    }

    /// First free block (in offset order) that can hold `needed_size` bytes.
    pub fn first_fit(&self, needed_size: u64) -> Option<usize> {
        let mut cursor = Some(self.head);
        while let Some(index) = cursor {
            let block = self.node(index);
            if block.free && block.size >= needed_size {
                return Some(index);
            }
            cursor = block.next;
        }
        None
    }

    /// Marks the free block at `index` as used, trimmed to exactly `needed_size` bytes. Any
    /// remainder becomes a new free block linked directly after it.
    ///
    /// The used block is given a fresh id, so an id that was handed out for an allocation never
    /// names a later allocation of the same region.
    pub fn take(&mut self, index: usize, needed_size: u64) -> &Block {
        let (offset, size, next) = {
            let block = self.node(index);
            debug_assert!(block.free, "took a block that is already in use");
            debug_assert!(block.size >= needed_size);
            (block.offset, block.size, block.next)
        };

        if size > needed_size {
            let remainder = Block {
                id: self.fresh_id(),
                offset: offset + needed_size,
                size: size - needed_size,
                free: true,
                prev: Some(index),
                next,
            };
            let remainder_index = self.insert_slot(remainder);
            if let Some(next) = next {
                self.node_mut(next).prev = Some(remainder_index);
            }
            self.node_mut(index).next = Some(remainder_index);
        }

        let id = self.fresh_id();
        let block = self.node_mut(index);
        block.id = id;
        block.size = needed_size;
        block.free = false;
        block
    }

    /// Marks the block at `index` free and merges it with free neighbours on both sides.
    /// Returns the slot index of the resulting free block.
    pub fn release(&mut self, index: usize) -> usize {
        self.node_mut(index).free = true;
        let mut current = index;

        if let Some(prev) = self.node(current).prev {
            if self.node(prev).free {
                let absorbed = self.node(current).size;
                self.node_mut(prev).size += absorbed;
                self.unlink(current);
                current = prev;
            }
        }

        if let Some(next) = self.node(current).next {
            if self.node(next).free {
                let absorbed = self.node(next).size;
                self.node_mut(current).size += absorbed;
                self.unlink(next);
            }
        }

        current
    }

    /// Drops every free node and appends one free block of `free_total` bytes after the last
    /// used block. Used blocks must already sit back to back from offset zero.
    pub fn collapse_free_to_tail(&mut self, free_total: u64) {
        for index in self.indices() {
            if self.node(index).free {
                self.unlink(index);
            }
        }

        if self.slots[self.head].is_none() {
            // Every node was free: start over with a single block.
            let id = self.fresh_id();
            let next_block_id = self.next_block_id;
            *self = BlockList::new(self.size);
            self.node_mut(self.head).id = id;
            self.next_block_id = next_block_id;
            return;
        }

        let tail = self.tail();
        let tail_end = self.node(tail).end();
        debug_assert_eq!(tail_end + free_total, self.size);
        let block = Block {
            id: self.fresh_id(),
            offset: tail_end,
            size: free_total,
            free: true,
            prev: Some(tail),
            next: None,
        };
        let index = self.insert_slot(block);
        self.node_mut(tail).next = Some(index);
    }

    /// Verifies the partition invariants: the head starts at zero, every block begins where the
    /// previous one ends, back links agree with forward links, the last block ends at `size`, and
    /// no two neighbours are both free.
    pub fn check_invariants(&self) -> Result<(), String> {
        let head = self.get(self.head).ok_or_else(|| String::from("head slot is vacant"))?;
        if head.offset != 0 {
            return Err(format!("head starts at {} instead of 0", head.offset));
        }
        if head.prev.is_some() {
            return Err(String::from("head has a predecessor"));
        }

        let mut seen = 0;
        let mut cursor = Some(self.head);
        let mut previous: Option<(usize, &Block)> = None;
        while let Some(index) = cursor {
            let block = self.get(index).ok_or_else(|| format!("link to vacant slot {}", index))?;
            if block.size == 0 {
                return Err(format!("{} has zero size", block.id));
            }
            if let Some((prev_index, prev)) = previous {
                if block.prev != Some(prev_index) {
                    return Err(format!("{} has a broken back link", block.id));
                }
                if prev.end() != block.offset {
                    return Err(format!("{} starts at {} but {} ends at {}", block.id, block.offset, prev.id, prev.end()));
                }
                if prev.free && block.free {
                    return Err(format!("adjacent free blocks {} and {}", prev.id, block.id));
                }
            }
            seen += 1;
            previous = Some((index, block));
            cursor = block.next;
        }

        let (_, last) = previous.ok_or_else(|| String::from("empty block list"))?;
        if last.end() != self.size {
            return Err(format!("last block ends at {} but the list covers {} bytes", last.end(), self.size));
        }
        if seen != self.len() {
            return Err(format!("{} blocks reachable but {} slots live", seen, self.len()));
        }
        Ok(())
    }

    fn tail(&self) -> usize {
        let mut index = self.head;
        while let Some(next) = self.node(index).next {
            index = next;
        }
        index
    }

    fn fresh_id(&mut self) -> BlockId {
        let id = BlockId(self.next_block_id);
        self.next_block_id += 1;
        id
    }

    fn insert_slot(&mut self, block: Block) -> usize {
        match self.vacant.pop() {
            Some(index) => {
                self.slots[index] = Some(block);
                index
            }
            None => {
                self.slots.push(Some(block));
                self.slots.len() - 1
            }
        }
    }

    /// Splices the node out of the list and vacates its slot.
    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let block = self.node(index);
            (block.prev, block.next)
        };
        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => {
                if let Some(next) = next {
                    self.head = next;
                }
            }
        }
        if let Some(next) = next {
            self.node_mut(next).prev = prev;
        }
        self.slots[index] = None;
        self.vacant.push(index);
    }

    // Links always point at live slots, so a vacant slot here is list corruption.
    fn node(&self, index: usize) -> &Block {
        match self.slots[index].as_ref() {
            Some(block) => block,
            None => panic!("block list links to vacant slot {}", index),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Block {
        match self.slots[index].as_mut() {
            Some(block) => block,
            None => panic!("block list links to vacant slot {}", index),
        }
    }
}

pub struct BlockIter<'a> {
    list: &'a BlockList,
    cursor: Option<usize>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = &'a Block;

    fn next(&mut self) -> Option<&'a Block> {
        let index = self.cursor?;
        let block = self.list.node(index);
        self.cursor = block.next;
        Some(block)
    }
}

// Tests ///////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    /// (offset, size, free) for every block, in order.
    fn layout(list: &BlockList) -> Vec<(u64, u64, bool)> {
        list.iter().map(|b| (b.offset, b.size, b.free)).collect()
    }

    #[test]
    fn new_list_is_one_free_block() {
        let list = BlockList::new(64);
        assert_eq!(layout(&list), vec![(0, 64, true)]);
        assert_eq!(list.len(), 1);
        list.check_invariants().unwrap();
    }

    #[test]
    fn take_splits_off_free_remainder() {
        let mut list = BlockList::new(64);
        let index = list.first_fit(16).unwrap();
        let taken = list.take(index, 16);
        assert_eq!((taken.offset, taken.size, taken.free), (0, 16, false));
        assert_eq!(layout(&list), vec![(0, 16, false), (16, 48, true)]);
        list.check_invariants().unwrap();
    }

    #[test]
    fn take_exact_fit_does_not_split() {
        let mut list = BlockList::new(32);
        let index = list.first_fit(32).unwrap();
        list.take(index, 32);
        assert_eq!(layout(&list), vec![(0, 32, false)]);
        assert_eq!(list.len(), 1);
        assert_eq!(list.first_fit(1), None);
    }

    #[test]
    fn ids_are_unique_and_not_reused() {
        let mut list = BlockList::new(30);
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        let b = list.take(list.first_fit(10).unwrap(), 10).id;
        let index = list.find(a).unwrap();
        list.release(index);
        let c = list.take(list.first_fit(10).unwrap(), 10).id;
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(list.find(a), None);
        let ids: Vec<BlockId> = list.iter().map(|b| b.id).collect();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(ids.len(), deduped.len());
        assert!(list.find(c).is_some());
    }

    #[test]
    fn ids_keep_counting_past_u32() {
        let mut list = BlockList::new(64);
        assert!(!list.is_empty());
        list.next_block_id = u32::MAX as u64 - 1;
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        let b = list.take(list.first_fit(10).unwrap(), 10).id;
        assert!(a.0 > u32::MAX as u64 - 1);
        assert!(b.0 > u32::MAX as u64);
        assert_ne!(a, b);

        list.release(list.find(a).unwrap());
        let c = list.take(list.first_fit(10).unwrap(), 10).id;
        assert!(c.0 > b.0);
        assert_eq!(list.find(a), None);
        list.check_invariants().unwrap();
    }

    #[test]
    fn first_fit_skips_small_and_used_blocks() {
        let mut list = BlockList::new(100);
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        list.take(list.first_fit(10).unwrap(), 10);
        list.release(list.find(a).unwrap());
        // [0,10) free, [10,20) used, [20,100) free
        let index = list.first_fit(20).unwrap();
        assert_eq!(list.get(index).unwrap().offset, 20);
        let index = list.first_fit(5).unwrap();
        assert_eq!(list.get(index).unwrap().offset, 0);
    }

    #[test]
    fn release_merges_both_neighbours() {
        let mut list = BlockList::new(30);
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        let b = list.take(list.first_fit(10).unwrap(), 10).id;
        let c = list.take(list.first_fit(10).unwrap(), 10).id;
        list.release(list.find(a).unwrap());
        list.release(list.find(c).unwrap());
        assert_eq!(layout(&list), vec![(0, 10, true), (10, 10, false), (20, 10, true)]);
        list.release(list.find(b).unwrap());
        assert_eq!(layout(&list), vec![(0, 30, true)]);
        assert_eq!(list.len(), 1);
        list.check_invariants().unwrap();
    }

    #[test]
    fn release_of_head_moves_head_when_merging_forward() {
        let mut list = BlockList::new(20);
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        list.release(list.find(a).unwrap());
        assert_eq!(layout(&list), vec![(0, 20, true)]);
        list.check_invariants().unwrap();
    }

    #[test]
    fn collapse_moves_all_free_space_to_tail() {
        let mut list = BlockList::new(30);
        let a = list.take(list.first_fit(10).unwrap(), 10).id;
        let b = list.take(list.first_fit(10).unwrap(), 10).id;
        list.take(list.first_fit(10).unwrap(), 10);
        list.release(list.find(a).unwrap());
        // Simulate the compaction walk: shift used blocks down.
        for index in list.indices() {
            let block = list.get_mut(index).unwrap();
            if !block.free {
                block.offset -= 10;
            }
        }
        list.collapse_free_to_tail(10);
        assert_eq!(layout(&list), vec![(0, 10, false), (10, 10, false), (20, 10, true)]);
        assert!(list.find(b).is_some());
        list.check_invariants().unwrap();
    }

    #[test]
    fn collapse_of_all_free_list_resets_to_single_block() {
        let mut list = BlockList::new(16);
        list.collapse_free_to_tail(16);
        assert_eq!(layout(&list), vec![(0, 16, true)]);
        list.check_invariants().unwrap();
    }

    #[test]
    fn invariant_checker_catches_gaps() {
        let mut list = BlockList::new(20);
        list.take(list.first_fit(10).unwrap(), 10);
        let index = list.indices()[1];
        list.get_mut(index).unwrap().offset = 12;
        assert!(list.check_invariants().is_err());
    }

    #[test]
    fn invariant_checker_catches_adjacent_free_blocks() {
        let mut list = BlockList::new(20);
        let head = list.first_fit(10).unwrap();
        list.take(head, 10);
        list.get_mut(head).unwrap().free = true;
        assert!(list.check_invariants().is_err());
    }
}
