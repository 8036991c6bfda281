//! Capacity-bounded open-addressed block map with full invalidation
//! (translation cache policy A).
//!
//! Deletion never happens entry-by-entry: blocks reference each other
//! through prediction links, so partial eviction would have to chase and
//! null every backreference. Instead, once the table passes its load
//! limit the whole translation state is flushed and the arena generation
//! moves on.

use crate::ir::BlockRef;

pub struct BlockMap {
    slots: Vec<Option<(u32, BlockRef)>>,
    mask: u32,
    size: u32,
}

fn hash(mut k: u32) -> u32 {
    k ^= k << 21;
    k ^= k >> 17;
    k
}

impl BlockMap {
    /// `capacity` is rounded up to a power of two.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        Self {
            slots: vec![None; capacity as usize],
            mask: capacity - 1,
            size: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// True once live entries would exceed the 1.25 load limit; the caller
    /// must clear both the map and the block arena before inserting more.
    pub fn needs_clear(&self) -> bool {
        u64::from(self.size) * 5 > u64::from(self.mask + 1) * 4
    }

    pub fn insert(&mut self, pc_start: u32, block: BlockRef) {
        let mut index = hash(pc_start);
        loop {
            let slot = &mut self.slots[(index & self.mask) as usize];
            if slot.is_none() {
                *slot = Some((pc_start, block));
                break;
            }
            index = index.wrapping_add(1);
        }
        self.size += 1;
    }

    pub fn lookup(&self, pc: u32) -> Option<BlockRef> {
        let mut index = hash(pc);
        loop {
            let (key, block) = self.slots[(index & self.mask) as usize]?;
            if key == pc {
                return Some(block);
            }
            index = index.wrapping_add(1);
        }
    }

    pub fn clear(&mut self) {
        self.slots.fill(None);
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: u32) -> BlockRef {
        BlockRef {
            index,
            generation: 0,
        }
    }

    #[test]
    fn insert_then_lookup_round_trips() {
        let mut map = BlockMap::new(64);
        for pc in (0x1000..0x1100).step_by(4) {
            map.insert(pc, block(pc));
        }
        for pc in (0x1000..0x1100).step_by(4) {
            assert_eq!(map.lookup(pc), Some(block(pc)));
        }
        assert_eq!(map.lookup(0x2000), None);
    }

    #[test]
    fn colliding_keys_probe_forward() {
        // Both keys land on slot 0 of a two-slot table.
        let mut map = BlockMap::new(2);
        map.insert(0x10, block(1));
        map.insert(0x30, block(2));
        assert_eq!(map.lookup(0x10), Some(block(1)));
        assert_eq!(map.lookup(0x30), Some(block(2)));
    }

    #[test]
    fn clear_forgets_every_key() {
        let mut map = BlockMap::new(16);
        map.insert(0x100, block(1));
        map.insert(0x104, block(2));
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.lookup(0x100), None);
        assert_eq!(map.lookup(0x104), None);
    }

    #[test]
    fn load_limit_triggers_before_table_fills() {
        let mut map = BlockMap::new(16);
        let mut pc = 0x1000;
        while !map.needs_clear() {
            map.insert(pc, block(pc));
            pc += 4;
            assert!(map.len() <= 16, "table overfilled without tripping limit");
        }
        // 16 * 4 / 5 = 12.8, so the 13th insert trips the limit.
        assert_eq!(map.len(), 13);
    }
}
