/// Physical and virtual addresses are both 32 bits wide.
pub type Addr = u32;

pub const PAGE_SIZE_BITS: u32 = 12;
pub const PAGE_TABLE_SIZE_BITS: u32 = 10;

pub const PAGE_SIZE: u32 = 1 << PAGE_SIZE_BITS;
pub const PAGE_TABLE_ENTRIES: usize = 1 << PAGE_TABLE_SIZE_BITS;
pub const PTE_SIZE: u32 = 4;
pub const PAGE_TABLE_SIZE_BYTES: usize = PAGE_TABLE_ENTRIES * PTE_SIZE as usize;

pub const OFFSET_MASK: u32 = PAGE_SIZE - 1;
pub const PAGE_TABLE_INDEX_MASK: u32 = (1 << PAGE_TABLE_SIZE_BITS) - 1;
pub const FRAME_ADDR_MASK: u32 = !OFFSET_MASK;

pub const L2_SHIFT: u32 = PAGE_SIZE_BITS;
pub const DIR_SHIFT: u32 = PAGE_SIZE_BITS + PAGE_TABLE_SIZE_BITS;

/// Link value terminating the free list, and the head value of an empty list.
pub const END_OF_LIST: u32 = 0xFFFF_FFFF;

/// 256 frames, 1 MiB of simulated RAM.
pub const DEFAULT_FRAME_COUNT: u32 = 0x100;

/// Frames reachable with a 32-bit physical address.
pub const MAX_FRAME_COUNT: u32 = 1 << (32 - PAGE_SIZE_BITS);
