use std::fmt;
use std::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::constants::*;

/// Represents the decomposed components of a Virtual Address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VirtualAddress {
    pub va: Addr,
    /// Index into the page directory
    pub dir: usize,
    /// Index into the L2 page table
    pub l2: usize,
    /// Byte offset within the page
    pub offset: u32,
}

impl VirtualAddress {
    /// Decompose a raw VA into its components
    pub fn from_raw(va: Addr) -> Self {
        let dir = ((va >> DIR_SHIFT) & PAGE_TABLE_INDEX_MASK) as usize;
        let l2 = ((va >> L2_SHIFT) & PAGE_TABLE_INDEX_MASK) as usize;
        let offset = va & OFFSET_MASK;

        VirtualAddress { va, dir, l2, offset }
    }

    /// Address of the first byte of the page containing this VA
    #[inline]
    pub fn page_base(&self) -> Addr {
        self.va & FRAME_ADDR_MASK
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "VA({:x}) = (dir={:x}, l2={:x}, offset={:x})",
            self.va, self.dir, self.l2, self.offset
        )
    }
}

bitflags! {
    /// Flag bits in the low part of a page table entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
    }
}

/// One 4-byte slot of a page directory or L2 page table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Build an entry pointing at `frame`
    pub fn new(frame: u32, flags: PteFlags) -> Self {
        PageTableEntry((frame << PAGE_SIZE_BITS) | flags.bits())
    }

    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        PageTableEntry(raw)
    }

    #[inline]
    pub fn raw(&self) -> u32 {
        self.0
    }

    #[inline]
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    /// Physical address of the frame this entry points at
    #[inline]
    pub fn frame_addr(&self) -> Addr {
        self.0 & FRAME_ADDR_MASK
    }

    #[inline]
    pub fn frame(&self) -> u32 {
        self.0 >> PAGE_SIZE_BITS
    }

    #[inline]
    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn set_writable(&mut self, writable: bool) {
        if writable {
            self.0 |= PteFlags::WRITABLE.bits();
        } else {
            self.0 &= !PteFlags::WRITABLE.bits();
        }
    }
}

/// In-memory image of one page-table frame
#[derive(Clone, PartialEq, Eq)]
pub struct PageTable {
    entries: Box<[PageTableEntry; PAGE_TABLE_ENTRIES]>,
}

impl PageTable {
    /// An all-zero table: every entry not present
    pub fn new() -> Self {
        PageTable {
            entries: Box::new([PageTableEntry::default(); PAGE_TABLE_ENTRIES]),
        }
    }

    /// Decode a table from the raw bytes of its frame
    pub fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), PAGE_TABLE_SIZE_BYTES);
        let mut table = PageTable::new();
        for (entry, raw) in table
            .entries
            .iter_mut()
            .zip(bytes.chunks_exact(PTE_SIZE as usize))
        {
            *entry = PageTableEntry::from_raw(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]));
        }
        table
    }

    /// Encode the table into the byte layout stored in its frame
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|entry| entry.raw().to_le_bytes())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PageTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only present entries are interesting
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| e.is_present())
                    .map(|(i, e)| (i, e.raw())),
            )
            .finish()
    }
}

impl Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &PageTableEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageTableEntry {
        &mut self.entries[index]
    }
}

/// Kind of access being translated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Result of an address translation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationResult {
    Success(Addr),
    /// No present entry in the page directory
    DirectoryNotPresent,
    /// No present entry in the L2 page table
    PageNotPresent,
    /// Present page, but a write hit a cleared Writable bit
    WriteProtected,
}

#[inline]
pub(crate) fn read_entry(ram: &[u8], table_base: Addr, index: usize) -> PageTableEntry {
    let at = table_base as usize + index * PTE_SIZE as usize;
    PageTableEntry::from_raw(u32::from_le_bytes([ram[at], ram[at + 1], ram[at + 2], ram[at + 3]]))
}

/// Walk the two-level tables rooted at `dir_base` in raw physical `ram`.
///
/// Only reads the tables; the device is the one that turns a failed walk
/// into a fault.
pub fn translate(va: &VirtualAddress, access: Access, ram: &[u8], dir_base: Addr) -> TranslationResult {
    let dir_entry = read_entry(ram, dir_base, va.dir);
    if !dir_entry.is_present() {
        return TranslationResult::DirectoryNotPresent;
    }

    let page_entry = read_entry(ram, dir_entry.frame_addr(), va.l2);
    if !page_entry.is_present() {
        return TranslationResult::PageNotPresent;
    }

    if access == Access::Write && !(dir_entry.is_writable() && page_entry.is_writable()) {
        return TranslationResult::WriteProtected;
    }

    TranslationResult::Success(page_entry.frame_addr() | va.offset)
}
