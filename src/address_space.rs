//! Page directory and L2 page table construction for one process.
//!
//! All table reads and writes happen inside a [`PhysicalMode`] guard, so
//! table frames never need to be mapped into the process's own address space.

use log::debug;

use crate::constants::*;
use crate::error::AddressSpaceError;
use crate::frames::FrameAllocator;
use crate::memory::{PhysicalMemory, PhysicalMode, Pmcb};
use crate::translation::{PageTable, PageTableEntry, PteFlags, VirtualAddress};

#[derive(Debug)]
pub struct AddressSpace {
    dir_base: Addr,
    /// Every frame this address space took from the allocator
    frames: Vec<u32>,
}

/// L2 table loaded from its frame, written back only if modified
struct TableCursor {
    dir_index: usize,
    base: Addr,
    table: PageTable,
    dirty: bool,
}

impl TableCursor {
    /// Cursor for the table at `base`, flushing whichever table was loaded before
    fn seek<'c>(
        slot: &'c mut Option<TableCursor>,
        pm: &mut PhysicalMode<'_>,
        dir_index: usize,
        base: Addr,
    ) -> &'c mut TableCursor {
        if slot.as_ref().is_some_and(|c| c.dir_index != dir_index) {
            if let Some(prev) = slot.take() {
                prev.flush(pm);
            }
        }
        slot.get_or_insert_with(|| TableCursor {
            dir_index,
            base,
            table: pm.read_table(base),
            dirty: false,
        })
    }

    fn flush(self, pm: &mut PhysicalMode<'_>) {
        if self.dirty {
            debug!("store L2 table {:x} (dir {:x})", self.base, self.dir_index);
            pm.write_table(self.base, &self.table);
        }
    }
}

fn check_range(vaddr: Addr, size: u32) -> Result<(), AddressSpaceError> {
    if vaddr % PAGE_SIZE != 0 || size % PAGE_SIZE != 0 {
        return Err(AddressSpaceError::Misaligned { vaddr, size });
    }
    if u64::from(vaddr) + u64::from(size) > 1u64 << 32 {
        return Err(AddressSpaceError::OutOfRange { vaddr, size });
    }
    Ok(())
}

/// Pages of an already validated range, in increasing address order
fn pages(vaddr: Addr, size: u32) -> impl Iterator<Item = VirtualAddress> {
    (0..size / PAGE_SIZE).map(move |i| VirtualAddress::from_raw(vaddr + i * PAGE_SIZE))
}

impl AddressSpace {
    /// Allocate an empty page directory and switch the device into Virtual
    /// mode on it.
    pub fn new(mem: &mut PhysicalMemory, allocator: &mut FrameAllocator) -> Result<Self, AddressSpaceError> {
        let mut pm = PhysicalMode::enter(mem);
        let mut frames = Vec::new();
        allocator.allocate(&mut pm, 1, &mut frames)?;

        let dir_base = PhysicalMemory::frame_to_address(frames[0]);
        pm.write_table(dir_base, &PageTable::new());
        pm.restore_to(Pmcb::virtual_mode(dir_base));

        debug!("page directory at {:x}", dir_base);
        Ok(AddressSpace { dir_base, frames })
    }

    /// Physical address of the page directory
    #[inline]
    pub fn dir_base(&self) -> Addr {
        self.dir_base
    }

    /// Frames backing this address space: directory, L2 tables and data pages
    pub fn frames(&self) -> &[u32] {
        &self.frames
    }

    /// Map every page of `[vaddr, vaddr + size)` to a fresh zeroed frame,
    /// creating L2 tables as needed. Pages that are already present keep
    /// their frame.
    ///
    /// The frames for the whole range are reserved up front; if the
    /// allocator can't supply them all, no table is touched.
    pub fn allocate_range(
        &mut self,
        mem: &mut PhysicalMemory,
        allocator: &mut FrameAllocator,
        vaddr: Addr,
        size: u32,
    ) -> Result<(), AddressSpaceError> {
        check_range(vaddr, size)?;

        let mut pm = PhysicalMode::enter(mem);
        let mut dir = pm.read_table(self.dir_base);

        let mut missing_tables: Vec<usize> = Vec::new();
        let mut missing_pages: Vec<VirtualAddress> = Vec::new();
        let mut cursor: Option<TableCursor> = None;
        for va in pages(vaddr, size) {
            let dir_entry = dir[va.dir];
            if !dir_entry.is_present() {
                if missing_tables.last() != Some(&va.dir) {
                    missing_tables.push(va.dir);
                }
                missing_pages.push(va);
                continue;
            }
            let l2 = TableCursor::seek(&mut cursor, &mut pm, va.dir, dir_entry.frame_addr());
            if !l2.table[va.l2].is_present() {
                missing_pages.push(va);
            }
        }

        let needed = (missing_tables.len() + missing_pages.len()) as u32;
        if needed == 0 {
            return Ok(());
        }
        let mut fresh = Vec::with_capacity(needed as usize);
        allocator.allocate(&mut pm, needed, &mut fresh)?;

        // Allocated frames are already zero, so new tables need no write
        let (table_frames, page_frames) = fresh.split_at(missing_tables.len());
        for (&dir_index, &frame) in missing_tables.iter().zip(table_frames) {
            dir[dir_index] = PageTableEntry::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE);
        }
        if !missing_tables.is_empty() {
            pm.write_table(self.dir_base, &dir);
        }

        let mut cursor: Option<TableCursor> = None;
        for (va, &frame) in missing_pages.iter().zip(page_frames) {
            let l2 = TableCursor::seek(&mut cursor, &mut pm, va.dir, dir[va.dir].frame_addr());
            l2.table[va.l2] = PageTableEntry::new(frame, PteFlags::PRESENT | PteFlags::WRITABLE);
            l2.dirty = true;
        }
        if let Some(last) = cursor.take() {
            last.flush(&mut pm);
        }

        debug!(
            "alloc {:x}+{:x}: {} new pages, {} new tables",
            vaddr,
            size,
            missing_pages.len(),
            missing_tables.len()
        );
        self.frames.extend_from_slice(&fresh);
        Ok(())
    }

    /// Set or clear the Writable bit of every present page in the range.
    /// Pages that are not present are skipped; directory entries are left
    /// alone. Returns the number of pages updated.
    pub fn set_writable(
        &mut self,
        mem: &mut PhysicalMemory,
        vaddr: Addr,
        size: u32,
        writable: bool,
    ) -> Result<u32, AddressSpaceError> {
        check_range(vaddr, size)?;

        let mut pm = PhysicalMode::enter(mem);
        let dir = pm.read_table(self.dir_base);

        let mut updated = 0;
        let mut cursor: Option<TableCursor> = None;
        for va in pages(vaddr, size) {
            let dir_entry = dir[va.dir];
            if !dir_entry.is_present() {
                continue;
            }
            let l2 = TableCursor::seek(&mut cursor, &mut pm, va.dir, dir_entry.frame_addr());
            let entry = &mut l2.table[va.l2];
            if entry.is_present() {
                entry.set_writable(writable);
                l2.dirty = true;
                updated += 1;
            }
        }
        if let Some(last) = cursor.take() {
            last.flush(&mut pm);
        }

        debug!("writable {:x}+{:x} -> {}: {} pages", vaddr, size, writable, updated);
        Ok(updated)
    }

    /// L2 entry mapping `vaddr`, if its directory entry is present
    pub fn lookup(&self, mem: &mut PhysicalMemory, vaddr: Addr) -> Option<PageTableEntry> {
        let pm = PhysicalMode::enter(mem);
        let va = VirtualAddress::from_raw(vaddr);
        let dir_entry = pm.read_table(self.dir_base)[va.dir];
        if !dir_entry.is_present() {
            return None;
        }
        Some(pm.read_table(dir_entry.frame_addr())[va.l2])
    }
}
