use log::trace;
use thiserror::Error;

use crate::constants::*;
use crate::error::{TraceError, TraceResult};
use crate::translation::{translate, Access, PageTable, TranslationResult, VirtualAddress};

/// Addressing mode of the simulated processor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressingMode {
    /// Addresses are raw byte offsets into RAM
    #[default]
    Physical,
    /// Addresses are translated through the page directory
    Virtual,
}

/// Access interrupted by a fault and not yet cancelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OperationState {
    #[default]
    Idle,
    Read { vaddr: Addr },
    Write { vaddr: Addr },
}

/// Processor Memory Control Block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pmcb {
    pub mode: AddressingMode,
    /// Physical address of the active page directory
    pub page_table_base: Addr,
    pub operation_state: OperationState,
}

impl Pmcb {
    pub fn physical() -> Self {
        Pmcb::default()
    }

    pub fn virtual_mode(page_table_base: Addr) -> Self {
        Pmcb {
            mode: AddressingMode::Virtual,
            page_table_base,
            operation_state: OperationState::Idle,
        }
    }
}

/// Faults raised by virtual-mode accesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryFault {
    #[error("page not present in {level}")]
    PageFault { vaddr: Addr, level: &'static str },
    #[error("write to non-writable page")]
    WritePermission { vaddr: Addr },
}

impl MemoryFault {
    pub fn vaddr(&self) -> Addr {
        match *self {
            MemoryFault::PageFault { vaddr, .. } | MemoryFault::WritePermission { vaddr } => vaddr,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MemoryFault::PageFault { .. } => "PageFault",
            MemoryFault::WritePermission { .. } => "WritePermissionFault",
        }
    }
}

/// Byte-addressable simulated RAM behind a two-level MMU
pub struct PhysicalMemory {
    data: Vec<u8>,
    frame_count: u32,
    pmcb: Pmcb,
}

impl PhysicalMemory {
    /// Create `frame_count` frames of zeroed memory, in Physical mode.
    /// `frame_count` must not exceed [`MAX_FRAME_COUNT`]; use [`try_new`]
    /// for counts that come from input.
    ///
    /// [`try_new`]: PhysicalMemory::try_new
    pub fn new(frame_count: u32) -> Self {
        debug_assert!(frame_count <= MAX_FRAME_COUNT);
        PhysicalMemory {
            data: vec![0u8; frame_count as usize * PAGE_SIZE as usize],
            frame_count,
            pmcb: Pmcb::physical(),
        }
    }

    /// Like [`new`](PhysicalMemory::new), but rejects frame counts whose
    /// frames would not all have a distinct 32-bit address
    pub fn try_new(frame_count: u32) -> TraceResult<Self> {
        Ok(Self::new(check_frame_count(frame_count)?))
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    #[inline]
    pub fn pmcb(&self) -> Pmcb {
        self.pmcb
    }

    pub fn set_pmcb(&mut self, pmcb: Pmcb) {
        trace!("pmcb <- {:?}", pmcb);
        self.pmcb = pmcb;
    }

    /// Calculate the starting address of a frame
    #[inline]
    pub fn frame_to_address(frame: u32) -> Addr {
        frame << PAGE_SIZE_BITS
    }

    /// Read one byte at `addr` in the current addressing mode
    pub fn get_byte(&mut self, addr: Addr) -> Result<u8, MemoryFault> {
        let pa = self.resolve(addr, Access::Read)?;
        Ok(self.data[pa as usize])
    }

    /// Write one byte at `addr` in the current addressing mode
    pub fn put_byte(&mut self, addr: Addr, value: u8) -> Result<(), MemoryFault> {
        let pa = self.resolve(addr, Access::Write)?;
        self.data[pa as usize] = value;
        Ok(())
    }

    /// Fill `dst` from consecutive addresses starting at `addr`.
    ///
    /// Translation is per byte, so the range may span pages. On a fault the
    /// bytes before the faulting address have already been read.
    pub fn get_bytes(&mut self, dst: &mut [u8], addr: Addr) -> Result<(), MemoryFault> {
        for (i, byte) in dst.iter_mut().enumerate() {
            *byte = self.get_byte(addr.wrapping_add(i as u32))?;
        }
        Ok(())
    }

    /// Store `src` at consecutive addresses starting at `addr`.
    ///
    /// Bytes before a faulting address stay written.
    pub fn put_bytes(&mut self, addr: Addr, src: &[u8]) -> Result<(), MemoryFault> {
        for (i, &byte) in src.iter().enumerate() {
            self.put_byte(addr.wrapping_add(i as u32), byte)?;
        }
        Ok(())
    }

    /// Raw physical slice, independent of the addressing mode
    pub(crate) fn raw(&self, pa: Addr, len: usize) -> &[u8] {
        &self.data[pa as usize..pa as usize + len]
    }

    pub(crate) fn raw_mut(&mut self, pa: Addr, len: usize) -> &mut [u8] {
        &mut self.data[pa as usize..pa as usize + len]
    }

    fn resolve(&mut self, addr: Addr, access: Access) -> Result<Addr, MemoryFault> {
        if self.pmcb.mode == AddressingMode::Physical {
            return Ok(addr);
        }

        // An interrupted access must be cancelled or become valid first
        match self.pmcb.operation_state {
            OperationState::Idle => {}
            OperationState::Read { vaddr } => self.walk(vaddr, Access::Read).map(|_| ())?,
            OperationState::Write { vaddr } => self.walk(vaddr, Access::Write).map(|_| ())?,
        }
        self.pmcb.operation_state = OperationState::Idle;

        self.walk(addr, access)
    }

    fn walk(&mut self, addr: Addr, access: Access) -> Result<Addr, MemoryFault> {
        let va = VirtualAddress::from_raw(addr);
        let fault = match translate(&va, access, &self.data, self.pmcb.page_table_base) {
            TranslationResult::Success(pa) => return Ok(pa),
            TranslationResult::DirectoryNotPresent => MemoryFault::PageFault {
                vaddr: addr,
                level: "page directory",
            },
            TranslationResult::PageNotPresent => MemoryFault::PageFault {
                vaddr: addr,
                level: "L2 page table",
            },
            TranslationResult::WriteProtected => MemoryFault::WritePermission { vaddr: addr },
        };

        self.pmcb.operation_state = match access {
            Access::Read => OperationState::Read { vaddr: addr },
            Access::Write => OperationState::Write { vaddr: addr },
        };
        Err(fault)
    }
}

pub fn check_frame_count(frame_count: u32) -> TraceResult<u32> {
    if frame_count > MAX_FRAME_COUNT {
        return Err(TraceError::FrameCount {
            count: frame_count,
            max: MAX_FRAME_COUNT,
        });
    }
    Ok(frame_count)
}

impl Default for PhysicalMemory {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_COUNT)
    }
}

/// Scoped switch into Physical mode.
///
/// Records the PMCB on entry and puts it back when dropped, on every exit
/// path. Page-table and free-list bytes are only touched through this guard.
pub struct PhysicalMode<'a> {
    mem: &'a mut PhysicalMemory,
    saved: Pmcb,
}

impl<'a> PhysicalMode<'a> {
    pub fn enter(mem: &'a mut PhysicalMemory) -> Self {
        let saved = mem.pmcb();
        mem.set_pmcb(Pmcb {
            mode: AddressingMode::Physical,
            ..saved
        });
        PhysicalMode { mem, saved }
    }

    /// PMCB that will be restored on drop
    pub fn saved_pmcb(&self) -> Pmcb {
        self.saved
    }

    /// Replace the PMCB restored on drop, e.g. to leave Physical mode for
    /// a freshly built page directory
    pub fn restore_to(&mut self, pmcb: Pmcb) {
        self.saved = pmcb;
    }

    #[inline]
    pub fn frame_count(&self) -> u32 {
        self.mem.frame_count()
    }

    pub fn read_u32(&self, pa: Addr) -> u32 {
        let b = self.mem.raw(pa, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&mut self, pa: Addr, value: u32) {
        self.mem.raw_mut(pa, 4).copy_from_slice(&value.to_le_bytes());
    }

    pub fn read(&self, pa: Addr, len: usize) -> &[u8] {
        self.mem.raw(pa, len)
    }

    pub fn write(&mut self, pa: Addr, src: &[u8]) {
        self.mem.raw_mut(pa, src.len()).copy_from_slice(src);
    }

    pub fn zero_frame(&mut self, frame: u32) {
        let pa = PhysicalMemory::frame_to_address(frame);
        self.mem.raw_mut(pa, PAGE_SIZE as usize).fill(0);
    }

    pub fn read_table(&self, base: Addr) -> PageTable {
        PageTable::from_bytes(self.read(base, PAGE_TABLE_SIZE_BYTES))
    }

    pub fn write_table(&mut self, base: Addr, table: &PageTable) {
        self.write(base, &table.to_bytes());
    }
}

impl Drop for PhysicalMode<'_> {
    fn drop(&mut self) {
        self.mem.set_pmcb(self.saved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::{PageTableEntry, PteFlags};

    #[test]
    fn test_pm_initialization() {
        let mut pm = PhysicalMemory::new(4);
        assert_eq!(pm.frame_count(), 4);
        assert_eq!(pm.pmcb().mode, AddressingMode::Physical);
        // All memory should be zeroed
        assert_eq!(pm.get_byte(0), Ok(0));
        assert_eq!(pm.get_byte(4 * PAGE_SIZE - 1), Ok(0));
    }

    #[test]
    fn test_physical_read_write() {
        let mut pm = PhysicalMemory::new(2);
        pm.put_bytes(0xFFE, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0u8; 4];
        pm.get_bytes(&mut buf, 0xFFE).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(pm.raw(0x1000, 2), &[3, 4]);
    }

    #[test]
    fn test_frame_to_address() {
        assert_eq!(PhysicalMemory::frame_to_address(0), 0);
        assert_eq!(PhysicalMemory::frame_to_address(1), 0x1000);
        assert_eq!(PhysicalMemory::frame_to_address(0xA), 0xA000);
        assert_eq!(PhysicalMemory::frame_to_address(MAX_FRAME_COUNT - 1), 0xFFFF_F000);
    }

    #[test]
    fn test_frame_count_limit() {
        assert_eq!(check_frame_count(MAX_FRAME_COUNT).unwrap(), 0x100000);

        // One more frame would alias frame 0
        let err = PhysicalMemory::try_new(MAX_FRAME_COUNT + 1).err().unwrap();
        assert!(matches!(err, TraceError::FrameCount { count: 0x100001, max: 0x100000 }));
        assert_eq!(err.exit_code(), 2);
        assert!(PhysicalMemory::try_new(u32::MAX).is_err());

        assert_eq!(PhysicalMemory::try_new(4).unwrap().frame_count(), 4);
    }

    // Directory at frame 0, L2 table at frame 1, VA 0x5000 -> frame 2 (read-only),
    // VA 0x6000 -> frame 3 (writable)
    fn setup_virtual_memory() -> PhysicalMemory {
        let mut pm = PhysicalMemory::new(4);
        let mut dir = PageTable::new();
        dir[0] = PageTableEntry::new(1, PteFlags::PRESENT | PteFlags::WRITABLE);
        let mut l2 = PageTable::new();
        l2[5] = PageTableEntry::new(2, PteFlags::PRESENT);
        l2[6] = PageTableEntry::new(3, PteFlags::PRESENT | PteFlags::WRITABLE);
        pm.put_bytes(0, &dir.to_bytes()).unwrap();
        pm.put_bytes(0x1000, &l2.to_bytes()).unwrap();
        pm.put_byte(0x2010, 0x5A).unwrap();
        pm.set_pmcb(Pmcb::virtual_mode(0));
        pm
    }

    #[test]
    fn test_virtual_translation() {
        let mut pm = setup_virtual_memory();
        assert_eq!(pm.get_byte(0x5010), Ok(0x5A));

        pm.put_byte(0x6FFF, 0x77).unwrap();
        assert_eq!(pm.raw(0x3FFF, 1), &[0x77]);
    }

    #[test]
    fn test_page_fault_records_operation_state() {
        let mut pm = setup_virtual_memory();
        let fault = pm.get_byte(0x7000).unwrap_err();

        assert!(matches!(fault, MemoryFault::PageFault { vaddr: 0x7000, .. }));
        assert_eq!(fault.kind(), "PageFault");
        assert_eq!(pm.pmcb().operation_state, OperationState::Read { vaddr: 0x7000 });
    }

    #[test]
    fn test_pending_operation_blocks_until_cleared() {
        let mut pm = setup_virtual_memory();
        assert!(pm.get_byte(0x7000).is_err());

        // A valid access still reports the pending fault
        assert_eq!(pm.get_byte(0x5010).unwrap_err().vaddr(), 0x7000);

        let mut pmcb = pm.pmcb();
        pmcb.operation_state = OperationState::Idle;
        pm.set_pmcb(pmcb);
        assert_eq!(pm.get_byte(0x5010), Ok(0x5A));
    }

    #[test]
    fn test_write_permission_fault() {
        let mut pm = setup_virtual_memory();
        let fault = pm.put_byte(0x5000, 1).unwrap_err();

        assert_eq!(fault, MemoryFault::WritePermission { vaddr: 0x5000 });
        assert_eq!(fault.kind(), "WritePermissionFault");
        assert_eq!(fault.to_string(), "write to non-writable page");
        assert_eq!(pm.pmcb().operation_state, OperationState::Write { vaddr: 0x5000 });
    }

    #[test]
    fn test_put_bytes_partial_before_fault() {
        let mut pm = setup_virtual_memory();
        let fault = pm.put_bytes(0x6FFE, &[0xA, 0xB, 0xC]).unwrap_err();

        assert_eq!(fault.vaddr(), 0x7000);
        assert_eq!(pm.raw(0x3FFE, 2), &[0xA, 0xB]);
    }

    #[test]
    fn test_physical_mode_guard_restores_pmcb() {
        let mut pm = setup_virtual_memory();
        let before = pm.pmcb();
        {
            let mut phys = PhysicalMode::enter(&mut pm);
            assert_eq!(phys.saved_pmcb(), before);
            // Raw offsets, no translation
            phys.write_u32(0x3000, 0xDEAD_BEEF);
            assert_eq!(phys.read_u32(0x3000), 0xDEAD_BEEF);
            assert_eq!(phys.read_table(0x1000)[6].frame(), 3);
        }
        assert_eq!(pm.pmcb(), before);
        assert_eq!(pm.get_byte(0x6000), Ok(0xEF));
    }

    #[test]
    fn test_physical_mode_guard_is_in_physical_mode() {
        let mut pm = setup_virtual_memory();
        let phys = PhysicalMode::enter(&mut pm);
        assert_eq!(phys.mem.pmcb().mode, AddressingMode::Physical);
        assert_eq!(phys.mem.pmcb().page_table_base, 0);
    }

    #[test]
    fn test_zero_frame() {
        let mut pm = PhysicalMemory::new(2);
        pm.put_bytes(0x1000, &[0xFF; 16]).unwrap();
        PhysicalMode::enter(&mut pm).zero_frame(1);
        assert!(pm.raw(0x1000, PAGE_SIZE as usize).iter().all(|&b| b == 0));
    }
}
