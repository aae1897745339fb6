pub mod address_space;
pub mod constants;
pub mod error;
pub mod frames;
pub mod io;
pub mod memory;
pub mod trace;
pub mod translation;

// Re-export commonly used items for convenience
pub use address_space::AddressSpace;
pub use constants::*;
pub use error::{AddressSpaceError, FrameError, TraceError, TraceResult};
pub use frames::FrameAllocator;
pub use memory::{MemoryFault, PhysicalMemory, PhysicalMode, Pmcb};
pub use trace::{run_trace_file, TraceInterpreter, TraceStats};
pub use translation::{PageTableEntry, PteFlags, VirtualAddress};
