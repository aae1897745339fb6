//! Trace interpreter.
//!
//! Each line is echoed as `{line}:{text}` before it runs. Data commands run
//! in Virtual mode and may fault on any byte; a fault ends the command, is
//! reported on the output, and the trace continues with the next line.

use std::io::{self, BufRead, Write};
use std::path::Path;

use log::{debug, info, warn};

use crate::address_space::AddressSpace;
use crate::constants::Addr;
use crate::error::{AddressSpaceError, TraceError, TraceResult};
use crate::frames::FrameAllocator;
use crate::io::{TraceLine, TraceReader};
use crate::memory::{AddressingMode, MemoryFault, OperationState, PhysicalMemory, PhysicalMode};

/// A validated trace command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Alloc { vaddr: Addr, size: u32 },
    Compare { addr: Addr, expected: Vec<u8> },
    Put { addr: Addr, values: Vec<u8> },
    Fill { addr: Addr, count: u32, value: u8 },
    Copy { dest: Addr, src: Addr, count: u32 },
    Dump { addr: Addr, count: u32 },
    Writable { vaddr: Addr, size: u32, writable: bool },
    Comment,
    Blank,
}

impl Command {
    pub fn parse(line: &TraceLine) -> TraceResult<Self> {
        let args = line.args.as_slice();
        let command = match line.name.as_str() {
            "" => Command::Blank,
            "#" => Command::Comment,
            "alloc" => {
                let [vaddr, size] = exact::<2>(line, "alloc", "2")?;
                Command::Alloc { vaddr, size }
            }
            "compare" => {
                let (&addr, rest) = args.split_first().ok_or_else(|| too_few(line, "compare"))?;
                Command::Compare {
                    addr,
                    expected: bytes(line, rest)?,
                }
            }
            "put" => {
                let (&addr, rest) = args.split_first().ok_or_else(|| too_few(line, "put"))?;
                Command::Put {
                    addr,
                    values: bytes(line, rest)?,
                }
            }
            "fill" => {
                let [addr, count, value] = exact::<3>(line, "fill", "3")?;
                Command::Fill {
                    addr,
                    count,
                    value: byte(line, value)?,
                }
            }
            "copy" => {
                let [dest, src, count] = exact::<3>(line, "copy", "3")?;
                Command::Copy { dest, src, count }
            }
            "dump" => {
                let [addr, count] = exact::<2>(line, "dump", "2")?;
                Command::Dump { addr, count }
            }
            "writable" => {
                let [vaddr, size, status] = exact::<3>(line, "writable", "3")?;
                Command::Writable {
                    vaddr,
                    size,
                    writable: status != 0,
                }
            }
            _ => {
                return Err(TraceError::InvalidCommand {
                    line: line.number,
                    text: line.text.clone(),
                });
            }
        };
        Ok(command)
    }
}

fn exact<const N: usize>(line: &TraceLine, command: &'static str, expected: &'static str) -> TraceResult<[u32; N]> {
    line.args.as_slice().try_into().map_err(|_| TraceError::ArgumentCount {
        line: line.number,
        command,
        expected,
        got: line.args.len(),
    })
}

fn too_few(line: &TraceLine, command: &'static str) -> TraceError {
    TraceError::ArgumentCount {
        line: line.number,
        command,
        expected: "at least 1",
        got: line.args.len(),
    }
}

fn byte(line: &TraceLine, value: u32) -> TraceResult<u8> {
    u8::try_from(value).map_err(|_| TraceError::ByteOutOfRange {
        line: line.number,
        value,
    })
}

fn bytes(line: &TraceLine, values: &[u32]) -> TraceResult<Vec<u8>> {
    values.iter().map(|&v| byte(line, v)).collect()
}

/// Bytes per `dump` output line
const DUMP_ROW: usize = 16;

/// Counters for one trace run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TraceStats {
    pub lines: usize,
    pub faults: usize,
    pub compare_errors: usize,
    pub failed_allocs: usize,
}

/// Why a command stopped early
enum Interrupt {
    Fault(MemoryFault),
    Fatal(TraceError),
}

impl From<MemoryFault> for Interrupt {
    fn from(fault: MemoryFault) -> Self {
        Interrupt::Fault(fault)
    }
}

impl From<TraceError> for Interrupt {
    fn from(err: TraceError) -> Self {
        Interrupt::Fatal(err)
    }
}

impl From<io::Error> for Interrupt {
    fn from(err: io::Error) -> Self {
        Interrupt::Fatal(TraceError::Output(err))
    }
}

pub struct TraceInterpreter<W: Write> {
    mem: PhysicalMemory,
    allocator: FrameAllocator,
    space: AddressSpace,
    out: W,
    stats: TraceStats,
}

impl<W: Write> TraceInterpreter<W> {
    /// Build the free list over `mem`, create the process's page directory
    /// and enter Virtual mode
    pub fn new(mut mem: PhysicalMemory, out: W) -> TraceResult<Self> {
        let mut allocator = FrameAllocator::new(&mut PhysicalMode::enter(&mut mem));
        let space = AddressSpace::new(&mut mem, &mut allocator).map_err(TraceError::Setup)?;

        Ok(TraceInterpreter {
            mem,
            allocator,
            space,
            out,
            stats: TraceStats::default(),
        })
    }

    pub fn memory(&mut self) -> &mut PhysicalMemory {
        &mut self.mem
    }

    pub fn allocator(&self) -> &FrameAllocator {
        &self.allocator
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn stats(&self) -> TraceStats {
        self.stats
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Execute every line of `reader`, stopping at the first fatal error
    pub fn run<R: BufRead>(&mut self, reader: TraceReader<R>) -> TraceResult<TraceStats> {
        for line in reader {
            let (number, text) = line?;
            self.execute_line(number, text)?;
        }
        self.out.flush()?;

        info!(
            "trace done: {} lines, {} faults, {} compare errors, {:#x} frames free",
            self.stats.lines,
            self.stats.faults,
            self.stats.compare_errors,
            self.allocator.free_count()
        );
        Ok(self.stats)
    }

    /// Echo one line, then parse and run it
    pub fn execute_line(&mut self, number: usize, text: String) -> TraceResult<()> {
        writeln!(self.out, "{}:{}", number, text)?;
        self.stats.lines += 1;

        let line = TraceLine::parse(number, text)?;
        let command = Command::parse(&line)?;
        match self.execute(line.number, command) {
            Ok(()) => {}
            Err(Interrupt::Fault(fault)) => self.recover(fault)?,
            Err(Interrupt::Fatal(err)) => return Err(err),
        }

        debug_assert_eq!(self.mem.pmcb().mode, AddressingMode::Virtual);
        Ok(())
    }

    fn execute(&mut self, line: usize, command: Command) -> Result<(), Interrupt> {
        match command {
            Command::Alloc { vaddr, size } => self.cmd_alloc(line, vaddr, size)?,
            Command::Compare { addr, expected } => self.cmd_compare(addr, &expected)?,
            Command::Put { addr, values } => self.mem.put_bytes(addr, &values)?,
            Command::Fill { addr, count, value } => {
                for i in 0..count {
                    self.mem.put_byte(addr.wrapping_add(i), value)?;
                }
            }
            Command::Copy { dest, src, count } => {
                for i in 0..count {
                    let value = self.mem.get_byte(src.wrapping_add(i))?;
                    self.mem.put_byte(dest.wrapping_add(i), value)?;
                }
            }
            Command::Dump { addr, count } => self.cmd_dump(addr, count)?,
            Command::Writable { vaddr, size, writable } => {
                self.space
                    .set_writable(&mut self.mem, vaddr, size, writable)
                    .map_err(|source| TraceError::Range { line, source })?;
            }
            Command::Comment | Command::Blank => {}
        }
        Ok(())
    }

    fn cmd_alloc(&mut self, line: usize, vaddr: Addr, size: u32) -> TraceResult<()> {
        match self
            .space
            .allocate_range(&mut self.mem, &mut self.allocator, vaddr, size)
        {
            Ok(()) => Ok(()),
            Err(AddressSpaceError::Frames(err)) => {
                warn!("line {}: alloc {:x} {:x} failed: {}", line, vaddr, size, err);
                self.stats.failed_allocs += 1;
                Ok(())
            }
            Err(source) => Err(TraceError::Range { line, source }),
        }
    }

    fn cmd_compare(&mut self, addr: Addr, expected: &[u8]) -> Result<(), Interrupt> {
        for (i, &want) in expected.iter().enumerate() {
            let at = addr.wrapping_add(i as u32);
            let actual = self.mem.get_byte(at)?;
            if actual != want {
                writeln!(
                    self.out,
                    "compare error at address {:x}, expected {:x}, actual is {:x}",
                    at, want, actual
                )?;
                self.stats.compare_errors += 1;
            }
        }
        Ok(())
    }

    fn cmd_dump(&mut self, addr: Addr, count: u32) -> Result<(), Interrupt> {
        writeln!(self.out, "{:x}", addr)?;

        // A row prints only once all of its bytes have been read
        let mut buf = [0u8; DUMP_ROW];
        let mut offset = 0u32;
        while offset < count {
            let len = (count - offset).min(DUMP_ROW as u32);
            let row = &mut buf[..len as usize];
            self.mem.get_bytes(row, addr.wrapping_add(offset))?;
            for b in row.iter() {
                write!(self.out, " {:02x}", b)?;
            }
            writeln!(self.out)?;
            offset += len;
        }
        Ok(())
    }

    /// Report a fault and cancel the interrupted access
    fn recover(&mut self, fault: MemoryFault) -> TraceResult<()> {
        writeln!(self.out, "{} at address {:x}: {}", fault.kind(), fault.vaddr(), fault)?;
        self.stats.faults += 1;

        let mut pmcb = self.mem.pmcb();
        pmcb.operation_state = OperationState::Idle;
        self.mem.set_pmcb(pmcb);
        debug!("recovered from {:?}", fault);
        Ok(())
    }
}

/// Run the trace at `path` on a fresh device of `frame_count` frames
pub fn run_trace_file<P: AsRef<Path>, W: Write>(path: P, frame_count: u32, out: W) -> TraceResult<TraceStats> {
    let reader = TraceReader::open(&path)?;
    info!("running {} with {:#x} frames", path.as_ref().display(), frame_count);
    let mut interpreter = TraceInterpreter::new(PhysicalMemory::try_new(frame_count)?, out)?;
    interpreter.run(reader)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(trace: &str) -> (TraceResult<TraceStats>, String) {
        let mut interp = TraceInterpreter::new(PhysicalMemory::new(0x100), Vec::new()).unwrap();
        let result = interp.run(TraceReader::new(trace.as_bytes()));
        (result, String::from_utf8(interp.into_output()).unwrap())
    }

    fn line(text: &str) -> TraceLine {
        TraceLine::parse(1, text.to_string()).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&line("alloc 1000 2000")).unwrap(),
            Command::Alloc { vaddr: 0x1000, size: 0x2000 }
        );
        assert_eq!(
            Command::parse(&line("compare 10 1 ff")).unwrap(),
            Command::Compare { addr: 0x10, expected: vec![1, 0xFF] }
        );
        assert_eq!(
            Command::parse(&line("writable 0 1000 0")).unwrap(),
            Command::Writable { vaddr: 0, size: 0x1000, writable: false }
        );
        assert_eq!(
            Command::parse(&line("writable 0 1000 5")).unwrap(),
            Command::Writable { vaddr: 0, size: 0x1000, writable: true }
        );
        assert_eq!(Command::parse(&line("# alloc 0 0")).unwrap(), Command::Comment);
    }

    #[test]
    fn test_parse_rejects_bad_arguments() {
        assert!(matches!(
            Command::parse(&line("alloc 1000")),
            Err(TraceError::ArgumentCount { command: "alloc", got: 1, .. })
        ));
        assert!(matches!(
            Command::parse(&line("put")),
            Err(TraceError::ArgumentCount { command: "put", .. })
        ));
        assert!(matches!(
            Command::parse(&line("fill 0 4 100")),
            Err(TraceError::ByteOutOfRange { value: 0x100, .. })
        ));
        assert!(matches!(
            Command::parse(&line("ALLOC 0 1000")),
            Err(TraceError::InvalidCommand { .. })
        ));
    }

    #[test]
    fn test_echo_and_zeroed_alloc() {
        let (result, out) = run("alloc 1000 2000\ncompare 1000 00 00 00\n");
        let stats = result.unwrap();
        assert_eq!(out, "1:alloc 1000 2000\n2:compare 1000 00 00 00\n");
        assert_eq!(stats.lines, 2);
        assert_eq!(stats.compare_errors, 0);
    }

    #[test]
    fn test_put_then_compare_reports_mismatch() {
        let (result, out) = run("alloc 1000 2000\nput 1000 aa bb\ncompare 1000 aa bb cc\n");
        assert_eq!(result.unwrap().compare_errors, 1);
        assert_eq!(
            out,
            "1:alloc 1000 2000\n2:put 1000 aa bb\n3:compare 1000 aa bb cc\n\
             compare error at address 1002, expected cc, actual is 0\n"
        );
    }

    #[test]
    fn test_compare_reports_each_mismatch() {
        let (_, out) = run("alloc 0 1000\nput 0 1 2 3 4\ncompare 0 1 9 3 8\n");
        let errors: Vec<&str> = out.lines().filter(|l| l.starts_with("compare error")).collect();
        assert_eq!(
            errors,
            vec![
                "compare error at address 1, expected 9, actual is 2",
                "compare error at address 3, expected 8, actual is 4",
            ]
        );
    }

    #[test]
    fn test_fill_copy_dump() {
        let trace = "alloc 0 2000\nfill ffc 8 7e\ncopy 1800 ffc 8\ndump 17fe 12\n";
        let (result, out) = run(trace);
        result.unwrap();
        let expected = "1:alloc 0 2000\n2:fill ffc 8 7e\n3:copy 1800 ffc 8\n4:dump 17fe 12\n\
                        17fe\n 00 00 7e 7e 7e 7e 7e 7e 7e 7e 00 00 00 00 00 00\n 00 00\n";
        assert_eq!(out, expected);
    }

    #[test]
    fn test_dump_zero_count() {
        let (_, out) = run("alloc 0 1000\ndump 10 0\n");
        assert!(out.ends_with("2:dump 10 0\n10\n"));
    }

    #[test]
    fn test_page_fault_recovery_continues() {
        let (result, out) = run("alloc 0 1000\ncompare 5000 0\nput 0 1\ncompare 0 1\n");
        let stats = result.unwrap();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.lines, 4);
        assert_eq!(stats.compare_errors, 0);
        assert!(out.contains("2:compare 5000 0\nPageFault at address 5000: page not present in L2 page table\n3:put 0 1\n"));
    }

    #[test]
    fn test_dump_prints_rows_read_before_fault() {
        let (result, out) = run("alloc 0 1000\nfill ff0 10 5\ndump ff0 20\nput 0 1\n");
        assert_eq!(result.unwrap().faults, 1);
        assert!(out.contains(
            "3:dump ff0 20\nff0\n 05 05 05 05 05 05 05 05 05 05 05 05 05 05 05 05\n\
             PageFault at address 1000: page not present in L2 page table\n4:put 0 1\n"
        ));
    }

    #[test]
    fn test_dump_of_whole_address_space_stops_at_first_fault() {
        let (result, out) = run("alloc 0 1000\ndump 0 ffffffff\n");
        assert_eq!(result.unwrap().faults, 1);

        let lines: Vec<&str> = out.lines().collect();
        // Echoes, address line, one row per 16 mapped bytes, fault notice
        assert_eq!(lines.len(), 2 + 1 + 0x100 + 1);
        assert_eq!(lines[3], " 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00 00");
        assert!(lines[lines.len() - 1].starts_with("PageFault at address 1000"));
    }

    #[test]
    fn test_malformed_argument_is_echoed_first() {
        let (result, out) = run("alloc 0 1000\nput 0x10 1\nput 0 1\n");
        let err = result.unwrap_err();
        assert!(matches!(err, TraceError::InvalidNumber { line: 2, ref token } if token == "0x10"));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(out, "1:alloc 0 1000\n2:put 0x10 1\n");
    }

    #[test]
    fn test_fault_on_missing_directory_entry() {
        let (_, out) = run("alloc 0 1000\ndump 400000 4\n");
        assert!(out.contains("400000\nPageFault at address 400000: page not present in page directory\n"));
    }

    #[test]
    fn test_writable_toggle() {
        let trace = "alloc 0 3000\n\
                     writable 1000 1000 0\n\
                     put 1000 1\n\
                     put 0 2\n\
                     put 2000 3\n\
                     writable 1000 1000 1\n\
                     put 1000 4\n\
                     compare 0 2\ncompare 1000 4\ncompare 2000 3\n";
        let (result, out) = run(trace);
        let stats = result.unwrap();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.compare_errors, 0);
        assert!(out.contains("3:put 1000 1\nWritePermissionFault at address 1000: write to non-writable page\n4:put 0 2\n"));
    }

    #[test]
    fn test_fault_keeps_partial_writes() {
        let (result, out) = run("alloc 0 1000\nfill ffe 4 9\ncompare ffe 9 9\n");
        assert_eq!(result.unwrap().compare_errors, 0);
        assert!(out.contains("PageFault at address 1000"));
    }

    #[test]
    fn test_compare_mismatches_before_fault_are_reported() {
        let (_, out) = run("alloc 0 1000\ncompare ffe 1 0 5\n");
        assert!(out.contains(
            "compare error at address ffe, expected 1, actual is 0\nPageFault at address 1000"
        ));
    }

    #[test]
    fn test_realloc_preserves_data() {
        let trace = "alloc 1000 1000\nput 1000 aa bb\nalloc 0 3000\ncompare 1000 aa bb\ncompare 0 0\n";
        let (result, _) = run(trace);
        let stats = result.unwrap();
        assert_eq!(stats.compare_errors, 0);
        assert_eq!(stats.faults, 0);
    }

    #[test]
    fn test_alloc_exhaustion_is_recoverable() {
        let mut interp = TraceInterpreter::new(PhysicalMemory::new(4), Vec::new()).unwrap();
        let stats = interp
            .run(TraceReader::new("alloc 0 4000\ncompare 0 0\nalloc 0 1000\n".as_bytes()))
            .unwrap();

        assert_eq!(stats.failed_allocs, 1);
        assert_eq!(stats.faults, 1);
        // Directory + one L2 table + one page from the last alloc
        assert_eq!(interp.allocator().free_count(), 1);
        assert_eq!(interp.address_space().frames().len(), 3);
    }

    #[test]
    fn test_misaligned_alloc_is_fatal() {
        let (result, out) = run("alloc 1000 800\ndump 0 1\n");
        let err = result.unwrap_err();
        assert_eq!(err.exit_code(), 3);
        assert_eq!(out, "1:alloc 1000 800\n");
    }

    #[test]
    fn test_misaligned_writable_is_fatal() {
        let (result, _) = run("alloc 0 1000\nwritable 10 1000 0\n");
        assert!(matches!(result, Err(TraceError::Range { line: 2, .. })));
    }

    #[test]
    fn test_unknown_command_is_fatal() {
        let (result, out) = run("alloc 0 1000\njump 0\nput 0 1\n");
        let err = result.unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(err, TraceError::InvalidCommand { line: 2, .. }));
        assert!(out.ends_with("2:jump 0\n"));
    }

    #[test]
    fn test_comment_and_blank_lines_echo_only() {
        let (result, out) = run("# set up\n\nalloc 0 1000\n");
        assert_eq!(result.unwrap().lines, 3);
        assert_eq!(out, "1:# set up\n2:\n3:alloc 0 1000\n");
    }

    #[test]
    fn test_virtual_mode_between_commands() {
        let mut interp = TraceInterpreter::new(PhysicalMemory::new(0x10), Vec::new()).unwrap();
        for text in ["alloc 0 2000", "writable 0 1000 0", "put 0 1", "compare 9000 0"] {
            interp.execute_line(1, text.to_string()).unwrap();
            let pmcb = interp.memory().pmcb();
            assert_eq!(pmcb.mode, AddressingMode::Virtual);
            assert_eq!(pmcb.operation_state, OperationState::Idle);
        }
    }

    #[test]
    fn test_setup_needs_a_frame() {
        let err = TraceInterpreter::new(PhysicalMemory::new(0), Vec::new()).err().unwrap();
        assert!(matches!(err, TraceError::Setup(_)));
    }
}
