use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines, Write};
use std::path::Path;

use crate::error::{TraceError, TraceResult};
use crate::frames::FrameAllocator;
use crate::memory::{check_frame_count, PhysicalMemory, PhysicalMode};

/// One line of a trace file, split into command name and hex arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    /// 1-based line number
    pub number: usize,
    /// Line exactly as read
    pub text: String,
    /// First token; `"#"` for comments, empty for blank lines
    pub name: String,
    pub args: Vec<u32>,
}

impl TraceLine {
    pub fn parse(number: usize, text: String) -> TraceResult<Self> {
        let mut tokens = text.split_whitespace();
        let name = match tokens.next() {
            None => String::new(),
            Some(first) if first.starts_with('#') => "#".to_string(),
            Some(first) => first.to_string(),
        };

        let args = if name == "#" {
            Vec::new()
        } else {
            tokens
                .map(|token| parse_hex(number, token))
                .collect::<TraceResult<Vec<u32>>>()?
        };

        Ok(TraceLine { number, text, name, args })
    }

    #[inline]
    pub fn is_comment(&self) -> bool {
        self.name == "#"
    }

    #[inline]
    pub fn is_blank(&self) -> bool {
        self.name.is_empty()
    }
}

fn parse_hex(line: usize, token: &str) -> TraceResult<u32> {
    u32::from_str_radix(token, 16).map_err(|_| TraceError::InvalidNumber {
        line,
        token: token.to_string(),
    })
}

/// Reads a trace one line at a time, yielding each line's number and text.
/// Lines are split into commands by [`TraceLine::parse`] once echoed.
pub struct TraceReader<R> {
    lines: Lines<R>,
    line_number: usize,
}

impl TraceReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let file = File::open(path.as_ref()).map_err(|source| TraceError::Open {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> TraceReader<R> {
    pub fn new(reader: R) -> Self {
        TraceReader {
            lines: reader.lines(),
            line_number: 0,
        }
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = TraceResult<(usize, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        let text = match self.lines.next()? {
            Ok(text) => text,
            Err(source) => {
                return Some(Err(TraceError::Read {
                    line: self.line_number + 1,
                    source,
                }));
            }
        };
        self.line_number += 1;
        Some(Ok((self.line_number, text)))
    }
}

/// One operation of a frame allocator script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOp {
    Deallocate(u32),
    Allocate(u32),
    PrintFreeList,
}

/// Allocator exercise script: a hex frame count, then one op per line
/// (`0 n` free, `1 n` allocate, `2` print the free list)
#[derive(Debug, Default)]
pub struct FrameScript {
    pub frame_count: u32,
    pub ops: Vec<FrameOp>,
}

impl FrameScript {
    pub fn from_file<P: AsRef<Path>>(path: P) -> TraceResult<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|source| TraceError::Open {
            path: path.as_ref().to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> TraceResult<Self> {
        let mut lines = content.lines().enumerate().map(|(i, text)| (i + 1, text));

        let frame_count = match lines.next() {
            Some((number, text)) => {
                let line = TraceLine::parse(number, text.to_string())?;
                match line.name.as_str() {
                    "" => return Err(invalid(number, text)),
                    first => check_frame_count(parse_hex(number, first)?)?,
                }
            }
            None => return Err(invalid(1, "")),
        };

        let mut ops = Vec::new();
        for (number, text) in lines {
            let line = TraceLine::parse(number, text.to_string())?;
            let op = match (line.name.as_str(), line.args.as_slice()) {
                ("", []) => continue,
                ("0", &[n]) => FrameOp::Deallocate(n),
                ("1", &[n]) => FrameOp::Allocate(n),
                ("2", []) => FrameOp::PrintFreeList,
                _ => return Err(invalid(number, text)),
            };
            ops.push(op);
        }

        Ok(FrameScript { frame_count, ops })
    }

    /// Run the script on a fresh device, writing the allocator's responses
    /// to `out`
    pub fn run<W: Write>(&self, out: &mut W) -> TraceResult<FrameAllocator> {
        let mut mem = PhysicalMemory::try_new(self.frame_count)?;
        let mut pm = PhysicalMode::enter(&mut mem);
        let mut allocator = FrameAllocator::new(&mut pm);
        let mut allocated: Vec<u32> = Vec::new();

        writeln!(out, ">{:x}", self.frame_count)?;
        for op in &self.ops {
            let result = match *op {
                FrameOp::Deallocate(n) => {
                    writeln!(out, ">0 {:x}", n)?;
                    allocator.deallocate(&mut pm, n, &mut allocated)
                }
                FrameOp::Allocate(n) => {
                    writeln!(out, ">1 {:x}", n)?;
                    allocator.allocate(&mut pm, n, &mut allocated)
                }
                FrameOp::PrintFreeList => {
                    writeln!(out, ">2")?;
                    writeln!(out, "{}", allocator.free_list_to_string(&pm))?;
                    continue;
                }
            };
            let status = if result.is_ok() { 'T' } else { 'F' };
            writeln!(out, " {} {:x}", status, allocator.free_count())?;
        }

        Ok(allocator)
    }
}

fn invalid(line: usize, text: &str) -> TraceError {
    TraceError::InvalidCommand {
        line,
        text: text.to_string(),
    }
}
