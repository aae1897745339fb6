use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::constants::Addr;

/// Failures of the frame allocator. Neither mutates allocator state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("requested {requested:#x} frames, only {free:#x} free")]
    Exhausted { requested: u32, free: u32 },
    #[error("asked to free {requested:#x} frames, only {available:#x} supplied")]
    NotEnoughFrames { requested: u32, available: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressSpaceError {
    /// Start or size not a multiple of the page size
    #[error("range {vaddr:x}+{size:x} is not page aligned")]
    Misaligned { vaddr: Addr, size: u32 },
    #[error("range {vaddr:x}+{size:x} runs past the end of the address space")]
    OutOfRange { vaddr: Addr, size: u32 },
    #[error(transparent)]
    Frames(#[from] FrameError),
}

/// Fatal trace and script errors
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("failed to open {}: {source}", .path.display())]
    Open { path: PathBuf, source: io::Error },
    #[error("read failed at line {line}: {source}")]
    Read { line: usize, source: io::Error },
    #[error("write to output failed: {0}")]
    Output(#[from] io::Error),
    #[error("invalid command at line {line}:\n{text}")]
    InvalidCommand { line: usize, text: String },
    #[error("line {line}: invalid hex argument '{token}'")]
    InvalidNumber { line: usize, token: String },
    #[error("line {line}: '{command}' expects {expected} arguments, got {got}")]
    ArgumentCount {
        line: usize,
        command: &'static str,
        expected: &'static str,
        got: usize,
    },
    #[error("line {line}: byte value {value:x} out of range")]
    ByteOutOfRange { line: usize, value: u32 },
    #[error("{count:#x} frames requested, at most {max:#x} are addressable")]
    FrameCount { count: u32, max: u32 },
    #[error("cannot build address space: {0}")]
    Setup(AddressSpaceError),
    #[error("line {line}: {source}")]
    Range {
        line: usize,
        source: AddressSpaceError,
    },
}

impl TraceError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            TraceError::Range { .. } => 3,
            _ => 2,
        }
    }
}

pub type TraceResult<T> = Result<T, TraceError>;
