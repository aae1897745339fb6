//! Page frame allocator.
//!
//! The free list lives inside the free frames themselves: the first four
//! bytes of each free frame hold the number of the next free frame, and the
//! last one holds [`END_OF_LIST`]. The allocator only keeps the head and the
//! counts. Every link access goes through a [`PhysicalMode`] guard.

use std::fmt::Write as _;

use log::debug;

use crate::constants::*;
use crate::error::FrameError;
use crate::memory::{PhysicalMemory, PhysicalMode};

#[derive(Debug)]
pub struct FrameAllocator {
    total_frames: u32,
    free_count: u32,
    free_list_head: u32,
}

impl FrameAllocator {
    /// Thread every frame of the device onto the free list, in ascending order
    pub fn new(pm: &mut PhysicalMode<'_>) -> Self {
        let total_frames = pm.frame_count();
        for frame in 0..total_frames {
            let next = if frame + 1 == total_frames { END_OF_LIST } else { frame + 1 };
            pm.write_u32(PhysicalMemory::frame_to_address(frame), next);
        }

        debug!("frame allocator: {:#x} frames", total_frames);
        FrameAllocator {
            total_frames,
            free_count: total_frames,
            free_list_head: if total_frames == 0 { END_OF_LIST } else { 0 },
        }
    }

    #[inline]
    pub fn total_frames(&self) -> u32 {
        self.total_frames
    }

    #[inline]
    pub fn free_count(&self) -> u32 {
        self.free_count
    }

    #[inline]
    pub fn allocated_count(&self) -> u32 {
        self.total_frames - self.free_count
    }

    /// First frame on the free list, or `END_OF_LIST` when empty
    #[inline]
    pub fn free_list_head(&self) -> u32 {
        self.free_list_head
    }

    /// Pop `count` frames off the free list and push their numbers onto
    /// `frames`. Each frame is zero-filled after it is unlinked.
    ///
    /// Nothing is allocated if fewer than `count` frames are free.
    pub fn allocate(
        &mut self,
        pm: &mut PhysicalMode<'_>,
        count: u32,
        frames: &mut Vec<u32>,
    ) -> Result<(), FrameError> {
        if count > self.free_count {
            return Err(FrameError::Exhausted {
                requested: count,
                free: self.free_count,
            });
        }

        frames.reserve(count as usize);
        for _ in 0..count {
            let frame = self.free_list_head;
            // Read the link before the frame is cleared
            self.free_list_head = pm.read_u32(PhysicalMemory::frame_to_address(frame));
            pm.zero_frame(frame);
            self.free_count -= 1;
            frames.push(frame);
        }

        debug!("allocated {:#x} frames, {:#x} free", count, self.free_count);
        Ok(())
    }

    /// Return the last `count` frames of `frames` to the head of the free list.
    ///
    /// Nothing is freed if `frames` holds fewer than `count` entries.
    pub fn deallocate(
        &mut self,
        pm: &mut PhysicalMode<'_>,
        count: u32,
        frames: &mut Vec<u32>,
    ) -> Result<(), FrameError> {
        if count as usize > frames.len() {
            return Err(FrameError::NotEnoughFrames {
                requested: count,
                available: frames.len(),
            });
        }

        for _ in 0..count {
            let Some(frame) = frames.pop() else { break };
            pm.write_u32(PhysicalMemory::frame_to_address(frame), self.free_list_head);
            self.free_list_head = frame;
            self.free_count += 1;
        }

        debug!("deallocated {:#x} frames, {:#x} free", count, self.free_count);
        Ok(())
    }

    /// Frame numbers on the free list, head first.
    ///
    /// Stops at the sentinel, and never walks more than `total_frames` links.
    pub fn free_frames(&self, pm: &PhysicalMode<'_>) -> Vec<u32> {
        let mut frames = Vec::with_capacity(self.free_count as usize);
        let mut next = self.free_list_head;
        while next != END_OF_LIST && frames.len() < self.total_frames as usize {
            frames.push(next);
            next = pm.read_u32(PhysicalMemory::frame_to_address(next));
        }
        frames
    }

    /// Hex listing of the free list, e.g. `" 3 4 5"`
    pub fn free_list_to_string(&self, pm: &PhysicalMode<'_>) -> String {
        let mut out = String::new();
        for frame in self.free_frames(pm) {
            let _ = write!(out, " {:x}", frame);
        }
        out
    }
}
