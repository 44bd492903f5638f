// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

//! Fixed-capacity byte buffer with producer/consumer cursors.
//!
//! `fill` marks the end of received/rendered data, `processed` the end of
//! consumed data; `0 <= processed <= fill <= capacity` always. There is no
//! wrap-around: space is reclaimed only by `reset` or an explicit `compact`
//! before a large receive.

use std::io;

pub struct SrBuffer {
    data: Box<[u8]>,
    fill: usize,
    processed: usize,
}

impl SrBuffer {
    pub fn new(capacity: usize) -> SrBuffer {
        SrBuffer {
            data: vec![0; capacity].into_boxed_slice(),
            fill: 0,
            processed: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn processed(&self) -> usize {
        self.processed
    }

    /// Free space left behind the producer cursor.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.fill
    }

    /// Received but not yet consumed bytes.
    pub fn unprocessed(&self) -> usize {
        self.fill - self.processed
    }

    pub fn is_empty(&self) -> bool {
        self.unprocessed() == 0
    }

    /// True once less than `threshold` bytes of free space remain.
    pub fn is_full(&self, threshold: usize) -> bool {
        self.remaining() < threshold
    }

    pub fn reset(&mut self) {
        self.fill = 0;
        self.processed = 0;
    }

    /// Account for `count` new bytes behind `fill`; optionally mark them
    /// consumed right away.
    pub fn add_data(&mut self, count: usize, advance: bool) {
        assert!(self.fill + count <= self.data.len());
        self.fill += count;
        if advance {
            self.processed += count;
        }
    }

    pub fn advance(&mut self, count: usize) {
        assert!(self.processed + count <= self.fill);
        self.processed += count;
    }

    /// Give back `count` bytes from both cursors.
    pub fn rewind_available_by(&mut self, count: usize) {
        assert!(count <= self.processed);
        self.fill -= count;
        self.processed -= count;
    }

    pub fn rewind_processed_to(&mut self, position: usize) {
        assert!(position <= self.fill);
        self.processed = position;
    }

    pub fn unprocessed_slice(&self) -> &[u8] {
        &self.data[self.processed..self.fill]
    }

    pub fn free_slice(&mut self) -> &mut [u8] {
        &mut self.data[self.fill..]
    }

    pub fn slice(&self, offset: usize, len: usize) -> &[u8] {
        &self.data[offset..offset + len]
    }

    /// Move unconsumed bytes to the front, reclaiming consumed space.
    pub fn compact(&mut self) {
        if self.processed == 0 {
            return;
        }
        self.data.copy_within(self.processed..self.fill, 0);
        self.fill -= self.processed;
        self.processed = 0;
    }
}

impl io::Write for SrBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = buf.len().min(self.remaining());
        if count == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WriteZero.into());
        }
        self.data[self.fill..self.fill + count].copy_from_slice(&buf[..count]);
        self.fill += count;
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
