// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Multidimensional address ranges and the cursor that consumes them.
//!
//! A port's address list is a sequence of rectangular ranges of up to three
//! dimensions: a contiguous byte run (dim 0) optionally repeated along lines
//! (dim 1) and planes (dim 2) with byte strides. The cursor exposes the
//! largest rectangular prefix still available at the current position; the
//! reported dimensionality drops while a lower dimension is partially
//! consumed and recovers at the next boundary.

use std::collections::VecDeque;

/// One rectangular range: `contig` bytes at `offset`, repeated along each
/// outer dimension `(count, stride)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRange {
    pub offset: usize,
    pub contig: usize,
    pub outer: Vec<(usize, usize)>,
}

impl AddressRange {
    /// Total bytes covered by the range.
    pub fn bytes(&self) -> usize {
        self.outer.iter().fold(self.contig, |b, (count, _)| b * count)
    }
}

/// Ordered collection of address ranges for one port.
#[derive(Debug, Clone, Default)]
pub struct AddressList {
    ranges: Vec<AddressRange>,
}

impl AddressList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a 1-D run of `bytes` at `offset`.
    pub fn push_1d(&mut self, offset: usize, bytes: usize) -> &mut Self {
        debug_assert!(bytes > 0);
        self.ranges.push(AddressRange {
            offset,
            contig: bytes,
            outer: Vec::new(),
        });
        self
    }

    /// Append `lines` runs of `bytes`, separated by `lstride` bytes.
    pub fn push_2d(&mut self, offset: usize, bytes: usize, lines: usize, lstride: usize) -> &mut Self {
        debug_assert!(bytes > 0 && lines > 0);
        self.ranges.push(AddressRange {
            offset,
            contig: bytes,
            outer: vec![(lines, lstride)],
        });
        self
    }

    /// Append `planes` 2-D blocks, separated by `pstride` bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn push_3d(
        &mut self,
        offset: usize,
        bytes: usize,
        lines: usize,
        lstride: usize,
        planes: usize,
        pstride: usize,
    ) -> &mut Self {
        debug_assert!(bytes > 0 && lines > 0 && planes > 0);
        self.ranges.push(AddressRange {
            offset,
            contig: bytes,
            outer: vec![(lines, lstride), (planes, pstride)],
        });
        self
    }

    pub fn total_bytes(&self) -> usize {
        self.ranges.iter().map(AddressRange::bytes).sum()
    }

    pub fn cursor(self) -> AddressCursor {
        let ranges: VecDeque<_> = self.ranges.into();
        let idx = ranges
            .front()
            .map(|r| vec![0; r.outer.len()])
            .unwrap_or_default();
        AddressCursor {
            ranges,
            byte_pos: 0,
            idx,
        }
    }
}

/// Stateful iterator over an [`AddressList`].
#[derive(Debug)]
pub struct AddressCursor {
    ranges: VecDeque<AddressRange>,
    /// Bytes consumed within the current dim-0 run.
    byte_pos: usize,
    /// Units consumed along each outer dimension of the current range.
    idx: Vec<usize>,
}

impl AddressCursor {
    pub fn is_exhausted(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Bytes still available across all remaining ranges.
    pub fn bytes_remaining(&self) -> usize {
        let mut total: usize = self.ranges.iter().skip(1).map(AddressRange::bytes).sum();
        if let Some(cur) = self.ranges.front() {
            let mut consumed = self.byte_pos;
            let mut unit = cur.contig;
            for (d, (count, _)) in cur.outer.iter().enumerate() {
                consumed += self.idx[d] * unit;
                unit *= count;
            }
            total += cur.bytes() - consumed;
        }
        total
    }

    /// Byte offset of the current position.
    pub fn offset(&self) -> usize {
        let cur = self.cur();
        let mut off = cur.offset + self.byte_pos;
        for (d, (_, stride)) in cur.outer.iter().enumerate() {
            off += self.idx[d] * stride;
        }
        off
    }

    /// Effective dimensionality at the current position.
    ///
    /// Partial consumption of dim 0 pins this to 1; a nonzero position along
    /// an outer dimension caps it one above that dimension.
    pub fn dim(&self) -> usize {
        if self.byte_pos > 0 {
            return 1;
        }
        for (d, i) in self.idx.iter().enumerate() {
            if *i > 0 {
                return d + 2;
            }
        }
        1 + self.cur().outer.len()
    }

    /// Units still available at dimension `d`: bytes for `d == 0`, lines or
    /// planes above that.
    pub fn remaining(&self, d: usize) -> usize {
        let cur = self.cur();
        if d == 0 {
            cur.contig - self.byte_pos
        } else {
            cur.outer[d - 1].0 - self.idx[d - 1]
        }
    }

    /// Byte stride at dimension `d`; dim 0 reports the contiguous run length.
    pub fn stride(&self, d: usize) -> usize {
        let cur = self.cur();
        if d == 0 { cur.contig } else { cur.outer[d - 1].1 }
    }

    /// Consume `n` units at dimension `d`.
    ///
    /// Bytes at dim 0, lines or planes above; exact fills carry into the next
    /// dimension up, and draining the top dimension moves to the next range.
    pub fn advance(&mut self, d: usize, n: usize) {
        if n == 0 {
            return;
        }
        if d == 0 {
            let contig = self.cur().contig;
            self.byte_pos += n;
            debug_assert!(self.byte_pos <= contig);
            if self.byte_pos == contig {
                self.byte_pos = 0;
                self.bump_outer(0, 1);
            }
        } else {
            debug_assert_eq!(self.byte_pos, 0);
            debug_assert!(self.idx[..d - 1].iter().all(|i| *i == 0));
            self.bump_outer(d - 1, n);
        }
    }

    /// Discard `n` bytes without touching memory.
    pub fn skip_bytes(&mut self, mut n: usize) {
        while n > 0 {
            debug_assert!(!self.is_exhausted());
            let take = self.remaining(0).min(n);
            self.advance(0, take);
            n -= take;
        }
    }

    fn cur(&self) -> &AddressRange {
        self.ranges.front().expect("cursor exhausted")
    }

    fn bump_outer(&mut self, mut d: usize, by: usize) {
        let cur = self.ranges.front().expect("cursor exhausted");
        if cur.outer.is_empty() {
            debug_assert_eq!(d, 0);
            self.next_range();
            return;
        }
        self.idx[d] += by;
        loop {
            let count = self.ranges.front().expect("cursor exhausted").outer[d].0;
            debug_assert!(self.idx[d] <= count);
            if self.idx[d] < count {
                return;
            }
            self.idx[d] = 0;
            d += 1;
            if d == self.idx.len() {
                self.next_range();
                return;
            }
            self.idx[d] += 1;
        }
    }

    fn next_range(&mut self) {
        self.ranges.pop_front();
        self.byte_pos = 0;
        self.idx = self
            .ranges
            .front()
            .map(|r| vec![0; r.outer.len()])
            .unwrap_or_default();
    }
}
