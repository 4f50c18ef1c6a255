// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Byte-progress span batching.
//!
//! Progress loops produce many small read/write spans; flushing each one as
//! its own update is wasteful. A `SequenceCache` merges adjacent spans per
//! port and applies them as single updates, early when a merged span crosses
//! the flush threshold and unconditionally when the cache is dropped into
//! `flush` at the end of a `progress` call.

use crate::xd::XdShared;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpanDir {
    Read,
    Write,
}

#[derive(Debug)]
pub(crate) struct SequenceCache {
    target: Arc<XdShared>,
    dir: SpanDir,
    spans: HashMap<usize, (usize, usize)>,
    /// Bytes recorded against no port (gather+scatter holes).
    hole_bytes: usize,
    threshold: usize,
}

impl SequenceCache {
    pub(crate) fn read(target: Arc<XdShared>, threshold: usize) -> Self {
        Self::new(target, SpanDir::Read, threshold)
    }

    pub(crate) fn write(target: Arc<XdShared>, threshold: usize) -> Self {
        Self::new(target, SpanDir::Write, threshold)
    }

    fn new(target: Arc<XdShared>, dir: SpanDir, threshold: usize) -> Self {
        Self {
            target,
            dir,
            spans: HashMap::new(),
            hole_bytes: 0,
            threshold,
        }
    }

    /// Record a span of progressed bytes. `port` of `None` accounts bytes
    /// that have no port to notify.
    pub(crate) fn add_span(&mut self, port: Option<usize>, offset: usize, size: usize) {
        if size == 0 {
            return;
        }
        let Some(port) = port else {
            self.hole_bytes += size;
            return;
        };
        match self.spans.remove(&port) {
            Some((start, len)) if start + len == offset => {
                let len = len + size;
                if len >= self.threshold {
                    self.apply(port, start, len);
                } else {
                    self.spans.insert(port, (start, len));
                }
            }
            Some((start, len)) => {
                self.apply(port, start, len);
                if size >= self.threshold {
                    self.apply(port, offset, size);
                } else {
                    self.spans.insert(port, (offset, size));
                }
            }
            None => {
                if size >= self.threshold {
                    self.apply(port, offset, size);
                } else {
                    self.spans.insert(port, (offset, size));
                }
            }
        }
    }

    /// Apply everything still cached.
    pub(crate) fn flush(&mut self) {
        let spans: Vec<_> = self.spans.drain().collect();
        for (port, (start, len)) in spans {
            self.apply(port, start, len);
        }
        if self.hole_bytes > 0 {
            tracing::trace!(
                xd = format_args!("{:#x}", self.target.guid()),
                bytes = self.hole_bytes,
                "progress spans with no port"
            );
            self.hole_bytes = 0;
        }
    }

    fn apply(&self, port: usize, start: usize, len: usize) {
        match self.dir {
            SpanDir::Read => self.target.update_bytes_read(port, start, len),
            SpanDir::Write => self.target.update_bytes_write(port, start, len),
        }
    }
}

impl Drop for SequenceCache {
    fn drop(&mut self) {
        if !self.spans.is_empty() {
            self.flush();
        }
    }
}
