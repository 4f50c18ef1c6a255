// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! In-memory driver backend for tests.
//!
//! `MockApi` executes every submission immediately against host memory and
//! records it in a log, so decomposition decisions are observable without a
//! device. Events retire immediately unless `hold_events` is set, which lets
//! tests observe descriptors with fences still in flight.

use crate::driver::{CopyKind, DeviceApi, DriverError, RawEvent, RawStream};
use gpudma_memory::{DmaMemory, MemoryHandle, MemoryId, MemoryKind};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One recorded driver submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Copy1d {
        stream: RawStream,
        dst: usize,
        src: usize,
        bytes: usize,
        kind: CopyKind,
    },
    Copy2d {
        stream: RawStream,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
        kind: CopyKind,
    },
    Copy3d {
        stream: RawStream,
        dst: usize,
        src: usize,
        pitch: usize,
        rows_per_plane: usize,
        width: usize,
        height: usize,
        depth: usize,
        kind: CopyKind,
    },
    Memset1d {
        stream: RawStream,
        dst: usize,
        elem_size: usize,
        value: u64,
        count: usize,
    },
    Memset2d {
        stream: RawStream,
        dst: usize,
        pitch: usize,
        elem_size: usize,
        value: u64,
        width: usize,
        height: usize,
    },
}

#[derive(Debug, Default)]
struct EventState {
    recorded: bool,
    retired: bool,
}

/// Host-backed driver double with a submission log.
#[derive(Default)]
pub struct MockApi {
    log: Mutex<Vec<Submission>>,
    next_handle: AtomicU64,
    streams: Mutex<HashMap<RawStream, u32>>,
    events: Mutex<HashMap<RawEvent, EventState>>,
    hold_events: AtomicBool,
    ctx_depth: Mutex<HashMap<u32, i64>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Keep newly recorded events pending until `release_events`.
    pub fn hold_events(&self, hold: bool) {
        self.hold_events.store(hold, Ordering::SeqCst);
    }

    /// Retire every recorded event.
    pub fn release_events(&self) {
        let mut events = self.events.lock().unwrap();
        for state in events.values_mut() {
            if state.recorded {
                state.retired = true;
            }
        }
    }

    pub fn take_log(&self) -> Vec<Submission> {
        std::mem::take(&mut self.log.lock().unwrap())
    }

    pub fn log(&self) -> Vec<Submission> {
        self.log.lock().unwrap().clone()
    }

    /// Net push/pop balance for `device`. Zero when every scope was closed.
    pub fn context_depth(&self, device: u32) -> i64 {
        *self.ctx_depth.lock().unwrap().get(&device).unwrap_or(&0)
    }

    /// The device a stream was created on.
    pub fn stream_device(&self, stream: RawStream) -> Option<u32> {
        self.streams.lock().unwrap().get(&stream).copied()
    }

    fn record(&self, sub: Submission) {
        self.log.lock().unwrap().push(sub);
    }

    fn alloc_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }
}

impl DeviceApi for MockApi {
    fn create_stream(&self, device: u32) -> Result<RawStream, DriverError> {
        let handle = self.alloc_handle();
        self.streams.lock().unwrap().insert(handle, device);
        Ok(handle)
    }

    fn copy_1d(
        &self,
        stream: RawStream,
        dst: usize,
        src: usize,
        bytes: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        unsafe {
            std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes);
        }
        self.record(Submission::Copy1d {
            stream,
            dst,
            src,
            bytes,
            kind,
        });
        Ok(())
    }

    fn copy_2d(
        &self,
        stream: RawStream,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        for row in 0..height {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    (src + row * src_pitch) as *const u8,
                    (dst + row * dst_pitch) as *mut u8,
                    width,
                );
            }
        }
        self.record(Submission::Copy2d {
            stream,
            dst,
            dst_pitch,
            src,
            src_pitch,
            width,
            height,
            kind,
        });
        Ok(())
    }

    fn copy_3d(
        &self,
        stream: RawStream,
        dst: usize,
        src: usize,
        pitch: usize,
        rows_per_plane: usize,
        width: usize,
        height: usize,
        depth: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        let plane_stride = pitch * rows_per_plane;
        for plane in 0..depth {
            for row in 0..height {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        (src + plane * plane_stride + row * pitch) as *const u8,
                        (dst + plane * plane_stride + row * pitch) as *mut u8,
                        width,
                    );
                }
            }
        }
        self.record(Submission::Copy3d {
            stream,
            dst,
            src,
            pitch,
            rows_per_plane,
            width,
            height,
            depth,
            kind,
        });
        Ok(())
    }

    fn memset_d8(
        &self,
        stream: RawStream,
        dst: usize,
        value: u8,
        count: usize,
    ) -> Result<(), DriverError> {
        unsafe {
            std::ptr::write_bytes(dst as *mut u8, value, count);
        }
        self.record(Submission::Memset1d {
            stream,
            dst,
            elem_size: 1,
            value: value as u64,
            count,
        });
        Ok(())
    }

    fn memset_d16(
        &self,
        stream: RawStream,
        dst: usize,
        value: u16,
        count: usize,
    ) -> Result<(), DriverError> {
        for i in 0..count {
            unsafe {
                ((dst + i * 2) as *mut u16).write_unaligned(value);
            }
        }
        self.record(Submission::Memset1d {
            stream,
            dst,
            elem_size: 2,
            value: value as u64,
            count,
        });
        Ok(())
    }

    fn memset_d32(
        &self,
        stream: RawStream,
        dst: usize,
        value: u32,
        count: usize,
    ) -> Result<(), DriverError> {
        for i in 0..count {
            unsafe {
                ((dst + i * 4) as *mut u32).write_unaligned(value);
            }
        }
        self.record(Submission::Memset1d {
            stream,
            dst,
            elem_size: 4,
            value: value as u64,
            count,
        });
        Ok(())
    }

    fn memset2d_d8(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u8,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        for row in 0..height {
            unsafe {
                std::ptr::write_bytes((dst + row * pitch) as *mut u8, value, width);
            }
        }
        self.record(Submission::Memset2d {
            stream,
            dst,
            pitch,
            elem_size: 1,
            value: value as u64,
            width,
            height,
        });
        Ok(())
    }

    fn memset2d_d16(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u16,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        for row in 0..height {
            for i in 0..width {
                unsafe {
                    ((dst + row * pitch + i * 2) as *mut u16).write_unaligned(value);
                }
            }
        }
        self.record(Submission::Memset2d {
            stream,
            dst,
            pitch,
            elem_size: 2,
            value: value as u64,
            width,
            height,
        });
        Ok(())
    }

    fn memset2d_d32(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u32,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        for row in 0..height {
            for i in 0..width {
                unsafe {
                    ((dst + row * pitch + i * 4) as *mut u32).write_unaligned(value);
                }
            }
        }
        self.record(Submission::Memset2d {
            stream,
            dst,
            pitch,
            elem_size: 4,
            value: value as u64,
            width,
            height,
        });
        Ok(())
    }

    fn create_event(&self, _device: u32) -> Result<RawEvent, DriverError> {
        let handle = self.alloc_handle();
        self.events
            .lock()
            .unwrap()
            .insert(handle, EventState::default());
        Ok(handle)
    }

    fn record_event(&self, _stream: RawStream, event: RawEvent) -> Result<(), DriverError> {
        let mut events = self.events.lock().unwrap();
        let state = events
            .get_mut(&event)
            .ok_or_else(|| DriverError::call("record_event", "unknown event"))?;
        state.recorded = true;
        state.retired = !self.hold_events.load(Ordering::SeqCst);
        Ok(())
    }

    fn query_event(&self, event: RawEvent) -> Result<bool, DriverError> {
        let events = self.events.lock().unwrap();
        let state = events
            .get(&event)
            .ok_or_else(|| DriverError::call("query_event", "unknown event"))?;
        Ok(state.retired)
    }

    fn destroy_event(&self, event: RawEvent) -> Result<(), DriverError> {
        self.events.lock().unwrap().remove(&event);
        Ok(())
    }

    fn push_context(&self, device: u32) -> Result<(), DriverError> {
        *self.ctx_depth.lock().unwrap().entry(device).or_insert(0) += 1;
        Ok(())
    }

    fn pop_context(&self, device: u32) -> Result<(), DriverError> {
        *self.ctx_depth.lock().unwrap().entry(device).or_insert(0) -= 1;
        Ok(())
    }
}

/// Owned byte region tests hand to descriptors as either endpoint kind.
pub struct TestRegion {
    buf: Box<[u8]>,
}

impl TestRegion {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn filled(len: usize, value: u8) -> Self {
        Self {
            buf: vec![value; len].into_boxed_slice(),
        }
    }

    pub fn base(&self) -> usize {
        self.buf.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Expose this region as framebuffer memory of `device`.
    pub fn as_fb(&self, id: MemoryId, device: u32) -> MemoryHandle {
        MemoryHandle::new(ExtMemory {
            id,
            base: self.base(),
            len: self.buf.len(),
            kind: MemoryKind::GpuFb { device },
        })
    }

    /// Expose this region as pinned host memory.
    pub fn as_pinned(&self, id: MemoryId) -> MemoryHandle {
        MemoryHandle::new(ExtMemory {
            id,
            base: self.base(),
            len: self.buf.len(),
            kind: MemoryKind::Pinned,
        })
    }
}

/// Unowned region with an arbitrary kind, backing `TestRegion` handles.
#[derive(Debug)]
struct ExtMemory {
    id: MemoryId,
    base: usize,
    len: usize,
    kind: MemoryKind,
}

impl DmaMemory for ExtMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn get_direct_ptr(&self, offset: usize, size: usize) -> Option<usize> {
        if offset + size > self.len {
            return None;
        }
        Some(self.base + offset)
    }

    fn size(&self) -> usize {
        self.len
    }

    fn kind(&self) -> MemoryKind {
        self.kind
    }
}
