// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Memory capability layer consumed by the transfer engine.
//!
//! The engine never allocates framebuffer or pinned memory itself; the
//! embedding runtime registers memory instances and hands the engine a
//! handle that can resolve flat addresses. This crate provides:
//! - A single trait for type erasure ([`DmaMemory`])
//! - A kind enum distinguishing device framebuffers from pinned host memory
//! - Concrete regions for embedders and tests ([`HostMemory`], [`FbMemory`])

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for memory operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors that can occur while registering or resolving memory.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    #[error("range {offset}+{size} exceeds region of {len} bytes")]
    OutOfRange {
        offset: usize,
        size: usize,
        len: usize,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

/// Memory instance classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Device-resident framebuffer memory, owned by the given device index.
    GpuFb { device: u32 },

    /// Page-locked host memory mapped for async device access.
    Pinned,
}

impl MemoryKind {
    /// The owning device index, if this memory is device-resident.
    pub fn device(&self) -> Option<u32> {
        match self {
            MemoryKind::GpuFb { device } => Some(*device),
            MemoryKind::Pinned => None,
        }
    }
}

/// Identity of a registered memory instance.
///
/// Channels publish their admitted source/destination sets in terms of these
/// ids; the planner matches a transfer's endpoints against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemoryId(pub u64);

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem{}", self.0)
    }
}

/// Core trait for memory instances the engine can address.
///
/// This is the only trait in the capability. Concrete storage types implement
/// it to enable type erasure via [`MemoryHandle`].
pub trait DmaMemory: Send + Sync + fmt::Debug {
    /// Identity of this memory instance.
    fn id(&self) -> MemoryId;

    /// Resolve a flat address for `size` bytes at `offset`, or `None` when
    /// the region is not directly addressable.
    fn get_direct_ptr(&self, offset: usize, size: usize) -> Option<usize>;

    /// Size of the region in bytes.
    fn size(&self) -> usize;

    /// Classification of the backing storage.
    fn kind(&self) -> MemoryKind;
}

/// Type-erased memory handle shared between the engine and its embedder.
#[derive(Clone)]
pub struct MemoryHandle(Arc<dyn DmaMemory>);

impl MemoryHandle {
    pub fn new<M: DmaMemory + 'static>(mem: M) -> Self {
        Self(Arc::new(mem))
    }
}

impl std::ops::Deref for MemoryHandle {
    type Target = dyn DmaMemory;

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl fmt::Debug for MemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryHandle")
            .field("id", &self.id())
            .field("size", &self.size())
            .field("kind", &self.kind())
            .finish()
    }
}

/// Owned, heap-backed host region.
///
/// Stands in for pinned allocations registered by the embedding runtime; the
/// bytes live on the host and the flat address is the allocation itself.
#[derive(Debug)]
pub struct HostMemory {
    id: MemoryId,
    buf: Box<[u8]>,
}

impl HostMemory {
    pub fn new(id: MemoryId, len: usize) -> Self {
        Self {
            id,
            buf: vec![0u8; len].into_boxed_slice(),
        }
    }

    pub fn from_bytes(id: MemoryId, bytes: &[u8]) -> Self {
        Self {
            id,
            buf: bytes.to_vec().into_boxed_slice(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }
}

impl DmaMemory for HostMemory {
    fn id(&self) -> MemoryId {
        self.id
    }

    fn get_direct_ptr(&self, offset: usize, size: usize) -> Option<usize> {
        if offset + size > self.buf.len() {
            return None;
        }
        Some(self.buf.as_ptr() as usize + offset)
    }

    fn size(&self) -> usize {
        self.buf.len()
    }

    fn kind(&self) -> MemoryKind {
        MemoryKind::Pinned
    }
}

/// Unowned device framebuffer region.
///
/// The registry owning the actual allocation lives outside the engine; this
/// handle carries the raw base address and the owning device index.
#[derive(Debug)]
pub struct FbMemory {
    id: MemoryId,
    base: usize,
    len: usize,
    device: u32,
}

impl FbMemory {
    pub fn new(id: MemoryId, base: usize, len: usize, device: u32) -> Self {
        Self {
            id,
            base,
            len,
            device,
        }
    }
}

impl DmaMemory for FbMemory {
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
        MemoryKind::GpuFb {
            device: self.device,
        }
    }
}
