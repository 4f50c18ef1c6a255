// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous GPU DMA transfer engine.
//!
//! The engine moves bytes between pinned host memory and GPU framebuffers
//! (and between GPUs over peer links) and performs device-side pattern
//! fills. Work is organized as transfer descriptors queued on per-GPU
//! [`channel::Channel`]s; an external scheduler polls a channel, which
//! advances one descriptor at a time under a cooperative deadline.
//! Submissions land on rate-limited [`stream::DmaStream`]s and completion
//! fences retire through the [`completion::FencePoller`], applying
//! byte-progress updates back onto the descriptor.
//!
//! The GPU driver itself is consumed as a capability
//! ([`driver::DeviceApi`]); enable the `cuda` feature for the
//! `cudarc`-backed implementation.

pub mod addrlist;
pub mod channel;
pub mod completion;
pub mod config;
pub mod deadline;
pub mod device;
pub mod driver;
pub mod error;
pub mod sequence;
pub mod stream;
pub mod testing;
pub mod xd;

#[cfg(test)]
mod tests;

pub use addrlist::{AddressCursor, AddressList};
pub use channel::{Channel, ChannelKind, Path};
pub use completion::FencePoller;
pub use config::{EngineConfig, EngineConfigBuilder};
pub use deadline::Deadline;
pub use device::{CtxGuard, Gpu};
pub use driver::{CopyKind, DeviceApi, DriverError};
pub use error::{DmaError, Result};
pub use xd::{CopyXferDes, FillXferDes, PortDesc, RedopInfo, XdShared, XferDes};
