// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! End-to-end descriptor tests against the in-memory driver backend.

mod copy_transfers;
mod fill_transfers;

use crate::addrlist::AddressList;
use crate::channel::{Channel, ChannelKind};
use crate::completion::FencePoller;
use crate::config::EngineConfig;
use crate::device::Gpu;
use crate::testing::MockApi;
use gpudma_memory::MemoryId;
use std::sync::Arc;

pub(crate) struct TestRig {
    pub api: Arc<MockApi>,
    pub poller: Arc<FencePoller>,
    pub config: EngineConfig,
}

impl TestRig {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let api = Arc::new(MockApi::new());
        let poller = FencePoller::new(api.clone());
        Self {
            api,
            poller,
            config,
        }
    }

    pub fn gpu(&self, index: u32, fbmem: MemoryId) -> Gpu {
        Gpu::new(
            self.api.clone(),
            index,
            fbmem,
            &self.config,
            self.poller.clone(),
        )
        .unwrap()
    }

    pub fn channel(&self, kind: ChannelKind, gpu: Gpu) -> Channel {
        Channel::new(kind, Arc::new(gpu), self.config.clone())
    }
}

pub(crate) fn list_1d(offset: usize, bytes: usize) -> AddressList {
    let mut list = AddressList::new();
    list.push_1d(offset, bytes);
    list
}

pub(crate) fn list_2d(offset: usize, bytes: usize, lines: usize, lstride: usize) -> AddressList {
    let mut list = AddressList::new();
    list.push_2d(offset, bytes, lines, lstride);
    list
}

pub(crate) fn list_3d(
    offset: usize,
    bytes: usize,
    lines: usize,
    lstride: usize,
    planes: usize,
    pstride: usize,
) -> AddressList {
    let mut list = AddressList::new();
    list.push_3d(offset, bytes, lines, lstride, planes, pstride);
    list
}
