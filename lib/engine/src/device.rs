// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-GPU stream pools and scoped context acquisition.

use crate::config::EngineConfig;
use crate::completion::FencePoller;
use crate::driver::{DeviceApi, DriverError};
use crate::stream::DmaStream;
use gpudma_memory::MemoryId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One GPU the engine can move bytes to, from, or within.
///
/// Direction-specific streams carry host traffic, a round-robin pool carries
/// intra-device copies, and peer links each get a dedicated stream. The
/// membership lists record which registered memories sit behind this device;
/// channels publish their capability paths from them.
pub struct Gpu {
    index: u32,
    api: Arc<dyn DeviceApi>,
    fbmem: MemoryId,
    pinned_sysmems: Vec<MemoryId>,
    peer_fbs: Vec<MemoryId>,
    d2d_streams: Vec<Arc<DmaStream>>,
    next_d2d: AtomicUsize,
    host_to_device: Arc<DmaStream>,
    device_to_host: Arc<DmaStream>,
    peer_streams: HashMap<u32, Arc<DmaStream>>,
    stream_inflight_limit: usize,
}

impl Gpu {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        index: u32,
        fbmem: MemoryId,
        config: &EngineConfig,
        poller: Arc<FencePoller>,
    ) -> Result<Self, DriverError> {
        let limit = config.stream_inflight_limit;
        let mut d2d_streams = Vec::with_capacity(config.d2d_stream_count);
        for _ in 0..config.d2d_stream_count {
            d2d_streams.push(DmaStream::new(api.clone(), index, limit, poller.clone())?);
        }
        let host_to_device = DmaStream::new(api.clone(), index, limit, poller.clone())?;
        let device_to_host = DmaStream::new(api.clone(), index, limit, poller.clone())?;
        Ok(Self {
            index,
            api,
            fbmem,
            pinned_sysmems: Vec::new(),
            peer_fbs: Vec::new(),
            d2d_streams,
            next_d2d: AtomicUsize::new(0),
            host_to_device,
            device_to_host,
            peer_streams: HashMap::new(),
            stream_inflight_limit: limit,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn fbmem(&self) -> MemoryId {
        self.fbmem
    }

    pub fn pinned_sysmems(&self) -> &[MemoryId] {
        &self.pinned_sysmems
    }

    pub fn peer_fbs(&self) -> &[MemoryId] {
        &self.peer_fbs
    }

    pub fn api(&self) -> &Arc<dyn DeviceApi> {
        &self.api
    }

    /// Register a pinned host memory reachable from this device.
    pub fn add_pinned_sysmem(&mut self, id: MemoryId) {
        self.pinned_sysmems.push(id);
    }

    /// Register a peer device's framebuffer and open a stream to it.
    pub fn add_peer(
        &mut self,
        peer_index: u32,
        peer_fb: MemoryId,
        poller: Arc<FencePoller>,
    ) -> Result<(), DriverError> {
        let stream = DmaStream::new(self.api.clone(), self.index, self.stream_inflight_limit, poller)?;
        self.peer_streams.insert(peer_index, stream);
        self.peer_fbs.push(peer_fb);
        Ok(())
    }

    /// Round-robin selection from the intra-device pool.
    pub fn next_d2d_stream(&self) -> Arc<DmaStream> {
        let n = self.next_d2d.fetch_add(1, Ordering::Relaxed);
        self.d2d_streams[n % self.d2d_streams.len()].clone()
    }

    pub fn host_to_device_stream(&self) -> &Arc<DmaStream> {
        &self.host_to_device
    }

    pub fn device_to_host_stream(&self) -> &Arc<DmaStream> {
        &self.device_to_host
    }

    /// The stream to `peer_index`, present iff the peer link exists.
    pub fn peer_stream(&self, peer_index: u32) -> Option<&Arc<DmaStream>> {
        self.peer_streams.get(&peer_index)
    }
}

impl std::fmt::Debug for Gpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpu")
            .field("index", &self.index)
            .field("fbmem", &self.fbmem)
            .field("d2d_streams", &self.d2d_streams.len())
            .field("peers", &self.peer_streams.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Scoped driver context acquisition.
///
/// The driver context must be current on the submitting thread for the whole
/// duration of stream submissions; the guard pops on every exit path. Must
/// not be held across suspension points.
pub struct CtxGuard<'a> {
    api: &'a dyn DeviceApi,
    device: u32,
}

impl<'a> CtxGuard<'a> {
    pub fn enter(api: &'a dyn DeviceApi, device: u32) -> Result<Self, DriverError> {
        api.push_context(device)?;
        Ok(Self { api, device })
    }
}

impl Drop for CtxGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.api.pop_context(self.device) {
            tracing::warn!(device = self.device, error = %err, "failed to pop device context");
        }
    }
}
