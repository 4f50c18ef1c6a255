// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use derive_builder::Builder;

/// Tunables shared by channels, streams and descriptors.
///
/// # Examples
///
/// ```rust,ignore
/// let config = EngineConfig::builder()
///     .d2d_stream_count(8)
///     .multithread_dma(true)
///     .build()?;
/// ```
#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned", default)]
pub struct EngineConfig {
    /// Minimum useful batch per `progress` iteration; a descriptor keeps
    /// working past an expired deadline until it has moved this much.
    pub min_xfer_size: usize,

    /// Cap on a single host<->device sub-copy.
    pub host_device_chunk: usize,

    /// Minimum useful batch for fill descriptors.
    pub fill_min_xfer_size: usize,

    /// Intra-device copy streams per GPU, selected round-robin.
    pub d2d_stream_count: usize,

    /// Bytes a stream admits before `admit` starts refusing.
    pub stream_inflight_limit: usize,

    /// Byte-progress span size at which sequence caches flush early.
    pub sequence_cache_flush: usize,

    /// Run channel dispatchers unordered so multiple workers can advance
    /// descriptors of one channel concurrently.
    pub multithread_dma: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_xfer_size: 4 << 20,
            host_device_chunk: 4 << 20,
            fill_min_xfer_size: 4096,
            d2d_stream_count: 4,
            stream_inflight_limit: 32 << 20,
            sequence_cache_flush: 2 << 20,
            multithread_dma: false,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}
