// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Channels: descriptor factories and their dispatch queues.
//!
//! A channel is bound to one GPU and one transfer kind. It publishes a
//! capability matrix of admitted (source set, destination set) paths with
//! bandwidth and latency estimates the external planner scores, creates the
//! matching descriptor variant on request, and owns a single dispatch queue
//! an external scheduler polls with `progress_next`.

use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::device::Gpu;
use crate::error::{DmaError, Result};
use crate::xd::{CopyXferDes, FillXferDes, PortDesc, RedopInfo, XdCore, XdShared, XferDes};
use gpudma_memory::MemoryId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Transfer kinds a channel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Pinned host memory into this GPU's framebuffer.
    ToFb,
    /// This GPU's framebuffer out to pinned host memory.
    FromFb,
    /// Within this GPU's framebuffer.
    InFb,
    /// This GPU's framebuffer to a peer GPU's framebuffer.
    PeerFb,
    /// Pattern fills into this GPU's framebuffer.
    Fill,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelKind::ToFb => "to_fb",
            ChannelKind::FromFb => "from_fb",
            ChannelKind::InFb => "in_fb",
            ChannelKind::PeerFb => "peer_fb",
            ChannelKind::Fill => "fill",
        };
        f.write_str(s)
    }
}

/// One admitted path in a channel's capability matrix.
///
/// `src` is empty for fills, which have no source memory. `max_dim` caps the
/// copy dimensionality the planner may request on this path: host<->device
/// shapes above 2-D get unrolled by the driver anyway, so they are not
/// admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Path {
    pub src: Vec<MemoryId>,
    pub dst: Vec<MemoryId>,
    /// MB/s estimate used for planner scoring.
    pub bandwidth: u32,
    /// Nanoseconds estimate.
    pub latency: u32,
    /// Nanoseconds added per fragment.
    pub frag_overhead: u32,
    pub max_dim: u8,
    pub kind: ChannelKind,
}

/// A descriptor factory and dispatcher for one transfer kind on one GPU.
pub struct Channel {
    kind: ChannelKind,
    gpu: Arc<Gpu>,
    config: EngineConfig,
    paths: Vec<Path>,
    queue: Mutex<BTreeMap<(i64, u64), XferDes>>,
    tick: AtomicU64,
    ordered: bool,
}

impl Channel {
    pub fn new(kind: ChannelKind, gpu: Arc<Gpu>, config: EngineConfig) -> Self {
        let paths = build_paths(kind, &gpu);
        // ordered single-queue dispatch unless multithreaded dma is requested
        let ordered = !config.multithread_dma;
        let channel = Self {
            kind,
            gpu,
            config,
            paths,
            queue: Mutex::new(BTreeMap::new()),
            tick: AtomicU64::new(0),
            ordered,
        };
        tracing::debug!(channel = %channel, "channel registered");
        channel
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn gpu(&self) -> &Arc<Gpu> {
        &self.gpu
    }

    /// The capability matrix published to the planner.
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().expect("channel queue poisoned").len()
    }

    /// Create a descriptor of this channel's kind and enqueue it.
    ///
    /// `redop_info` must be the null reduction for both copy and fill
    /// channels, and `fill_data` must be empty unless this is a fill channel.
    #[allow(clippy::too_many_arguments)]
    pub fn create_xfer_des(
        &self,
        dma_op: u64,
        launch_node: u32,
        guid: u64,
        inputs: Vec<PortDesc>,
        outputs: Vec<PortDesc>,
        priority: i32,
        redop_info: RedopInfo,
        fill_data: &[u8],
    ) -> Arc<XdShared> {
        assert_eq!(redop_info.id, 0, "reductions are not carried on {}", self);

        let xd = match self.kind {
            ChannelKind::Fill => {
                assert!(inputs.is_empty(), "fill descriptors take no input ports");
                let core = XdCore::new(dma_op, launch_node, guid, inputs, outputs, priority);
                XferDes::Fill(FillXferDes::new(
                    core,
                    self.gpu.clone(),
                    self.config.clone(),
                    fill_data.to_vec(),
                ))
            }
            _ => {
                assert!(fill_data.is_empty(), "fill data on a copy channel");
                let core = XdCore::new(dma_op, launch_node, guid, inputs, outputs, priority);
                XferDes::Copy(CopyXferDes::new(core, self.gpu.clone(), self.config.clone()))
            }
        };

        let shared = xd.shared().clone();
        tracing::debug!(
            channel = %self,
            xd = format_args!("{:#x}", guid),
            priority,
            "descriptor created"
        );
        self.enqueue(xd);
        shared
    }

    fn enqueue(&self, xd: XferDes) {
        let tick = self.tick.fetch_add(1, Ordering::Relaxed);
        let key = (-(xd.priority() as i64), tick);
        self.queue
            .lock()
            .expect("channel queue poisoned")
            .insert(key, xd);
    }

    /// Pop the highest-priority descriptor and advance it until the
    /// deadline. Returns whether any descriptor moved bytes.
    ///
    /// The queue entry is removed for the duration of the call, so a
    /// descriptor is never advanced from two workers at once.
    pub fn progress_next(&self, work_until: &Deadline) -> Result<bool> {
        let popped = {
            let mut queue = self.queue.lock().expect("channel queue poisoned");
            queue.pop_first()
        };
        let Some((key, mut xd)) = popped else {
            return Ok(false);
        };

        let did_work = xd.progress(work_until).map_err(|err| match err {
            DmaError::Driver(e) => DmaError::DescriptorFailed {
                guid: xd.shared().guid(),
                reason: e.to_string(),
            },
            other => other,
        })?;

        if xd.is_completed() {
            tracing::debug!(
                channel = %self,
                xd = format_args!("{:#x}", xd.shared().guid()),
                "descriptor retired"
            );
            // in-flight fences keep the shared state alive until they retire
        } else {
            let key = if self.ordered {
                key
            } else {
                (key.0, self.tick.fetch_add(1, Ordering::Relaxed))
            };
            self.queue
                .lock()
                .expect("channel queue poisoned")
                .insert(key, xd);
        }

        Ok(did_work)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ChannelKind::Fill => write!(f, "gpu fill channel (gpu={})", self.gpu.index()),
            kind => write!(f, "gpu channel (gpu={} kind={})", self.gpu.index(), kind),
        }
    }
}

fn build_paths(kind: ChannelKind, gpu: &Gpu) -> Vec<Path> {
    let local_gpu_mems = vec![gpu.fbmem()];
    let mapped_cpu_mems = gpu.pinned_sysmems().to_vec();
    let peer_gpu_mems = gpu.peer_fbs().to_vec();

    match kind {
        ChannelKind::ToFb => vec![Path {
            src: mapped_cpu_mems,
            dst: local_gpu_mems,
            // estimates: 10 GB/s, 1 us latency, 2 us per fragment
            bandwidth: 10_000,
            latency: 1_000,
            frag_overhead: 2_000,
            max_dim: 2,
            kind,
        }],
        ChannelKind::FromFb => vec![Path {
            src: local_gpu_mems,
            dst: mapped_cpu_mems,
            bandwidth: 10_000,
            latency: 1_000,
            frag_overhead: 2_000,
            max_dim: 2,
            kind,
        }],
        ChannelKind::InFb => vec![Path {
            src: local_gpu_mems.clone(),
            dst: local_gpu_mems,
            // estimates: 200 GB/s, 250 ns latency
            bandwidth: 200_000,
            latency: 250,
            frag_overhead: 2_000,
            max_dim: 3,
            kind,
        }],
        ChannelKind::PeerFb => vec![Path {
            src: local_gpu_mems,
            dst: peer_gpu_mems,
            // estimates: 50 GB/s over the peer link
            bandwidth: 50_000,
            latency: 1_000,
            frag_overhead: 2_000,
            max_dim: 3,
            kind,
        }],
        ChannelKind::Fill => vec![Path {
            src: Vec::new(),
            dst: local_gpu_mems,
            // estimates: 300 GB/s for on-device fills
            bandwidth: 300_000,
            latency: 250,
            frag_overhead: 2_000,
            max_dim: 2,
            kind,
        }],
    }
}
