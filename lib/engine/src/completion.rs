// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion fences and the poller that retires them.
//!
//! Every `progress` call that submitted work posts one fence on the stream
//! it used. The fence owns a driver event recorded after the submissions and
//! a [`TransferCompletion`] that applies the byte-progress deltas once the
//! event retires. Fences hold a descriptor reference; the descriptor cannot
//! tear down while any fence is in flight.

use crate::driver::{DeviceApi, DriverError, RawEvent, RawStream};
use crate::xd::XdShared;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Byte-progress deltas applied when a fence retires.
///
/// A `None` port means no update for that side; fill descriptors have no
/// input to report.
#[derive(Debug)]
pub(crate) struct TransferCompletion {
    xd: Arc<XdShared>,
    read_port: Option<usize>,
    read_offset: usize,
    read_size: usize,
    write_port: Option<usize>,
    write_offset: usize,
    write_size: usize,
}

impl TransferCompletion {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        xd: Arc<XdShared>,
        read_port: Option<usize>,
        read_offset: usize,
        read_size: usize,
        write_port: Option<usize>,
        write_offset: usize,
        write_size: usize,
    ) -> Self {
        Self {
            xd,
            read_port,
            read_offset,
            read_size,
            write_port,
            write_offset,
            write_size,
        }
    }

    pub(crate) fn complete(self) {
        tracing::debug!(
            xd = format_args!("{:#x}", self.xd.guid()),
            read = ?self.read_port,
            read_offset = self.read_offset,
            write = ?self.write_port,
            write_offset = self.write_offset,
            bytes = self.write_size,
            "gpu transfer complete"
        );
        if let Some(port) = self.read_port {
            self.xd
                .update_bytes_read(port, self.read_offset, self.read_size);
        }
        if let Some(port) = self.write_port {
            self.xd
                .update_bytes_write(port, self.write_offset, self.write_size);
        }
        // dropping self releases the descriptor reference
    }

    pub(crate) fn fail(self, err: DriverError) {
        self.xd.mark_failed(err.into());
    }
}

/// A fence registered with the poller.
pub(crate) struct PendingFence {
    pub uuid: Uuid,
    pub stream: RawStream,
    pub event: RawEvent,
    pub completion: TransferCompletion,
    /// Rate-limit bytes returned to the stream on retirement.
    pub credit: usize,
    pub inflight: Arc<AtomicUsize>,
    pub posted_at: Instant,
    pub last_warned_at: Option<Instant>,
}

fn check_and_warn_slow_fence(
    uuid: &Uuid,
    posted_at: Instant,
    last_warned_at: Option<Instant>,
) -> Option<Instant> {
    let elapsed = posted_at.elapsed();
    if elapsed > Duration::from_secs(60) {
        let should_warn = last_warned_at
            .map(|last| last.elapsed() > Duration::from_secs(30))
            .unwrap_or(true);
        if should_warn {
            tracing::warn!(
                uuid = %uuid,
                elapsed_secs = elapsed.as_secs(),
                "fence has been pending for over 1 minute"
            );
            return Some(Instant::now());
        }
    }
    last_warned_at
}

/// Retires completion fences in submission order per stream.
pub struct FencePoller {
    api: Arc<dyn DeviceApi>,
    pending: Mutex<VecDeque<PendingFence>>,
}

impl FencePoller {
    pub fn new(api: Arc<dyn DeviceApi>) -> Arc<Self> {
        Arc::new(Self {
            api,
            pending: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn register(&self, fence: PendingFence) {
        self.pending.lock().expect("fence queue poisoned").push_back(fence);
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().expect("fence queue poisoned").len()
    }

    /// Query all outstanding fences once; returns how many retired.
    ///
    /// A fence is never retired before an earlier fence of the same stream,
    /// so per-stream FIFO ordering holds regardless of query results.
    pub fn poll_once(&self) -> usize {
        let mut retired = Vec::new();
        {
            let mut pending = self.pending.lock().expect("fence queue poisoned");
            let mut blocked: HashSet<RawStream> = HashSet::new();
            let mut keep = VecDeque::with_capacity(pending.len());
            for mut fence in pending.drain(..) {
                if blocked.contains(&fence.stream) {
                    keep.push_back(fence);
                    continue;
                }
                match self.api.query_event(fence.event) {
                    Ok(true) => retired.push(Ok(fence)),
                    Ok(false) => {
                        fence.last_warned_at = check_and_warn_slow_fence(
                            &fence.uuid,
                            fence.posted_at,
                            fence.last_warned_at,
                        );
                        blocked.insert(fence.stream);
                        keep.push_back(fence);
                    }
                    Err(err) => retired.push(Err((fence, err))),
                }
            }
            *pending = keep;
        }

        let count = retired.len();
        for outcome in retired {
            match outcome {
                Ok(fence) => {
                    fence.inflight.fetch_sub(fence.credit, Ordering::AcqRel);
                    if let Err(err) = self.api.destroy_event(fence.event) {
                        tracing::warn!(uuid = %fence.uuid, error = %err, "failed to destroy fence event");
                    }
                    fence.completion.complete();
                }
                Err((fence, err)) => {
                    tracing::error!(uuid = %fence.uuid, error = %err, "fence query failed");
                    fence.inflight.fetch_sub(fence.credit, Ordering::AcqRel);
                    let _ = self.api.destroy_event(fence.event);
                    fence.completion.fail(err);
                }
            }
        }
        count
    }

    /// Drive the poller until cancellation, then drain outstanding fences.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut check_interval = tokio::time::interval(Duration::from_millis(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = check_interval.tick() => {
                    self.poll_once();
                }
            }
        }

        // work already on the streams still drains through its fences
        while self.outstanding() > 0 {
            check_interval.tick().await;
            self.poll_once();
        }
    }

    /// Spawn `run` on the given runtime.
    pub fn spawn(
        self: &Arc<Self>,
        handle: &tokio::runtime::Handle,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        handle.spawn(self.clone().run(cancel))
    }
}
