// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Stream handles with admission control and fence posting.
//!
//! A `DmaStream` wraps one driver stream. `admit` keeps the number of
//! unfenced bytes on the stream under a budget; a refused submission is a
//! transient condition the caller recovers from by returning control.
//! Fences posted with `add_notification` retire in FIFO order with respect
//! to all prior submissions on the stream.

use crate::completion::{FencePoller, PendingFence, TransferCompletion};
use crate::driver::{CopyKind, DeviceApi, DriverError, RawStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

pub struct DmaStream {
    api: Arc<dyn DeviceApi>,
    raw: RawStream,
    device: u32,
    inflight: Arc<AtomicUsize>,
    inflight_limit: usize,
    poller: Arc<FencePoller>,
}

impl DmaStream {
    pub(crate) fn new(
        api: Arc<dyn DeviceApi>,
        device: u32,
        inflight_limit: usize,
        poller: Arc<FencePoller>,
    ) -> Result<Arc<Self>, DriverError> {
        let raw = api.create_stream(device)?;
        Ok(Arc::new(Self {
            api,
            raw,
            device,
            inflight: Arc::new(AtomicUsize::new(0)),
            inflight_limit,
            poller,
        }))
    }

    pub fn raw(&self) -> RawStream {
        self.raw
    }

    pub fn device(&self) -> u32 {
        self.device
    }

    pub fn inflight_bytes(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    /// Reserve `bytes` against the stream budget.
    ///
    /// An idle stream always admits, even oversized submissions; otherwise
    /// the reservation fails once the budget would be exceeded and the
    /// caller must back off until fences retire.
    pub fn admit(&self, bytes: usize) -> bool {
        let mut cur = self.inflight.load(Ordering::Acquire);
        loop {
            if cur > 0 && cur + bytes > self.inflight_limit {
                return false;
            }
            match self.inflight.compare_exchange_weak(
                cur,
                cur + bytes,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    pub fn copy_1d(
        &self,
        dst: usize,
        src: usize,
        bytes: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}", dst),
            src = format_args!("{:#x}", src),
            bytes,
            %kind,
            "gpu memcpy"
        );
        self.api.copy_1d(self.raw, dst, src, bytes, kind)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_2d(
        &self,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}+{}", dst, dst_pitch),
            src = format_args!("{:#x}+{}", src, src_pitch),
            bytes = width * height,
            lines = height,
            %kind,
            "gpu memcpy 2d"
        );
        self.api
            .copy_2d(self.raw, dst, dst_pitch, src, src_pitch, width, height, kind)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn copy_3d(
        &self,
        dst: usize,
        src: usize,
        pitch: usize,
        rows_per_plane: usize,
        width: usize,
        height: usize,
        depth: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}", dst),
            src = format_args!("{:#x}", src),
            bytes = width * height * depth,
            lines = height,
            planes = depth,
            %kind,
            "gpu memcpy 3d"
        );
        self.api.copy_3d(
            self.raw,
            dst,
            src,
            pitch,
            rows_per_plane,
            width,
            height,
            depth,
            kind,
        )
    }

    pub fn memset_8(&self, dst: usize, value: u8, count: usize) -> Result<(), DriverError> {
        tracing::trace!(stream = self.raw, dst = format_args!("{:#x}", dst), count, "gpu memset8");
        self.api.memset_d8(self.raw, dst, value, count)
    }

    pub fn memset_16(&self, dst: usize, value: u16, count: usize) -> Result<(), DriverError> {
        tracing::trace!(stream = self.raw, dst = format_args!("{:#x}", dst), count, "gpu memset16");
        self.api.memset_d16(self.raw, dst, value, count)
    }

    pub fn memset_32(&self, dst: usize, value: u32, count: usize) -> Result<(), DriverError> {
        tracing::trace!(stream = self.raw, dst = format_args!("{:#x}", dst), count, "gpu memset32");
        self.api.memset_d32(self.raw, dst, value, count)
    }

    pub fn memset2d_8(
        &self,
        dst: usize,
        pitch: usize,
        value: u8,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}+{}", dst, pitch),
            width,
            height,
            "gpu memset8 2d"
        );
        self.api.memset2d_d8(self.raw, dst, pitch, value, width, height)
    }

    pub fn memset2d_16(
        &self,
        dst: usize,
        pitch: usize,
        value: u16,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}+{}", dst, pitch),
            width,
            height,
            "gpu memset16 2d"
        );
        self.api.memset2d_d16(self.raw, dst, pitch, value, width, height)
    }

    pub fn memset2d_32(
        &self,
        dst: usize,
        pitch: usize,
        value: u32,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError> {
        tracing::trace!(
            stream = self.raw,
            dst = format_args!("{:#x}+{}", dst, pitch),
            width,
            height,
            "gpu memset32 2d"
        );
        self.api.memset2d_d32(self.raw, dst, pitch, value, width, height)
    }

    /// Post a completion fence covering all prior submissions.
    ///
    /// `credit` is the number of admitted bytes the fence returns to the
    /// stream budget when it retires.
    pub(crate) fn add_notification(
        &self,
        completion: TransferCompletion,
        credit: usize,
    ) -> Result<(), DriverError> {
        let event = self.api.create_event(self.device)?;
        self.api.record_event(self.raw, event)?;
        self.poller.register(PendingFence {
            uuid: Uuid::new_v4(),
            stream: self.raw,
            event,
            completion,
            credit,
            inflight: self.inflight.clone(),
            posted_at: Instant::now(),
            last_warned_at: None,
        });
        Ok(())
    }
}

impl std::fmt::Debug for DmaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaStream")
            .field("raw", &self.raw)
            .field("device", &self.device)
            .field("inflight", &self.inflight_bytes())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockApi;

    fn stream_with_limit(limit: usize) -> (Arc<MockApi>, Arc<DmaStream>) {
        let api = Arc::new(MockApi::new());
        let poller = FencePoller::new(api.clone());
        let stream = DmaStream::new(api.clone(), 0, limit, poller).unwrap();
        (api, stream)
    }

    #[test]
    fn admits_until_budget_exhausted() {
        let (_api, stream) = stream_with_limit(1000);
        assert!(stream.admit(600));
        assert!(stream.admit(400));
        assert!(!stream.admit(1));
        assert_eq!(stream.inflight_bytes(), 1000);
    }

    #[test]
    fn idle_stream_admits_oversized_submission() {
        let (_api, stream) = stream_with_limit(1000);
        assert!(stream.admit(10_000));
        assert!(!stream.admit(1));
    }
}
