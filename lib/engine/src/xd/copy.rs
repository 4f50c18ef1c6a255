// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Copy descriptors.
//!
//! `progress` pulls address ranges from both cursors and decomposes them
//! into the largest 1-D, 2-D or 3-D copies that fit both sides, preferring
//! fewer, larger submissions. 3-D shapes are unrolled into per-plane 2-D
//! copies on the host so the loop can stop early on stream saturation or an
//! expired deadline.

use super::{XdCore, XferPort};
use crate::completion::TransferCompletion;
use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::device::{CtxGuard, Gpu};
use crate::driver::CopyKind;
use crate::error::Result;
use crate::sequence::SequenceCache;
use crate::stream::DmaStream;
use std::sync::Arc;

/// A descriptor that moves bytes between two ports.
#[derive(Debug)]
pub struct CopyXferDes {
    pub(crate) core: XdCore,
    gpu: Arc<Gpu>,
    config: EngineConfig,
}

/// Copy kind for a pair of endpoint device tags.
fn copy_kind(in_gpu: Option<u32>, out_gpu: Option<u32>) -> CopyKind {
    match (in_gpu, out_gpu) {
        (Some(src), Some(dst)) if src == dst => CopyKind::DeviceToDevice,
        (Some(_), None) => CopyKind::DeviceToHost,
        (Some(_), Some(_)) => CopyKind::Inferred,
        (None, _) => CopyKind::HostToDevice,
    }
}

impl CopyXferDes {
    pub(crate) fn new(core: XdCore, gpu: Arc<Gpu>, config: EngineConfig) -> Self {
        Self { core, gpu, config }
    }

    /// Advance until the deadline expires, a stream refuses work, or the
    /// addressed bytes run out. Returns whether any bytes moved.
    pub fn progress(&mut self, work_until: &Deadline) -> Result<bool> {
        self.core.check_failure()?;

        let mut did_work = false;
        let threshold = self.config.sequence_cache_flush;
        let mut rseqcache = SequenceCache::read(self.core.shared.clone(), threshold);
        let mut wseqcache = SequenceCache::write(self.core.shared.clone(), threshold);

        loop {
            let min_xfer_size = self.config.min_xfer_size;
            let max_bytes = self.core.get_addresses(min_xfer_size, &mut rseqcache);
            if max_bytes == 0 {
                break;
            }

            let in_idx = self.core.input_control.current_port;
            let out_idx = self.core.output_control.current_port;

            let total_bytes = match (in_idx, out_idx) {
                (Some(i), Some(o)) => {
                    tracing::debug!(
                        xd = format_args!("{:#x}", self.core.shared.guid()),
                        min = min_xfer_size,
                        max = max_bytes,
                        "gpu memcpy chunk"
                    );
                    let moved = self.copy_spans(i, o, max_bytes, work_until)?;
                    if moved == 0 {
                        // stream saturated before anything went out
                        break;
                    }
                    moved
                }
                (Some(i), None) => {
                    // input with no consumer, discard the bytes
                    let port = &mut self.core.inputs[i];
                    let span_start = port.local_bytes_total;
                    port.cursor.skip_bytes(max_bytes);
                    rseqcache.add_span(Some(i), span_start, max_bytes);
                    max_bytes
                }
                (None, Some(o)) => {
                    // output with no producer; a sink must not pretend reads
                    self.core.outputs[o].cursor.skip_bytes(max_bytes);
                    max_bytes
                }
                (None, None) => {
                    // simultaneous gather+scatter leaves both sides portless
                    wseqcache.add_span(None, 0, max_bytes);
                    max_bytes
                }
            };

            did_work = true;
            let done = self.core.record_address_consumption(total_bytes, total_bytes);
            if done || work_until.expired() {
                break;
            }
        }

        rseqcache.flush();
        wseqcache.flush();

        Ok(did_work)
    }

    fn select_stream(&self, in_gpu: Option<u32>, out_gpu: Option<u32>) -> Arc<DmaStream> {
        match (in_gpu, out_gpu) {
            (Some(src), Some(dst)) if src == dst => {
                debug_assert_eq!(src, self.gpu.index());
                self.gpu.next_d2d_stream()
            }
            (Some(src), None) => {
                debug_assert_eq!(src, self.gpu.index());
                self.gpu.device_to_host_stream().clone()
            }
            (None, Some(dst)) => {
                debug_assert_eq!(dst, self.gpu.index());
                self.gpu.host_to_device_stream().clone()
            }
            (Some(src), Some(dst)) => self
                .gpu
                .peer_stream(dst)
                .unwrap_or_else(|| panic!("no peer link from device {src} to device {dst}"))
                .clone(),
            (None, None) => unreachable!("copy between two host memories has no stream"),
        }
    }

    /// Move up to `max_bytes` between the two ports. Returns bytes submitted.
    fn copy_spans(
        &mut self,
        in_idx: usize,
        out_idx: usize,
        max_bytes: usize,
        work_until: &Deadline,
    ) -> Result<usize> {
        let min_xfer_size = self.config.min_xfer_size;
        let host_chunk = self.config.host_device_chunk;

        let in_gpu = self.core.inputs[in_idx].device;
        let out_gpu = self.core.outputs[out_idx].device;

        let stream = self.select_stream(in_gpu, out_gpu);
        let kind = copy_kind(in_gpu, out_gpu);
        let api = self.gpu.api().clone();
        let _ctx = CtxGuard::enter(api.as_ref(), stream.device())?;

        let XdCore {
            inputs,
            outputs,
            shared,
            ..
        } = &mut self.core;
        let in_port: &mut XferPort = &mut inputs[in_idx];
        let out_port: &mut XferPort = &mut outputs[out_idx];

        let in_span_start = in_port.local_bytes_total;
        let out_span_start = out_port.local_bytes_total;

        let in_base = in_port
            .mem
            .get_direct_ptr(0, 0)
            .expect("channel admits only directly addressable memory");
        let out_base = out_port
            .mem
            .get_direct_ptr(0, 0)
            .expect("channel admits only directly addressable memory");

        let mut total_bytes = 0usize;
        let mut bytes_to_fence = 0usize;

        while total_bytes < max_bytes {
            let in_offset = in_port.cursor.offset();
            let out_offset = out_port.cursor.offset();

            // the reported dim is reduced for partially consumed address
            // ranges, so whatever we get can be assumed to be regular
            let mut in_dim = in_port.cursor.dim();
            let mut out_dim = out_port.cursor.dim();

            let bytes;
            let mut bytes_left = max_bytes - total_bytes;

            // limit transfer size for host<->device copies
            if bytes_left > host_chunk && (in_gpu.is_none() || out_gpu.is_none()) {
                bytes_left = host_chunk;
            }

            let mut icount = in_port.cursor.remaining(0);
            let mut ocount = out_port.cursor.remaining(0);

            // contig bytes is always the min of the first dimensions
            let contig_bytes = icount.min(ocount).min(bytes_left);

            // catch the simple 1-D case first
            if contig_bytes == bytes_left
                || (contig_bytes == icount && in_dim == 1)
                || (contig_bytes == ocount && out_dim == 1)
            {
                bytes = contig_bytes;

                if !stream.admit(bytes) {
                    break;
                }

                stream.copy_1d(out_base + out_offset, in_base + in_offset, bytes, kind)?;

                in_port.cursor.advance(0, bytes);
                out_port.cursor.advance(0, bytes);

                bytes_to_fence += bytes;
            } else {
                // grow to a 2-D copy; the input side splits or promotes first
                let id;
                let mut iscale;
                let in_lstride;
                if contig_bytes < icount {
                    // second input dim comes from splitting the first
                    id = 0;
                    in_lstride = contig_bytes;
                    let ilines = icount / contig_bytes;
                    if ilines * contig_bytes != icount {
                        // leftover means we cannot go beyond this
                        in_dim = 1;
                    }
                    icount = ilines;
                    iscale = contig_bytes;
                } else {
                    debug_assert!(in_dim > 1);
                    id = 1;
                    icount = in_port.cursor.remaining(id);
                    in_lstride = in_port.cursor.stride(id);
                    iscale = 1;
                }

                let od;
                let mut oscale;
                let out_lstride;
                if contig_bytes < ocount {
                    od = 0;
                    out_lstride = contig_bytes;
                    let olines = ocount / contig_bytes;
                    if olines * contig_bytes != ocount {
                        out_dim = 1;
                    }
                    ocount = olines;
                    oscale = contig_bytes;
                } else {
                    debug_assert!(out_dim > 1);
                    od = 1;
                    ocount = out_port.cursor.remaining(od);
                    out_lstride = out_port.cursor.stride(od);
                    oscale = 1;
                }

                let lines = icount.min(ocount).min(bytes_left / contig_bytes);

                // see if we have to stop at 2-D
                if contig_bytes * lines == bytes_left
                    || (lines == icount && id == in_dim - 1)
                    || (lines == ocount && od == out_dim - 1)
                {
                    bytes = contig_bytes * lines;

                    if !stream.admit(bytes) {
                        break;
                    }

                    stream.copy_2d(
                        out_base + out_offset,
                        out_lstride,
                        in_base + in_offset,
                        in_lstride,
                        contig_bytes,
                        lines,
                        kind,
                    )?;

                    in_port.cursor.advance(id, lines * iscale);
                    out_port.cursor.advance(od, lines * oscale);

                    bytes_to_fence += bytes;
                } else {
                    let mut id = id;
                    let mut od = od;

                    let in_pstride;
                    if lines < icount {
                        // third input dim comes from splitting the current one
                        in_pstride = in_lstride * lines;
                        icount /= lines;
                        iscale *= lines;
                    } else {
                        id += 1;
                        debug_assert!(in_dim > id);
                        icount = in_port.cursor.remaining(id);
                        in_pstride = in_port.cursor.stride(id);
                        iscale = 1;
                    }

                    let out_pstride;
                    if lines < ocount {
                        out_pstride = out_lstride * lines;
                        ocount /= lines;
                        oscale *= lines;
                    } else {
                        od += 1;
                        debug_assert!(out_dim > od);
                        ocount = out_port.cursor.remaining(od);
                        out_pstride = out_port.cursor.stride(od);
                        oscale = 1;
                    }

                    let planes = icount
                        .min(ocount)
                        .min(bytes_left / (contig_bytes * lines));

                    // a 3-D copy is unrolled by the driver on the host anyway,
                    // so unroll into 2-D copies ourselves and keep the option
                    // of stopping early on saturation or timeout
                    let mut act_planes = 0usize;
                    while act_planes < planes {
                        if !stream.admit(contig_bytes * lines) {
                            break;
                        }

                        stream.copy_2d(
                            out_base + out_offset + act_planes * out_pstride,
                            out_lstride,
                            in_base + in_offset + act_planes * in_pstride,
                            in_lstride,
                            contig_bytes,
                            lines,
                            kind,
                        )?;
                        act_planes += 1;

                        if work_until.expired() {
                            break;
                        }
                    }

                    if act_planes == 0 {
                        break;
                    }

                    tracing::debug!(
                        stream = stream.raw(),
                        bytes = contig_bytes * lines * act_planes,
                        lines,
                        planes = act_planes,
                        "gpu memcpy 3d"
                    );

                    bytes = contig_bytes * lines * act_planes;
                    in_port.cursor.advance(id, act_planes * iscale);
                    out_port.cursor.advance(od, act_planes * oscale);

                    bytes_to_fence += bytes;
                }
            }

            debug_assert!(bytes <= bytes_left);
            total_bytes += bytes;

            // stop once the deadline has passed, but only after moving at
            // least the minimum useful amount
            if total_bytes >= min_xfer_size && work_until.expired() {
                break;
            }
        }

        if bytes_to_fence > 0 {
            tracing::debug!(
                stream = stream.raw(),
                xd = format_args!("{:#x}", shared.guid()),
                bytes = total_bytes,
                "gpu memcpy fence"
            );
            // the fence holds a descriptor reference until it retires
            let completion = TransferCompletion::new(
                shared.clone(),
                Some(in_idx),
                in_span_start,
                total_bytes,
                Some(out_idx),
                out_span_start,
                total_bytes,
            );
            stream.add_notification(completion, bytes_to_fence)?;
        }

        Ok(total_bytes)
    }
}
