// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Fill descriptors.
//!
//! Device memsets are fastest at 8/16/32-bit widths, so the fill pattern is
//! reduced at construction to the narrowest power-of-two period that tiles
//! it. Patterns with no such period seed one line with byte-granular strided
//! memsets and then extend to full lines and planes by doubling the already
//! valid prefix with device-to-device copies, which bounds the number of
//! driver calls logarithmically.

use super::{PortControl, XdCore};
use crate::completion::TransferCompletion;
use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::device::{CtxGuard, Gpu};
use crate::driver::CopyKind;
use crate::error::Result;
use crate::sequence::SequenceCache;
use std::sync::Arc;

/// A descriptor that writes a repeated pattern into its output port.
#[derive(Debug)]
pub struct FillXferDes {
    pub(crate) core: XdCore,
    gpu: Arc<Gpu>,
    config: EngineConfig,
    fill_data: Vec<u8>,
    reduced_fill_size: usize,
}

/// Narrowest period in {1, 2, 4} that tiles `data`, or its full length.
fn reduce_fill_size(data: &[u8]) -> usize {
    for s in [1usize, 2, 4] {
        if data.len() == s {
            return s;
        }
        if data.len() > s
            && data.len() % s == 0
            && data.chunks_exact(s).all(|chunk| chunk == &data[..s])
        {
            return s;
        }
    }
    data.len()
}

impl FillXferDes {
    pub(crate) fn new(
        mut core: XdCore,
        gpu: Arc<Gpu>,
        config: EngineConfig,
        fill_data: Vec<u8>,
    ) -> Self {
        // no direct input data for a fill
        assert!(core.input_control.current_port.is_none());
        core.input_control = PortControl::disabled();
        assert!(!fill_data.is_empty());
        let reduced_fill_size = reduce_fill_size(&fill_data);
        Self {
            core,
            gpu,
            config,
            fill_data,
            reduced_fill_size,
        }
    }

    pub fn reduced_fill_size(&self) -> usize {
        self.reduced_fill_size
    }

    /// Advance until the deadline expires or the addressed bytes run out.
    pub fn progress(&mut self, work_until: &Deadline) -> Result<bool> {
        self.core.check_failure()?;

        let mut did_work = false;
        let threshold = self.config.sequence_cache_flush;
        let mut rseqcache = SequenceCache::read(self.core.shared.clone(), threshold);

        loop {
            let min_xfer_size = self.config.fill_min_xfer_size;
            let max_bytes = self.core.get_addresses(min_xfer_size, &mut rseqcache);
            if max_bytes == 0 {
                break;
            }

            let Some(out_idx) = self.core.output_control.current_port else {
                break;
            };

            tracing::debug!(
                xd = format_args!("{:#x}", self.core.shared.guid()),
                min = min_xfer_size,
                max = max_bytes,
                "gpu fill chunk"
            );

            let total_bytes = self.fill_spans(out_idx, max_bytes, work_until)?;

            did_work = true;
            let done = self.core.record_address_consumption(total_bytes, total_bytes);
            if done || work_until.expired() {
                break;
            }
        }

        rseqcache.flush();

        Ok(did_work)
    }

    /// Fill up to `max_bytes` of the output port. Returns bytes submitted.
    fn fill_spans(
        &mut self,
        out_idx: usize,
        max_bytes: usize,
        work_until: &Deadline,
    ) -> Result<usize> {
        let min_xfer_size = self.config.fill_min_xfer_size;

        let api = self.gpu.api().clone();
        let _ctx = CtxGuard::enter(api.as_ref(), self.gpu.index())?;
        let stream = self.gpu.next_d2d_stream();

        let XdCore {
            outputs, shared, ..
        } = &mut self.core;
        let out_port = &mut outputs[out_idx];

        let out_span_start = out_port.local_bytes_total;
        let out_base = out_port
            .mem
            .get_direct_ptr(0, 0)
            .expect("channel admits only directly addressable memory");

        let mut total_bytes = 0usize;

        while total_bytes < max_bytes {
            let out_offset = out_port.cursor.offset();
            let out_dim = out_port.cursor.dim();
            let dst = out_base + out_offset;

            match self.reduced_fill_size {
                1 => {
                    let fill_u8 = self.fill_data[0];
                    if out_dim == 1 {
                        let bytes = out_port.cursor.remaining(0);
                        stream.memset_8(dst, fill_u8, bytes)?;
                        out_port.cursor.advance(0, bytes);
                        total_bytes += bytes;
                    } else {
                        let bytes = out_port.cursor.remaining(0);
                        let lines = out_port.cursor.remaining(1);
                        let lstride = out_port.cursor.stride(1);
                        stream.memset2d_8(dst, lstride, fill_u8, bytes, lines)?;
                        out_port.cursor.advance(1, lines);
                        total_bytes += bytes * lines;
                    }
                }

                2 => {
                    let fill_u16 = u16::from_ne_bytes([self.fill_data[0], self.fill_data[1]]);
                    if out_dim == 1 {
                        let bytes = out_port.cursor.remaining(0);
                        debug_assert_eq!(bytes & 1, 0);
                        stream.memset_16(dst, fill_u16, bytes >> 1)?;
                        out_port.cursor.advance(0, bytes);
                        total_bytes += bytes;
                    } else {
                        let bytes = out_port.cursor.remaining(0);
                        let lines = out_port.cursor.remaining(1);
                        let lstride = out_port.cursor.stride(1);
                        debug_assert_eq!(bytes & 1, 0);
                        debug_assert_eq!(lstride & 1, 0);
                        stream.memset2d_16(dst, lstride, fill_u16, bytes >> 1, lines)?;
                        out_port.cursor.advance(1, lines);
                        total_bytes += bytes * lines;
                    }
                }

                4 => {
                    let fill_u32 = u32::from_ne_bytes([
                        self.fill_data[0],
                        self.fill_data[1],
                        self.fill_data[2],
                        self.fill_data[3],
                    ]);
                    if out_dim == 1 {
                        let bytes = out_port.cursor.remaining(0);
                        debug_assert_eq!(bytes & 3, 0);
                        stream.memset_32(dst, fill_u32, bytes >> 2)?;
                        out_port.cursor.advance(0, bytes);
                        total_bytes += bytes;
                    } else {
                        let bytes = out_port.cursor.remaining(0);
                        let lines = out_port.cursor.remaining(1);
                        let lstride = out_port.cursor.stride(1);
                        debug_assert_eq!(bytes & 3, 0);
                        debug_assert_eq!(lstride & 3, 0);
                        stream.memset2d_32(dst, lstride, fill_u32, bytes >> 2, lines)?;
                        out_port.cursor.advance(1, lines);
                        total_bytes += bytes * lines;
                    }
                }

                reduced => {
                    // general pattern: strided byte memsets seed the first
                    // line, then doublings handle lines and planes
                    let bytes = out_port.cursor.remaining(0);
                    let elems = bytes / reduced;
                    debug_assert_eq!(bytes % reduced, 0);

                    for partial in 0..reduced {
                        stream.memset2d_8(
                            dst + partial,
                            reduced,
                            self.fill_data[partial],
                            1,
                            elems,
                        )?;
                    }

                    if out_dim == 1 {
                        out_port.cursor.advance(0, bytes);
                        total_bytes += bytes;
                    } else {
                        let lines = out_port.cursor.remaining(1);
                        let lstride = out_port.cursor.stride(1);

                        let mut lines_done = 1usize; // first line already valid
                        while lines_done < lines {
                            let todo = lines_done.min(lines - lines_done);
                            stream.copy_2d(
                                dst + lines_done * lstride,
                                lstride,
                                dst,
                                lstride,
                                bytes,
                                todo,
                                CopyKind::DeviceToDevice,
                            )?;
                            lines_done += todo;
                        }

                        if out_dim == 2 {
                            out_port.cursor.advance(1, lines);
                            total_bytes += bytes * lines;
                        } else {
                            let planes = out_port.cursor.remaining(2);
                            let pstride = out_port.cursor.stride(2);

                            // doubling across planes needs pstride to tile
                            // into whole rows
                            if pstride % lstride == 0 {
                                let mut planes_done = 1usize; // first plane already valid
                                while planes_done < planes {
                                    let todo = planes_done.min(planes - planes_done);
                                    stream.copy_3d(
                                        dst + planes_done * pstride,
                                        dst,
                                        lstride,
                                        pstride / lstride,
                                        bytes,
                                        lines,
                                        todo,
                                        CopyKind::DeviceToDevice,
                                    )?;
                                    planes_done += todo;
                                }
                            } else {
                                // plane-at-a-time fallback, always sourcing
                                // the first plane
                                for plane in 1..planes {
                                    stream.copy_2d(
                                        dst + plane * pstride,
                                        lstride,
                                        dst,
                                        lstride,
                                        bytes,
                                        lines,
                                        CopyKind::DeviceToDevice,
                                    )?;
                                }
                            }

                            out_port.cursor.advance(2, planes);
                            total_bytes += bytes * lines * planes;
                        }
                    }
                }
            }

            // stop once the deadline has passed, but only after filling at
            // least the minimum useful amount
            if total_bytes >= min_xfer_size && work_until.expired() {
                break;
            }
        }

        // however many fills and copies went out, one fence tells us that
        // all of them are done
        tracing::debug!(
            stream = stream.raw(),
            xd = format_args!("{:#x}", shared.guid()),
            bytes = total_bytes,
            "gpu fill fence"
        );
        let completion = TransferCompletion::new(
            shared.clone(),
            None,
            0,
            0,
            Some(out_idx),
            out_span_start,
            total_bytes,
        );
        stream.add_notification(completion, 0)?;

        Ok(total_bytes)
    }
}
