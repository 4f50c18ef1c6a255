// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Driver capability consumed by the engine.
//!
//! The engine submits all device work through [`DeviceApi`]: async memcpy in
//! one, two and three dimensions, async memset in 8/16/32-bit element widths,
//! stream and event management, and context push/pop. The `cuda` feature
//! provides a `cudarc`-backed implementation; tests use the in-memory
//! implementation from [`crate::testing`].

use std::fmt;
use thiserror::Error;

/// Opaque driver stream handle.
pub type RawStream = u64;

/// Opaque driver event handle.
pub type RawEvent = u64;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{call} failed: {status}")]
    Call {
        call: &'static str,
        status: String,
    },
}

impl DriverError {
    pub fn call(call: &'static str, status: impl ToString) -> Self {
        Self::Call {
            call,
            status: status.to_string(),
        }
    }
}

/// Direction hint for a copy submission.
///
/// `Inferred` leaves the direction to the driver and is only ever used for
/// cross-device copies on an explicit peer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    DeviceToDevice,
    DeviceToHost,
    HostToDevice,
    Inferred,
}

impl fmt::Display for CopyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CopyKind::DeviceToDevice => "d2d",
            CopyKind::DeviceToHost => "d2h",
            CopyKind::HostToDevice => "h2d",
            CopyKind::Inferred => "inferred",
        };
        f.write_str(s)
    }
}

/// Asynchronous device driver surface.
///
/// All submission calls are asynchronous with respect to the host; ordering
/// is FIFO per stream. Any non-success status is fatal to the transfer that
/// issued it.
pub trait DeviceApi: Send + Sync {
    /// Create an async stream on `device`.
    fn create_stream(&self, device: u32) -> Result<RawStream, DriverError>;

    /// 1-D async copy of `bytes` from `src` to `dst`.
    fn copy_1d(
        &self,
        stream: RawStream,
        dst: usize,
        src: usize,
        bytes: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError>;

    /// 2-D async copy: `height` rows of `width` bytes with independent
    /// source and destination pitches.
    #[allow(clippy::too_many_arguments)]
    fn copy_2d(
        &self,
        stream: RawStream,
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
        height: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError>;

    /// 3-D async copy of pitched-pointer shape: `depth` planes of `height`
    /// rows of `width` bytes. Both sides share `pitch` between rows and
    /// `rows_per_plane * pitch` between planes.
    #[allow(clippy::too_many_arguments)]
    fn copy_3d(
        &self,
        stream: RawStream,
        dst: usize,
        src: usize,
        pitch: usize,
        rows_per_plane: usize,
        width: usize,
        height: usize,
        depth: usize,
        kind: CopyKind,
    ) -> Result<(), DriverError>;

    /// 1-D async memset of `count` 8-bit elements.
    fn memset_d8(
        &self,
        stream: RawStream,
        dst: usize,
        value: u8,
        count: usize,
    ) -> Result<(), DriverError>;

    /// 1-D async memset of `count` 16-bit elements. `dst` must be 2-aligned.
    fn memset_d16(
        &self,
        stream: RawStream,
        dst: usize,
        value: u16,
        count: usize,
    ) -> Result<(), DriverError>;

    /// 1-D async memset of `count` 32-bit elements. `dst` must be 4-aligned.
    fn memset_d32(
        &self,
        stream: RawStream,
        dst: usize,
        value: u32,
        count: usize,
    ) -> Result<(), DriverError>;

    /// 2-D async memset: `height` rows of `width` 8-bit elements, rows
    /// separated by `pitch` bytes.
    fn memset2d_d8(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u8,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError>;

    /// 2-D async memset of 16-bit elements; `width` counts elements.
    fn memset2d_d16(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u16,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError>;

    /// 2-D async memset of 32-bit elements; `width` counts elements.
    fn memset2d_d32(
        &self,
        stream: RawStream,
        dst: usize,
        pitch: usize,
        value: u32,
        width: usize,
        height: usize,
    ) -> Result<(), DriverError>;

    /// Create a completion event on `device`.
    fn create_event(&self, device: u32) -> Result<RawEvent, DriverError>;

    /// Enqueue `event` on `stream`; it retires after all prior submissions.
    fn record_event(&self, stream: RawStream, event: RawEvent) -> Result<(), DriverError>;

    /// Query whether `event` has retired.
    fn query_event(&self, event: RawEvent) -> Result<bool, DriverError>;

    /// Destroy a retired event.
    fn destroy_event(&self, event: RawEvent) -> Result<(), DriverError>;

    /// Make `device`'s context current on this thread.
    fn push_context(&self, device: u32) -> Result<(), DriverError>;

    /// Undo the matching `push_context`.
    fn pop_context(&self, device: u32) -> Result<(), DriverError>;
}

#[cfg(feature = "cuda")]
pub use cuda::CudaApi;

#[cfg(feature = "cuda")]
mod cuda {
    use super::{CopyKind, DeviceApi, DriverError, RawEvent, RawStream};
    use cudarc::driver::sys;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    fn check(call: &'static str, status: sys::CUresult) -> Result<(), DriverError> {
        if status == sys::CUresult::CUDA_SUCCESS {
            Ok(())
        } else {
            Err(DriverError::call(call, format!("{:?}", status)))
        }
    }

    fn init() -> Result<(), DriverError> {
        static INIT: OnceLock<sys::CUresult> = OnceLock::new();
        let status = *INIT.get_or_init(|| unsafe { sys::cuInit(0) });
        check("cuInit", status)
    }

    /// CUDA driver backend.
    ///
    /// Primary contexts are retained lazily per device for the lifetime of
    /// the api object; streams and events are raw driver handles.
    pub struct CudaApi {
        contexts: Mutex<HashMap<u32, usize>>,
    }

    impl CudaApi {
        pub fn new() -> Self {
            Self {
                contexts: Mutex::new(HashMap::new()),
            }
        }

        fn context(&self, device: u32) -> Result<sys::CUcontext, DriverError> {
            init()?;
            let mut map = self.contexts.lock().expect("cuda context map poisoned");
            if let Some(&ctx) = map.get(&device) {
                return Ok(ctx as sys::CUcontext);
            }
            let mut dev: sys::CUdevice = 0;
            unsafe {
                check("cuDeviceGet", sys::cuDeviceGet(&mut dev, device as i32))?;
            }
            let mut ctx: sys::CUcontext = std::ptr::null_mut();
            unsafe {
                check(
                    "cuDevicePrimaryCtxRetain",
                    sys::cuDevicePrimaryCtxRetain(&mut ctx, dev),
                )?;
            }
            map.insert(device, ctx as usize);
            Ok(ctx)
        }
    }

    impl Default for CudaApi {
        fn default() -> Self {
            Self::new()
        }
    }

    fn memcpy2d_desc(
        dst: usize,
        dst_pitch: usize,
        src: usize,
        src_pitch: usize,
        width: usize,
    ) -> sys::CUDA_MEMCPY2D {
        let mut desc: sys::CUDA_MEMCPY2D = unsafe { std::mem::zeroed() };
        desc.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_UNIFIED;
        desc.srcDevice = src as sys::CUdeviceptr;
        desc.srcPitch = src_pitch;
        desc.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_UNIFIED;
        desc.dstDevice = dst as sys::CUdeviceptr;
        desc.dstPitch = dst_pitch;
        desc.WidthInBytes = width;
        desc
    }

    impl DeviceApi for CudaApi {
        fn create_stream(&self, device: u32) -> Result<RawStream, DriverError> {
            self.push_context(device)?;
            let mut stream: sys::CUstream = std::ptr::null_mut();
            let status = unsafe {
                sys::cuStreamCreate(
                    &mut stream,
                    sys::CUstream_flags::CU_STREAM_NON_BLOCKING as u32,
                )
            };
            self.pop_context(device)?;
            check("cuStreamCreate", status)?;
            Ok(stream as RawStream)
        }

        fn copy_1d(
            &self,
            stream: RawStream,
            dst: usize,
            src: usize,
            bytes: usize,
            kind: CopyKind,
        ) -> Result<(), DriverError> {
            let stream = stream as sys::CUstream;
            unsafe {
                match kind {
                    CopyKind::DeviceToDevice => check(
                        "cuMemcpyDtoDAsync",
                        sys::cuMemcpyDtoDAsync_v2(
                            dst as sys::CUdeviceptr,
                            src as sys::CUdeviceptr,
                            bytes,
                            stream,
                        ),
                    ),
                    CopyKind::DeviceToHost => check(
                        "cuMemcpyDtoHAsync",
                        sys::cuMemcpyDtoHAsync_v2(
                            dst as *mut std::ffi::c_void,
                            src as sys::CUdeviceptr,
                            bytes,
                            stream,
                        ),
                    ),
                    CopyKind::HostToDevice => check(
                        "cuMemcpyHtoDAsync",
                        sys::cuMemcpyHtoDAsync_v2(
                            dst as sys::CUdeviceptr,
                            src as *const std::ffi::c_void,
                            bytes,
                            stream,
                        ),
                    ),
                    CopyKind::Inferred => check(
                        "cuMemcpyAsync",
                        sys::cuMemcpyAsync(
                            dst as sys::CUdeviceptr,
                            src as sys::CUdeviceptr,
                            bytes,
                            stream,
                        ),
                    ),
                }
            }
        }

        fn copy_2d(
            &self,
            stream: RawStream,
            dst: usize,
            dst_pitch: usize,
            src: usize,
            src_pitch: usize,
            width: usize,
            height: usize,
            _kind: CopyKind,
        ) -> Result<(), DriverError> {
            let desc = memcpy2d_desc(dst, dst_pitch, src, src_pitch, width);
            let mut desc = desc;
            desc.Height = height;
            unsafe {
                check(
                    "cuMemcpy2DAsync",
                    sys::cuMemcpy2DAsync_v2(&desc, stream as sys::CUstream),
                )
            }
        }

        fn copy_3d(
            &self,
            stream: RawStream,
            dst: usize,
            src: usize,
            pitch: usize,
            rows_per_plane: usize,
            width: usize,
            height: usize,
            depth: usize,
            _kind: CopyKind,
        ) -> Result<(), DriverError> {
            let mut desc: sys::CUDA_MEMCPY3D = unsafe { std::mem::zeroed() };
            desc.srcMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_UNIFIED;
            desc.srcDevice = src as sys::CUdeviceptr;
            desc.srcPitch = pitch;
            desc.srcHeight = rows_per_plane;
            desc.dstMemoryType = sys::CUmemorytype::CU_MEMORYTYPE_UNIFIED;
            desc.dstDevice = dst as sys::CUdeviceptr;
            desc.dstPitch = pitch;
            desc.dstHeight = rows_per_plane;
            desc.WidthInBytes = width;
            desc.Height = height;
            desc.Depth = depth;
            unsafe {
                check(
                    "cuMemcpy3DAsync",
                    sys::cuMemcpy3DAsync_v2(&desc, stream as sys::CUstream),
                )
            }
        }

        fn memset_d8(
            &self,
            stream: RawStream,
            dst: usize,
            value: u8,
            count: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD8Async",
                    sys::cuMemsetD8Async(dst as sys::CUdeviceptr, value, count, stream as sys::CUstream),
                )
            }
        }

        fn memset_d16(
            &self,
            stream: RawStream,
            dst: usize,
            value: u16,
            count: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD16Async",
                    sys::cuMemsetD16Async(dst as sys::CUdeviceptr, value, count, stream as sys::CUstream),
                )
            }
        }

        fn memset_d32(
            &self,
            stream: RawStream,
            dst: usize,
            value: u32,
            count: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD32Async",
                    sys::cuMemsetD32Async(dst as sys::CUdeviceptr, value, count, stream as sys::CUstream),
                )
            }
        }

        fn memset2d_d8(
            &self,
            stream: RawStream,
            dst: usize,
            pitch: usize,
            value: u8,
            width: usize,
            height: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD2D8Async",
                    sys::cuMemsetD2D8Async(
                        dst as sys::CUdeviceptr,
                        pitch,
                        value,
                        width,
                        height,
                        stream as sys::CUstream,
                    ),
                )
            }
        }

        fn memset2d_d16(
            &self,
            stream: RawStream,
            dst: usize,
            pitch: usize,
            value: u16,
            width: usize,
            height: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD2D16Async",
                    sys::cuMemsetD2D16Async(
                        dst as sys::CUdeviceptr,
                        pitch,
                        value,
                        width,
                        height,
                        stream as sys::CUstream,
                    ),
                )
            }
        }

        fn memset2d_d32(
            &self,
            stream: RawStream,
            dst: usize,
            pitch: usize,
            value: u32,
            width: usize,
            height: usize,
        ) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuMemsetD2D32Async",
                    sys::cuMemsetD2D32Async(
                        dst as sys::CUdeviceptr,
                        pitch,
                        value,
                        width,
                        height,
                        stream as sys::CUstream,
                    ),
                )
            }
        }

        fn create_event(&self, device: u32) -> Result<RawEvent, DriverError> {
            self.push_context(device)?;
            let mut event: sys::CUevent = std::ptr::null_mut();
            let status = unsafe {
                sys::cuEventCreate(
                    &mut event,
                    sys::CUevent_flags::CU_EVENT_DISABLE_TIMING as u32,
                )
            };
            self.pop_context(device)?;
            check("cuEventCreate", status)?;
            Ok(event as RawEvent)
        }

        fn record_event(&self, stream: RawStream, event: RawEvent) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuEventRecord",
                    sys::cuEventRecord(event as sys::CUevent, stream as sys::CUstream),
                )
            }
        }

        fn query_event(&self, event: RawEvent) -> Result<bool, DriverError> {
            let status = unsafe { sys::cuEventQuery(event as sys::CUevent) };
            match status {
                sys::CUresult::CUDA_SUCCESS => Ok(true),
                sys::CUresult::CUDA_ERROR_NOT_READY => Ok(false),
                other => Err(DriverError::call("cuEventQuery", format!("{:?}", other))),
            }
        }

        fn destroy_event(&self, event: RawEvent) -> Result<(), DriverError> {
            unsafe {
                check(
                    "cuEventDestroy",
                    sys::cuEventDestroy_v2(event as sys::CUevent),
                )
            }
        }

        fn push_context(&self, device: u32) -> Result<(), DriverError> {
            let ctx = self.context(device)?;
            unsafe { check("cuCtxPushCurrent", sys::cuCtxPushCurrent_v2(ctx)) }
        }

        fn pop_context(&self, _device: u32) -> Result<(), DriverError> {
            let mut ctx: sys::CUcontext = std::ptr::null_mut();
            unsafe { check("cuCtxPopCurrent", sys::cuCtxPopCurrent_v2(&mut ctx)) }
        }
    }
}
