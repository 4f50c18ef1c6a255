// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transfer descriptors.
//!
//! A descriptor is one unit of transfer work: input and output ports over
//! registered memory, control blocks tracking how many bytes each side still
//! owes, and a `progress` entry point the channel dispatcher drives under a
//! deadline. The channel decides at creation whether a descriptor copies or
//! fills; both variants share the port and control machinery here.

pub mod copy;
pub mod fill;

pub use copy::CopyXferDes;
pub use fill::FillXferDes;

use crate::addrlist::{AddressCursor, AddressList};
use crate::deadline::Deadline;
use crate::error::{DmaError, Result};
use crate::sequence::SequenceCache;
use gpudma_memory::MemoryHandle;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Reduction descriptor passed through descriptor creation. The engine's
/// channels carry plain copies and fills only; a nonzero id is rejected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedopInfo {
    pub id: u32,
}

/// One endpoint a descriptor reads from or writes to.
#[derive(Debug)]
pub struct PortDesc {
    pub mem: MemoryHandle,
    pub addresses: AddressList,
}

/// Progress state observable outside the dispatcher.
///
/// The channel's queue entry and every in-flight completion fence share
/// ownership of this; the descriptor is torn down only when the last of them
/// releases its reference.
#[derive(Debug)]
pub struct XdShared {
    guid: u64,
    dma_op: u64,
    read_done: Vec<AtomicUsize>,
    write_done: Vec<AtomicUsize>,
    iteration_completed: AtomicBool,
    failure: Mutex<Option<DmaError>>,
}

impl XdShared {
    fn new(guid: u64, dma_op: u64, num_inputs: usize, num_outputs: usize) -> Arc<Self> {
        Arc::new(Self {
            guid,
            dma_op,
            read_done: (0..num_inputs).map(|_| AtomicUsize::new(0)).collect(),
            write_done: (0..num_outputs).map(|_| AtomicUsize::new(0)).collect(),
            iteration_completed: AtomicBool::new(false),
            failure: Mutex::new(None),
        })
    }

    pub fn guid(&self) -> u64 {
        self.guid
    }

    pub fn dma_op(&self) -> u64 {
        self.dma_op
    }

    /// Bytes confirmed read from an input port by retired fences.
    pub fn bytes_read(&self, port: usize) -> usize {
        self.read_done[port].load(Ordering::Acquire)
    }

    /// Bytes confirmed written to an output port by retired fences.
    pub fn bytes_written(&self, port: usize) -> usize {
        self.write_done[port].load(Ordering::Acquire)
    }

    pub fn is_completed(&self) -> bool {
        self.iteration_completed.load(Ordering::Acquire)
    }

    pub(crate) fn update_bytes_read(&self, port: usize, offset: usize, size: usize) {
        tracing::trace!(
            xd = format_args!("{:#x}", self.guid),
            port,
            offset,
            size,
            "bytes read"
        );
        self.read_done[port].fetch_add(size, Ordering::AcqRel);
    }

    pub(crate) fn update_bytes_write(&self, port: usize, offset: usize, size: usize) {
        tracing::trace!(
            xd = format_args!("{:#x}", self.guid),
            port,
            offset,
            size,
            "bytes written"
        );
        self.write_done[port].fetch_add(size, Ordering::AcqRel);
    }

    pub(crate) fn mark_completed(&self) {
        self.iteration_completed.store(true, Ordering::Release);
    }

    pub(crate) fn mark_failed(&self, err: DmaError) {
        tracing::error!(
            xd = format_args!("{:#x}", self.guid),
            error = %err,
            "descriptor failed"
        );
        let mut slot = self.failure.lock().expect("failure slot poisoned");
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<DmaError> {
        self.failure.lock().expect("failure slot poisoned").take()
    }
}

/// A typed endpoint: memory, its cursor, running byte total and device tag.
#[derive(Debug)]
pub(crate) struct XferPort {
    pub mem: MemoryHandle,
    pub cursor: AddressCursor,
    /// Bytes this port has produced across all `progress` calls. Never
    /// decreases.
    pub local_bytes_total: usize,
    /// Owning device index iff the memory is device-resident.
    pub device: Option<u32>,
}

impl XferPort {
    fn new(desc: PortDesc) -> Self {
        let device = desc.mem.kind().device();
        Self {
            mem: desc.mem,
            cursor: desc.addresses.cursor(),
            local_bytes_total: 0,
            device,
        }
    }
}

/// Per-side control block: which port is active and how much it still owes.
#[derive(Debug)]
pub(crate) struct PortControl {
    pub enabled: bool,
    pub current_port: Option<usize>,
    pub remaining_count: usize,
    pub eos_received: bool,
}

impl PortControl {
    fn for_ports(ports: &[XferPort]) -> Self {
        let remaining: usize = ports.iter().map(|p| p.cursor.bytes_remaining()).sum();
        Self {
            enabled: !ports.is_empty(),
            current_port: if ports.is_empty() { None } else { Some(0) },
            remaining_count: remaining,
            eos_received: true,
        }
    }

    pub(crate) fn disabled() -> Self {
        Self {
            enabled: false,
            current_port: None,
            remaining_count: 0,
            eos_received: true,
        }
    }

    /// A side with bytes to account for but no backing port. Used for
    /// simultaneous gather+scatter where one side's addresses are produced
    /// elsewhere.
    #[cfg(test)]
    pub(crate) fn hole(bytes: usize) -> Self {
        Self {
            enabled: true,
            current_port: None,
            remaining_count: bytes,
            eos_received: true,
        }
    }
}

/// State common to copy and fill descriptors.
#[derive(Debug)]
pub(crate) struct XdCore {
    pub shared: Arc<XdShared>,
    pub inputs: Vec<XferPort>,
    pub outputs: Vec<XferPort>,
    pub input_control: PortControl,
    pub output_control: PortControl,
    pub priority: i32,
    #[allow(dead_code)]
    pub launch_node: u32,
}

impl XdCore {
    pub(crate) fn new(
        dma_op: u64,
        launch_node: u32,
        guid: u64,
        inputs: Vec<PortDesc>,
        outputs: Vec<PortDesc>,
        priority: i32,
    ) -> Self {
        let inputs: Vec<_> = inputs.into_iter().map(XferPort::new).collect();
        let outputs: Vec<_> = outputs.into_iter().map(XferPort::new).collect();
        let shared = XdShared::new(guid, dma_op, inputs.len(), outputs.len());
        let input_control = PortControl::for_ports(&inputs);
        let output_control = PortControl::for_ports(&outputs);
        Self {
            shared,
            inputs,
            outputs,
            input_control,
            output_control,
            priority,
            launch_node,
        }
    }

    /// Bytes addressable right now, bounded by whichever sides are active.
    ///
    /// `min_xfer_size` is a batching hint from the caller; the control layer
    /// never returns a nonzero value smaller than what both sides can take.
    pub(crate) fn get_addresses(
        &mut self,
        _min_xfer_size: usize,
        _read_cache: &mut SequenceCache,
    ) -> usize {
        let in_avail = self.side_available(true);
        let out_avail = self.side_available(false);
        match (in_avail, out_avail) {
            (Some(i), Some(o)) => i.min(o),
            (Some(i), None) => i,
            (None, Some(o)) => o,
            (None, None) => 0,
        }
    }

    fn side_available(&self, input: bool) -> Option<usize> {
        let (control, ports) = if input {
            (&self.input_control, &self.inputs)
        } else {
            (&self.output_control, &self.outputs)
        };
        if !control.enabled {
            return None;
        }
        let mut avail = control.remaining_count;
        if let Some(p) = control.current_port {
            avail = avail.min(ports[p].cursor.bytes_remaining());
        }
        Some(avail)
    }

    /// Account for consumed addresses; returns true when the descriptor has
    /// produced everything it owes.
    pub(crate) fn record_address_consumption(&mut self, in_bytes: usize, out_bytes: usize) -> bool {
        if self.input_control.enabled {
            debug_assert!(in_bytes <= self.input_control.remaining_count);
            self.input_control.remaining_count -= in_bytes;
            if let Some(p) = self.input_control.current_port {
                self.inputs[p].local_bytes_total += in_bytes;
            }
        }
        if self.output_control.enabled {
            debug_assert!(out_bytes <= self.output_control.remaining_count);
            self.output_control.remaining_count -= out_bytes;
            if let Some(p) = self.output_control.current_port {
                self.outputs[p].local_bytes_total += out_bytes;
            }
        }

        let side_done = |c: &PortControl| !c.enabled || (c.remaining_count == 0 && c.eos_received);
        let done = side_done(&self.input_control) && side_done(&self.output_control);
        if done {
            self.shared.mark_completed();
        }
        done
    }

    /// Surface a failure recorded by a retired fence, if any.
    pub(crate) fn check_failure(&self) -> Result<()> {
        match self.shared.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// A queued unit of transfer work, tagged by what it does.
#[derive(Debug)]
pub enum XferDes {
    Copy(CopyXferDes),
    Fill(FillXferDes),
}

impl XferDes {
    /// Advance the descriptor until the deadline expires, a stream refuses
    /// work, or the addressed bytes run out. Returns whether any bytes moved.
    pub fn progress(&mut self, work_until: &Deadline) -> Result<bool> {
        match self {
            XferDes::Copy(xd) => xd.progress(work_until),
            XferDes::Fill(xd) => xd.progress(work_until),
        }
    }

    pub fn shared(&self) -> &Arc<XdShared> {
        match self {
            XferDes::Copy(xd) => &xd.core.shared,
            XferDes::Fill(xd) => &xd.core.shared,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            XferDes::Copy(xd) => xd.core.priority,
            XferDes::Fill(xd) => xd.core.priority,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.shared().is_completed()
    }
}
