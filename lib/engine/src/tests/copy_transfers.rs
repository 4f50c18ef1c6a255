// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{TestRig, list_1d, list_2d, list_3d};
use crate::channel::ChannelKind;
use crate::config::EngineConfig;
use crate::deadline::Deadline;
use crate::driver::CopyKind;
use crate::testing::{Submission, TestRegion};
use crate::xd::{CopyXferDes, PortControl, PortDesc, RedopInfo, XdCore, XferDes};
use gpudma_memory::MemoryId;
use std::sync::Arc;

const MIB: usize = 1 << 20;

#[test]
fn one_mib_host_to_device_is_a_single_1d_copy() {
    let rig = TestRig::new();
    let host = TestRegion::filled(MIB, 0x5A);
    let fb = TestRegion::new(MIB);

    let mut gpu = rig.gpu(0, MemoryId(10));
    gpu.add_pinned_sysmem(MemoryId(1));
    let h2d_stream = gpu.host_to_device_stream().raw();
    let channel = rig.channel(ChannelKind::ToFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x100,
        vec![PortDesc {
            mem: host.as_pinned(MemoryId(1)),
            addresses: list_1d(0, MIB),
        }],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, MIB),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Copy1d {
            stream,
            bytes,
            kind,
            ..
        } => {
            assert_eq!(*stream, h2d_stream);
            assert_eq!(*bytes, MIB);
            assert_eq!(*kind, CopyKind::HostToDevice);
        }
        other => panic!("expected a 1d copy, got {other:?}"),
    }

    // one fence covering the full span
    assert_eq!(rig.poller.outstanding(), 1);
    assert_eq!(rig.poller.poll_once(), 1);
    assert_eq!(shared.bytes_read(0), MIB);
    assert_eq!(shared.bytes_written(0), MIB);
    assert!(fb.as_slice().iter().all(|&b| b == 0x5A));
}

#[test]
fn matched_2d_shapes_become_one_2d_copy() {
    // 64 x 64 doubles: 512 contiguous bytes per line, 1024-byte stride
    let rig = TestRig::new();
    let src = TestRegion::filled(64 * 1024, 0x11);
    let dst = TestRegion::new(64 * 1024);

    let gpu = rig.gpu(0, MemoryId(10));
    let d2d_raws: Vec<_> = (0..rig.config.d2d_stream_count)
        .map(|_| gpu.next_d2d_stream().raw())
        .collect();
    let channel = rig.channel(ChannelKind::InFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x200,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_2d(0, 512, 64, 1024),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: list_2d(0, 512, 64, 1024),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Copy2d {
            stream,
            dst_pitch,
            src_pitch,
            width,
            height,
            kind,
            ..
        } => {
            assert!(d2d_raws.contains(stream));
            assert_eq!((*width, *height), (512, 64));
            assert_eq!((*src_pitch, *dst_pitch), (1024, 1024));
            assert_eq!(*kind, CopyKind::DeviceToDevice);
        }
        other => panic!("expected a 2d copy, got {other:?}"),
    }

    assert_eq!(rig.poller.poll_once(), 1);
    assert_eq!(shared.bytes_written(0), 512 * 64);
    for line in 0..64 {
        assert_eq!(
            &dst.as_slice()[line * 1024..line * 1024 + 512],
            &src.as_slice()[line * 1024..line * 1024 + 512],
        );
    }
}

#[test]
#[should_panic(expected = "no peer link")]
fn missing_peer_link_is_fatal() {
    let rig = TestRig::new();
    let src = TestRegion::new(4096);
    let dst = TestRegion::new(4096);

    // gpu 0 with no registered peers
    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::PeerFb, gpu);

    channel.create_xfer_des(
        0,
        0,
        0x300,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(30), 2),
            addresses: list_1d(0, 4096),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    let _ = channel.progress_next(&Deadline::never());
}

#[test]
fn peer_copy_uses_the_peer_stream() {
    let rig = TestRig::new();
    let src = TestRegion::filled(4096, 0x42);
    let dst = TestRegion::new(4096);

    let mut gpu = rig.gpu(0, MemoryId(10));
    gpu.add_peer(1, MemoryId(20), rig.poller.clone()).unwrap();
    let peer_raw = gpu.peer_stream(1).unwrap().raw();
    let channel = rig.channel(ChannelKind::PeerFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x310,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(20), 1),
            addresses: list_1d(0, 4096),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());

    let log = rig.api.take_log();
    match &log[0] {
        Submission::Copy1d { stream, kind, .. } => {
            assert_eq!(*stream, peer_raw);
            assert_eq!(*kind, CopyKind::Inferred);
        }
        other => panic!("expected a 1d copy, got {other:?}"),
    }

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 4096);
    assert_eq!(dst.as_slice(), src.as_slice());
}

#[test]
fn device_to_host_uses_the_d2h_stream() {
    let rig = TestRig::new();
    let fb = TestRegion::filled(8192, 0x77);
    let host = TestRegion::new(8192);

    let mut gpu = rig.gpu(0, MemoryId(10));
    gpu.add_pinned_sysmem(MemoryId(1));
    let d2h_raw = gpu.device_to_host_stream().raw();
    let channel = rig.channel(ChannelKind::FromFb, gpu);

    channel.create_xfer_des(
        0,
        0,
        0x320,
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 8192),
        }],
        vec![PortDesc {
            mem: host.as_pinned(MemoryId(1)),
            addresses: list_1d(0, 8192),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    match &rig.api.take_log()[0] {
        Submission::Copy1d { stream, kind, .. } => {
            assert_eq!(*stream, d2h_raw);
            assert_eq!(*kind, CopyKind::DeviceToHost);
        }
        other => panic!("expected a 1d copy, got {other:?}"),
    }
    assert_eq!(host.as_slice(), fb.as_slice());
}

#[test]
fn host_device_copies_are_capped_per_submission() {
    // 32 MiB H->D must go out as 4 MiB sub-copies
    let rig = TestRig::new();
    let host = TestRegion::filled(32 * MIB, 0xC3);
    let fb = TestRegion::new(32 * MIB);

    let mut gpu = rig.gpu(0, MemoryId(10));
    gpu.add_pinned_sysmem(MemoryId(1));
    let channel = rig.channel(ChannelKind::ToFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x400,
        vec![PortDesc {
            mem: host.as_pinned(MemoryId(1)),
            addresses: list_1d(0, 32 * MIB),
        }],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 32 * MIB),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 8);
    for sub in &log {
        match sub {
            Submission::Copy1d { bytes, .. } => assert_eq!(*bytes, 4 * MIB),
            other => panic!("expected a 1d copy, got {other:?}"),
        }
    }

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 32 * MIB);
    assert!(fb.as_slice().iter().all(|&b| b == 0xC3));
}

#[test]
fn contiguous_source_splits_against_strided_destination() {
    // 32 KiB contiguous source packs into 64 strided lines of 512
    let rig = TestRig::new();
    let src = TestRegion::filled(32768, 0x9E);
    let dst = TestRegion::new(64 * 1024);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::InFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x500,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 32768),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: list_2d(0, 512, 64, 1024),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Copy2d {
            src_pitch,
            dst_pitch,
            width,
            height,
            ..
        } => {
            assert_eq!((*width, *height), (512, 64));
            assert_eq!(*src_pitch, 512);
            assert_eq!(*dst_pitch, 1024);
        }
        other => panic!("expected a 2d copy, got {other:?}"),
    }

    for line in 0..64 {
        assert_eq!(
            &dst.as_slice()[line * 1024..line * 1024 + 512],
            &src.as_slice()[line * 512..(line + 1) * 512],
        );
    }
}

#[test]
fn three_dim_shapes_unroll_into_plane_copies() {
    // contiguous source into 256 x 4 x 4 with plane stride 4096
    let rig = TestRig::new();
    let src = TestRegion::filled(4096, 0x3D);
    let dst = TestRegion::new(4 * 4096);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::InFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x600,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: list_3d(0, 256, 4, 512, 4, 4096),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 4);
    for sub in &log {
        match sub {
            Submission::Copy2d {
                src_pitch,
                dst_pitch,
                width,
                height,
                ..
            } => {
                assert_eq!((*width, *height), (256, 4));
                assert_eq!((*src_pitch, *dst_pitch), (256, 512));
            }
            other => panic!("expected a 2d copy, got {other:?}"),
        }
    }

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 4096);
    for plane in 0..4 {
        for line in 0..4 {
            let dst_off = plane * 4096 + line * 512;
            let src_off = (plane * 4 + line) * 256;
            assert_eq!(
                &dst.as_slice()[dst_off..dst_off + 256],
                &src.as_slice()[src_off..src_off + 256],
            );
        }
    }
}

#[test]
fn saturated_stream_suspends_and_resumes() -> anyhow::Result<()> {
    // a 4 KiB budget forces one range per progress call
    let config = EngineConfig::builder()
        .stream_inflight_limit(4096)
        .build()?;
    let rig = TestRig::with_config(config);
    let src = TestRegion::filled(16384, 0x66);
    let dst = TestRegion::new(16384);

    let mut gpu = rig.gpu(0, MemoryId(10));
    gpu.add_pinned_sysmem(MemoryId(1));
    let channel = rig.channel(ChannelKind::ToFb, gpu);

    let mut src_list = list_1d(0, 4096);
    let mut dst_list = list_1d(0, 4096);
    for i in 1..4 {
        src_list.push_1d(i * 4096, 4096);
        dst_list.push_1d(i * 4096, 4096);
    }

    let shared = channel.create_xfer_des(
        0,
        0,
        0x700,
        vec![PortDesc {
            mem: src.as_pinned(MemoryId(1)),
            addresses: src_list,
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: dst_list,
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    rig.api.hold_events(true);
    let mut fences = 0;
    let mut last_written = 0;
    for _ in 0..4 {
        assert!(channel.progress_next(&Deadline::never())?);
        fences += 1;
        assert_eq!(rig.poller.outstanding(), 1);
        rig.api.release_events();
        assert_eq!(rig.poller.poll_once(), 1);
        rig.api.hold_events(true);

        // monotone progress across calls
        let written = shared.bytes_written(0);
        assert!(written >= last_written);
        last_written = written;
    }

    assert!(shared.is_completed());
    assert_eq!(fences, 4);
    // byte conservation: reads and writes both cover the whole transfer
    assert_eq!(shared.bytes_read(0), 16384);
    assert_eq!(shared.bytes_written(0), 16384);
    assert_eq!(dst.as_slice(), src.as_slice());
    Ok(())
}

#[test]
fn input_without_consumer_discards_and_reports_reads() {
    let rig = TestRig::new();
    let src = TestRegion::filled(8192, 0x21);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::FromFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x800,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 8192),
        }],
        vec![],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());
    assert!(rig.api.take_log().is_empty());
    // spans flushed by the read sequence cache, no fence involved
    assert_eq!(rig.poller.outstanding(), 0);
    assert_eq!(shared.bytes_read(0), 8192);
}

#[test]
fn output_without_producer_skips_without_reads() {
    let rig = TestRig::new();
    let dst = TestRegion::new(8192);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::InFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x900,
        vec![],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 8192),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());
    assert!(rig.api.take_log().is_empty());
    assert_eq!(shared.bytes_written(0), 0);
}

#[test]
fn simultaneous_gather_scatter_accounts_bytes_without_ports() {
    // both sides portless: the control blocks carry the byte counts and the
    // descriptor only advances the write-side accounting
    let rig = TestRig::new();
    let gpu = rig.gpu(0, MemoryId(10));

    let mut core = XdCore::new(0, 0, 0xB00, vec![], vec![], 0);
    core.input_control = PortControl::hole(8192);
    core.output_control = PortControl::hole(8192);
    let shared = core.shared.clone();

    let mut xd = XferDes::Copy(CopyXferDes::new(core, Arc::new(gpu), rig.config.clone()));
    assert!(xd.progress(&Deadline::never()).unwrap());
    assert!(shared.is_completed());
    assert!(rig.api.take_log().is_empty());
    assert_eq!(rig.poller.outstanding(), 0);
}

#[test]
fn descriptor_reference_survives_until_fences_retire() {
    let rig = TestRig::new();
    let src = TestRegion::filled(4096, 0x55);
    let dst = TestRegion::new(4096);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::InFb, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0xA00,
        vec![PortDesc {
            mem: src.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        vec![PortDesc {
            mem: dst.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        0,
        RedopInfo::default(),
        &[],
    );

    rig.api.hold_events(true);
    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());
    assert_eq!(channel.pending_count(), 0);

    // ours plus the in-flight fence's reference
    assert_eq!(Arc::strong_count(&shared), 2);
    assert_eq!(shared.bytes_written(0), 0);

    rig.api.release_events();
    rig.poller.poll_once();
    assert_eq!(Arc::strong_count(&shared), 1);
    assert_eq!(shared.bytes_written(0), 4096);
}
