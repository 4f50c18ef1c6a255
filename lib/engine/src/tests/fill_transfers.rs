// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use super::{TestRig, list_1d, list_2d, list_3d};
use crate::channel::ChannelKind;
use crate::deadline::Deadline;
use crate::testing::{Submission, TestRegion};
use crate::xd::{PortDesc, RedopInfo};
use gpudma_memory::MemoryId;

#[test]
fn periodic_pattern_reduces_to_one_2d_memset8() {
    // 0xAA repeated four times tiles at one byte
    let rig = TestRig::new();
    let fb = TestRegion::new(1024 * 8192);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::Fill, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x1000,
        vec![],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_2d(0, 1024, 1024, 8192),
        }],
        0,
        RedopInfo::default(),
        &[0xAA, 0xAA, 0xAA, 0xAA],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Memset2d {
            pitch,
            elem_size,
            value,
            width,
            height,
            ..
        } => {
            assert_eq!(*elem_size, 1);
            assert_eq!(*value, 0xAA);
            assert_eq!((*width, *height), (1024, 1024));
            assert_eq!(*pitch, 8192);
        }
        other => panic!("expected a 2d memset, got {other:?}"),
    }

    // a single fence covers the whole call
    assert_eq!(rig.poller.outstanding(), 1);
    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 1024 * 1024);
    for line in 0..1024 {
        assert!(
            fb.as_slice()[line * 8192..line * 8192 + 1024]
                .iter()
                .all(|&b| b == 0xAA)
        );
    }
}

#[test]
fn two_byte_period_uses_the_16_bit_primitive() {
    let rig = TestRig::new();
    let fb = TestRegion::new(8 * 1024);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::Fill, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x1100,
        vec![],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_2d(0, 512, 8, 1024),
        }],
        0,
        RedopInfo::default(),
        &[0xAB, 0xCD],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Memset2d {
            elem_size,
            width,
            height,
            pitch,
            ..
        } => {
            assert_eq!(*elem_size, 2);
            // width counts 16-bit elements
            assert_eq!((*width, *height), (256, 8));
            assert_eq!(*pitch, 1024);
        }
        other => panic!("expected a 2d memset, got {other:?}"),
    }

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 512 * 8);
    for line in 0..8 {
        let row = &fb.as_slice()[line * 1024..line * 1024 + 512];
        for pair in row.chunks(2) {
            assert_eq!(pair, &[0xAB, 0xCD]);
        }
    }
}

#[test]
fn four_byte_period_uses_the_32_bit_primitive() {
    let rig = TestRig::new();
    let fb = TestRegion::new(4096);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::Fill, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x1200,
        vec![],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_1d(0, 4096),
        }],
        0,
        RedopInfo::default(),
        &[1, 2, 3, 4, 1, 2, 3, 4],
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert_eq!(log.len(), 1);
    match &log[0] {
        Submission::Memset1d {
            elem_size, count, ..
        } => {
            assert_eq!(*elem_size, 4);
            assert_eq!(*count, 1024);
        }
        other => panic!("expected a 1d memset, got {other:?}"),
    }

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 4096);
    for chunk in fb.as_slice().chunks(4) {
        assert_eq!(chunk, &[1, 2, 3, 4]);
    }
}

#[test]
fn non_periodic_pattern_seeds_then_doubles_lines_and_planes() {
    // 16 distinct bytes over 256 bytes x 64 lines x 8 planes; the plane
    // stride tiles into whole lines so plane extension uses 3-d copies
    let pattern: [u8; 16] = [9, 8, 7, 6, 5, 4, 3, 2, 1, 0, 11, 12, 13, 14, 15, 16];
    let rig = TestRig::new();
    let fb = TestRegion::new(8 * 32768);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::Fill, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x1300,
        vec![],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            addresses: list_3d(0, 256, 64, 512, 8, 32768),
        }],
        0,
        RedopInfo::default(),
        &pattern,
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();

    // 16 strided byte memsets seed the first line
    let seeds: Vec<_> = log
        .iter()
        .filter_map(|s| match s {
            Submission::Memset2d {
                pitch,
                elem_size,
                width,
                height,
                ..
            } => Some((*pitch, *elem_size, *width, *height)),
            _ => None,
        })
        .collect();
    assert_eq!(seeds.len(), 16);
    assert!(seeds.iter().all(|&s| s == (16, 1, 1, 16)));

    // line extension doubles: 1, 2, 4, 8, 16, 32
    let line_copies: Vec<_> = log
        .iter()
        .filter_map(|s| match s {
            Submission::Copy2d { width, height, .. } => Some((*width, *height)),
            _ => None,
        })
        .collect();
    assert_eq!(
        line_copies,
        vec![(256, 1), (256, 2), (256, 4), (256, 8), (256, 16), (256, 32)]
    );

    // plane extension doubles with pitched 3-d copies: 1, 2, 4
    let plane_copies: Vec<_> = log
        .iter()
        .filter_map(|s| match s {
            Submission::Copy3d {
                pitch,
                rows_per_plane,
                width,
                height,
                depth,
                ..
            } => Some((*pitch, *rows_per_plane, *width, *height, *depth)),
            _ => None,
        })
        .collect();
    assert_eq!(
        plane_copies,
        vec![(512, 64, 256, 64, 1), (512, 64, 256, 64, 2), (512, 64, 256, 64, 4)]
    );

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 256 * 64 * 8);

    // the filled region is a byte-exact tiling of the pattern
    for plane in 0..8 {
        for line in 0..64 {
            let off = plane * 32768 + line * 512;
            for chunk in fb.as_slice()[off..off + 256].chunks(16) {
                assert_eq!(chunk, &pattern);
            }
        }
    }
}

#[test]
fn non_periodic_pattern_with_untileable_plane_stride_falls_back() {
    // pstride not a multiple of lstride forces per-plane 2-d copies
    let pattern: [u8; 3] = [0xDE, 0xAD, 0xBF];
    let rig = TestRig::new();
    let fb = TestRegion::new(4 * 4000 + 8 * 768);

    let gpu = rig.gpu(0, MemoryId(10));
    let channel = rig.channel(ChannelKind::Fill, gpu);

    let shared = channel.create_xfer_des(
        0,
        0,
        0x1400,
        vec![],
        vec![PortDesc {
            mem: fb.as_fb(MemoryId(10), 0),
            // lstride 768, pstride 4000: 4000 % 768 != 0
            addresses: list_3d(0, 384, 4, 768, 4, 4000),
        }],
        0,
        RedopInfo::default(),
        &pattern,
    );

    assert!(channel.progress_next(&Deadline::never()).unwrap());
    assert!(shared.is_completed());

    let log = rig.api.take_log();
    assert!(!log.iter().any(|s| matches!(s, Submission::Copy3d { .. })));
    // 3 per-plane fallback copies at full height follow the line doublings
    let full_planes = log
        .iter()
        .filter(|s| matches!(s, Submission::Copy2d { height: 4, .. }))
        .count();
    assert_eq!(full_planes, 3);

    rig.poller.poll_once();
    assert_eq!(shared.bytes_written(0), 384 * 4 * 4);
    for plane in 0..4 {
        for line in 0..4 {
            let off = plane * 4000 + line * 768;
            for chunk in fb.as_slice()[off..off + 384].chunks(3) {
                assert_eq!(chunk, &pattern);
            }
        }
    }
}
