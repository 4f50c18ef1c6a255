// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Engine error taxonomy.
//!
//! Driver failures are fatal: the engine never retries a driver call, it
//! surfaces the failure to the caller as an operational error. Transient
//! conditions (stream saturation, deadline expiry) are not errors at all;
//! `progress` reports them by returning early.

use crate::driver::DriverError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DmaError>;

#[derive(Debug, Error)]
pub enum DmaError {
    #[error("driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("descriptor {guid:#x} failed: {reason}")]
    DescriptorFailed { guid: u64, reason: String },
}
