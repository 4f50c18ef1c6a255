// SPDX-FileCopyrightText: Copyright (c) 2024-2026 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cooperative work bound for time-sliced descriptor progress.

use std::time::{Duration, Instant};

/// Advisory deadline handed to `progress` calls.
///
/// Expiry never cancels work already submitted to a stream; it only tells the
/// descriptor to return control once it has done at least a minimum amount of
/// useful work.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    until: Option<Instant>,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn within(budget: Duration) -> Self {
        Self {
            until: Some(Instant::now() + budget),
        }
    }

    /// A deadline at an absolute instant.
    pub fn at(until: Instant) -> Self {
        Self { until: Some(until) }
    }

    /// A deadline that never expires.
    pub fn never() -> Self {
        Self { until: None }
    }

    /// An already-expired deadline.
    pub fn expired_now() -> Self {
        Self {
            until: Some(Instant::now()),
        }
    }

    pub fn expired(&self) -> bool {
        match self.until {
            Some(until) => Instant::now() >= until,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_does_not_expire() {
        assert!(!Deadline::never().expired());
    }

    #[test]
    fn expired_now_is_expired() {
        assert!(Deadline::expired_now().expired());
    }

    #[test]
    fn future_deadline_is_live() {
        assert!(!Deadline::within(Duration::from_secs(60)).expired());
    }
}
