// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token bucket used to cap how many events per second a consumer publishes.

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
struct Bucket {
    available: u64,
    last_refill: Instant,
}

/// Events-per-second limiter shared between tasks.
///
/// The bucket holds one second worth of tokens, so a consumer that has been
/// idle may publish a full second's burst at once. A rate of 0 disables it.
#[derive(Debug)]
pub struct RateLimiter {
    events_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(events_per_sec: u64) -> Self {
        Self {
            events_per_sec,
            bucket: Mutex::new(Bucket {
                available: events_per_sec,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn events_per_sec(&self) -> u64 {
        self.events_per_sec
    }

    pub fn is_unlimited(&self) -> bool {
        self.events_per_sec == 0
    }

    /// Takes `events` tokens and returns how long the caller must wait
    /// before the reservation is covered.
    pub fn reserve_at(&self, events: u64, now: Instant) -> Duration {
        if self.is_unlimited() || events == 0 {
            return Duration::ZERO;
        }
        let rate = self.events_per_sec;
        let mut bucket = match self.bucket.lock() {
            Ok(bucket) => bucket,
            Err(poisoned) => poisoned.into_inner(),
        };

        if now > bucket.last_refill {
            let elapsed = now.duration_since(bucket.last_refill).as_micros();
            let added = (u128::from(rate) * elapsed / 1_000_000).min(u128::from(u64::MAX)) as u64;
            let filled = bucket.available.saturating_add(added);
            if filled >= rate {
                // A full bucket earns nothing more
                bucket.available = rate;
                bucket.last_refill = now;
            } else if added > 0 {
                // Advance only by the time the whole tokens took, so a
                // partly earned token carries over
                bucket.available = filled;
                let earned_us = (u128::from(added) * 1_000_000).div_ceil(u128::from(rate));
                bucket.last_refill += Duration::from_micros(earned_us as u64);
            }
        }

        if events <= bucket.available {
            bucket.available -= events;
            return Duration::ZERO;
        }

        let deficit = events - bucket.available;
        bucket.available = 0;
        let earn_us = (u128::from(deficit) * 1_000_000).div_ceil(u128::from(rate));
        // Tokens earned until then are already spent
        let covered =
            bucket.last_refill + Duration::from_micros(earn_us.min(u128::from(u64::MAX)) as u64);
        bucket.last_refill = covered;
        covered.saturating_duration_since(now)
    }

    /// Waits until `events` may be published.
    pub async fn acquire(&self, events: u64) {
        let wait = self.reserve_at(events, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}
