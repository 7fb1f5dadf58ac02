//! Rate limits for the cloud services we call.
//!
//! OCR providers throttle aggressively, so instead of allowing a full burst at
//! the start of each period, we spread requests evenly across the period. A
//! limit of `60/m` means "at most one request per second".

use std::{fmt, str::FromStr, time::Duration};

use leaky_bucket::RateLimiter;

use crate::prelude::*;

/// The period over which the rate limit is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPeriod {
    /// Per second.
    Second,
    /// Per minute.
    Minute,
    /// Per hour.
    Hour,
}

impl RateLimitPeriod {
    /// The length of this period.
    pub fn to_duration(self) -> Duration {
        match self {
            RateLimitPeriod::Second => Duration::from_secs(1),
            RateLimitPeriod::Minute => Duration::from_secs(60),
            RateLimitPeriod::Hour => Duration::from_secs(60 * 60),
        }
    }
}

impl fmt::Display for RateLimitPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitPeriod::Second => write!(f, "s"),
            RateLimitPeriod::Minute => write!(f, "m"),
            RateLimitPeriod::Hour => write!(f, "h"),
        }
    }
}

impl FromStr for RateLimitPeriod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "s" => Ok(RateLimitPeriod::Second),
            "m" => Ok(RateLimitPeriod::Minute),
            "h" => Ok(RateLimitPeriod::Hour),
            _ => Err(anyhow!("Unsupported rate limit period: {:?}", s)),
        }
    }
}

/// A rate limit for an API, written as `"10/s"`, `"60/m"` or `"1000/h"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimit {
    /// The maximum number of requests allowed in the period. Never zero.
    pub max_requests: u32,
    /// The period over which the rate limit is applied.
    pub per_period: RateLimitPeriod,
}

impl RateLimit {
    /// Create a new [`RateLimit`]. `max_requests` is raised to 1 if it is 0.
    pub fn new(max_requests: u32, per_period: RateLimitPeriod) -> Self {
        Self {
            max_requests: max_requests.max(1),
            per_period,
        }
    }

    /// The minimum delay between two requests.
    pub fn min_spacing(&self) -> Duration {
        let per_request = self.per_period.to_duration() / self.max_requests.max(1);
        per_request.max(Duration::from_millis(1))
    }

    /// Create a [`RateLimiter`] that hands out one permit every
    /// [`Self::min_spacing`].
    pub fn to_rate_limiter(&self) -> RateLimiter {
        RateLimiter::builder()
            .initial(1)
            .refill(1)
            .max(1)
            .interval(self.min_spacing())
            .build()
    }
}

impl fmt::Display for RateLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.max_requests, self.per_period)
    }
}

impl FromStr for RateLimit {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let parse = |s: &str| -> Result<_> {
            let (max_requests, per_period) = s
                .split_once('/')
                .ok_or_else(|| anyhow!("Missing period"))?;
            let max_requests = max_requests.trim().parse::<u64>()?;
            let max_requests = u32::try_from(max_requests)
                .map_err(|_| anyhow!("Rate limit of {} requests is too large", max_requests))?;
            if max_requests == 0 {
                return Err(anyhow!("Rate limit must allow at least one request"));
            }
            let per_period = per_period.trim().parse::<RateLimitPeriod>()?;
            Ok(Self {
                max_requests,
                per_period,
            })
        };
        parse(s).with_context(|| format!("Failed to parse rate limit: {:?}", s))
    }
}
