//! Rate limiting for merge proposals.
//!
//! Buckets group proposals (typically by maintainer); the number of
//! concurrently-open proposals per bucket never exceeds the configured
//! limit.

use janitor::config::RateLimitConfig;
use janitor::publish::MergeProposalStatus;
use std::collections::HashMap;

/// Status of a rate limit check.
#[derive(Debug)]
pub enum RateLimitStatus {
    /// The operation is allowed.
    Allowed,
    /// Counts are not loaded yet; be conservative.
    RateLimited,
    /// The bucket is at its open-proposal limit.
    BucketRateLimited {
        bucket: String,
        open_mps: usize,
        max_open_mps: usize,
    },
}

impl RateLimitStatus {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitStatus::Allowed)
    }
}

impl std::fmt::Display for RateLimitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RateLimitStatus::Allowed => write!(f, "Allowed"),
            RateLimitStatus::RateLimited => write!(f, "RateLimited"),
            RateLimitStatus::BucketRateLimited {
                bucket,
                open_mps,
                max_open_mps,
            } => write!(
                f,
                "BucketRateLimited: bucket={}, open_mps={}, max_open_mps={}",
                bucket, open_mps, max_open_mps
            ),
        }
    }
}

/// Statistics about rate limiting.
pub struct RateLimitStats {
    /// Number of open merge proposals per bucket.
    pub per_bucket: HashMap<String, usize>,
}

/// Trait for rate limiters.
pub trait RateLimiter: Send + Sync {
    /// Load the proposal counts per status and bucket.
    fn set_mps_per_bucket(
        &mut self,
        mps_per_bucket: &HashMap<MergeProposalStatus, HashMap<String, usize>>,
    );

    /// Check if opening a proposal in a bucket is allowed.
    fn check_allowed(&self, bucket: &str) -> RateLimitStatus;

    /// Record a newly-opened proposal.
    fn inc(&mut self, bucket: &str);

    /// Get rate limit statistics, if counts are loaded.
    fn get_stats(&self) -> Option<RateLimitStats>;

    /// The open-proposal limit for a bucket, if the limiter has one.
    fn get_max_open(&self, _bucket: &str) -> Option<usize> {
        None
    }
}

/// Rate limiter that always allows operations.
#[derive(Default)]
pub struct NonRateLimiter;

impl NonRateLimiter {
    pub fn new() -> Self {
        NonRateLimiter
    }
}

impl RateLimiter for NonRateLimiter {
    fn set_mps_per_bucket(
        &mut self,
        _mps_per_bucket: &HashMap<MergeProposalStatus, HashMap<String, usize>>,
    ) {
    }

    fn check_allowed(&self, _bucket: &str) -> RateLimitStatus {
        RateLimitStatus::Allowed
    }

    fn inc(&mut self, _bucket: &str) {}

    fn get_stats(&self) -> Option<RateLimitStats> {
        None
    }
}

/// Rate limiter enforcing the configured per-bucket limits.
pub struct FixedRateLimiter {
    limits: RateLimitConfig,
    open_mps_per_bucket: Option<HashMap<String, usize>>,
}

impl FixedRateLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        FixedRateLimiter {
            limits,
            open_mps_per_bucket: None,
        }
    }
}

impl RateLimiter for FixedRateLimiter {
    fn set_mps_per_bucket(
        &mut self,
        mps_per_bucket: &HashMap<MergeProposalStatus, HashMap<String, usize>>,
    ) {
        self.open_mps_per_bucket = mps_per_bucket.get(&MergeProposalStatus::Open).cloned();
    }

    fn check_allowed(&self, bucket: &str) -> RateLimitStatus {
        let Some(open_mps_per_bucket) = &self.open_mps_per_bucket else {
            // Counts not loaded yet; be conservative.
            return RateLimitStatus::RateLimited;
        };
        let max_open = self.limits.max_open(bucket);
        if let Some(&current) = open_mps_per_bucket.get(bucket) {
            if current >= max_open {
                return RateLimitStatus::BucketRateLimited {
                    bucket: bucket.to_string(),
                    open_mps: current,
                    max_open_mps: max_open,
                };
            }
        }
        RateLimitStatus::Allowed
    }

    fn inc(&mut self, bucket: &str) {
        if let Some(open_mps_per_bucket) = self.open_mps_per_bucket.as_mut() {
            open_mps_per_bucket
                .entry(bucket.to_string())
                .and_modify(|e| *e += 1)
                .or_insert(1);
        }
    }

    fn get_stats(&self) -> Option<RateLimitStats> {
        self.open_mps_per_bucket
            .as_ref()
            .map(|open_mps_per_bucket| RateLimitStats {
                per_bucket: open_mps_per_bucket.clone(),
            })
    }

    fn get_max_open(&self, bucket: &str) -> Option<usize> {
        Some(self.limits.max_open(bucket))
    }
}

/// Rate limiter that grows the limit with the number of absorbed (merged
/// or applied) proposals, so a bucket earns trust gradually.
pub struct SlowStartRateLimiter {
    max_mps_per_bucket: Option<usize>,
    open_mps_per_bucket: Option<HashMap<String, usize>>,
    absorbed_mps_per_bucket: Option<HashMap<String, usize>>,
}

impl SlowStartRateLimiter {
    pub fn new(max_mps_per_bucket: Option<usize>) -> Self {
        SlowStartRateLimiter {
            max_mps_per_bucket,
            open_mps_per_bucket: None,
            absorbed_mps_per_bucket: None,
        }
    }

    fn get_limit(&self, bucket: &str) -> Option<usize> {
        self.absorbed_mps_per_bucket
            .as_ref()
            .map(|absorbed| absorbed.get(bucket).map_or(1, |c| c + 1))
    }
}

impl RateLimiter for SlowStartRateLimiter {
    fn check_allowed(&self, bucket: &str) -> RateLimitStatus {
        let Some(open_mps_per_bucket) = &self.open_mps_per_bucket else {
            return RateLimitStatus::RateLimited;
        };
        let Some(mut limit) = self.get_limit(bucket) else {
            return RateLimitStatus::RateLimited;
        };
        if let Some(max) = self.max_mps_per_bucket {
            limit = std::cmp::min(limit, max);
        }
        if let Some(&current) = open_mps_per_bucket.get(bucket) {
            if current >= limit {
                return RateLimitStatus::BucketRateLimited {
                    bucket: bucket.to_string(),
                    open_mps: current,
                    max_open_mps: limit,
                };
            }
        }
        RateLimitStatus::Allowed
    }

    fn inc(&mut self, bucket: &str) {
        if let Some(open_mps_per_bucket) = self.open_mps_per_bucket.as_mut() {
            open_mps_per_bucket
                .entry(bucket.to_string())
                .and_modify(|e| *e += 1)
                .or_insert(1);
        }
    }

    fn set_mps_per_bucket(
        &mut self,
        mps_per_bucket: &HashMap<MergeProposalStatus, HashMap<String, usize>>,
    ) {
        self.open_mps_per_bucket = mps_per_bucket.get(&MergeProposalStatus::Open).cloned();
        let mut absorbed_mps_per_bucket: HashMap<String, usize> = HashMap::new();
        if let Some(merged) = mps_per_bucket.get(&MergeProposalStatus::Merged) {
            for (bucket, count) in merged {
                absorbed_mps_per_bucket
                    .entry(bucket.to_string())
                    .and_modify(|e| *e += count)
                    .or_insert(*count);
            }
        }
        self.absorbed_mps_per_bucket = Some(absorbed_mps_per_bucket);
    }

    fn get_stats(&self) -> Option<RateLimitStats> {
        self.open_mps_per_bucket
            .as_ref()
            .map(|open_mps_per_bucket| RateLimitStats {
                per_bucket: open_mps_per_bucket.clone(),
            })
    }

    fn get_max_open(&self, bucket: &str) -> Option<usize> {
        self.get_limit(bucket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn counts(
        open: HashMap<String, usize>,
        merged: HashMap<String, usize>,
    ) -> HashMap<MergeProposalStatus, HashMap<String, usize>> {
        hashmap! {
            MergeProposalStatus::Open => open,
            MergeProposalStatus::Merged => merged,
        }
    }

    #[test]
    fn test_fixed_rate_limiter_conservative_before_load() {
        let limiter = FixedRateLimiter::new(RateLimitConfig::default());
        assert!(!limiter.check_allowed("maint:alice").is_allowed());
    }

    #[test]
    fn test_fixed_rate_limiter_enforces_bucket_limit() {
        let mut limiter = FixedRateLimiter::new(RateLimitConfig {
            default_max_open: 5,
            per_bucket: hashmap! {"maint:alice".to_string() => 2},
        });
        limiter.set_mps_per_bucket(&counts(
            hashmap! {"maint:alice".to_string() => 2},
            hashmap! {},
        ));

        // Bucket at the limit: blocked. Invariant: open ≤ limit.
        match limiter.check_allowed("maint:alice") {
            RateLimitStatus::BucketRateLimited {
                open_mps,
                max_open_mps,
                ..
            } => {
                assert_eq!(open_mps, 2);
                assert_eq!(max_open_mps, 2);
            }
            other => panic!("expected BucketRateLimited, got {}", other),
        }

        // Other buckets fall back to the default limit.
        assert!(limiter.check_allowed("maint:bob").is_allowed());
    }

    #[test]
    fn test_fixed_rate_limiter_inc() {
        let mut limiter = FixedRateLimiter::new(RateLimitConfig {
            default_max_open: 2,
            per_bucket: hashmap! {},
        });
        limiter.set_mps_per_bucket(&counts(hashmap! {}, hashmap! {}));
        assert!(limiter.check_allowed("maint:carol").is_allowed());
        limiter.inc("maint:carol");
        assert!(limiter.check_allowed("maint:carol").is_allowed());
        limiter.inc("maint:carol");
        assert!(!limiter.check_allowed("maint:carol").is_allowed());
    }

    #[test]
    fn test_slow_start_limit_grows_with_absorbed() {
        let mut limiter = SlowStartRateLimiter::new(Some(10));
        limiter.set_mps_per_bucket(&counts(
            hashmap! {"maint:alice".to_string() => 1, "maint:bob".to_string() => 1},
            hashmap! {"maint:bob".to_string() => 3},
        ));

        // No absorbed proposals: limit is 1, and one is already open.
        assert!(!limiter.check_allowed("maint:alice").is_allowed());
        // Three absorbed: limit is 4.
        assert!(limiter.check_allowed("maint:bob").is_allowed());
        assert_eq!(limiter.get_max_open("maint:bob"), Some(4));
    }
}
