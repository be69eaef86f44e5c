use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::MembershipError;

/// Protocol tuning parameters for a membership service instance.
///
/// The defaults carry the protocol constants: K=10 observer rings, hard
/// watermark H=8, soft watermark L=1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Number of independent observer rings (K).
    pub k: usize,
    /// Hard watermark: reports required before a subject is ready (H).
    pub h: usize,
    /// Soft watermark: reports marking a subject as in progress (L).
    pub l: usize,
    /// Base deadline applied to probe and link-update RPCs.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    /// Failure detector tuning.
    pub failure_detector: FailureDetectorConfig,
    /// Joiner-side bootstrap tuning.
    pub join: JoinConfig,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            k: 10,
            h: 8,
            l: 1,
            rpc_timeout: Duration::from_secs(1),
            failure_detector: FailureDetectorConfig::default(),
            join: JoinConfig::default(),
        }
    }
}

impl MembershipConfig {
    /// Validates the watermark relationship K >= H > L >= 0 with K >= 3.
    ///
    /// The watermark buffer and the ring topology both depend on these
    /// bounds; construction of a service fails fast when they do not hold.
    pub fn validate(&self) -> Result<(), MembershipError> {
        if self.k < 3 || self.h > self.k || self.h <= self.l {
            return Err(MembershipError::Configuration(format!(
                "watermarks must satisfy K >= H > L >= 0 with K >= 3 (K: {}, H: {}, L: {})",
                self.k, self.h, self.l
            )));
        }
        Ok(())
    }
}

/// Tuning for the periodic link failure detector driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FailureDetectorConfig {
    /// Interval between detector ticks.
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Consecutive unanswered probes before a subject is flagged.
    pub probe_failure_threshold: u32,
}

impl Default for FailureDetectorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(1),
            probe_failure_threshold: 5,
        }
    }
}

/// Tuning for the joiner side of the bootstrap protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Bounded number of join attempts before giving up.
    pub attempts: usize,
    /// Deadline for each phase-2 observer exchange (5x the base RPC
    /// deadline by default, since the response waits for a view commit).
    #[serde(with = "humantime_serde")]
    pub phase2_timeout: Duration,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            phase2_timeout: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_satisfy_watermark_bounds() {
        assert!(MembershipConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_h_above_k() {
        let config = MembershipConfig {
            k: 5,
            h: 6,
            l: 1,
            ..MembershipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_h_equal_l() {
        let config = MembershipConfig {
            k: 3,
            h: 2,
            l: 2,
            ..MembershipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_k_below_minimum() {
        let config = MembershipConfig {
            k: 2,
            h: 2,
            l: 0,
            ..MembershipConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_boundary_watermarks() {
        let config = MembershipConfig {
            k: 3,
            h: 3,
            l: 0,
            ..MembershipConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
