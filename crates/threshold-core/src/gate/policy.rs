//! Fixed anomaly policy. Thresholds live here and nowhere else.
//!
//! | Severity | Action |
//! |----------|--------|
//! | 0–40 | warn and allow |
//! | 41–75 | throttle: rate limit halved |
//! | 76–100 | lockdown: every request to the cell denied until manual release |

use serde::{Deserialize, Serialize};

pub const WARN_MAX_SEVERITY: u8 = 40;
pub const THROTTLE_MAX_SEVERITY: u8 = 75;
pub const LOCKDOWN_MIN_SEVERITY: u8 = THROTTLE_MAX_SEVERITY + 1;
pub const MAX_SEVERITY: u8 = 100;

/// Requests per flow per sliding window on an open cell.
pub const RATE_LIMIT_PER_MINUTE: usize = 100;
pub const RATE_WINDOW_MS: i64 = 60_000;

/// Severity added per recorded anomaly (8 anomalies → 80 → lockdown).
pub const ANOMALY_SEVERITY_STEP: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyAction {
    Warn,
    Throttle,
    Lockdown,
}

impl AnomalyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warn => "warn",
            Self::Throttle => "throttle",
            Self::Lockdown => "lockdown",
        }
    }
}

pub fn action_for(severity: u8) -> AnomalyAction {
    if severity >= LOCKDOWN_MIN_SEVERITY {
        AnomalyAction::Lockdown
    } else if severity > WARN_MAX_SEVERITY {
        AnomalyAction::Throttle
    } else {
        AnomalyAction::Warn
    }
}

pub fn severity_for_count(anomaly_count: u32) -> u8 {
    anomaly_count
        .saturating_mul(ANOMALY_SEVERITY_STEP)
        .min(MAX_SEVERITY as u32) as u8
}

/// Effective per-flow limit: halved while throttled.
pub fn rate_limit(throttled: bool) -> usize {
    if throttled {
        RATE_LIMIT_PER_MINUTE / 2
    } else {
        RATE_LIMIT_PER_MINUTE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bands() {
        assert_eq!(action_for(0), AnomalyAction::Warn);
        assert_eq!(action_for(40), AnomalyAction::Warn);
        assert_eq!(action_for(41), AnomalyAction::Throttle);
        assert_eq!(action_for(75), AnomalyAction::Throttle);
        assert_eq!(action_for(76), AnomalyAction::Lockdown);
        assert_eq!(action_for(100), AnomalyAction::Lockdown);
    }

    #[test]
    fn count_to_severity_saturates() {
        assert_eq!(severity_for_count(0), 0);
        assert_eq!(severity_for_count(5), 50);
        assert_eq!(severity_for_count(8), 80);
        assert_eq!(severity_for_count(u32::MAX), 100);
        assert_eq!(rate_limit(true), 50);
    }
}
