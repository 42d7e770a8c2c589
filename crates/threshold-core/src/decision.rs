//! Success/failure decisions for simulated remote collaborators.
//!
//! Simulated processors, publishers and sync targets ask a `DecisionSource` whether a call
//! succeeds instead of sampling global randomness, so tests can force either branch.

use rand::Rng;
use std::collections::VecDeque;
use std::sync::Mutex;

/// Decides whether a simulated remote operation succeeds.
pub trait DecisionSource: Send + Sync {
    /// `operation` names the call (e.g. "stripe.charge") for scripted or logged decisions.
    fn should_succeed(&self, operation: &str) -> bool;
}

/// Succeeds with probability `success_rate` (0.0-1.0).
#[derive(Debug, Clone)]
pub struct RandomDecision {
    success_rate: f64,
}

impl RandomDecision {
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
        }
    }
}

impl DecisionSource for RandomDecision {
    fn should_succeed(&self, _operation: &str) -> bool {
        rand::thread_rng().gen_bool(self.success_rate)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysSucceed;

impl DecisionSource for AlwaysSucceed {
    fn should_succeed(&self, _operation: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFail;

impl DecisionSource for AlwaysFail {
    fn should_succeed(&self, _operation: &str) -> bool {
        false
    }
}

/// Replays a fixed sequence of outcomes, then falls back to `exhausted`.
#[derive(Debug)]
pub struct ScriptedDecision {
    script: Mutex<VecDeque<bool>>,
    exhausted: bool,
}

impl ScriptedDecision {
    pub fn new(script: impl IntoIterator<Item = bool>, exhausted: bool) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            exhausted,
        }
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl DecisionSource for ScriptedDecision {
    fn should_succeed(&self, _operation: &str) -> bool {
        match self.script.lock() {
            Ok(mut script) => script.pop_front().unwrap_or(self.exhausted),
            Err(_) => self.exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_then_exhausted() {
        let d = ScriptedDecision::new([false, true], false);
        assert!(!d.should_succeed("a"));
        assert!(d.should_succeed("a"));
        assert_eq!(d.remaining(), 0);
        assert!(!d.should_succeed("a"));
    }

    #[test]
    fn random_extremes_are_deterministic() {
        assert!(RandomDecision::new(1.0).should_succeed("x"));
        assert!(!RandomDecision::new(0.0).should_succeed("x"));
        assert!(RandomDecision::new(7.0).should_succeed("x"));
    }
}
