//! Bounded verify-and-remediate loops.
//!
//! A gate runs a check, and while the number of failing items exceeds the
//! tolerance it runs a remediation, waits, and checks again. Running out of
//! attempts is a soft failure: the last result comes back with
//! `threshold_met = false` and the caller decides what that means.

pub mod assets;

use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub use assets::{AssetCheck, CommandRemediation, CompletenessReport, ExpectedAssets};

/// Outcome of one (or the last) check run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub checked: usize,
    pub passing: usize,
    pub failing: usize,
    pub threshold_met: bool,
    /// Check runs performed before this result was returned
    pub attempts: u32,
    /// Names of the failing items
    pub failures: Vec<String>,
}

impl VerificationResult {
    pub fn from_failures(checked: usize, failures: Vec<String>) -> Self {
        let failing = failures.len();
        Self {
            checked: checked.max(failing),
            passing: checked.saturating_sub(failing),
            failing,
            threshold_met: false,
            attempts: 0,
            failures,
        }
    }

    pub fn all_passing(checked: usize) -> Self {
        Self::from_failures(checked, Vec::new())
    }
}

/// Knobs of a verification gate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Name used in log lines
    pub gate: String,
    pub max_attempts: u32,
    pub delay: Duration,
    /// Failing items tolerated without further remediation
    pub acceptable_failures: usize,
    /// Stops remediation and waiting early; the last result is returned
    pub cancel: CancellationToken,
}

impl RetryPolicy {
    pub fn new(gate: impl Into<String>, max_attempts: u32, delay: Duration, acceptable_failures: usize) -> Self {
        Self {
            gate: gate.into(),
            max_attempts,
            delay,
            acceptable_failures,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Run `check` until its failures fall within tolerance or attempts run out.
///
/// `remediate` runs between attempts, never after the last one. Cancelling
/// the policy's token cuts the remediation or the wait short.
pub async fn verify_with_retry<C, CF, R, RF>(mut check: C, mut remediate: R, policy: &RetryPolicy) -> VerificationResult
where
    C: FnMut() -> CF,
    CF: Future<Output = VerificationResult>,
    R: FnMut() -> RF,
    RF: Future<Output = ()>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        let mut result = check().await;
        result.attempts = attempt;

        if result.failing <= policy.acceptable_failures {
            result.threshold_met = true;
            if result.failing > 0 {
                info!(
                    gate = %policy.gate,
                    "{} of {} items failing, within tolerance of {}",
                    result.failing, result.checked, policy.acceptable_failures
                );
            } else {
                info!(gate = %policy.gate, attempt, "All {} items passing", result.checked);
            }
            return result;
        }

        if attempt >= max_attempts {
            result.threshold_met = false;
            warn!(
                gate = %policy.gate,
                "Still {} of {} items failing after {} attempts (tolerance {})",
                result.failing, result.checked, attempt, policy.acceptable_failures
            );
            return result;
        }

        warn!(
            gate = %policy.gate,
            attempt,
            "{} of {} items failing, remediating and retrying in {:?}",
            result.failing, result.checked, policy.delay
        );
        let interrupted = tokio::select! {
            _ = async {
                remediate().await;
                tokio::time::sleep(policy.delay).await;
            } => false,
            _ = policy.cancel.cancelled() => true,
        };
        if interrupted {
            result.threshold_met = false;
            warn!(gate = %policy.gate, attempt, "Verification cancelled with {} items failing", result.failing);
            return result;
        }
        attempt += 1;
    }
}
