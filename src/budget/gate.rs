use std::sync::Arc;

use serde::Serialize;

use crate::budget::ledger::{LedgerError, SpendPolicy, UsageLedger};

/// Spend of a caller against the configured limit, in micro-units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Balance {
    pub spent: i64,
    pub limit: i64,
    /// Negative once the caller has overshot the limit.
    pub remaining: i64,
}

/// Convert micro-units to whole currency units for display.
pub fn micros_to_dollars(micros: i64) -> f64 {
    micros as f64 / 1_000_000.0
}

/// Admission control and accounting over a [`UsageLedger`].
///
/// The gate keeps no state of its own. Admission and accounting are two
/// independent ledger operations separated by the whole upstream stream, so
/// concurrent requests from one caller can all pass `allow` before any of their
/// usage lands: the limit is soft. Spend stops growing once a check observes it
/// over the limit; it can still overshoot by whatever was in flight.
pub struct AdmissionGate {
    ledger: Arc<dyn UsageLedger>,
}

impl AdmissionGate {
    pub fn new(ledger: Arc<dyn UsageLedger>) -> Self {
        Self { ledger }
    }

    /// Whether the caller may start a new request.
    pub async fn allow(&self, caller: &str) -> Result<bool, LedgerError> {
        self.ledger.check_allowed(caller).await
    }

    /// Charge `tokens` to the caller.
    pub async fn record(&self, caller: &str, tokens: u64) -> Result<(), LedgerError> {
        self.ledger.add_usage(caller, tokens).await
    }

    /// Balance inquiry. Not used on the request path.
    pub async fn balance(&self, caller: &str) -> Result<Balance, LedgerError> {
        let spent = self.ledger.get_usage(caller).await?;
        let limit = self.policy().spend_limit;
        Ok(Balance {
            spent,
            limit,
            remaining: limit.saturating_sub(spent),
        })
    }

    pub fn policy(&self) -> SpendPolicy {
        self.ledger.policy()
    }

    pub fn backend(&self) -> &'static str {
        self.ledger.backend()
    }
}
