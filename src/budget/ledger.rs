use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by ledger operations. Keeps `UsageLedger` dyn-compatible.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Failure of the store behind a ledger.
///
/// A caller being over its limit is never an error; it is a `false` from
/// [`UsageLedger::check_allowed`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Ledger backend unavailable: {0}")]
    Backend(String),

    #[error("Stored usage is not an integer: {0}")]
    Corrupt(String),
}

/// Spend limit and cost model, both in micro-currency units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpendPolicy {
    /// Callers are admitted while their spend is strictly below this value.
    pub spend_limit: i64,
    /// Cost charged for a single token.
    pub cost_per_token: i64,
}

impl SpendPolicy {
    /// $10.00 expressed in micro-dollars.
    pub const DEFAULT_SPEND_LIMIT: i64 = 10_000_000;
    /// $0.002 per 1000 tokens, i.e. 2 micro-dollars per token.
    pub const DEFAULT_COST_PER_TOKEN: i64 = 2;

    pub const fn new(spend_limit: i64, cost_per_token: i64) -> Self {
        Self {
            spend_limit,
            cost_per_token,
        }
    }

    /// Cost of `tokens`, saturating at `i64::MAX`.
    pub fn cost(&self, tokens: u64) -> i64 {
        i64::try_from(tokens)
            .unwrap_or(i64::MAX)
            .saturating_mul(self.cost_per_token)
    }

    /// Admission rule: spend must be strictly below the limit.
    pub fn allows(&self, spent: i64) -> bool {
        spent < self.spend_limit
    }
}

impl Default for SpendPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SPEND_LIMIT, Self::DEFAULT_COST_PER_TOKEN)
    }
}

/// Per-caller spend store.
///
/// Implementations own all spend state. Increments must be atomic per key:
/// concurrent `add_usage` calls on the same caller never lose an update.
pub trait UsageLedger: Send + Sync {
    /// Short backend name ("memory", "redis") for logs and health output.
    fn backend(&self) -> &'static str;

    /// The policy this ledger applies.
    fn policy(&self) -> SpendPolicy;

    /// Whether the caller's current spend is below the limit. Unknown callers
    /// have zero spend and are allowed.
    fn check_allowed<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, bool>;

    /// Atomically add the cost of `tokens` to the caller's spend.
    fn add_usage<'a>(&'a self, caller: &'a str, tokens: u64) -> LedgerFuture<'a, ()>;

    /// Current spend, 0 for unknown callers.
    fn get_usage<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, i64>;
}
