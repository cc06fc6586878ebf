pub mod dispatcher;
pub mod gate;
pub mod ledger;
pub mod memory;
pub mod remote;

use std::sync::Arc;

use crate::config::{LedgerBackend, LedgerConfig};

pub use self::dispatcher::{
    SubmitOutcome, UsageDispatcher, UsageReceiver, UsageWorker, spawn_usage_worker,
};
pub use self::gate::{AdmissionGate, Balance, micros_to_dollars};
pub use self::ledger::{LedgerError, LedgerFuture, SpendPolicy, UsageLedger};
pub use self::memory::MemoryLedger;
pub use self::remote::RedisLedger;

/// Tokens consumed by one completed request, on its way to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageEvent {
    pub caller: String,
    pub tokens: u64,
}

/// Build the configured ledger backend.
pub async fn build_ledger(
    config: &LedgerConfig,
    policy: SpendPolicy,
) -> Result<Arc<dyn UsageLedger>, LedgerError> {
    match config.backend {
        LedgerBackend::Memory => Ok(Arc::new(MemoryLedger::new(policy))),
        LedgerBackend::Redis => Ok(Arc::new(RedisLedger::connect(&config.redis, policy).await?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_memory_ledger() {
        let config = LedgerConfig::default();
        let ledger = build_ledger(&config, SpendPolicy::new(5, 1)).await.unwrap();
        assert_eq!(ledger.backend(), "memory");
        assert_eq!(ledger.policy(), SpendPolicy::new(5, 1));
    }

    #[tokio::test]
    async fn test_build_redis_ledger_fails_fast_when_unreachable() {
        let mut config = LedgerConfig::default();
        config.backend = LedgerBackend::Redis;
        config.redis.url = "redis://127.0.0.1:1".to_string();
        config.redis.timeout_ms = 200;

        let result = build_ledger(&config, SpendPolicy::default()).await;
        assert!(matches!(result, Err(LedgerError::Backend(_))));
    }
}
