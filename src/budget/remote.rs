//! Redis-backed usage ledger.
//!
//! Every operation is a single round trip (`GET`, `INCRBY`) against the key
//! `{prefix}{caller}:usage`. There is no client-side caching: reads see whatever
//! the store holds at the time of the call, and increments are atomic on the
//! server, so any number of gateway instances can share one store.

use std::future::Future;
use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use crate::budget::ledger::{LedgerError, LedgerFuture, SpendPolicy, UsageLedger};
use crate::config::RedisLedgerConfig;

pub struct RedisLedger {
    /// Multiplexed connection; reconnects on its own after failures.
    connection: ConnectionManager,
    policy: SpendPolicy,
    key_prefix: String,
    timeout: Duration,
}

impl RedisLedger {
    /// Connect to the store and verify it answers `PING`.
    pub async fn connect(
        config: &RedisLedgerConfig,
        policy: SpendPolicy,
    ) -> Result<Self, LedgerError> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| LedgerError::Backend(format!("invalid redis url: {e}")))?;

        let timeout = config.timeout();
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| LedgerError::Backend(format!("connect timed out after {timeout:?}")))?
            .map_err(backend_error)?;

        let ledger = Self {
            connection,
            policy,
            key_prefix: config.key_prefix.clone(),
            timeout,
        };
        ledger.ping().await?;

        tracing::debug!(
            url = %config.url,
            prefix = %config.key_prefix,
            "Redis ledger connected"
        );
        Ok(ledger)
    }

    pub fn usage_key(&self, caller: &str) -> String {
        format!("{}{}:usage", self.key_prefix, caller)
    }

    async fn ping(&self) -> Result<(), LedgerError> {
        let mut conn = self.connection.clone();
        let _pong: String = self
            .bounded(async move { redis::cmd("PING").query_async(&mut conn).await })
            .await?;
        Ok(())
    }

    async fn read(&self, caller: &str) -> Result<i64, LedgerError> {
        let key = self.usage_key(caller);
        let mut conn = self.connection.clone();
        let raw: Option<String> = self.bounded(async move { conn.get(&key).await }).await?;

        match raw {
            None => Ok(0),
            Some(value) => value
                .trim()
                .parse::<i64>()
                .map_err(|_| LedgerError::Corrupt(format!("{value:?}"))),
        }
    }

    async fn increment(&self, caller: &str, cost: i64) -> Result<(), LedgerError> {
        let key = self.usage_key(caller);
        let mut conn = self.connection.clone();
        let _total: i64 = self
            .bounded(async move { conn.incr(&key, cost).await })
            .await?;
        Ok(())
    }

    /// Apply the per-operation timeout and map redis errors.
    async fn bounded<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(backend_error(e)),
            Err(_) => Err(LedgerError::Backend(format!(
                "operation timed out after {:?}",
                self.timeout
            ))),
        }
    }
}

fn backend_error(err: redis::RedisError) -> LedgerError {
    LedgerError::Backend(err.to_string())
}

impl UsageLedger for RedisLedger {
    fn backend(&self) -> &'static str {
        "redis"
    }

    fn policy(&self) -> SpendPolicy {
        self.policy
    }

    fn check_allowed<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, bool> {
        Box::pin(async move { Ok(self.policy.allows(self.read(caller).await?)) })
    }

    fn add_usage<'a>(&'a self, caller: &'a str, tokens: u64) -> LedgerFuture<'a, ()> {
        Box::pin(async move { self.increment(caller, self.policy.cost(tokens)).await })
    }

    fn get_usage<'a>(&'a self, caller: &'a str) -> LedgerFuture<'a, i64> {
        Box::pin(async move { self.read(caller).await })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
