//! Optimistic transactions.
//!
//! A transaction session applies a caller-supplied update function to the
//! value at a path and commits only if the value has not changed since the
//! caller last saw it. Each attempt sends the new value together with the
//! content hash of the value it was derived from; the worker commits when
//! the hash still matches and otherwise replies with the current value and
//! hash, which seeds the next attempt.

use std::future::Future;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use truss_api::Snapshot;

use crate::config::DEFAULT_MAX_TRANSACTION_TRIES;
use crate::error::CoreError;

/// What the update function wants done with the current value.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionStep {
    /// Write this value.
    Write(Value),
    /// End the session without writing.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionOptions {
    /// When set, an update function returning `None` deletes the value
    /// instead of aborting.
    pub safe_abort: bool,
    pub max_tries: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            safe_abort: false,
            max_tries: DEFAULT_MAX_TRANSACTION_TRIES,
        }
    }
}

/// Final state of a transaction session.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionResult {
    pub committed: bool,
    /// Committed value, or the last value seen when aborted.
    pub snapshot: Snapshot,
    /// Attempts made, not counting the initial read.
    pub tries: u32,
}

/// Worker reply to one conditional write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum AttemptReply {
    Committed { snapshot: Snapshot },
    /// The value changed since `old_hash` was computed.
    Stale { value: Value, hash: String },
}

/// The two round trips a transaction session needs.
pub trait TransactionPort: Send + Sync {
    /// Read the current value at `url`.
    fn fetch(&self, url: &str) -> impl Future<Output = Result<Value, CoreError>> + Send;

    /// Write `new_value` at `url` if the current value still hashes to
    /// `old_hash`.
    fn attempt(
        &self,
        url: &str,
        old_hash: &str,
        new_value: &Value,
    ) -> impl Future<Output = Result<AttemptReply, CoreError>> + Send;
}

/// Run a transaction session to completion.
pub async fn run<P, F>(
    port: &P,
    url: &str,
    mut update: F,
    options: TransactionOptions,
) -> Result<TransactionResult, CoreError>
where
    P: TransactionPort,
    F: FnMut(&Value) -> Option<TransactionStep> + Send,
{
    let mut current = port.fetch(url).await?;
    let mut hash = truss_api::hash(&current);

    for tries in 1..=options.max_tries {
        let new_value = match update(&current) {
            Some(TransactionStep::Write(value)) => value,
            None if options.safe_abort => Value::Null,
            Some(TransactionStep::Abort) | None => {
                debug!(url, tries, "transaction aborted");
                return Ok(TransactionResult {
                    committed: false,
                    snapshot: Snapshot::new(url, current),
                    tries,
                });
            }
        };

        match port.attempt(url, &hash, &new_value).await? {
            AttemptReply::Committed { snapshot } => {
                debug!(url, tries, "transaction committed");
                return Ok(TransactionResult {
                    committed: true,
                    snapshot,
                    tries,
                });
            }
            AttemptReply::Stale { value, hash: latest } => {
                debug!(url, tries, "transaction stale, retrying");
                current = value;
                hash = latest;
            }
        }
    }

    warn!(url, tries = options.max_tries, "transaction exhausted its attempts");
    Err(CoreError::MaxRetriesExceeded {
        url: url.to_owned(),
        tries: options.max_tries,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Mutex, PoisonError};

    /// Port backed by a single value. `interference` bumps the value
    /// before every attempt, simulating a concurrent writer.
    struct FakePort {
        value: Mutex<Value>,
        interference: bool,
        attempts: AtomicU32,
    }

    impl FakePort {
        fn new(value: Value, interference: bool) -> Self {
            Self {
                value: Mutex::new(value),
                interference,
                attempts: AtomicU32::new(0),
            }
        }

        fn current(&self) -> Value {
            self.value.lock().unwrap_or_else(PoisonError::into_inner).clone()
        }
    }

    impl TransactionPort for FakePort {
        async fn fetch(&self, _url: &str) -> Result<Value, CoreError> {
            Ok(self.current())
        }

        async fn attempt(
            &self,
            url: &str,
            old_hash: &str,
            new_value: &Value,
        ) -> Result<AttemptReply, CoreError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst);
            let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
            if self.interference {
                *value = json!(1000 + n);
            }
            if truss_api::hash(&value) == old_hash {
                *value = new_value.clone();
                Ok(AttemptReply::Committed {
                    snapshot: Snapshot::new(url, new_value.clone()),
                })
            } else {
                Ok(AttemptReply::Stale {
                    value: value.clone(),
                    hash: truss_api::hash(&value),
                })
            }
        }
    }

    fn increment(v: &Value) -> Option<TransactionStep> {
        Some(TransactionStep::Write(json!(v.as_i64().unwrap_or(0) + 1)))
    }

    #[tokio::test]
    async fn unchanged_value_commits_first_try() {
        let port = FakePort::new(json!(41), false);
        let result = run(&port, "/n", increment, TransactionOptions::default()).await.unwrap();
        assert!(result.committed);
        assert_eq!(result.tries, 1);
        assert_eq!(result.snapshot.value, json!(42));
        assert_eq!(port.current(), json!(42));
    }

    #[tokio::test]
    async fn value_changing_every_attempt_exhausts_retries() {
        let port = FakePort::new(json!(0), true);
        let err = run(&port, "/n", increment, TransactionOptions::default())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoreError::MaxRetriesExceeded {
                url: "/n".into(),
                tries: 25
            }
        );
        assert_eq!(port.attempts.load(Ordering::SeqCst), 25);
    }

    #[tokio::test]
    async fn abort_sentinel_ends_without_writing() {
        let port = FakePort::new(json!("keep"), false);
        let result = run(&port, "/k", |_| Some(TransactionStep::Abort), TransactionOptions::default())
            .await
            .unwrap();
        assert!(!result.committed);
        assert_eq!(result.snapshot.value, json!("keep"));
        assert_eq!(port.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn undefined_result_aborts_unless_safe_abort() {
        let port = FakePort::new(json!(1), false);
        let result = run(&port, "/k", |_| None, TransactionOptions::default()).await.unwrap();
        assert!(!result.committed);

        let options = TransactionOptions {
            safe_abort: true,
            ..TransactionOptions::default()
        };
        let result = run(&port, "/k", |_| None, options).await.unwrap();
        assert!(result.committed);
        assert_eq!(port.current(), Value::Null);
    }

    #[tokio::test]
    async fn stale_reply_seeds_next_attempt() {
        let port = FakePort::new(json!(1), false);
        let mut seen = Vec::new();
        let mut first = true;
        let result = run(
            &port,
            "/n",
            |v| {
                seen.push(v.clone());
                if first {
                    first = false;
                    *port.value.lock().unwrap() = json!(10);
                }
                increment(v)
            },
            TransactionOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(result.tries, 2);
        assert_eq!(seen, vec![json!(1), json!(10)]);
        assert_eq!(port.current(), json!(11));
    }
}
