//! Chunked application of change ops with bounded retry of transient failures.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::sync::types::{ChangeOp, SyncResult, WriteAck};

/// Retry policy for transient write failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Retries immediately, without sleeping.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }
}

/// An op the store accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedOp {
    pub op: ChangeOp,
    pub ack: WriteAck,
}

/// An op that failed after all permitted attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedOp {
    pub op: ChangeOp,
    pub error: String,
    pub attempts: u32,
    /// Whether the last error was transient.
    pub transient: bool,
}

/// Outcome of one `apply` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyResult {
    pub succeeded: Vec<AppliedOp>,
    pub failed: Vec<FailedOp>,
    /// Ops never attempted because the deadline passed.
    pub deferred: Vec<ChangeOp>,
}

impl ApplyResult {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// True when something was attempted and every attempt failed transiently.
    pub fn all_failed_transiently(&self) -> bool {
        self.succeeded.is_empty()
            && !self.failed.is_empty()
            && self.failed.iter().all(|f| f.transient)
    }

    pub fn merge(&mut self, other: ApplyResult) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
        self.deferred.extend(other.deferred);
    }
}

/// Applies ops in fixed-size batches.
#[derive(Debug, Clone)]
pub struct BatchWriter {
    batch_size: usize,
    retry: RetryConfig,
}

impl BatchWriter {
    pub fn new(batch_size: usize, retry: RetryConfig) -> Self {
        Self {
            batch_size: batch_size.max(1),
            retry,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Apply `ops` through `write`, batch by batch.
    ///
    /// A failing op never stops the others. Once `deadline` has passed, the
    /// remaining batches are returned unattempted in `deferred`.
    pub fn apply<F>(&self, ops: Vec<ChangeOp>, deadline: Option<Instant>, mut write: F) -> ApplyResult
    where
        F: FnMut(&ChangeOp) -> SyncResult<WriteAck>,
    {
        let mut result = ApplyResult::default();
        let mut remaining = ops.into_iter().peekable();
        let mut batch_no = 0usize;

        while remaining.peek().is_some() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                result.deferred.extend(remaining);
                debug!(deferred = result.deferred.len(), "Time budget exhausted, deferring ops");
                break;
            }

            batch_no += 1;
            let batch: Vec<ChangeOp> = remaining.by_ref().take(self.batch_size).collect();
            debug!(batch = batch_no, size = batch.len(), "Applying batch");

            for op in batch {
                match self.write_with_retry(&op, &mut write) {
                    Ok(ack) => result.succeeded.push(AppliedOp { op, ack }),
                    Err(failed) => result.failed.push(FailedOp { op, ..failed }),
                }
            }
        }

        result
    }

    fn write_with_retry<F>(&self, op: &ChangeOp, write: &mut F) -> Result<WriteAck, FailedOp>
    where
        F: FnMut(&ChangeOp) -> SyncResult<WriteAck>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match write(op) {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempts <= self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    warn!(
                        id = %op.id,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient write failure, retrying"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
                Err(e) => {
                    warn!(id = %op.id, attempts, error = %e, "Write failed");
                    return Err(FailedOp {
                        op: op.clone(),
                        error: e.to_string(),
                        attempts,
                        transient: e.is_retryable(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::types::{EventTime, Side, SyncError, SyncRecord, SyncStatus};
    use chrono::{NaiveDate, Utc};
    use std::collections::{BTreeMap, HashMap};

    fn op(id: &str) -> ChangeOp {
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        ChangeOp::create(
            Side::Sheet,
            SyncRecord {
                id: id.to_string(),
                title: id.to_string(),
                description: String::new(),
                location: String::new(),
                start_at: EventTime::Date(day),
                end_at: EventTime::Date(day),
                all_day: true,
                attendees: Vec::new(),
                recurrence_rule: None,
                extensions: BTreeMap::new(),
                last_modified_at: Utc::now(),
                sync_status: SyncStatus::Synced,
            },
        )
    }

    fn ops(n: usize) -> Vec<ChangeOp> {
        (0..n).map(|i| op(&format!("r{i:02}"))).collect()
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let retry = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn test_all_ops_applied_in_order() {
        let writer = BatchWriter::new(3, RetryConfig::immediate(0));
        let mut seen = Vec::new();
        let result = writer.apply(ops(7), None, |op| {
            seen.push(op.id.clone());
            Ok(WriteAck::row(2))
        });
        assert_eq!(result.succeeded.len(), 7);
        assert!(result.failed.is_empty());
        assert_eq!(seen.first().map(String::as_str), Some("r00"));
        assert_eq!(seen.last().map(String::as_str), Some("r06"));
    }

    #[test]
    fn test_failure_isolated_from_rest_of_batch() {
        let writer = BatchWriter::new(50, RetryConfig::immediate(2));
        let result = writer.apply(ops(5), None, |op| {
            if op.id == "r02" {
                Err(SyncError::PermanentIo("row protected".into()))
            } else {
                Ok(WriteAck::row(3))
            }
        });
        assert_eq!(result.succeeded.len(), 4);
        assert_eq!(result.failed.len(), 1);
        let failed = &result.failed[0];
        assert_eq!(failed.op.id, "r02");
        assert_eq!(failed.attempts, 1);
        assert!(!failed.transient);
        assert!(failed.error.contains("row protected"));
    }

    #[test]
    fn test_transient_errors_are_retried() {
        let writer = BatchWriter::new(10, RetryConfig::immediate(3));
        let mut calls: HashMap<String, u32> = HashMap::new();
        let result = writer.apply(ops(2), None, |op| {
            let n = calls.entry(op.id.clone()).or_default();
            *n += 1;
            if op.id == "r00" && *n < 3 {
                Err(SyncError::RateLimited)
            } else {
                Ok(WriteAck::row(2))
            }
        });
        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(calls["r00"], 3);
        assert_eq!(calls["r01"], 1);
    }

    #[test]
    fn test_retries_are_bounded() {
        let writer = BatchWriter::new(10, RetryConfig::immediate(2));
        let result = writer.apply(ops(1), None, |_| Err(SyncError::TransientIo("timeout".into())));
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].attempts, 3);
        assert!(result.failed[0].transient);
        assert!(result.all_failed_transiently());
    }

    #[test]
    fn test_expired_deadline_defers_everything() {
        let writer = BatchWriter::new(2, RetryConfig::immediate(0));
        let mut calls = 0;
        let result = writer.apply(ops(5), Some(Instant::now()), |_| {
            calls += 1;
            Ok(WriteAck::row(2))
        });
        assert_eq!(calls, 0);
        assert_eq!(result.deferred.len(), 5);
        assert_eq!(result.attempted(), 0);
    }

    #[test]
    fn test_deadline_checked_between_batches() {
        let writer = BatchWriter::new(2, RetryConfig::immediate(0));
        let deadline = Instant::now() + Duration::from_millis(30);
        let result = writer.apply(ops(6), Some(deadline), |_| {
            std::thread::sleep(Duration::from_millis(20));
            Ok(WriteAck::row(2))
        });
        assert_eq!(result.succeeded.len(), 2);
        assert_eq!(result.deferred.len(), 4);
        assert_eq!(result.deferred[0].id, "r02");
    }
}
