//! Bounded retry for transient store failures.

use std::time::Duration;

use tracing::debug;

use crate::error::StoreResult;

/// Default attempt count for statement-level retry.
pub const DEFAULT_ATTEMPTS: u32 = 5;

/// Default base backoff between attempts.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(200);

/// Run `op`, retrying only transient failures (lock contention) with linear
/// backoff: 1×, 2×, 3×… the base delay. Integrity and fatal errors are
/// returned immediately.
///
/// Blocking; intended for use inside the engine's blocking tasks.
pub fn with_retry<T>(
    attempts: u32,
    backoff: Duration,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let mut attempt = 0u32;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                attempt += 1;
                debug!(attempt, error = %e, "transient store error, retrying");
                std::thread::sleep(backoff * attempt);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    fn busy() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        ))
    }

    #[test]
    fn retries_transient_until_success() {
        let mut calls = 0;
        let result = with_retry(5, Duration::from_millis(1), || {
            calls += 1;
            if calls < 3 {
                Err(busy())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_budget() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retry(3, Duration::from_millis(1), || {
            calls += 1;
            Err(busy())
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn non_transient_errors_fail_fast() {
        let mut calls = 0;
        let result: StoreResult<()> = with_retry(5, Duration::from_millis(1), || {
            calls += 1;
            Err(StoreError::MissingTable("invoices".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
