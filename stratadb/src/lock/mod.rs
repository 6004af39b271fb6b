//! Advisory locks: named, leased, renewable mutual exclusion.
//!
//! These are cooperative tokens stored in the `advisory_locks` table,
//! unrelated to database row locking. A lock is live until it is released
//! or its lease (`renewed_at + lease_duration`) runs out. Expired rows are
//! not reclaimed implicitly: acquisition fails on any existing row, and
//! [`Repository::sweep_expired_locks`] is what frees locks a crashed holder
//! left behind. Callers poll the sweep; within its latency window two
//! critical sections can briefly overlap, which callers must tolerate.

use crate::backend::{with_root_transaction, DatabaseAdapter, SqlValue};
use crate::error::{RepositoryError, Result};
use crate::store::{next_sequence, Repository};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

const LOCK_HANDLE_SEQUENCE: &str = "advisory-lock-handle";

/// A held lock. Timestamps are unix milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryLock {
    pub name: String,
    pub handle: i64,
    pub acquired_at: i64,
    pub renewed_at: i64,
    pub lease_duration: Duration,
}

/// Tunables for [`Repository::with_advisory_lock`].
#[derive(Debug, Clone)]
pub struct AdvisoryLockOptions {
    pub lease_duration: Duration,
    /// How often acquisition is retried while another holder is live.
    pub poll_interval: Duration,
    /// How often the lease is renewed while the critical section runs.
    pub renew_interval: Duration,
}

impl Default for AdvisoryLockOptions {
    fn default() -> Self {
        AdvisoryLockOptions {
            lease_duration: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
            renew_interval: Duration::from_secs(10),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_millis(duration: Duration) -> i64 {
    duration.as_millis().min(i64::MAX as u128) as i64
}

impl<A: DatabaseAdapter> Repository<A> {
    /// Take the named lock. Fails with `Conflict` if any row exists for the
    /// name, even an expired one; run the sweep to free those first.
    pub fn acquire_advisory_lock(
        &self,
        name: &str,
        lease_duration: Duration,
    ) -> Result<AdvisoryLock> {
        with_root_transaction(&self.adapter, |ctx| {
            let held = ctx.query_opt(
                "SELECT handle FROM advisory_locks WHERE name = ?1",
                &[SqlValue::text(name)],
            )?;
            if held.is_some() {
                return Err(RepositoryError::conflict(name, "lock is already held"));
            }
            let handle = next_sequence(ctx, LOCK_HANDLE_SEQUENCE)?;
            let now = now_millis();
            let lease = duration_millis(lease_duration);
            ctx.execute(
                "INSERT INTO advisory_locks (name, handle, acquired_at, renewed_at, lease_duration)
                 VALUES (?1, ?2, ?3, ?3, ?4)",
                &[
                    SqlValue::text(name),
                    SqlValue::Integer(handle),
                    SqlValue::Integer(now),
                    SqlValue::Integer(lease),
                ],
            )?;
            Ok(AdvisoryLock {
                name: name.to_string(),
                handle,
                acquired_at: now,
                renewed_at: now,
                lease_duration,
            })
        })
    }

    /// Extend the lease. A stale handle can never renew a lock it no longer
    /// owns; that is `NotFound`.
    pub fn renew_advisory_lock(&self, name: &str, handle: i64) -> Result<i64> {
        let now = now_millis();
        let updated = self.adapter.execute(
            "UPDATE advisory_locks SET renewed_at = ?1 WHERE name = ?2 AND handle = ?3",
            &[
                SqlValue::Integer(now),
                SqlValue::text(name),
                SqlValue::Integer(handle),
            ],
        )?;
        if updated == 0 {
            return Err(RepositoryError::not_found(format!(
                "lock '{name}' with handle {handle}"
            )));
        }
        Ok(now)
    }

    pub fn release_advisory_lock(&self, name: &str, handle: i64) -> Result<()> {
        let deleted = self.adapter.execute(
            "DELETE FROM advisory_locks WHERE name = ?1 AND handle = ?2",
            &[SqlValue::text(name), SqlValue::Integer(handle)],
        )?;
        if deleted == 0 {
            return Err(RepositoryError::not_found(format!(
                "lock '{name}' with handle {handle}"
            )));
        }
        Ok(())
    }

    /// Delete every expired lock row. Hosts call this from a poll loop.
    pub fn sweep_expired_locks(&self) -> Result<usize> {
        self.adapter.execute(
            "DELETE FROM advisory_locks WHERE renewed_at + lease_duration < ?1",
            &[SqlValue::Integer(now_millis())],
        )
    }

    /// Run `f` under the named lock.
    ///
    /// Acquisition is polled (sweeping expired rows between attempts) until
    /// it succeeds; while `f` runs, a scoped thread renews the lease at the
    /// configured interval; the lock is always released on exit, success or
    /// failure.
    ///
    /// Renewal and release are single statements. If another thread holds an
    /// open root transaction on the same adapter and rolls it back, a renew
    /// or release landing inside that transaction is undone with it; the
    /// lock then frees through lease expiry plus the sweep rather than
    /// immediately.
    pub fn with_advisory_lock<T>(
        &self,
        name: &str,
        options: &AdvisoryLockOptions,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T>
    where
        A: Sync,
    {
        let lock = loop {
            match self.acquire_advisory_lock(name, options.lease_duration) {
                Ok(lock) => break lock,
                Err(RepositoryError::Conflict { .. }) => {
                    self.sweep_expired_locks()?;
                    thread::sleep(options.poll_interval);
                }
                Err(err) => return Err(err),
            }
        };

        let done = AtomicBool::new(false);
        let result = thread::scope(|scope| {
            scope.spawn(|| {
                // Sleep in short slices so the thread notices `done` quickly
                // even with a long renew interval.
                let slice = Duration::from_millis(25).min(options.renew_interval);
                let mut since_renew = Duration::ZERO;
                while !done.load(Ordering::Acquire) {
                    thread::sleep(slice);
                    since_renew += slice;
                    if since_renew >= options.renew_interval {
                        since_renew = Duration::ZERO;
                        if let Err(err) = self.renew_advisory_lock(name, lock.handle) {
                            log::warn!("renewing advisory lock '{name}' failed: {err}");
                            break;
                        }
                    }
                }
            });
            let result = f();
            done.store(true, Ordering::Release);
            result
        });

        if let Err(err) = self.release_advisory_lock(name, lock.handle) {
            log::warn!("releasing advisory lock '{name}' failed: {err}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteAdapter;

    fn repo() -> Repository<SqliteAdapter> {
        Repository::new(SqliteAdapter::open_in_memory().unwrap()).unwrap()
    }

    #[test]
    fn test_second_acquire_conflicts_until_release() {
        let repo = repo();
        let lock = repo
            .acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap();

        let err = repo
            .acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));

        // Other names are unaffected.
        repo.acquire_advisory_lock("y", Duration::from_secs(1))
            .unwrap();

        repo.release_advisory_lock("x", lock.handle).unwrap();
        repo.acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_expired_lock_needs_the_sweep() {
        let repo = repo();
        repo.acquire_advisory_lock("x", Duration::from_millis(20))
            .unwrap();
        std::thread::sleep(Duration::from_millis(60));

        // Expired but not swept: still a conflict.
        let err = repo
            .acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));

        assert_eq!(repo.sweep_expired_locks().unwrap(), 1);
        repo.acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_renew_keeps_the_lease_alive() {
        let repo = repo();
        let lock = repo
            .acquire_advisory_lock("x", Duration::from_millis(200))
            .unwrap();
        std::thread::sleep(Duration::from_millis(120));
        repo.renew_advisory_lock("x", lock.handle).unwrap();
        std::thread::sleep(Duration::from_millis(120));

        // The renewed lease has not run out yet.
        assert_eq!(repo.sweep_expired_locks().unwrap(), 0);
        assert!(repo
            .acquire_advisory_lock("x", Duration::from_secs(1))
            .is_err());
    }

    #[test]
    fn test_stale_handle_cannot_renew_or_release() {
        let repo = repo();
        let lock = repo
            .acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap();

        assert!(matches!(
            repo.renew_advisory_lock("x", lock.handle + 1),
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(
            repo.release_advisory_lock("x", lock.handle + 1),
            Err(RepositoryError::NotFound(_))
        ));
        assert!(matches!(
            repo.release_advisory_lock("unknown", lock.handle),
            Err(RepositoryError::NotFound(_))
        ));

        repo.release_advisory_lock("x", lock.handle).unwrap();
    }

    #[test]
    fn test_with_advisory_lock_always_releases() {
        let repo = repo();
        let options = AdvisoryLockOptions {
            poll_interval: Duration::from_millis(10),
            ..AdvisoryLockOptions::default()
        };

        let value = repo.with_advisory_lock("x", &options, || Ok(7)).unwrap();
        assert_eq!(value, 7);

        let err: Result<()> = repo.with_advisory_lock("x", &options, || {
            Err(RepositoryError::generic("boom"))
        });
        assert!(err.is_err());

        // Released both times, so a plain acquire goes through.
        repo.acquire_advisory_lock("x", Duration::from_secs(1))
            .unwrap();
    }

    #[test]
    fn test_with_advisory_lock_serializes_sections() {
        let repo = repo();
        let options = AdvisoryLockOptions {
            poll_interval: Duration::from_millis(5),
            ..AdvisoryLockOptions::default()
        };
        let order = std::sync::Mutex::new(Vec::new());

        thread::scope(|scope| {
            scope.spawn(|| {
                repo.with_advisory_lock("x", &options, || {
                    order.lock().unwrap().push("a-start");
                    thread::sleep(Duration::from_millis(80));
                    order.lock().unwrap().push("a-end");
                    Ok(())
                })
                .unwrap();
            });
            thread::sleep(Duration::from_millis(20));
            scope.spawn(|| {
                repo.with_advisory_lock("x", &options, || {
                    order.lock().unwrap().push("b");
                    Ok(())
                })
                .unwrap();
            });
        });

        assert_eq!(
            order.into_inner().unwrap(),
            vec!["a-start", "a-end", "b"]
        );
    }
}
