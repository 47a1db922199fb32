//! Migration critical sections.
//!
//! Writers hold a shared barrier permit for the duration of one write. A
//! migration enters its critical section by taking the barrier exclusively
//! (draining in-flight writes), publishing the blocked range and releasing
//! the barrier. From then on writers touching the range wait, bounded by a
//! timeout, until the section's guard is dropped.

use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::watch;
use tokio::sync::OwnedRwLockReadGuard;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::info;

use crate::time::elapsed_ms;
use crate::ChunkRange;
use crate::MigrationError;
use crate::Result;
use crate::ShardKey;
use crate::CRITICAL_SECTION_DURATION_MS;

#[derive(Debug)]
struct ActiveSection {
    range: ChunkRange,
    released: watch::Sender<bool>,
}

/// Held by a writer while it checks versions and applies its write.
pub type WritePermit = OwnedRwLockReadGuard<()>;

#[derive(Debug)]
pub struct CriticalSections {
    barriers: DashMap<String, Arc<RwLock<()>>>,
    active: Arc<DashMap<String, Arc<ActiveSection>>>,
    timeout: Duration,
}

impl CriticalSections {
    pub fn new(timeout: Duration) -> Self {
        Self {
            barriers: DashMap::new(),
            active: Arc::new(DashMap::new()),
            timeout,
        }
    }

    fn barrier(
        &self,
        namespace: &str,
    ) -> Arc<RwLock<()>> {
        self.barriers
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Section blocking any of `keys`; `None` keys means the whole namespace.
    fn blocking(
        &self,
        namespace: &str,
        keys: Option<&[&ShardKey]>,
    ) -> Option<Arc<ActiveSection>> {
        let section = self.active.get(namespace)?.clone();
        let blocked = match keys {
            None => true,
            Some(keys) => keys.iter().any(|k| section.range.contains(k)),
        };
        blocked.then_some(section)
    }

    pub fn is_blocked(
        &self,
        namespace: &str,
        key: &ShardKey,
    ) -> bool {
        self.blocking(namespace, Some(&[key])).is_some()
    }

    /// Waits out any section covering `keys` and returns a write permit.
    pub async fn write_permit(
        &self,
        namespace: &str,
        keys: Option<&[&ShardKey]>,
    ) -> Result<WritePermit> {
        let deadline = Instant::now() + self.timeout;
        let barrier = self.barrier(namespace);
        loop {
            let permit = barrier.clone().read_owned().await;
            let Some(section) = self.blocking(namespace, keys) else {
                return Ok(permit);
            };
            drop(permit);

            let mut released = section.released.subscribe();
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!("write to {} waits for critical section {}", namespace, section.range);
            let timed_out = tokio::time::timeout(remaining, released.wait_for(|done| *done))
                .await
                .is_err();
            if timed_out {
                return Err(MigrationError::CriticalSectionTimeout {
                    namespace: namespace.to_string(),
                }
                .into());
            }
        }
    }

    /// Permit that ignores active sections; used to finish transactions that
    /// already hold their locks.
    pub async fn barrier_permit(
        &self,
        namespace: &str,
    ) -> WritePermit {
        self.barrier(namespace).read_owned().await
    }

    /// Blocks writes to `range` until the returned guard is dropped.
    pub async fn enter(
        &self,
        namespace: &str,
        range: ChunkRange,
    ) -> CriticalSectionGuard {
        let barrier = self.barrier(namespace);
        let exclusive = barrier.write().await;
        let (released, _) = watch::channel(false);
        self.active.insert(
            namespace.to_string(),
            Arc::new(ActiveSection {
                range: range.clone(),
                released,
            }),
        );
        drop(exclusive);
        info!("entered critical section for {} {}", namespace, range);

        CriticalSectionGuard {
            active: self.active.clone(),
            namespace: namespace.to_string(),
            entered_at: Instant::now(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Releases the section on drop, on every exit path of the migration.
#[derive(Debug)]
pub struct CriticalSectionGuard {
    active: Arc<DashMap<String, Arc<ActiveSection>>>,
    namespace: String,
    entered_at: Instant,
}

impl Drop for CriticalSectionGuard {
    fn drop(&mut self) {
        if let Some((_, section)) = self.active.remove(&self.namespace) {
            section.released.send_replace(true);
        }
        let elapsed = elapsed_ms(self.entered_at);
        CRITICAL_SECTION_DURATION_MS.observe(elapsed);
        info!(
            "left critical section for {} after {:.1}ms",
            self.namespace, elapsed
        );
    }
}
