use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{Task, UnknownVariant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKeyPolicy {
    TaskId,
    SourceUrl,
}

impl LockKeyPolicy {
    pub fn key_for(&self, task: &Task) -> String {
        match self {
            Self::TaskId => format!("task:{}", task.id),
            Self::SourceUrl => format!("source:{}", task.source_url.trim()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskId => "task_id",
            Self::SourceUrl => "source_url",
        }
    }
}

impl fmt::Display for LockKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockKeyPolicy {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "task_id" | "task" => Ok(Self::TaskId),
            "source_url" | "url" => Ok(Self::SourceUrl),
            _ => Err(UnknownVariant::new("lock key policy", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: Uuid,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Debug)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct DedupLock {
    ttl: Duration,
    holders: Mutex<HashMap<String, Holder>>,
}

impl DedupLock {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            holders: Mutex::new(HashMap::new()),
        }
    }

    pub async fn try_acquire(&self, key: &str) -> Option<Lease> {
        let now = Instant::now();
        let mut holders = self.holders.lock().await;

        if let Some(holder) = holders.get(key) {
            if holder.expires_at > now {
                debug!(key, "Dedup lock busy");
                return None;
            }
            warn!(key, "Reclaiming expired dedup lock");
        }

        let token = Uuid::new_v4();
        holders.insert(
            key.to_string(),
            Holder {
                token,
                expires_at: now + self.ttl,
            },
        );
        Some(Lease {
            key: key.to_string(),
            token,
        })
    }

    pub async fn release(&self, lease: &Lease) -> bool {
        let mut holders = self.holders.lock().await;
        match holders.get(&lease.key) {
            Some(holder) if holder.token == lease.token => {
                holders.remove(&lease.key);
                true
            }
            _ => {
                warn!(key = %lease.key, "Dedup lock lease was no longer held at release");
                false
            }
        }
    }

    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut holders = self.holders.lock().await;
        let before = holders.len();
        holders.retain(|_, holder| holder.expires_at > now);
        before - holders.len()
    }

    #[cfg(test)]
    async fn is_held(&self, key: &str) -> bool {
        let holders = self.holders.lock().await;
        holders
            .get(key)
            .map(|holder| holder.expires_at > Instant::now())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::models::ResolutionRequest;

    #[tokio::test]
    async fn concurrent_acquire_grants_exactly_one() {
        let lock = Arc::new(DedupLock::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            handles.push(tokio::spawn(async move { lock.try_acquire("task:a").await }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn release_allows_reacquire() {
        let lock = DedupLock::new(Duration::from_secs(60));
        let lease = lock.try_acquire("k").await.unwrap();
        assert!(lock.try_acquire("k").await.is_none());
        assert!(lock.release(&lease).await);
        assert!(!lock.is_held("k").await);
        assert!(lock.try_acquire("k").await.is_some());
    }

    #[tokio::test]
    async fn independent_keys_do_not_contend() {
        let lock = DedupLock::new(Duration::from_secs(60));
        assert!(lock.try_acquire("a").await.is_some());
        assert!(lock.try_acquire("b").await.is_some());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_and_stale_release_is_ignored() {
        let lock = DedupLock::new(Duration::from_millis(20));
        let stale = lock.try_acquire("k").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let fresh = lock.try_acquire("k").await.expect("expired lock reclaimed");
        assert!(!lock.release(&stale).await);
        assert!(lock.is_held("k").await);
        assert!(lock.release(&fresh).await);
    }

    #[tokio::test]
    async fn purge_drops_only_expired_leases() {
        let lock = DedupLock::new(Duration::from_millis(20));
        lock.try_acquire("old").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(lock.purge_expired().await, 1);
        assert!(!lock.is_held("old").await);
    }

    #[test]
    fn key_policy_derives_keys_from_task_identity() {
        let a = Task::new("https://v/1", ResolutionRequest::HighestAvailable, true);
        let b = Task::new("https://v/1", ResolutionRequest::LowestAvailable, false);
        assert_ne!(LockKeyPolicy::TaskId.key_for(&a), LockKeyPolicy::TaskId.key_for(&b));
        assert_eq!(
            LockKeyPolicy::SourceUrl.key_for(&a),
            LockKeyPolicy::SourceUrl.key_for(&b)
        );
        assert_eq!("source_url".parse::<LockKeyPolicy>().unwrap(), LockKeyPolicy::SourceUrl);
        assert!("global".parse::<LockKeyPolicy>().is_err());
    }
}
