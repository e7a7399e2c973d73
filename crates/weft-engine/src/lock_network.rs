use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

use weft_core::error::{Result, WeftError};
use weft_core::types::InputUid;

/// Something an invocation can hold exclusively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A named shared resource declared by an implementation.
    Resource(String),
    /// One Input whose definition is marked `lock`.
    Input(InputUid),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Resource(name) => write!(f, "resource:{}", name),
            LockKey::Input(uid) => write!(f, "input:{}", uid),
        }
    }
}

#[derive(Default)]
struct LockEntry {
    mutex: Arc<AsyncMutex<()>>,
    holder: Option<String>,
    waiting: usize,
}

type LockTable = Arc<Mutex<HashMap<LockKey, LockEntry>>>;

/// Mutual exclusion over resource keys and lockable Inputs.
///
/// Keys are always taken in one global order: resource keys by their rank
/// in the configured `lock_order` (lexicographic when none is given), then
/// Input keys by uid. Acquisition suspends until every key is free.
pub struct LockNetwork {
    order: Vec<String>,
    table: LockTable,
}

impl LockNetwork {
    pub fn new(order: Vec<String>) -> Self {
        Self {
            order,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check that declared resource keys can be totally ordered. Run before
    /// a flow starts.
    pub fn validate<'a>(&self, keys: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let mut ranked: BTreeSet<&str> = BTreeSet::new();
        for key in &self.order {
            if !ranked.insert(key.as_str()) {
                return Err(WeftError::DeadlockRisk(format!(
                    "lock_order lists '{}' more than once",
                    key
                )));
            }
        }
        for key in keys {
            if key.trim().is_empty() {
                return Err(WeftError::DeadlockRisk(
                    "empty lock resource key".to_string(),
                ));
            }
            if !self.order.is_empty() && !ranked.contains(key) {
                return Err(WeftError::DeadlockRisk(format!(
                    "lock resource '{}' is missing from lock_order",
                    key
                )));
            }
        }
        Ok(())
    }

    fn rank(&self, key: &LockKey) -> (u8, usize, String) {
        match key {
            LockKey::Resource(name) => {
                let position = self
                    .order
                    .iter()
                    .position(|k| k == name)
                    .unwrap_or(usize::MAX);
                (0, position, name.clone())
            }
            LockKey::Input(uid) => (1, 0, uid.as_str().to_string()),
        }
    }

    /// Sort and dedup keys into acquisition order.
    pub fn ordered(&self, keys: impl IntoIterator<Item = LockKey>) -> Vec<LockKey> {
        let mut keys: Vec<LockKey> = keys.into_iter().collect();
        keys.sort_by_cached_key(|k| self.rank(k));
        keys.dedup();
        keys
    }

    /// Acquire every key for `holder`, suspending until all are held.
    ///
    /// The handle exists from the start, so keys already taken are released
    /// if this future is dropped while waiting on a later one.
    pub async fn acquire(
        &self,
        holder: &str,
        keys: impl IntoIterator<Item = LockKey>,
    ) -> LockHandle {
        let keys = self.ordered(keys);
        let mut handle = LockHandle {
            table: self.table.clone(),
            holder: holder.to_string(),
            guards: Vec::with_capacity(keys.len()),
            keys,
        };
        for index in 0..handle.keys.len() {
            let key = handle.keys[index].clone();
            let mutex = {
                let mut table = self.table.lock();
                let entry = table.entry(key.clone()).or_default();
                entry.waiting += 1;
                entry.mutex.clone()
            };
            let waiting = Waiting {
                table: &self.table,
                key: &key,
            };
            trace!(key = %key, holder, "Waiting for lock");
            let guard = mutex.lock_owned().await;
            drop(waiting);
            if let Some(entry) = self.table.lock().get_mut(&key) {
                entry.holder = Some(holder.to_string());
            }
            handle.guards.push(guard);
        }
        if !handle.keys.is_empty() {
            debug!(holder, keys = handle.keys.len(), "Locks acquired");
        }
        handle
    }

    /// Release every key of a handle. Dropping the handle does the same.
    pub fn release(&self, handle: LockHandle) {
        drop(handle);
    }

    /// Current holder of a key.
    pub fn holder(&self, key: &LockKey) -> Option<String> {
        self.table.lock().get(key).and_then(|e| e.holder.clone())
    }

    /// Invocations suspended on a key.
    pub fn waiting(&self, key: &LockKey) -> usize {
        self.table.lock().get(key).map(|e| e.waiting).unwrap_or(0)
    }

    pub fn is_locked(&self, key: &LockKey) -> bool {
        self.holder(key).is_some()
    }

    /// Keys currently tracked in the table.
    pub fn tracked(&self) -> usize {
        self.table.lock().len()
    }
}

/// Undoes a waiter registration, including when the acquiring future is
/// dropped mid-wait.
struct Waiting<'a> {
    table: &'a LockTable,
    key: &'a LockKey,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.table.lock().get_mut(self.key) {
            entry.waiting = entry.waiting.saturating_sub(1);
        }
    }
}

/// Keys held by one invocation, released on drop.
pub struct LockHandle {
    table: LockTable,
    holder: String,
    keys: Vec<LockKey>,
    guards: Vec<OwnedMutexGuard<()>>,
}

impl LockHandle {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        // Clear ownership before unlocking so a new holder is never
        // overwritten.
        for key in &self.keys {
            if let Some(entry) = table.get_mut(key) {
                if entry.holder.as_deref() == Some(self.holder.as_str()) {
                    entry.holder = None;
                }
            }
        }
        self.guards.clear();
        for key in &self.keys {
            let idle = table
                .get(key)
                .is_some_and(|e| e.waiting == 0 && Arc::strong_count(&e.mutex) == 1);
            if idle {
                table.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use weft_test_utils::ConcurrencyProbe;

    fn resource(name: &str) -> LockKey {
        LockKey::Resource(name.to_string())
    }

    #[test]
    fn test_ordering_rank_then_inputs() {
        let net = LockNetwork::new(vec!["z".into(), "a".into()]);
        let ordered = net.ordered([
            LockKey::Input(InputUid::from("u1")),
            resource("a"),
            resource("z"),
            resource("a"),
        ]);
        assert_eq!(
            ordered,
            vec![resource("z"), resource("a"), LockKey::Input(InputUid::from("u1"))]
        );

        let lexical = LockNetwork::new(vec![]);
        assert_eq!(
            lexical.ordered([resource("b"), resource("a")]),
            vec![resource("a"), resource("b")]
        );
    }

    #[test]
    fn test_validate() {
        let net = LockNetwork::new(vec!["store".into()]);
        assert!(net.validate(["store"]).is_ok());
        assert!(matches!(
            net.validate(["models"]),
            Err(WeftError::DeadlockRisk(_))
        ));
        assert!(matches!(
            LockNetwork::new(vec![]).validate([""]),
            Err(WeftError::DeadlockRisk(_))
        ));
        assert!(matches!(
            LockNetwork::new(vec!["a".into(), "a".into()]).validate(Vec::<&str>::new()),
            Err(WeftError::DeadlockRisk(_))
        ));
    }

    #[tokio::test]
    async fn test_holder_and_release() {
        let net = LockNetwork::new(vec![]);
        let handle = net.acquire("op-1", [resource("store")]).await;
        assert_eq!(net.holder(&resource("store")).as_deref(), Some("op-1"));
        assert_eq!(handle.keys(), &[resource("store")]);

        net.release(handle);
        assert!(!net.is_locked(&resource("store")));
        assert_eq!(net.waiting(&resource("store")), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let net = Arc::new(LockNetwork::new(vec![]));
        let probe = ConcurrencyProbe::new();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let net = net.clone();
            let probe = probe.clone();
            tasks.push(tokio::spawn(async move {
                let _handle = net
                    .acquire(&format!("op-{}", i), [resource("store"), resource("models")])
                    .await;
                let _in = probe.enter();
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(probe.peak(), 1);
        assert!(!net.is_locked(&resource("store")));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_disjoint_keys_run_concurrently() {
        let net = Arc::new(LockNetwork::new(vec![]));
        let probe = ConcurrencyProbe::new();
        let mut tasks = Vec::new();
        for i in 0..2 {
            let net = net.clone();
            let probe = probe.clone();
            tasks.push(tokio::spawn(async move {
                let _handle = net.acquire("op", [resource(&format!("r{}", i))]).await;
                let _in = probe.enter();
                tokio::time::sleep(Duration::from_millis(50)).await;
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(probe.peak(), 2);
    }

    #[tokio::test]
    async fn test_waiting_count() {
        let net = Arc::new(LockNetwork::new(vec![]));
        let first = net.acquire("first", [resource("store")]).await;

        let waiter = {
            let net = net.clone();
            tokio::spawn(async move {
                let _h = net.acquire("second", [resource("store")]).await;
            })
        };
        while net.waiting(&resource("store")) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(net.waiting(&resource("store")), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(net.waiting(&resource("store")), 0);
    }

    #[tokio::test]
    async fn test_abandoned_acquire_releases_partial_keys() {
        let net = Arc::new(LockNetwork::new(vec![]));
        let first = net.acquire("first", [resource("b")]).await;

        let second = {
            let net = net.clone();
            tokio::spawn(async move {
                let _h = net.acquire("second", [resource("a"), resource("b")]).await;
            })
        };
        while net.waiting(&resource("b")) == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(net.holder(&resource("a")).as_deref(), Some("second"));

        second.abort();
        assert!(second.await.unwrap_err().is_cancelled());
        assert!(!net.is_locked(&resource("a")));
        assert_eq!(net.waiting(&resource("b")), 0);
        assert_eq!(net.holder(&resource("b")).as_deref(), Some("first"));

        drop(first);
        assert!(!net.is_locked(&resource("b")));
        assert_eq!(net.tracked(), 0);
    }
}
