//! Purpose: Reference-counted lifecycle tracking for resources shared by proxy handles.
//! Exports: `Manager`, `WeakManager`, `ProxyHandle`, `Identity`, `OpenHandle`, `ShutdownGuard`,
//! `TeardownFn`.
//! Role: Every engine-produced schema and record is registered here and torn down through it.
//! Invariants: Teardown runs at most once per identity, outside the table lock.
//! Invariants: A torn-down identity is tombstoned and never becomes live again.
//! Invariants: Every id below the issue watermark that is neither live nor forgotten is released;
//! explicit tombstones are kept only for ids supplied from outside that range.
//! Invariants: Externally owned identities are forgotten at zero proxies, not torn down.
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::core::error::{Error, ErrorKind};

/// Opaque key for one managed resource.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Identity(u64);

impl Identity {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type TeardownFn = Box<dyn FnOnce() -> Result<(), Error> + Send>;

type Payload = Arc<dyn Any + Send + Sync>;

/// An external handle (file, socket) that must be closed at shutdown.
pub trait OpenHandle: Send {
    fn label(&self) -> &str;
    fn close(&mut self) -> Result<(), Error>;
}

struct Entry {
    proxies: usize,
    external: bool,
    payload: Option<Payload>,
    teardown: Option<TeardownFn>,
}

impl Entry {
    fn new() -> Self {
        Self {
            proxies: 0,
            external: false,
            payload: None,
            teardown: None,
        }
    }
}

#[derive(Default)]
struct IdentityTable {
    live: HashMap<Identity, Entry>,
    /// Released ids at or above the watermark when they were torn down.
    released: HashSet<Identity>,
    /// Externally owned ids dropped to zero proxies, kept for their owner's `destroy`.
    forgotten: HashMap<Identity, Entry>,
}

struct Inner {
    identities: Mutex<IdentityTable>,
    open: Mutex<Vec<Box<dyn OpenHandle>>>,
    next_id: AtomicU64,
    shut_down: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn released_error(identity: Identity) -> Error {
    tracing::error!(%identity, "use of released resource");
    Error::new(ErrorKind::Released)
        .with_message(format!("resource {identity} was already released"))
        .with_hint("a proxy outlived its resource; check release ordering")
}

fn run_teardown(identity: Identity, teardown: Option<TeardownFn>) {
    tracing::debug!(%identity, "tearing down");
    if let Some(teardown) = teardown {
        if let Err(err) = teardown() {
            tracing::warn!(%identity, error = %err, "teardown failed");
        }
    }
}

/// Shared handle to the process-wide resource tables.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<Inner>,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("live", &self.live_count())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Manager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                identities: Mutex::new(IdentityTable::default()),
                open: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Non-owning reference for teardown callbacks that need the manager.
    pub fn downgrade(&self) -> WeakManager {
        WeakManager {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Called with the identity lock held so a concurrent `shutdown` cannot interleave.
    fn ensure_running(&self) -> Result<(), Error> {
        if self.is_shut_down() {
            return Err(Error::new(ErrorKind::Usage).with_message("manager has been shut down"));
        }
        Ok(())
    }

    fn below_watermark(&self, identity: Identity) -> bool {
        (1..self.inner.next_id.load(Ordering::SeqCst)).contains(&identity.0)
    }

    fn is_tombstoned(&self, table: &IdentityTable, identity: Identity) -> bool {
        if table.live.contains_key(&identity) || table.forgotten.contains_key(&identity) {
            return false;
        }
        table.released.contains(&identity) || self.below_watermark(identity)
    }

    /// Creates the identity (count 1) or adds a proxy to a live one.
    pub fn register(&self, identity: Identity) -> Result<ProxyHandle, Error> {
        let mut table = lock(&self.inner.identities);
        self.ensure_running()?;
        if self.is_tombstoned(&table, identity) {
            return Err(released_error(identity));
        }
        let revived = table.forgotten.remove(&identity);
        let entry = table
            .live
            .entry(identity)
            .or_insert_with(|| revived.unwrap_or_else(Entry::new));
        entry.proxies += 1;
        tracing::debug!(%identity, proxies = entry.proxies, "registered proxy");
        Ok(ProxyHandle::new(self.clone(), identity))
    }

    /// Registers `value` under a fresh identity.
    pub fn manage<T: Any + Send + Sync>(&self, value: T) -> Result<ProxyHandle, Error> {
        self.manage_inner(Arc::new(value), None)
    }

    /// Like `manage`, running `teardown` when the last manager-owned proxy goes.
    pub fn manage_with<T, F>(&self, value: T, teardown: F) -> Result<ProxyHandle, Error>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        self.manage_inner(Arc::new(value), Some(Box::new(teardown)))
    }

    fn manage_inner(
        &self,
        payload: Payload,
        teardown: Option<TeardownFn>,
    ) -> Result<ProxyHandle, Error> {
        let mut table = lock(&self.inner.identities);
        self.ensure_running()?;
        let identity = loop {
            let candidate = Identity(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
            if table.live.contains_key(&candidate) || table.forgotten.contains_key(&candidate) {
                continue;
            }
            // Now below the watermark, which covers it.
            if table.released.remove(&candidate) {
                continue;
            }
            break candidate;
        };
        table.live.insert(
            identity,
            Entry {
                proxies: 1,
                external: false,
                payload: Some(payload),
                teardown,
            },
        );
        tracing::debug!(%identity, "managing new resource");
        Ok(ProxyHandle::new(self.clone(), identity))
    }

    /// Attaches a teardown callback to a live identity, replacing any previous one.
    pub fn adopt(&self, identity: Identity, teardown: TeardownFn) -> Result<(), Error> {
        let mut table = lock(&self.inner.identities);
        if self.is_tombstoned(&table, identity) {
            return Err(released_error(identity));
        }
        let entry = table.live.get_mut(&identity).ok_or_else(|| not_live(identity))?;
        entry.teardown = Some(teardown);
        Ok(())
    }

    pub fn release(&self, handle: ProxyHandle) -> Result<bool, Error> {
        handle.release()
    }

    /// Drops one proxy count; returns whether the resource was torn down.
    ///
    /// Releasing a released identity is a no-op.
    pub fn release_identity(&self, identity: Identity) -> Result<bool, Error> {
        let mut table = lock(&self.inner.identities);
        if self.is_tombstoned(&table, identity) {
            return Ok(false);
        }
        let Some(entry) = table.live.get_mut(&identity) else {
            if self.is_shut_down() {
                return Ok(false);
            }
            return Err(not_live(identity));
        };
        entry.proxies = entry.proxies.saturating_sub(1);
        if entry.proxies > 0 {
            tracing::debug!(%identity, proxies = entry.proxies, "released proxy");
            return Ok(false);
        }
        let external = entry.external;
        let Some(entry) = table.live.remove(&identity) else {
            return Ok(false);
        };
        if external {
            tracing::debug!(%identity, "forgetting externally owned resource");
            table.forgotten.insert(identity, entry);
            return Ok(false);
        }
        if !self.below_watermark(identity) {
            table.released.insert(identity);
        }
        drop(table);
        run_teardown(identity, entry.teardown);
        Ok(true)
    }

    /// Marks whether some other party is responsible for tearing `identity` down.
    pub fn set_externally_owned(&self, identity: Identity, external: bool) -> Result<(), Error> {
        let mut table = lock(&self.inner.identities);
        if self.is_tombstoned(&table, identity) {
            return Err(released_error(identity));
        }
        let entry = table.live.get_mut(&identity).ok_or_else(|| not_live(identity))?;
        entry.external = external;
        tracing::debug!(%identity, external, "ownership changed");
        Ok(())
    }

    /// Direct teardown by the owning party. Outstanding proxies become stale.
    ///
    /// Returns `Ok(false)` when the identity was already released.
    pub fn destroy(&self, identity: Identity) -> Result<bool, Error> {
        let mut table = lock(&self.inner.identities);
        if self.is_tombstoned(&table, identity) {
            return Ok(false);
        }
        if !self.below_watermark(identity) {
            table.released.insert(identity);
        }
        let entry = table
            .live
            .remove(&identity)
            .or_else(|| table.forgotten.remove(&identity));
        drop(table);
        run_teardown(identity, entry.and_then(|entry| entry.teardown));
        Ok(true)
    }

    fn payload(&self, identity: Identity) -> Result<Payload, Error> {
        let table = lock(&self.inner.identities);
        if self.is_tombstoned(&table, identity) {
            return Err(released_error(identity));
        }
        match table.live.get(&identity) {
            Some(entry) => entry.payload.clone().ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message(format!("resource {identity} carries no payload"))
            }),
            None if self.is_shut_down() => Err(released_error(identity)),
            None => Err(not_live(identity)),
        }
    }

    /// Typed payload of a live identity.
    pub fn get<T: Any + Send + Sync>(&self, identity: Identity) -> Result<Arc<T>, Error> {
        self.payload(identity)?.downcast::<T>().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message(format!(
                "resource {identity} does not hold a {}",
                std::any::type_name::<T>()
            ))
        })
    }

    pub fn track_open_handle(&self, handle: Box<dyn OpenHandle>) {
        tracing::debug!(label = handle.label(), "tracking open handle");
        lock(&self.inner.open).push(handle);
    }

    /// Closes every tracked handle, logging and skipping failures.
    pub fn close_all_tracked(&self) -> usize {
        let handles = std::mem::take(&mut *lock(&self.inner.open));
        let mut closed = 0;
        for mut handle in handles {
            match handle.close() {
                Ok(()) => closed += 1,
                Err(err) => {
                    tracing::warn!(label = handle.label(), error = %err, "failed to close handle");
                }
            }
        }
        closed
    }

    /// Tears down everything still tracked. Later calls do nothing.
    pub fn shutdown(&self) {
        let mut table = lock(&self.inner.identities);
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut identities: Vec<Identity> = table.live.keys().copied().collect();
        identities.sort();
        let mut teardowns = Vec::new();
        for identity in identities {
            let Some(entry) = table.live.remove(&identity) else {
                continue;
            };
            if entry.external {
                tracing::debug!(%identity, "leaving externally owned resource to its owner");
            } else {
                teardowns.push((identity, entry.teardown));
            }
        }
        table.released.clear();
        table.forgotten.clear();
        drop(table);
        let count = teardowns.len();
        for (identity, teardown) in teardowns {
            run_teardown(identity, teardown);
        }
        let closed = self.close_all_tracked();
        tracing::debug!(torn_down = count, closed, "manager shut down");
    }

    pub fn shutdown_guard(&self) -> ShutdownGuard {
        ShutdownGuard {
            manager: self.clone(),
        }
    }

    pub fn proxy_count(&self, identity: Identity) -> Option<usize> {
        lock(&self.inner.identities)
            .live
            .get(&identity)
            .map(|entry| entry.proxies)
    }

    pub fn is_live(&self, identity: Identity) -> bool {
        lock(&self.inner.identities).live.contains_key(&identity)
    }

    pub fn is_released(&self, identity: Identity) -> bool {
        let table = lock(&self.inner.identities);
        self.is_tombstoned(&table, identity)
    }

    /// Identities remembered outside the live set: explicit tombstones plus forgotten ids.
    pub fn tombstone_count(&self) -> usize {
        let table = lock(&self.inner.identities);
        table.released.len() + table.forgotten.len()
    }

    pub fn live_count(&self) -> usize {
        lock(&self.inner.identities).live.len()
    }
}

fn not_live(identity: Identity) -> Error {
    Error::new(ErrorKind::NotFound).with_message(format!("resource {identity} is not tracked"))
}

/// One counted reference to a managed identity; dropping it releases the count.
pub struct ProxyHandle {
    manager: Manager,
    identity: Identity,
    active: bool,
}

impl ProxyHandle {
    fn new(manager: Manager, identity: Identity) -> Self {
        Self {
            manager,
            identity,
            active: true,
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Another proxy for the same identity.
    pub fn try_clone(&self) -> Result<ProxyHandle, Error> {
        self.manager.register(self.identity)
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, Error> {
        self.manager.get(self.identity)
    }

    /// Releases this proxy now; returns whether the resource was torn down.
    pub fn release(mut self) -> Result<bool, Error> {
        self.active = false;
        self.manager.release_identity(self.identity)
    }

    /// Gives up RAII release; the count stays held until `release_identity`.
    pub fn into_identity(mut self) -> Identity {
        self.active = false;
        self.identity
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("identity", &self.identity)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Err(err) = self.manager.release_identity(self.identity) {
            tracing::debug!(identity = %self.identity, error = %err, "release on drop failed");
        }
    }
}

#[derive(Clone)]
pub struct WeakManager {
    inner: Weak<Inner>,
}

impl WeakManager {
    pub fn upgrade(&self) -> Option<Manager> {
        self.inner.upgrade().map(|inner| Manager { inner })
    }
}

/// Calls `Manager::shutdown` when dropped.
#[derive(Debug)]
pub struct ShutdownGuard {
    manager: Manager,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        self.manager.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{Identity, Manager, OpenHandle};
    use crate::core::error::{Error, ErrorKind};

    fn counter_teardown(
        counter: &Arc<AtomicUsize>,
    ) -> Box<dyn FnOnce() -> Result<(), Error> + Send> {
        let counter = Arc::clone(counter);
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    struct FakeFile {
        label: String,
        fail: bool,
        closed: Arc<Mutex<Vec<String>>>,
    }

    impl OpenHandle for FakeFile {
        fn label(&self) -> &str {
            &self.label
        }

        fn close(&mut self) -> Result<(), Error> {
            if self.fail {
                return Err(Error::new(ErrorKind::Io).with_message("already closed"));
            }
            self.closed.lock().expect("lock").push(self.label.clone());
            Ok(())
        }
    }

    #[test]
    fn n_registers_and_releases_tear_down_once() {
        let manager = Manager::new();
        let torn = Arc::new(AtomicUsize::new(0));
        let id = Identity::new(0xdead);
        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(manager.register(id).expect("register"));
        }
        manager.adopt(id, counter_teardown(&torn)).expect("adopt");
        assert_eq!(manager.proxy_count(id), Some(5));
        let mut torn_down = 0;
        for handle in handles {
            if manager.release(handle).expect("release") {
                torn_down += 1;
            }
        }
        assert_eq!(torn_down, 1);
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert!(manager.is_released(id));
        assert!(!manager.release_identity(id).expect("no-op"));
    }

    #[test]
    fn released_identity_never_comes_back() {
        let manager = Manager::new();
        let handle = manager.manage(7u32).expect("manage");
        let id = handle.identity();
        handle.release().expect("release");
        let err = manager.register(id).expect_err("released");
        assert_eq!(err.kind(), ErrorKind::Released);
        let err = manager.set_externally_owned(id, true).expect_err("released");
        assert_eq!(err.kind(), ErrorKind::Released);
    }

    #[test]
    fn externally_owned_is_forgotten_not_torn_down() {
        let manager = Manager::new();
        let torn = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&torn);
        let handle = manager
            .manage_with("child", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .expect("manage");
        let id = handle.identity();
        manager.set_externally_owned(id, true).expect("claim");
        assert!(!handle.release().expect("release"));
        assert_eq!(torn.load(Ordering::SeqCst), 0);
        assert!(!manager.is_live(id));
        assert!(!manager.is_released(id));

        assert!(manager.destroy(id).expect("owner teardown"));
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert!(!manager.destroy(id).expect("idempotent"));
        assert!(manager.is_released(id));
        assert_eq!(manager.tombstone_count(), 0);
    }

    #[test]
    fn ownership_claim_can_be_reversed() {
        let manager = Manager::new();
        let torn = Arc::new(AtomicUsize::new(0));
        let handle = manager.manage(1u8).expect("manage");
        let id = handle.identity();
        manager.adopt(id, counter_teardown(&torn)).expect("adopt");
        manager.set_externally_owned(id, true).expect("claim");
        manager.set_externally_owned(id, false).expect("unclaim");
        drop(handle);
        assert_eq!(torn.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn payload_access_fails_after_teardown() {
        let manager = Manager::new();
        let handle = manager.manage(String::from("record")).expect("manage");
        let alias = handle.try_clone().expect("clone");
        assert_eq!(alias.get::<String>().expect("payload").as_str(), "record");
        assert_eq!(alias.get::<u64>().expect_err("wrong type").kind(), ErrorKind::Usage);

        assert!(manager.destroy(handle.identity()).expect("destroy"));
        assert_eq!(alias.get::<String>().expect_err("stale").kind(), ErrorKind::Released);
        assert!(!alias.release().expect("no-op"));
        drop(handle);
    }

    #[test]
    fn drop_releases_and_into_identity_keeps_count() {
        let manager = Manager::new();
        let handle = manager.manage(()).expect("manage");
        let id = handle.identity();
        {
            let _alias = handle.try_clone().expect("clone");
            assert_eq!(manager.proxy_count(id), Some(2));
        }
        assert_eq!(manager.proxy_count(id), Some(1));
        let raw = handle.into_identity();
        assert_eq!(manager.proxy_count(raw), Some(1));
        assert!(manager.release_identity(raw).expect("release"));
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn manage_release_cycles_leave_no_tombstones() {
        let manager = Manager::new();
        let first = manager.manage(0usize).expect("manage").identity();
        for round in 1..10_000usize {
            let handle = manager.manage(round).expect("manage");
            assert!(handle.release().expect("release"));
        }
        assert_eq!(manager.live_count(), 0);
        assert_eq!(manager.tombstone_count(), 0);
        assert!(manager.is_released(first));
        let err = manager.register(first).expect_err("old id");
        assert_eq!(err.kind(), ErrorKind::Released);
        assert!(!manager.destroy(first).expect("already gone"));
    }

    #[test]
    fn supplied_tombstones_are_dropped_once_the_watermark_passes() {
        let manager = Manager::new();
        let supplied = Identity::new(3);
        assert!(manager.register(supplied).expect("register").release().expect("release"));
        assert_eq!(manager.tombstone_count(), 1);

        let issued: Vec<_> = (0..3)
            .map(|_| manager.manage(()).expect("manage").into_identity())
            .collect();
        assert_eq!(issued, [Identity::new(1), Identity::new(2), Identity::new(4)]);
        assert_eq!(manager.tombstone_count(), 0);
        assert!(manager.is_released(supplied));
        assert_eq!(
            manager.register(supplied).expect_err("still gone").kind(),
            ErrorKind::Released
        );
    }

    #[test]
    fn nothing_is_managed_after_shutdown() {
        let manager = Manager::new();
        manager.shutdown();
        assert_eq!(manager.manage(1u8).expect_err("shut down").kind(), ErrorKind::Usage);
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn unknown_identity_release_is_not_found() {
        let manager = Manager::new();
        let err = manager.release_identity(Identity::new(99)).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn shutdown_sweeps_once_and_respects_ownership() {
        let manager = Manager::new();
        let torn = Arc::new(AtomicUsize::new(0));
        let owned = manager.manage(1u8).expect("owned");
        manager.adopt(owned.identity(), counter_teardown(&torn)).expect("adopt");
        let child = manager.manage(2u8).expect("child");
        manager.adopt(child.identity(), counter_teardown(&torn)).expect("adopt");
        manager.set_externally_owned(child.identity(), true).expect("claim");
        manager
            .adopt(
                manager.register(Identity::new(500)).expect("reg").into_identity(),
                Box::new(|| Err(Error::new(ErrorKind::Io).with_message("close failed"))),
            )
            .expect("adopt failing");

        let closed = Arc::new(Mutex::new(Vec::new()));
        for (label, fail) in [("a", false), ("b", true), ("c", false)] {
            manager.track_open_handle(Box::new(FakeFile {
                label: label.to_string(),
                fail,
                closed: Arc::clone(&closed),
            }));
        }

        {
            let _guard = manager.shutdown_guard();
        }
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        assert_eq!(*closed.lock().expect("lock"), ["a", "c"]);
        assert_eq!(manager.live_count(), 0);

        manager.shutdown();
        assert_eq!(torn.load(Ordering::SeqCst), 1);
        let err = manager.register(Identity::new(1)).expect_err("after shutdown");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(owned.get::<u8>().expect_err("gone").kind(), ErrorKind::Released);
        drop(owned);
        drop(child);
    }
}
