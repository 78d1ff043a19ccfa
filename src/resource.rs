//! Resource handle tables.
//!
//! A [`ResourceManager`] owns three tables for one resource type:
//!
//! - the handle table maps a handle to its representation on the side that
//!   implements the resource
//! - the object table maps a handle to a host object, either owned by the
//!   manager or a proxy synthesized for a handle the far side handed over
//! - the loop table maps a loop representation back to the handle it stands
//!   for when an import is served by the same instance's export
//!
//! Proxies are released deterministically with [`ResourceManager::release`].
//! A proxy dropped without a release is reported as a leak and queued; the
//! next [`ResourceManager::collect`] runs its destructor.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::abi::{Trap, Value};
use crate::error::Error;
use crate::logging::{debug, error, warn};

/// A host object exposed to the far side as a handle.
pub trait Resource: Send + Sync {
    /// Invoke `method` with already lifted parameters.
    fn call(&self, method: &str, params: Vec<Value>) -> Result<Option<Value>, Error> {
        let _ = params;
        Err(Trap::MethodNotFound {
            method: method.to_string(),
            resource: std::any::type_name::<Self>().to_string(),
        }
        .into())
    }

    /// Cleanup hook run by a destructor call before the handle is removed.
    fn on_drop(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Builds the proxy for a discovered handle from `(handle, rep)`.
pub type ProxyConstructor = Arc<dyn Fn(u32, u32) -> Arc<dyn Resource> + Send + Sync>;

/// Destroys the representation behind a proxy.
pub type ProxyDestructor = Arc<dyn Fn(u32) -> Result<(), Error> + Send + Sync>;

/// Keeps a proxy registered while any [`ResourceRef`] to it is alive.
struct ProxyLease {
    handle: u32,
    rep: u32,
    object: Arc<dyn Resource>,
    released: AtomicBool,
    leaks: Arc<LeakLog>,
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            warn!(handle = self.handle, rep = self.rep, "resource proxy dropped without release");
            self.leaks.reported.fetch_add(1, Ordering::Relaxed);
            self.leaks.pending.lock().push(self.handle);
        }
    }
}

/// Proxies dropped without a release, waiting for collection.
#[derive(Default)]
struct LeakLog {
    pending: Mutex<Vec<u32>>,
    reported: AtomicUsize,
}

/// A resolved resource: its handle plus the host object behind it.
#[derive(Clone)]
pub struct ResourceRef {
    handle: u32,
    object: Arc<dyn Resource>,
    lease: Option<Arc<ProxyLease>>,
}

impl ResourceRef {
    fn owned(handle: u32, object: Arc<dyn Resource>) -> Self {
        Self {
            handle,
            object,
            lease: None,
        }
    }

    fn proxy(lease: Arc<ProxyLease>) -> Self {
        Self {
            handle: lease.handle,
            object: lease.object.clone(),
            lease: Some(lease),
        }
    }

    pub fn handle(&self) -> u32 {
        self.handle
    }

    pub fn object(&self) -> &Arc<dyn Resource> {
        &self.object
    }

    /// Representation of a proxy; `None` for host-owned resources.
    pub fn rep(&self) -> Option<u32> {
        self.lease.as_ref().map(|lease| lease.rep)
    }

    pub fn is_proxy(&self) -> bool {
        self.lease.is_some()
    }
}

impl PartialEq for ResourceRef {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle && Arc::ptr_eq(&self.object, &other.object)
    }
}

impl fmt::Debug for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceRef")
            .field("handle", &self.handle)
            .field("rep", &self.rep())
            .finish()
    }
}

enum Slot {
    Owned(Arc<dyn Resource>),
    Proxy(Weak<ProxyLease>),
}

struct Tables {
    handle_counter: u32,
    rep_counter: u32,
    handle_table: HashMap<u32, u32>,
    objects: HashMap<u32, Slot>,
    loop_table: HashMap<u32, u32>,
    ctor: Option<ProxyConstructor>,
    dtor: Option<ProxyDestructor>,
}

impl Tables {
    fn next_handle(&mut self) -> Result<u32, Trap> {
        let handle = self.handle_counter;
        self.handle_counter = handle.checked_add(1).ok_or(Trap::HandlesExhausted)?;
        Ok(handle)
    }

    /// Remove the handle and object mappings of `handle`, marking a live
    /// proxy as released. The loop entry of the representation is removed
    /// only after the destructor has run.
    fn unlink(&mut self, handle: u32) -> Option<u32> {
        if let Some(Slot::Proxy(weak)) = self.objects.remove(&handle)
            && let Some(lease) = weak.upgrade()
        {
            lease.released.store(true, Ordering::Release);
        }
        self.handle_table.remove(&handle)
    }
}

/// Handle tables of one resource type.
pub struct ResourceManager {
    tables: Mutex<Tables>,
    leaks: Arc<LeakLog>,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tables = self.tables.lock();
        f.debug_struct("ResourceManager")
            .field("handle_counter", &tables.handle_counter)
            .field("handles", &tables.handle_table.len())
            .field("objects", &tables.objects.len())
            .field("loops", &tables.loop_table.len())
            .finish()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables {
                handle_counter: 1,
                rep_counter: u32::MAX,
                handle_table: HashMap::new(),
                objects: HashMap::new(),
                loop_table: HashMap::new(),
                ctor: None,
                dtor: None,
            }),
            leaks: Arc::new(LeakLog::default()),
        }
    }

    /// Issue a new handle for `rep`.
    pub fn new_handle(&self, rep: u32) -> Result<u32, Trap> {
        let mut tables = self.tables.lock();
        let handle = tables.next_handle()?;
        tables.handle_table.insert(handle, rep);
        Ok(handle)
    }

    pub fn get_representation(&self, handle: u32) -> Result<u32, Trap> {
        self.tables
            .lock()
            .handle_table
            .get(&handle)
            .copied()
            .ok_or(Trap::NoRepresentation(handle))
    }

    /// Remove `handle` from every table and run the proxy destructor on its
    /// representation. The handle is gone even when the destructor fails.
    pub fn drop_handle(&self, handle: u32) -> Result<u32, Error> {
        let (rep, dtor) = {
            let mut tables = self.tables.lock();
            if !tables.handle_table.contains_key(&handle) {
                return Err(Trap::UnknownHandle(handle).into());
            }
            let rep = tables.unlink(handle).ok_or(Trap::UnknownHandle(handle))?;
            (rep, tables.dtor.clone())
        };
        debug!(handle, rep, "dropping resource handle");
        let result = match dtor {
            Some(dtor) => dtor(rep),
            None => Ok(()),
        };
        self.forget_loop(Some(rep));
        result.map(|()| rep)
    }

    /// Install the functions used to build and destroy proxies.
    pub fn set_proxy_info(&self, ctor: ProxyConstructor, dtor: ProxyDestructor) {
        let mut tables = self.tables.lock();
        tables.ctor = Some(ctor);
        tables.dtor = Some(dtor);
    }

    pub fn has_resource(&self, handle: u32) -> bool {
        self.tables.lock().objects.contains_key(&handle)
    }

    /// Resolve `handle` to its host object, synthesizing a proxy the first
    /// time a handle issued by the far side is seen.
    pub fn get_resource(&self, handle: u32) -> Result<ResourceRef, Trap> {
        let (rep, ctor) = {
            let tables = self.tables.lock();
            match tables.objects.get(&handle) {
                Some(Slot::Owned(object)) => return Ok(ResourceRef::owned(handle, object.clone())),
                Some(Slot::Proxy(weak)) => {
                    return weak
                        .upgrade()
                        .map(ResourceRef::proxy)
                        .ok_or(Trap::ResourceCollected(handle));
                }
                None => {}
            }
            let rep = tables
                .handle_table
                .get(&handle)
                .copied()
                .ok_or(Trap::UnknownHandle(handle))?;
            let ctor = tables.ctor.clone().ok_or(Trap::NoProxyConstructor)?;
            if tables.dtor.is_none() {
                return Err(Trap::NoProxyDestructor);
            }
            (rep, ctor)
        };
        let object = ctor(handle, rep);
        self.register_proxy(handle, rep, object)
    }

    /// Register an owned host object, under `handle` or a fresh one.
    pub fn register_resource(&self, resource: Arc<dyn Resource>, handle: Option<u32>) -> Result<u32, Trap> {
        let mut tables = self.tables.lock();
        let handle = match handle {
            Some(handle) => {
                if handle >= tables.handle_counter {
                    return Err(Trap::HandleOutOfBounds {
                        handle,
                        counter: tables.handle_counter,
                    });
                }
                if tables.objects.contains_key(&handle) {
                    return Err(Trap::HandleRegistered(handle));
                }
                if tables.handle_table.contains_key(&handle) {
                    return Err(Trap::HandleInUse(handle));
                }
                handle
            }
            None => tables.next_handle()?,
        };
        tables.objects.insert(handle, Slot::Owned(resource));
        Ok(handle)
    }

    /// Register `object` as the proxy for `handle`. When a live proxy is
    /// already registered that one is returned instead.
    pub fn register_proxy(&self, handle: u32, rep: u32, object: Arc<dyn Resource>) -> Result<ResourceRef, Trap> {
        let lease = Arc::new(ProxyLease {
            handle,
            rep,
            object,
            released: AtomicBool::new(false),
            leaks: self.leaks.clone(),
        });
        let mut tables = self.tables.lock();
        let existing = match tables.objects.get(&handle) {
            Some(Slot::Proxy(weak)) => weak.upgrade(),
            Some(Slot::Owned(_)) => {
                lease.released.store(true, Ordering::Release);
                return Err(Trap::HandleRegistered(handle));
            }
            None => None,
        };
        if let Some(existing) = existing {
            lease.released.store(true, Ordering::Release);
            return Ok(ResourceRef::proxy(existing));
        }
        tables.objects.insert(handle, Slot::Proxy(Arc::downgrade(&lease)));
        debug!(handle, rep, "registered resource proxy");
        Ok(ResourceRef::proxy(lease))
    }

    /// Remove an owned object. Proxies must be released instead.
    pub fn remove_resource(&self, handle: u32) -> Result<Arc<dyn Resource>, Trap> {
        let mut tables = self.tables.lock();
        match tables.objects.remove(&handle) {
            Some(Slot::Owned(object)) => Ok(object),
            Some(proxy @ Slot::Proxy(_)) => {
                tables.objects.insert(handle, proxy);
                Err(Trap::ProxyRemoval(handle))
            }
            None => Err(Trap::UnknownHandle(handle)),
        }
    }

    /// Give `handle` a second identity for a call that loops back into the
    /// same instance. Returns the loop handle.
    pub fn register_loop(&self, handle: u32) -> Result<u32, Trap> {
        let mut tables = self.tables.lock();
        let result = tables.next_handle()?;
        let rep = tables.rep_counter;
        tables.rep_counter = rep.checked_sub(1).ok_or(Trap::HandlesExhausted)?;
        tables.handle_table.insert(result, rep);
        tables.loop_table.insert(rep, handle);
        Ok(result)
    }

    fn forget_loop(&self, rep: Option<u32>) {
        if let Some(rep) = rep {
            self.tables.lock().loop_table.remove(&rep);
        }
    }

    pub fn get_loop(&self, rep: u32) -> Result<u32, Trap> {
        self.tables
            .lock()
            .loop_table
            .get(&rep)
            .copied()
            .ok_or(Trap::UnknownLoop(rep))
    }

    /// Deterministically release `handle`.
    ///
    /// A proxy loses all of its mappings and its destructor runs once. An
    /// owned object is removed and its `on_drop` hook runs.
    pub fn release(&self, handle: u32) -> Result<(), Error> {
        let (owned, rep, dtor) = {
            let mut tables = self.tables.lock();
            let owned = match tables.objects.get(&handle) {
                Some(Slot::Owned(object)) => Some(object.clone()),
                Some(Slot::Proxy(_)) => None,
                None if tables.handle_table.contains_key(&handle) => None,
                None => return Err(Trap::UnknownHandle(handle).into()),
            };
            let rep = tables.unlink(handle);
            (owned, rep, tables.dtor.clone())
        };
        self.leaks.pending.lock().retain(|h| *h != handle);
        if let Some(object) = owned {
            return object.on_drop();
        }
        let result = match (rep, dtor) {
            (Some(rep), Some(dtor)) => dtor(rep),
            _ => Ok(()),
        };
        self.forget_loop(rep);
        result
    }

    /// Run the destructor of every proxy dropped without a release.
    /// Returns the number of proxies cleaned up.
    pub fn collect(&self) -> usize {
        let leaked: Vec<u32> = std::mem::take(&mut *self.leaks.pending.lock());
        let mut collected = 0;
        for handle in leaked {
            let (rep, dtor) = {
                let mut tables = self.tables.lock();
                let dead = matches!(
                    tables.objects.get(&handle),
                    Some(Slot::Proxy(weak)) if weak.strong_count() == 0
                );
                if !dead {
                    continue;
                }
                tables.objects.remove(&handle);
                (tables.unlink(handle), tables.dtor.clone())
            };
            collected += 1;
            if let (Some(rep), Some(dtor)) = (rep, dtor)
                && let Err(err) = dtor(rep)
            {
                error!(handle, rep, error = %err, "resource destructor failed during collection");
            }
            self.forget_loop(rep);
        }
        collected
    }

    /// Number of leaked proxies waiting for [`collect`](Self::collect).
    pub fn pending_collection(&self) -> usize {
        self.leaks.pending.lock().len()
    }

    /// Number of proxies ever dropped without a release.
    pub fn leaks_reported(&self) -> usize {
        self.leaks.reported.load(Ordering::Relaxed)
    }
}

/// Resource managers of one instance, keyed by resource id.
#[derive(Default)]
pub struct ResourceManagers {
    managers: Mutex<HashMap<String, Arc<ResourceManager>>>,
}

impl fmt::Debug for ResourceManagers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let managers = self.managers.lock();
        f.debug_set().entries(managers.keys()).finish()
    }
}

impl ResourceManagers {
    pub fn has(&self, id: &str) -> bool {
        self.managers.lock().contains_key(id)
    }

    pub fn set(&self, id: impl Into<String>, manager: Arc<ResourceManager>) -> Result<(), Trap> {
        let id = id.into();
        let mut managers = self.managers.lock();
        if managers.contains_key(&id) {
            return Err(Trap::ManagerRegistered(id));
        }
        managers.insert(id, manager);
        Ok(())
    }

    pub fn ensure(&self, id: &str) -> Result<Arc<ResourceManager>, Trap> {
        self.get(id).ok_or_else(|| Trap::ManagerNotFound(id.to_string()))
    }

    pub fn get(&self, id: &str) -> Option<Arc<ResourceManager>> {
        self.managers.lock().get(id).cloned()
    }

    /// The manager registered under `id`, created on first use.
    pub fn get_or_create(&self, id: &str) -> Arc<ResourceManager> {
        self.managers
            .lock()
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(ResourceManager::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter;

    impl Resource for Counter {}

    fn proxied(dropped: Arc<AtomicUsize>) -> ResourceManager {
        let manager = ResourceManager::new();
        manager.set_proxy_info(
            Arc::new(|_: u32, _: u32| Arc::new(Counter) as Arc<dyn Resource>),
            Arc::new(move |_: u32| -> Result<(), Error> {
                dropped.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        manager
    }

    #[test]
    fn test_handles_start_at_one() {
        let manager = ResourceManager::new();
        assert_eq!(manager.new_handle(40).unwrap(), 1);
        assert_eq!(manager.new_handle(41).unwrap(), 2);
        assert_eq!(manager.get_representation(2).unwrap(), 41);
    }

    #[test]
    fn test_drop_removes_even_when_destructor_fails() {
        let manager = ResourceManager::new();
        manager.set_proxy_info(
            Arc::new(|_: u32, _: u32| Arc::new(Counter) as Arc<dyn Resource>),
            Arc::new(|_: u32| -> Result<(), Error> { Err(Trap::convention("boom").into()) }),
        );
        let handle = manager.new_handle(9).unwrap();
        assert!(manager.drop_handle(handle).is_err());
        assert_eq!(manager.get_representation(handle), Err(Trap::NoRepresentation(handle)));
    }

    #[test]
    fn test_release_runs_destructor_once() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let manager = proxied(dropped.clone());
        let handle = manager.new_handle(5).unwrap();
        let proxy = manager.get_resource(handle).unwrap();
        assert_eq!(proxy.rep(), Some(5));
        manager.release(handle).unwrap();
        drop(proxy);
        assert_eq!(manager.collect(), 0);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_only_unreleased_proxies_are_reported() {
        let manager = proxied(Arc::new(AtomicUsize::new(0)));
        let kept = manager.new_handle(5).unwrap();
        let proxy = manager.get_resource(kept).unwrap();
        manager.release(proxy.handle()).unwrap();
        drop(proxy);
        assert_eq!(manager.leaks_reported(), 0);

        let lost = manager.new_handle(6).unwrap();
        drop(manager.get_resource(lost).unwrap());
        assert_eq!(manager.leaks_reported(), 1);
        assert_eq!(manager.pending_collection(), 1);
    }

    #[test]
    fn test_register_resource_rejects_bad_handles() {
        let manager = ResourceManager::new();
        assert_eq!(
            manager.register_resource(Arc::new(Counter), Some(1)),
            Err(Trap::HandleOutOfBounds { handle: 1, counter: 1 })
        );
        let owned = manager.register_resource(Arc::new(Counter), None).unwrap();
        assert_eq!(
            manager.register_resource(Arc::new(Counter), Some(owned)),
            Err(Trap::HandleRegistered(owned))
        );
        let issued = manager.new_handle(12).unwrap();
        assert_eq!(
            manager.register_resource(Arc::new(Counter), Some(issued)),
            Err(Trap::HandleInUse(issued))
        );
        let removed = manager.register_resource(Arc::new(Counter), None).unwrap();
        manager.remove_resource(removed).unwrap();
        assert_eq!(manager.register_resource(Arc::new(Counter), Some(removed)), Ok(removed));
    }

    #[test]
    fn test_leaked_proxy_collected() {
        let dropped = Arc::new(AtomicUsize::new(0));
        let manager = proxied(dropped.clone());
        let handle = manager.new_handle(5).unwrap();
        drop(manager.get_resource(handle).unwrap());
        assert_eq!(manager.pending_collection(), 1);
        assert_eq!(manager.collect(), 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(!manager.has_resource(handle));
        assert!(manager.get_representation(handle).is_err());
    }

    #[test]
    fn test_loop_handles() {
        let manager = ResourceManager::new();
        let original = manager.new_handle(3).unwrap();
        let looped = manager.register_loop(original).unwrap();
        let rep = manager.get_representation(looped).unwrap();
        assert_eq!(rep, u32::MAX);
        assert_eq!(manager.get_loop(rep).unwrap(), original);
        assert_eq!(manager.get_loop(7), Err(Trap::UnknownLoop(7)));
    }

    #[test]
    fn test_managers_registry() {
        let managers = ResourceManagers::default();
        managers.set("a", Arc::new(ResourceManager::new())).unwrap();
        assert!(matches!(
            managers.set("a", Arc::new(ResourceManager::new())),
            Err(Trap::ManagerRegistered(_))
        ));
        assert!(managers.ensure("b").is_err());
        let created = managers.get_or_create("b");
        assert!(Arc::ptr_eq(&created, &managers.ensure("b").unwrap()));
    }
}
