//! Opaque integer handles for external identity.
//!
//! The handle table owns the external-side strong reference to every exposed
//! object. Freeing a handle releases that reference; actual destruction is
//! deferred to the owning context's audio thread (§ deferred deletion), so
//! the audio thread never observes a dangling object.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::properties::PropertyHost;
use crate::router::{InputId, OutputId};

/// Non-zero opaque identifier for an exposed object.
pub type Handle = u64;

/// Per-object storage for the object's most recent handle. Zero means the
/// object was never exposed.
#[derive(Debug, Default)]
pub struct HandleSlot(AtomicU64);

impl HandleSlot {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn get(&self) -> Handle {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self, handle: Handle) {
        self.0.store(handle, Ordering::Relaxed);
    }
}

/// Capability of being exposed through the handle table.
///
/// Everything reachable by handle carries property dispatch, a handle slot,
/// and (except for contexts themselves) a back-reference to its owning
/// context. Objects participating in routing override the endpoint
/// accessors.
pub trait Exposable: PropertyHost + Send + Sync {
    fn handle_slot(&self) -> &HandleSlot;

    /// The owning context; `None` for contexts themselves.
    fn context_ref(&self) -> Option<Arc<Context>>;

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn kind_name(&self) -> &'static str;

    /// Routing output endpoint, if this object writes into the router.
    fn output_endpoint(&self) -> Option<OutputId> {
        None
    }

    /// Routing input endpoint, if this object reads from the router.
    fn input_endpoint(&self) -> Option<InputId> {
        None
    }

    /// Called when the external handle is released, before the owning
    /// reference is queued for deletion.
    fn on_handle_free(&self) {}
}

/// Monotonic handle → owning reference map.
pub struct HandleTable {
    next: AtomicU64,
    map: Mutex<HashMap<Handle, Arc<dyn Exposable>>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            map: Mutex::new(HashMap::new()),
        }
    }

    /// Exposes `object`, returning its handle. Re-registering an object that
    /// already has a live handle returns the existing one.
    pub fn register(&self, object: Arc<dyn Exposable>) -> Handle {
        let existing = object.handle_slot().get();
        if existing != 0 {
            let map = self.map.lock().unwrap();
            if map.contains_key(&existing) {
                return existing;
            }
        }
        let handle = self.next.fetch_add(1, Ordering::Relaxed);
        object.handle_slot().set(handle);
        self.map.lock().unwrap().insert(handle, object);
        handle
    }

    /// Strong-reference snapshot of the object behind `handle`.
    pub fn lookup(&self, handle: Handle) -> Result<Arc<dyn Exposable>> {
        self.map
            .lock()
            .unwrap()
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::InvalidHandle.record())
    }

    /// Typed lookup; fails with `HandleType` on a mismatched downcast.
    pub fn get<T: Any + Send + Sync>(&self, handle: Handle) -> Result<Arc<T>> {
        let object = self.lookup(handle)?;
        let kind = object.kind_name();
        object.into_any().downcast::<T>().map_err(|_| {
            Error::HandleType(format!(
                "handle refers to a {kind}, not a {}",
                std::any::type_name::<T>()
            ))
            .record()
        })
    }

    /// Releases the external reference behind `handle`. Destruction happens
    /// on the owning context's audio thread after the next block boundary.
    pub fn free(&self, handle: Handle) -> Result<()> {
        let object = self
            .map
            .lock()
            .unwrap()
            .remove(&handle)
            .ok_or_else(|| Error::InvalidHandle.record())?;
        object.on_handle_free();
        match object.context_ref() {
            Some(ctx) => ctx.enqueue_deletion(Box::new(object)),
            // Contexts shut themselves down in on_handle_free and can be
            // dropped inline.
            None => drop(object),
        }
        Ok(())
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
