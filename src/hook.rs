//! Wraps methods on host objects with `before`, `after` and `instead` callbacks, and takes them
//! off again.
//!
//! The first patch on an `(object, method)` pair swaps the method for a wrapper function and keeps
//! the original aside. Later patches on the same pair, from any `Injector`, are appended to that
//! wrapper's records. When the last record goes, the original function is put back exactly as it
//! was.

pub(crate) mod chain;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;

use crate::{
    error::{Error, Result},
    value::{Function, Object, Value},
};
use chain::{Callback, PatchRecord, Slot};

/// When a patch callback runs relative to the original function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum PatchKind {
    Before,
    After,
    Instead,
}

static NEXT_PATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies a single installed patch. Removing it more than once is harmless.
#[derive(Clone)]
pub struct PatchHandle {
    id: u64,
    kind: PatchKind,
    target: Object,
    method: Arc<str>,
    slot: Arc<Slot>,
    wrapper: Function,
}

impl PatchHandle {
    pub fn kind(&self) -> PatchKind {
        self.kind
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Returns true while the patch is still installed.
    pub fn is_active(&self) -> bool {
        self.slot.contains(self.id)
    }

    /// Removes this patch. If it was the last patch on the method, the original function is
    /// restored, unless the host has replaced the wrapper with something else in the meantime.
    ///
    /// Returns `false` if the patch had already been removed.
    pub fn remove(&self) -> bool {
        self.slot.remove(self.id, |original| {
            let restored = self.target.replace_if(
                &self.method,
                &Value::Function(self.wrapper.clone()),
                Value::Function(original.clone()),
            );

            if restored {
                log::debug!("restored original `{}`", self.method);
            } else {
                log::warn!(
                    "`{}` was replaced while patched; leaving the new value alone",
                    self.method
                );
            }

            // Either way, this wrapper is no longer reachable through the object.
            true
        })
    }
}

impl std::fmt::Debug for PatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("method", &self.method)
            .finish()
    }
}

/// Issues patches and remembers them, so that a feature can take all of its patches off at once.
#[derive(Default)]
pub struct Injector {
    handles: Mutex<Vec<PatchHandle>>,
}

impl Injector {
    pub fn new() -> Injector {
        Injector::default()
    }

    /// Runs `callback` over the argument list before the original is called. The callback may
    /// change the arguments.
    pub fn before<F>(&self, target: &Object, method: &str, callback: F) -> Result<PatchHandle>
    where
        F: Fn(&mut Vec<Value>) -> eyre::Result<()> + Send + Sync + 'static,
    {
        self.install(target, method, Callback::Before(Arc::new(callback)))
    }

    /// Runs `callback` with the arguments and the result so far. Whatever it returns becomes the
    /// result.
    pub fn after<F>(&self, target: &Object, method: &str, callback: F) -> Result<PatchHandle>
    where
        F: Fn(&[Value], Value) -> eyre::Result<Value> + Send + Sync + 'static,
    {
        self.install(target, method, Callback::After(Arc::new(callback)))
    }

    /// Replaces the call entirely. The callback is given the function it replaces and decides for
    /// itself whether to call it.
    pub fn instead<F>(&self, target: &Object, method: &str, callback: F) -> Result<PatchHandle>
    where
        F: Fn(&[Value], &Function) -> eyre::Result<Value> + Send + Sync + 'static,
    {
        self.install(target, method, Callback::Instead(Arc::new(callback)))
    }

    fn install(&self, target: &Object, method: &str, callback: Callback) -> Result<PatchHandle> {
        let kind = callback.kind();

        // Only loops if the slot changes underneath us between reading and writing it.
        loop {
            let current = target.get(method).ok_or_else(|| Error::TargetNotFound {
                method: method.to_string(),
            })?;

            let function = current.as_function().ok_or_else(|| Error::NotCallable {
                method: method.to_string(),
            })?;

            let (slot, wrapper) = match function.slot() {
                Some(slot) => (slot.clone(), function.clone()),

                None => {
                    let slot = Arc::new(Slot::new(method, function.clone()));
                    let wrapper = Function::patched(slot.clone());

                    if !target.replace_if(method, &current, Value::Function(wrapper.clone())) {
                        continue;
                    }

                    (slot, wrapper)
                }
            };

            let id = NEXT_PATCH_ID.fetch_add(1, Ordering::Relaxed);

            let record = PatchRecord {
                id,
                callback: callback.clone(),
            };

            if !slot.push(record) {
                continue;
            }

            log::debug!("installed {kind} patch #{id} on `{method}`");

            let handle = PatchHandle {
                id,
                kind,
                target: target.clone(),
                method: method.into(),
                slot,
                wrapper,
            };

            self.handles.lock().push(handle.clone());
            return Ok(handle);
        }
    }

    /// Removes a single patch. Does nothing if it has already been removed.
    pub fn uninject(&self, handle: &PatchHandle) {
        handle.remove();
        self.handles.lock().retain(|held| held.id != handle.id);
    }

    /// Removes every patch issued by this injector. Patches from other injectors on the same
    /// methods are left in place.
    pub fn uninject_all(&self) {
        // Take the list first so that callbacks triggered by removal can't deadlock on it.
        let handles = std::mem::take(&mut *self.handles.lock());

        let removed = handles.iter().filter(|handle| handle.remove()).count();

        if removed > 0 {
            log::info!("removed {removed} patch(es)");
        }
    }

    /// The number of patches from this injector that are still installed.
    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|handle| handle.is_active())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
