//! Patch records and the composition of a patched call.

use std::sync::Arc;

use parking_lot::Mutex;

use super::PatchKind;
use crate::value::{Function, Value};

pub(crate) type BeforeFn = dyn Fn(&mut Vec<Value>) -> eyre::Result<()> + Send + Sync;
pub(crate) type AfterFn = dyn Fn(&[Value], Value) -> eyre::Result<Value> + Send + Sync;
pub(crate) type InsteadFn = dyn Fn(&[Value], &Function) -> eyre::Result<Value> + Send + Sync;

#[derive(Clone)]
pub(crate) enum Callback {
    Before(Arc<BeforeFn>),
    After(Arc<AfterFn>),
    Instead(Arc<InsteadFn>),
}

impl Callback {
    pub(crate) fn kind(&self) -> PatchKind {
        match self {
            Callback::Before(_) => PatchKind::Before,
            Callback::After(_) => PatchKind::After,
            Callback::Instead(_) => PatchKind::Instead,
        }
    }
}

#[derive(Clone)]
pub(crate) struct PatchRecord {
    pub id: u64,
    pub callback: Callback,
}

struct SlotState {
    records: Vec<PatchRecord>,

    /// Set once the last record is removed and the original has been put back. A detached slot
    /// never takes new records; installers have to go back to the object and start again.
    detached: bool,
}

/// The state behind one patched `(object, method)` pair. The wrapper function installed on the
/// object points here.
pub(crate) struct Slot {
    method: String,
    original: Function,
    state: Mutex<SlotState>,
}

impl Slot {
    pub(crate) fn new(method: &str, original: Function) -> Slot {
        Slot {
            method: method.to_string(),
            original,
            state: Mutex::new(SlotState {
                records: vec![],
                detached: false,
            }),
        }
    }

    /// Appends a record. Returns `false` if the slot has been detached.
    pub(crate) fn push(&self, record: PatchRecord) -> bool {
        let mut state = self.state.lock();

        if state.detached {
            return false;
        }

        state.records.push(record);
        true
    }

    /// Removes the record with the given id. If that leaves the slot empty, `on_empty` is called
    /// while the slot is still locked, and the slot becomes detached if it returns `true`.
    ///
    /// Returns `false` if there was no such record.
    pub(crate) fn remove(&self, id: u64, on_empty: impl FnOnce(&Function) -> bool) -> bool {
        let mut state = self.state.lock();

        let Some(index) = state.records.iter().position(|record| record.id == id) else {
            return false;
        };

        state.records.remove(index);

        if state.records.is_empty() {
            state.detached = on_empty(&self.original);
        }

        true
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.state.lock().records.iter().any(|record| record.id == id)
    }

    /// Runs a call through the records as they are right now. Records added or removed by a
    /// callback during the call take effect from the next call.
    pub(crate) fn invoke(&self, args: &[Value]) -> eyre::Result<Value> {
        let records = self.state.lock().records.clone();
        compose(&self.method, &self.original, &records, args)
    }
}

/// Calls `original` with every record applied. `before` callbacks see the arguments first, then
/// the `instead` layers run (the earliest installed sits closest to the original), then each
/// `after` callback transforms the result.
pub(crate) fn compose(
    method: &str,
    original: &Function,
    records: &[PatchRecord],
    args: &[Value],
) -> eyre::Result<Value> {
    let mut args = args.to_vec();

    for record in records {
        if let Callback::Before(before) = &record.callback {
            if let Err(err) = before(&mut args) {
                log::error!("before patch #{} on `{}` failed: {:?}", record.id, method, err);
            }
        }
    }

    let composed = records
        .iter()
        .filter_map(|record| match &record.callback {
            Callback::Instead(instead) => Some((record.id, instead.clone())),
            _ => None,
        })
        .fold(original.clone(), |inner, (id, instead)| {
            layer(method, id, inner, instead)
        });

    // Errors from the original are the host's own and go straight back to the caller.
    let mut result = composed.call(&args)?;

    for record in records {
        if let Callback::After(after) = &record.callback {
            match after(&args, result.clone()) {
                Ok(value) => result = value,
                Err(err) => {
                    log::error!("after patch #{} on `{}` failed: {:?}", record.id, method, err);
                }
            }
        }
    }

    Ok(result)
}

/// Result of the inner call as seen by an `instead` layer.
enum InnerOutcome {
    NotCalled,
    Returned(Value),
    Failed,
}

/// Wraps `inner` in one `instead` callback. If the callback fails, the caller still gets the
/// result of `inner`: either the value `inner` already produced, or a fresh call to it.
fn layer(method: &str, id: u64, inner: Function, instead: Arc<InsteadFn>) -> Function {
    let method = method.to_string();

    Function::new(move |args| {
        let outcome = Arc::new(Mutex::new(InnerOutcome::NotCalled));

        let tracked = {
            let outcome = outcome.clone();
            let inner = inner.clone();

            Function::new(move |args| {
                let result = inner.call(args);

                *outcome.lock() = match &result {
                    Ok(value) => InnerOutcome::Returned(value.clone()),
                    Err(_) => InnerOutcome::Failed,
                };

                result
            })
        };

        let err = match instead(args, &tracked) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let outcome = std::mem::replace(&mut *outcome.lock(), InnerOutcome::NotCalled);

        match outcome {
            InnerOutcome::Failed => Err(err),

            InnerOutcome::Returned(value) => {
                log::error!(
                    "instead patch #{id} on `{method}` failed after calling the original: {err:?}"
                );

                Ok(value)
            }

            InnerOutcome::NotCalled => {
                log::error!("instead patch #{id} on `{method}` failed: {err:?}");
                inner.call(args)
            }
        }
    })
}
