//! Finds modules in the host's registry by what they contain rather than by name.

pub mod filters;

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::value::Object;
pub use filters::{Filter, SourcePattern};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleId(Arc<str>);

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModuleId {
    fn from(id: &str) -> Self {
        ModuleId(id.into())
    }
}

impl From<u64> for ModuleId {
    fn from(id: u64) -> Self {
        ModuleId(id.to_string().into())
    }
}

/// A module the host has loaded. The host owns it; this is just a reference to it.
#[derive(Debug, Clone)]
pub struct Module {
    id: ModuleId,
    exports: Object,
    source: Arc<str>,
}

impl Module {
    pub fn new(id: impl Into<ModuleId>, exports: Object, source: &str) -> Module {
        Module {
            id: id.into(),
            exports,
            source: source.into(),
        }
    }

    pub fn id(&self) -> &ModuleId {
        &self.id
    }

    pub fn exports(&self) -> &Object {
        &self.exports
    }

    /// The module's code as text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns the name of the first export that is a function.
    pub fn function_name(&self) -> Option<String> {
        self.exports
            .entries()
            .into_iter()
            .find(|(_, value)| value.as_function().is_some())
            .map(|(name, _)| name)
    }
}

pub type Listener = Arc<dyn Fn(&Module) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// The host's module system, as far as the locator needs to see it.
pub trait ModuleRegistry: Send + Sync {
    /// Every module loaded so far, in the order they were loaded.
    fn loaded(&self) -> Vec<Module>;

    /// Calls `listener` with each module loaded from now on.
    fn subscribe(&self, listener: Listener) -> Subscription;

    fn unsubscribe(&self, subscription: Subscription);
}

/// An in-process module registry. Hosts register modules as they load them.
#[derive(Default)]
pub struct ModuleCache {
    modules: Mutex<Vec<Module>>,
    listeners: Mutex<Vec<(Subscription, Listener)>>,
    next_subscription: AtomicU64,
}

impl ModuleCache {
    pub fn new() -> ModuleCache {
        ModuleCache::default()
    }

    /// Adds a module and tells every listener about it. Returns `None` if a module with the same
    /// id is already registered.
    pub fn register(
        &self,
        id: impl Into<ModuleId>,
        exports: Object,
        source: &str,
    ) -> Option<Module> {
        let module = Module::new(id, exports, source);

        {
            let mut modules = self.modules.lock();

            if modules.iter().any(|existing| existing.id == module.id) {
                log::warn!("module {} is already registered", module.id);
                return None;
            }

            modules.push(module.clone());
        }

        // Listeners may subscribe or unsubscribe while being called, so call a snapshot.
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();

        for listener in listeners {
            listener(&module);
        }

        Some(module)
    }

    pub fn len(&self) -> usize {
        self.modules.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ModuleRegistry for ModuleCache {
    fn loaded(&self) -> Vec<Module> {
        self.modules.lock().clone()
    }

    fn subscribe(&self, listener: Listener) -> Subscription {
        let subscription = Subscription(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((subscription, listener));
        subscription
    }

    fn unsubscribe(&self, subscription: Subscription) {
        self.listeners.lock().retain(|(sub, _)| *sub != subscription);
    }
}

/// Searches a registry. Holds no state of its own.
#[derive(Clone)]
pub struct Locator {
    registry: Arc<dyn ModuleRegistry>,
}

impl Locator {
    pub fn new(registry: Arc<dyn ModuleRegistry>) -> Locator {
        Locator { registry }
    }

    /// Returns the first loaded module that passes `filter`, if any.
    pub fn find(&self, filter: &Filter) -> Option<Module> {
        self.registry
            .loaded()
            .into_iter()
            .find(|module| filter.matches(module))
    }

    pub fn find_all(&self, filter: &Filter) -> Vec<Module> {
        self.registry
            .loaded()
            .into_iter()
            .filter(|module| filter.matches(module))
            .collect()
    }

    pub fn get_by_props<I, S>(&self, props: I) -> Option<Module>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.find(&filters::by_props(props))
    }

    pub fn get_by_source(&self, pattern: impl Into<SourcePattern>) -> Option<Module> {
        self.find(&filters::by_source(pattern))
    }

    /// Finds the object that holds all of `props`. This is either a module's exports or one of the
    /// objects it exports, since hosts often nest the useful part one level down.
    pub fn get_export_for_props(&self, props: &[&str]) -> Option<Object> {
        let has_all = |object: &Object| props.iter().all(|prop| object.contains(prop));

        self.registry.loaded().into_iter().find_map(|module| {
            let exports = module.exports();

            if has_all(exports) {
                return Some(exports.clone());
            }

            exports.entries().into_iter().find_map(|(_, value)| {
                value
                    .as_object()
                    .filter(|object| has_all(object))
                    .cloned()
            })
        })
    }

    /// Resolves with the first module that passes `filter`, whether it is already loaded or loads
    /// later. Never resolves if no such module is ever loaded; wrap it in a timeout if that
    /// matters.
    pub fn wait_for(&self, filter: Filter) -> ModuleWait {
        let (sender, receiver) = oneshot::channel();
        let sender = Arc::new(Mutex::new(Some(sender)));
        let filter = Arc::new(filter);

        // Subscribe before scanning so that nothing loaded in between is missed.
        let subscription = self.registry.subscribe({
            let sender = sender.clone();
            let filter = filter.clone();

            Arc::new(move |module: &Module| {
                if filter.matches(module) {
                    deliver(&sender, module.clone());
                }
            })
        });

        if let Some(module) = self.find(&filter) {
            deliver(&sender, module);
        }

        ModuleWait {
            receiver,
            registry: self.registry.clone(),
            subscription: Some(subscription),
        }
    }
}

/// Sends `module` unless a match has already been sent. Only the first match gets through.
fn deliver(sender: &Mutex<Option<oneshot::Sender<Module>>>, module: Module) {
    if let Some(sender) = sender.lock().take() {
        let _ = sender.send(module);
    }
}

/// A pending module search. Dropping it stops listening for new modules.
pub struct ModuleWait {
    receiver: oneshot::Receiver<Module>,
    registry: Arc<dyn ModuleRegistry>,
    subscription: Option<Subscription>,
}

impl ModuleWait {
    fn stop_listening(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.registry.unsubscribe(subscription);
        }
    }
}

impl Future for ModuleWait {
    type Output = Module;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Module> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(module)) => {
                self.stop_listening();
                Poll::Ready(module)
            }

            // The registry went away without a match, so no match can ever arrive.
            Poll::Ready(Err(_)) => Poll::Pending,

            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ModuleWait {
    fn drop(&mut self) {
        self.stop_listening();
    }
}
