//! Runtime function injection for host applications.
//!
//! The host exposes its loaded modules through a [`modules::ModuleRegistry`]. Features use a
//! [`modules::Locator`] to find the functions they care about, patch them through a
//! [`hook::Injector`], and take the patches off again when they are stopped.

pub mod cache;
pub mod error;
pub mod features;
pub mod hook;
pub mod logging;
pub mod meta;
pub mod modules;
pub mod value;

use std::path::Path;

pub use error::{Error, Result};
pub use features::{Feature, Features};
pub use hook::{Injector, PatchHandle, PatchKind};
pub use modules::{Locator, Module, ModuleCache, ModuleRegistry};
pub use value::{Function, List, Object, Value};

/// Sets up logging. Call this before anything else so that everything after it can log.
pub fn init(log_path: impl AsRef<Path>) -> eyre::Result<()> {
    logging::init(log_path)?;

    log::info!("rehook {} loaded", env!("CARGO_PKG_VERSION"));
    Ok(())
}
