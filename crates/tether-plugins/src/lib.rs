//! # tether-plugins
//!
//! The event dispatch engine:
//!
//! - [`matcher`]: compiles `match`/`prefix` declarations into a [`Matcher`]
//! - [`loader`]: discovers JSON plugin manifests and builds [`Plugin`]s
//! - [`registry`]: the process-wide [`PluginRegistry`] with per-event buckets
//! - [`dispatcher`]: one [`Dispatcher`] per connected socket
//! - [`watcher`]: debounced hot reload via [`HotReloader`]
//! - [`catalog`] / [`script`]: native and external-command handlers

#![deny(unsafe_code)]

pub mod catalog;
pub mod dispatcher;
pub mod error;
pub mod loader;
pub mod matcher;
pub mod plugin;
pub mod registry;
pub mod script;
pub mod watcher;

pub use catalog::HandlerCatalog;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use error::PluginError;
pub use loader::{LoadReport, LoaderConfig, PluginLoader};
pub use matcher::{Matcher, PrefixPolicy, Trigger};
pub use plugin::{handler_fn, Plugin, PluginHandler};
pub use registry::{Bucket, PluginRegistry, Replaced};
pub use watcher::{HotReloader, ReloadOutcome};
