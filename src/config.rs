//! Store configuration.

use std::fmt;
use std::sync::Arc;

use serde::Deserialize;

use crate::plugin::{DevtoolsHook, Plugin, TracingDevtools};
use crate::runtime::ReactiveRuntime;
use crate::store::Store;

/// Options for [`Store::with_options`].
///
/// # Examples
///
/// ```
/// use larder::{Module, Store, StoreOptions};
///
/// let options = StoreOptions::default()
///     .strict(true)
///     .plugin(|store: &Store| {
///         store.subscribe(|mutation, _| println!("{}", mutation.kind));
///     });
/// let store = Store::with_options(Module::new(), options).unwrap();
/// ```
pub struct StoreOptions {
    pub(crate) strict: bool,
    pub(crate) dev_mode: bool,
    pub(crate) devtools: Option<Arc<dyn DevtoolsHook>>,
    pub(crate) plugins: Vec<Plugin>,
    pub(crate) runtime: Option<Arc<ReactiveRuntime>>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            strict: false,
            dev_mode: cfg!(debug_assertions),
            devtools: None,
            plugins: Vec::new(),
            runtime: None,
        }
    }
}

impl StoreOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject state writes made outside mutations. Only checked when
    /// `dev_mode` is on.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Enable developer-mode assertions. Defaults to on in debug builds.
    pub fn dev_mode(mut self, dev_mode: bool) -> Self {
        self.dev_mode = dev_mode;
        self
    }

    pub fn devtools(mut self, hook: Arc<dyn DevtoolsHook>) -> Self {
        self.devtools = Some(hook);
        self
    }

    /// Add a plugin. Plugins run in the order they were added.
    pub fn plugin<F>(mut self, plugin: F) -> Self
    where
        F: FnOnce(&Store) + Send + 'static,
    {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Build the store against `runtime` instead of the global one.
    pub fn runtime(mut self, runtime: Arc<ReactiveRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl fmt::Debug for StoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreOptions")
            .field("strict", &self.strict)
            .field("dev_mode", &self.dev_mode)
            .field("devtools", &self.devtools.is_some())
            .field("plugins", &self.plugins.len())
            .finish()
    }
}

/// The serializable subset of [`StoreOptions`].
///
/// ```
/// use larder::StoreConfig;
///
/// let config: StoreConfig = serde_json::from_str(r#"{ "strict": true }"#).unwrap();
/// assert!(config.strict);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub strict: bool,
    /// `None` keeps the build-profile default.
    pub dev_mode: Option<bool>,
    /// Attach [`TracingDevtools`].
    pub devtools: bool,
}

impl StoreConfig {
    pub fn into_options(self) -> StoreOptions {
        let mut options = StoreOptions::default().strict(self.strict);
        if let Some(dev_mode) = self.dev_mode {
            options = options.dev_mode(dev_mode);
        }
        if self.devtools {
            options = options.devtools(Arc::new(TracingDevtools));
        }
        options
    }
}

impl From<StoreConfig> for StoreOptions {
    fn from(config: StoreConfig) -> Self {
        config.into_options()
    }
}
