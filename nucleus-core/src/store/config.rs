//! Store configuration.

use tokio::runtime::Handle;

use super::Store;

/// Settings fixed when a [`Store`] is created.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    /// Name shown in logs and in the store's `Debug` output.
    pub label: Option<String>,

    /// Runtime async read functions are spawned on.
    ///
    /// When unset, the store uses the runtime of the calling thread, if any.
    pub runtime: Option<Handle>,
}

impl StoreConfig {
    /// The runtime to spawn an async evaluation on.
    pub(crate) fn runtime(&self) -> Option<Handle> {
        self.runtime.clone().or_else(|| Handle::try_current().ok())
    }
}

/// Builder for [`Store`].
///
/// ```rust,ignore
/// let store = Store::builder()
///     .label("settings")
///     .runtime(tokio::runtime::Handle::current())
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct StoreBuilder {
    config: StoreConfig,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the store's label.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    /// Spawn async evaluations on `runtime`.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.config.runtime = Some(runtime);
        self
    }

    /// Create the store.
    pub fn build(self) -> Store {
        Store::with_config(self.config)
    }
}
