//! Lifecycle hooks and the plugins that attach to them.
//!
//! # Events
//!
//! Every hook point is a variant of [`HookEvent`] carrying its own payload.
//! Payloads that plugins are allowed to change are borrowed mutably:
//!
//! | Event | Payload | Fired |
//! |---|---|---|
//! | `BeforeBuild` | options | once, before listing |
//! | `AfterListing` | all listed objects (mutable) | once |
//! | `BeforeDispatch` | prepared tasks | once |
//! | `BeforePhotoProcess` | task | per processed photo |
//! | `AfterPhotoProcess` | task, item (mutable), fresh thumbnail path | per processed photo |
//! | `AfterDispatch` | stats | once |
//! | `BeforeManifestSave` | manifest (mutable) | once |
//! | `AfterManifestSave` | manifest, path | once |
//! | `AfterBuild` | summary | once |
//! | `OnError` | message | on a run-aborting error |
//!
//! # Dispatch
//!
//! [`HookRegistry::emit`] runs handlers sequentially in registration order
//! and stops at the first error, which aborts the run. Handlers share state
//! through the [`RunScope`] in the [`HookContext`], a key/value map that
//! lives for exactly one run.
//!
//! # Plugins
//!
//! `[[plugins]]` entries resolve against the built-ins in [`builtin`]; code
//! embedding the builder can pass extra [`Plugin`] values. A plugin gets a
//! [`PluginInitContext`] once at startup: the resolved config, its own
//! options table, a logging span, the hook registry and the storage
//! provider registry (so a plugin can add a backend).

pub mod builtin;

use crate::builder::{BuildOptions, BuildSummary};
use crate::cache::{BuildStats, ProcessScope};
use crate::config::BuilderConfig;
use crate::storage::{ProviderRegistry, StorageManager};
use crate::types::{BuildTask, Manifest, ManifestItem, StorageObject};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PluginError {
    #[error("unknown plugin '{0}'")]
    Unknown(String),
    #[error("invalid options for plugin '{plugin}': {message}")]
    Options { plugin: String, message: String },
    #[error("plugin '{plugin}' failed to initialize: {message}")]
    Init { plugin: String, message: String },
    #[error("plugin '{plugin}' failed in {event}: {message}")]
    Hook {
        plugin: String,
        event: EventKind,
        message: String,
    },
}

impl PluginError {
    /// Failure inside a handler; the plugin and event are filled in by
    /// [`HookRegistry::emit`].
    pub fn hook(message: impl fmt::Display) -> Self {
        Self::Hook {
            plugin: String::new(),
            event: EventKind::OnError,
            message: message.to_string(),
        }
    }
}

/// Hook points, without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeBuild,
    AfterListing,
    BeforeDispatch,
    BeforePhotoProcess,
    AfterPhotoProcess,
    AfterDispatch,
    BeforeManifestSave,
    AfterManifestSave,
    AfterBuild,
    OnError,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A hook invocation and its payload.
#[derive(Debug)]
pub enum HookEvent<'a> {
    BeforeBuild {
        options: &'a BuildOptions,
    },
    AfterListing {
        objects: &'a mut Vec<StorageObject>,
    },
    BeforeDispatch {
        tasks: &'a [BuildTask],
    },
    BeforePhotoProcess {
        task: &'a BuildTask,
    },
    AfterPhotoProcess {
        task: &'a BuildTask,
        item: &'a mut ManifestItem,
        scope: ProcessScope,
        /// Set when a thumbnail was written during this run.
        thumbnail_path: Option<&'a Path>,
    },
    AfterDispatch {
        stats: &'a BuildStats,
    },
    BeforeManifestSave {
        manifest: &'a mut Manifest,
    },
    AfterManifestSave {
        manifest: &'a Manifest,
        path: &'a Path,
    },
    AfterBuild {
        summary: &'a BuildSummary,
    },
    OnError {
        message: &'a str,
    },
}

impl HookEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::BeforeBuild { .. } => EventKind::BeforeBuild,
            Self::AfterListing { .. } => EventKind::AfterListing,
            Self::BeforeDispatch { .. } => EventKind::BeforeDispatch,
            Self::BeforePhotoProcess { .. } => EventKind::BeforePhotoProcess,
            Self::AfterPhotoProcess { .. } => EventKind::AfterPhotoProcess,
            Self::AfterDispatch { .. } => EventKind::AfterDispatch,
            Self::BeforeManifestSave { .. } => EventKind::BeforeManifestSave,
            Self::AfterManifestSave { .. } => EventKind::AfterManifestSave,
            Self::AfterBuild { .. } => EventKind::AfterBuild,
            Self::OnError { .. } => EventKind::OnError,
        }
    }
}

/// Per-run key/value state shared by all handlers.
#[derive(Debug, Default)]
pub struct RunScope {
    values: Mutex<HashMap<String, serde_json::Value>>,
}

impl RunScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().ok()?.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: serde_json::Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().ok()?.remove(key)
    }

    /// Add `by` to an integer counter, returning the new value.
    pub fn increment(&self, key: &str, by: i64) -> i64 {
        let Ok(mut values) = self.values.lock() else {
            return 0;
        };
        let next = values.get(key).and_then(|v| v.as_i64()).unwrap_or(0) + by;
        values.insert(key.to_string(), next.into());
        next
    }
}

/// What every handler can reach besides its payload.
pub struct HookContext<'a> {
    pub config: &'a BuilderConfig,
    pub storage: &'a StorageManager,
    pub run: &'a RunScope,
}

pub type Handler =
    Box<dyn Fn(&mut HookEvent<'_>, &HookContext<'_>) -> Result<(), PluginError> + Send + Sync>;

/// Ordered handlers per event.
#[derive(Default)]
pub struct HookRegistry {
    handlers: HashMap<EventKind, Vec<(String, Handler)>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut counts: Vec<(EventKind, usize)> =
            self.handlers.iter().map(|(k, v)| (*k, v.len())).collect();
        counts.sort_by_key(|(k, _)| format!("{k}"));
        f.debug_struct("HookRegistry").field("handlers", &counts).finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler for `kind`.
    pub fn on<F>(&mut self, kind: EventKind, plugin: &str, handler: F)
    where
        F: Fn(&mut HookEvent<'_>, &HookContext<'_>) -> Result<(), PluginError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers
            .entry(kind)
            .or_default()
            .push((plugin.to_string(), Box::new(handler)));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Run every handler for the event, in order. The first error stops
    /// the rest and is returned.
    pub fn emit(&self, event: &mut HookEvent<'_>, ctx: &HookContext<'_>) -> Result<(), PluginError> {
        let kind = event.kind();
        let Some(handlers) = self.handlers.get(&kind) else {
            return Ok(());
        };
        for (plugin, handler) in handlers {
            tracing::trace!(plugin, event = %kind, "hook");
            handler(event, ctx).map_err(|e| match e {
                PluginError::Hook { message, .. } => PluginError::Hook {
                    plugin: plugin.clone(),
                    event: kind,
                    message,
                },
                other => other,
            })?;
        }
        Ok(())
    }
}

/// Startup context handed to [`Plugin::init`].
pub struct PluginInitContext<'a> {
    pub config: &'a BuilderConfig,
    pub options: &'a toml::Table,
    pub span: tracing::Span,
    pub hooks: &'a mut HookRegistry,
    pub providers: &'a mut ProviderRegistry,
}

impl PluginInitContext<'_> {
    /// Deserialize this plugin's options table.
    pub fn options<T: DeserializeOwned>(&self, plugin: &str) -> Result<T, PluginError> {
        parse_options(plugin, self.options)
    }
}

pub fn parse_options<T: DeserializeOwned>(
    plugin: &str,
    options: &toml::Table,
) -> Result<T, PluginError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|e: toml::de::Error| PluginError::Options {
            plugin: plugin.to_string(),
            message: e.to_string(),
        })
}

/// Trusted in-process extension.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Register hooks and providers. Called once, in configuration order.
    fn init(self: Arc<Self>, ctx: &mut PluginInitContext<'_>) -> Result<(), PluginError>;
}

/// Initialized plugins plus their hooks.
#[derive(Debug, Default)]
pub struct PluginHost {
    names: Vec<String>,
    hooks: HookRegistry,
}

impl PluginHost {
    /// Resolve `[[plugins]]` against the built-ins, add the geocoding plugin
    /// when `[geocoding] enabled` and it is not listed, then append `extra`.
    /// Every plugin is initialized in that order.
    pub fn load(
        config: &BuilderConfig,
        providers: &mut ProviderRegistry,
        extra: Vec<Arc<dyn Plugin>>,
    ) -> Result<Self, PluginError> {
        let empty = toml::Table::new();
        let mut entries: Vec<(Arc<dyn Plugin>, &toml::Table)> = Vec::new();
        for entry in &config.plugins {
            entries.push((builtin::create(&entry.name, config, &entry.options)?, &entry.options));
        }
        let listed = |name: &str| config.plugins.iter().any(|p| p.name == name);
        if config.geocoding.enabled && !listed(builtin::GEOCODING) {
            entries.push((builtin::create(builtin::GEOCODING, config, &empty)?, &empty));
        }
        for plugin in extra {
            entries.push((plugin, &empty));
        }

        let mut host = Self::default();
        for (plugin, options) in entries {
            let name = plugin.name().to_string();
            let mut ctx = PluginInitContext {
                config,
                options,
                span: tracing::info_span!("plugin", name = %name),
                hooks: &mut host.hooks,
                providers: &mut *providers,
            };
            plugin.init(&mut ctx)?;
            tracing::debug!(plugin = %name, "plugin initialized");
            host.names.push(name);
        }
        Ok(host)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    pub fn emit(&self, event: &mut HookEvent<'_>, ctx: &HookContext<'_>) -> Result<(), PluginError> {
        self.hooks.emit(event, ctx)
    }
}
