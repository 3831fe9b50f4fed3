//! Tool registry and the `ToolModule` interface.
//!
//! A tool module declares a namespace and a set of tools. The registry
//! computes each tool's fully-qualified name as `<namespace>.<name>`,
//! unless the module opts out of prefixing (legacy basic tools, which
//! live in the root namespace under their bare names). Fully-qualified
//! names are globally unique; conflicting registrations are rejected.
//!
//! The registry is one of the two legitimate pieces of process-wide
//! mutable state (the other is the session registry). Reads are
//! concurrent; registrations and de-registrations are serialized.

pub mod schema;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Pattern every tool name (and namespace) must match.
static TOOL_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.-]*$").expect("valid pattern"));

/// Declared failure kinds a tool can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorKind {
    /// Arguments were structurally valid but unusable
    InvalidArguments,
    /// A referenced resource does not exist
    NotFound,
    /// A dependency of the tool is unavailable
    Unavailable,
    /// An I/O operation failed
    Io,
    /// An external service reported an error
    External,
    /// The tool failed for an internal reason it chose to declare
    Internal,
}

impl ToolErrorKind {
    /// Stable string form used in error `data.kind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArguments => "invalid_arguments",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Io => "io",
            Self::External => "external",
            Self::Internal => "internal",
        }
    }
}

/// A declared tool failure.
///
/// Declared failures map to -32002; anything a tool panics with maps to
/// -32603 instead.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ToolError {
    /// Failure classification
    pub kind: ToolErrorKind,
    /// Client-safe message
    pub message: String,
    /// Optional structured details (client-safe by contract)
    pub details: Option<Value>,
}

impl ToolError {
    /// Convenience constructor without details.
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }
}

/// Definition of one tool.
///
/// Immutable once registered; changing a definition requires
/// unregistering and re-registering the module.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    /// Bare name within the module's namespace
    pub name: String,
    /// Human-readable display name
    #[serde(rename = "title", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Description shown to agents
    pub description: String,
    /// Module-declared version
    #[serde(skip_serializing)]
    pub version: String,
    /// JSON Schema for the arguments object
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    /// Optional JSON Schema for the result
    #[serde(rename = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Capability tags
    #[serde(skip_serializing)]
    pub tags: Vec<String>,
}

impl ToolDefinition {
    /// Wire representation for `tools/list`, with the fully-qualified name.
    pub fn to_wire(&self, fq_name: &str) -> Value {
        let mut wire = serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}));
        if let Some(obj) = wire.as_object_mut() {
            obj.insert("name".into(), Value::String(fq_name.to_string()));
        }
        wire
    }
}

/// Per-call context handed to a tool.
///
/// Carries everything a tool needs without referencing the dispatcher:
/// the correlation id, the deadline, the cancellation token, and a
/// tracing span for structured logging.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Correlation id of the originating request
    pub request_id: Uuid,
    /// Absolute deadline for this call
    pub deadline: Instant,
    /// Fires on client disconnect, drain, or explicit cancel
    pub cancel: CancellationToken,
    /// Span to log under
    pub span: tracing::Span,
}

impl ToolContext {
    /// Remaining time before the deadline, zero if already past.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the call has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Interface every tool module implements.
///
/// The core never inspects what a tool does; it validates arguments
/// against the declared input schema and forwards the call.
#[async_trait]
pub trait ToolModule: Send + Sync {
    /// Namespace the module's tools are prefixed with.
    fn namespace(&self) -> &str;

    /// Whether tool names get the `<namespace>.` prefix.
    ///
    /// Legacy basic-tool modules return false and live in the root
    /// namespace under their bare names.
    fn prefix_tools(&self) -> bool {
        true
    }

    /// Tools exposed by this module.
    fn list(&self) -> Vec<ToolDefinition>;

    /// Execute a tool call.
    ///
    /// `tool_name` is the bare (unprefixed) name. Implementations
    /// should observe `ctx.cancel` and abandon work when it fires.
    async fn call(&self, tool_name: &str, arguments: Value, ctx: ToolContext)
        -> Result<Value, ToolError>;

    /// Release module resources. Must be idempotent.
    async fn shutdown(&self) {}
}

/// Errors raised by registration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RegistryError {
    /// A fully-qualified name is already taken.
    #[error("tool '{name}' is already registered")]
    Conflict {
        /// The conflicting fully-qualified name
        name: String,
    },
    /// A namespace or tool name fails the naming pattern.
    #[error("invalid tool name '{name}'")]
    InvalidName {
        /// The offending name
        name: String,
    },
}

/// Handle returned by [`ToolRegistry::register`]; passes to `unregister`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationHandle(u64);

/// A resolved tool ready to be invoked.
#[derive(Clone)]
pub struct ResolvedTool {
    /// The owning module
    pub module: Arc<dyn ToolModule>,
    /// Bare name to pass to `ToolModule::call`
    pub local_name: String,
    /// Fully-qualified name
    pub fq_name: String,
    /// The tool's definition
    pub definition: ToolDefinition,
}

struct ToolEntry {
    handle: RegistrationHandle,
    module: Arc<dyn ToolModule>,
    local_name: String,
    definition: ToolDefinition,
}

#[derive(Default)]
struct Inner {
    modules: HashMap<RegistrationHandle, Arc<dyn ToolModule>>,
    tools: HashMap<String, ToolEntry>,
}

/// The process-wide tool registry.
pub struct ToolRegistry {
    inner: RwLock<Inner>,
    next_handle: AtomicU64,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Register a module and all of its tools atomically.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::InvalidName`] when the namespace or a tool name
    ///   fails the naming pattern
    /// - [`RegistryError::Conflict`] when any fully-qualified name is
    ///   already registered (no partial registration happens)
    pub fn register(
        &self,
        module: Arc<dyn ToolModule>,
    ) -> Result<RegistrationHandle, RegistryError> {
        let namespace = module.namespace().to_string();
        if module.prefix_tools() && !TOOL_NAME_RE.is_match(&namespace) {
            return Err(RegistryError::InvalidName { name: namespace });
        }

        let definitions = module.list();
        let mut staged: Vec<(String, ToolDefinition)> = Vec::with_capacity(definitions.len());
        for def in definitions {
            if !TOOL_NAME_RE.is_match(&def.name) {
                return Err(RegistryError::InvalidName {
                    name: def.name.clone(),
                });
            }
            let fq_name = if module.prefix_tools() {
                format!("{}.{}", namespace, def.name)
            } else {
                def.name.clone()
            };
            staged.push((fq_name, def));
        }

        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Conflict scan first so a failed registration leaves no trace.
        // An unprefixed legacy name that matches an existing qualified
        // name (or vice versa) is ambiguous and lands here too.
        for (fq_name, _) in &staged {
            if inner.tools.contains_key(fq_name) {
                return Err(RegistryError::Conflict {
                    name: fq_name.clone(),
                });
            }
        }
        let mut seen = std::collections::HashSet::new();
        for (fq_name, _) in &staged {
            if !seen.insert(fq_name.clone()) {
                return Err(RegistryError::Conflict {
                    name: fq_name.clone(),
                });
            }
        }

        let handle = RegistrationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        for (fq_name, definition) in staged {
            debug!(tool = %fq_name, namespace = %namespace, "Tool registered");
            inner.tools.insert(
                fq_name,
                ToolEntry {
                    handle,
                    module: module.clone(),
                    local_name: definition.name.clone(),
                    definition,
                },
            );
        }
        inner.modules.insert(handle, module);
        info!(namespace = %namespace, "Tool module registered");
        Ok(handle)
    }

    /// Remove every tool registered under `handle`.
    ///
    /// Returns the module so the caller can shut it down. Idempotent:
    /// unregistering an unknown handle returns `None`.
    pub fn unregister(&self, handle: RegistrationHandle) -> Option<Arc<dyn ToolModule>> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let module = inner.modules.remove(&handle)?;
        inner.tools.retain(|_, entry| entry.handle != handle);
        info!(namespace = %module.namespace(), "Tool module unregistered");
        Some(module)
    }

    /// Snapshot of all tool definitions with their fully-qualified names.
    pub fn list(&self) -> Vec<(String, ToolDefinition)> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut tools: Vec<(String, ToolDefinition)> = inner
            .tools
            .iter()
            .map(|(name, entry)| (name.clone(), entry.definition.clone()))
            .collect();
        tools.sort_by(|a, b| a.0.cmp(&b.0));
        tools
    }

    /// Resolve a tool name to its module and bare name.
    ///
    /// Exact match on the fully-qualified name. Root-namespace legacy
    /// tools are stored under their bare names, so the undotted-name
    /// fallback collapses into the same lookup.
    pub fn resolve(&self, name: &str) -> Option<ResolvedTool> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.tools.get(name).map(|entry| ResolvedTool {
            module: entry.module.clone(),
            local_name: entry.local_name.clone(),
            fq_name: name.to_string(),
            definition: entry.definition.clone(),
        })
    }

    /// Number of registered tools.
    pub fn tool_count(&self) -> usize {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner()).tools.len()
    }

    /// Shut down every module and clear the registry.
    ///
    /// Running it twice has the same visible effect as running it once.
    pub async fn shutdown_modules(&self) {
        let modules: Vec<Arc<dyn ToolModule>> = {
            let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.tools.clear();
            inner.modules.drain().map(|(_, module)| module).collect()
        };
        for module in modules {
            module.shutdown().await;
        }
    }
}
