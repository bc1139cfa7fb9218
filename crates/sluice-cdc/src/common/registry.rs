//! # Handler Registry
//!
//! Static `entity_type -> [HandlerBinding]` table, built once at startup and
//! read-only afterwards. [`HandlerRegistry::invoke`] is the single handler
//! dispatch path shared by the dispatcher workers and bulk migration.
//!
//! Every binding of a type is attempted for every event of that type, in
//! registration order. A binding that returns `Ok(false)`, returns an error
//! or panics is recorded as failed; the next binding still runs.
//!
//! ## Usage
//!
//! ```ignore
//! let registry = HandlerRegistry::builder()
//!     .bind(HandlerBinding::new("users", "warehouse", "dim_users", warehouse.clone())
//!         .with_fields(["id", "name"]))
//!     .bind(HandlerBinding::new("users", "search", "users_idx", search.clone()))
//!     .build()?;
//!
//! let report = registry.invoke(&event).await;
//! ```

use crate::common::{BindingConfig, CdcError, ChangeEvent, PipelineMetrics, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Downstream sink for change events.
///
/// Invoked with at-least-once semantics: the same event may be delivered
/// again after a restart, so implementations must be idempotent with respect
/// to `(entity_id, change_kind, full_document)`.
#[async_trait]
pub trait ChangeHandler: Send + Sync {
    /// Apply one change to `table_name`, restricted to `fields` (empty = all).
    ///
    /// `Ok(false)` and `Err(_)` both signal a handler-level failure.
    async fn handle_change(
        &self,
        event: &ChangeEvent,
        table_name: &str,
        fields: &[String],
    ) -> Result<bool>;
}

/// Association of an entity type with one handler and its projection.
#[derive(Clone)]
pub struct HandlerBinding {
    pub entity_type: String,
    pub handler_name: String,
    pub target_table: String,
    pub projected_fields: Vec<String>,
    pub handler: Arc<dyn ChangeHandler>,
}

impl HandlerBinding {
    pub fn new(
        entity_type: impl Into<String>,
        handler_name: impl Into<String>,
        target_table: impl Into<String>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            handler_name: handler_name.into(),
            target_table: target_table.into(),
            projected_fields: Vec::new(),
            handler,
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projected_fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl std::fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerBinding")
            .field("entity_type", &self.entity_type)
            .field("handler_name", &self.handler_name)
            .field("target_table", &self.target_table)
            .field("projected_fields", &self.projected_fields)
            .finish_non_exhaustive()
    }
}

/// A binding that did not succeed for an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler_name: String,
    pub reason: String,
}

/// Outcome of invoking every binding of an entity type for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvocationReport {
    pub entity_type: String,
    pub entity_id: String,
    /// Bindings attempted
    pub attempted: usize,
    /// Bindings that returned `Ok(true)`
    pub succeeded: usize,
    pub failures: Vec<HandlerFailure>,
}

impl InvocationReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Read-only map from entity type to its handler bindings.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    bindings: HashMap<String, Vec<HandlerBinding>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// Build from configured bindings, resolving handler names in `handlers`.
    pub fn from_config(
        bindings: &[BindingConfig],
        handlers: &HashMap<String, Arc<dyn ChangeHandler>>,
    ) -> Result<Self> {
        let mut builder = Self::builder();
        for binding in bindings {
            let handler = handlers.get(&binding.handler).ok_or_else(|| {
                CdcError::config(format!(
                    "binding for '{}' references unknown handler '{}'",
                    binding.entity_type, binding.handler
                ))
            })?;
            builder = builder.bind(
                HandlerBinding::new(
                    &binding.entity_type,
                    &binding.handler,
                    &binding.table,
                    handler.clone(),
                )
                .with_fields(binding.fields.iter().cloned()),
            );
        }
        builder.build()
    }

    /// Bindings for an entity type, in registration order.
    pub fn bindings_for(&self, entity_type: &str) -> &[HandlerBinding] {
        self.bindings
            .get(entity_type)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Entity types with at least one binding, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.bindings.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.bindings.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Invoke every binding of the event's entity type, isolating failures.
    pub async fn invoke(&self, event: &ChangeEvent) -> InvocationReport {
        let bindings = self.bindings_for(&event.entity_type);
        let mut report = InvocationReport {
            entity_type: event.entity_type.clone(),
            entity_id: event.entity_id.clone(),
            attempted: bindings.len(),
            ..Default::default()
        };

        if bindings.is_empty() {
            debug!("No handlers bound for {}", event.entity_type);
            return report;
        }

        for binding in bindings {
            let call = binding.handler.handle_change(
                event,
                &binding.target_table,
                &binding.projected_fields,
            );
            let reason = match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(true)) => {
                    report.succeeded += 1;
                    continue;
                }
                Ok(Ok(false)) => "handler reported failure".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(&*panic)),
            };

            warn!(
                entity_type = %event.entity_type,
                entity_id = %event.entity_id,
                change_kind = %event.change_kind,
                handler = %binding.handler_name,
                "Handler failed: {}",
                reason
            );
            PipelineMetrics::record_handler_failure(&event.entity_type, &binding.handler_name);
            report.failures.push(HandlerFailure {
                handler_name: binding.handler_name.clone(),
                reason,
            });
        }

        report
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

/// Builder for [`HandlerRegistry`].
#[derive(Debug, Default)]
pub struct HandlerRegistryBuilder {
    bindings: Vec<HandlerBinding>,
}

impl HandlerRegistryBuilder {
    pub fn bind(mut self, binding: HandlerBinding) -> Self {
        self.bindings.push(binding);
        self
    }

    /// Build the registry; the same handler name may not be bound twice to
    /// one entity type.
    pub fn build(self) -> Result<HandlerRegistry> {
        let mut seen = HashSet::new();
        let mut bindings: HashMap<String, Vec<HandlerBinding>> = HashMap::new();

        for binding in self.bindings {
            if binding.entity_type.is_empty() {
                return Err(CdcError::config("binding entity_type must not be empty"));
            }
            if !seen.insert((binding.entity_type.clone(), binding.handler_name.clone())) {
                return Err(CdcError::config(format!(
                    "handler '{}' bound twice to '{}'",
                    binding.handler_name, binding.entity_type
                )));
            }
            bindings
                .entry(binding.entity_type.clone())
                .or_default()
                .push(binding);
        }

        Ok(HandlerRegistry { bindings })
    }
}
