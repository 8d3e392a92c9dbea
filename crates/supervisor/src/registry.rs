//! Capability registry: the namespaced catalog of every running worker's
//! tools, resources and prompts, and the router for invocations.
//!
//! Qualified names are `<plugin>.<local>`. Plugin names never contain a dot,
//! so the owner is always the text before the first one.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use {
    serde_json::Value,
    tokio::sync::{RwLock, watch},
    tracing::{debug, info},
};

#[cfg(feature = "metrics")]
use {
    plughub_metrics::{counter, histogram, invocations as invocation_metrics, labels},
    std::time::Instant,
};

use crate::{
    channel::WorkerChannel,
    error::{Error, FailureCode, InvocationFailure, Result},
    types::{CapabilityEntry, CapabilityKind, WorkerState},
};

/// Where a qualified name routes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub owner: String,
    pub local_name: String,
    pub kind: CapabilityKind,
}

#[derive(Clone)]
struct OwnerBinding {
    channel: Arc<WorkerChannel>,
    call_timeout: Duration,
}

#[derive(Default)]
struct RegistryInner {
    entries: BTreeMap<String, CapabilityEntry>,
    bindings: HashMap<String, OwnerBinding>,
    /// Live state of every known owner, fed by the owner's worker task.
    states: HashMap<String, watch::Receiver<WorkerState>>,
}

impl RegistryInner {
    fn owner_state(&self, owner: &str) -> Option<WorkerState> {
        self.states.get(owner).map(|rx| *rx.borrow())
    }

    fn is_running(&self, owner: &str) -> bool {
        self.owner_state(owner)
            .is_none_or(|state| state == WorkerState::Running)
    }

    fn remove_owner_entries(&mut self, owner: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.owner != owner);
        before - self.entries.len()
    }
}

#[derive(Default)]
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow an owner's lifecycle state. Owners that are tracked but not
    /// `Running` are hidden from the catalog and refuse invocations.
    pub async fn track(&self, owner: &str, state: watch::Receiver<WorkerState>) {
        self.inner.write().await.states.insert(owner.to_string(), state);
    }

    /// Drop everything known about an owner.
    pub async fn forget(&self, owner: &str) {
        let mut inner = self.inner.write().await;
        inner.remove_owner_entries(owner);
        inner.bindings.remove(owner);
        inner.states.remove(owner);
    }

    /// Replace all entries of `owner` with `entries`.
    ///
    /// Atomic: if two entries share a local name the whole batch is rejected
    /// and the registry is left untouched.
    pub async fn ingest(
        &self,
        owner: &str,
        entries: Vec<CapabilityEntry>,
        channel: Arc<WorkerChannel>,
        call_timeout: Duration,
    ) -> Result<usize> {
        let mut seen = HashSet::with_capacity(entries.len());
        for entry in &entries {
            if entry.owner != owner {
                return Err(Error::message(format!(
                    "capability '{}' does not belong to plugin '{owner}'",
                    entry.qualified_name
                )));
            }
            if !seen.insert(entry.local_name.as_str()) {
                return Err(Error::DuplicateCapability {
                    plugin: owner.to_string(),
                    name: entry.local_name.clone(),
                });
            }
        }

        let count = entries.len();
        let mut inner = self.inner.write().await;
        inner.remove_owner_entries(owner);
        for entry in entries {
            inner.entries.insert(entry.qualified_name.clone(), entry);
        }
        inner.bindings.insert(owner.to_string(), OwnerBinding {
            channel,
            call_timeout,
        });
        drop(inner);

        info!(plugin = %owner, capabilities = count, "capabilities registered");
        Ok(count)
    }

    /// Remove every entry of `owner` from the catalog. Returns how many were
    /// removed.
    pub async fn retract(&self, owner: &str) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.remove_owner_entries(owner);
        inner.bindings.remove(owner);
        drop(inner);

        if removed > 0 {
            debug!(plugin = %owner, removed, "capabilities retracted");
        }
        removed
    }

    /// Drop the owner's channel binding but keep its entries. Invocations
    /// fail with `OwnerNotRunning` until the owner ingests again.
    pub async fn unbind(&self, owner: &str) -> bool {
        self.inner.write().await.bindings.remove(owner).is_some()
    }

    pub async fn resolve(
        &self,
        qualified_name: &str,
    ) -> std::result::Result<Resolution, InvocationFailure> {
        let inner = self.inner.read().await;
        inner
            .entries
            .get(qualified_name)
            .map(|entry| Resolution {
                owner: entry.owner.clone(),
                local_name: entry.local_name.clone(),
                kind: entry.kind,
            })
            .ok_or_else(|| unknown(qualified_name))
    }

    /// Every entry whose owner is `Running`, sorted by qualified name.
    pub async fn catalog(&self) -> Vec<CapabilityEntry> {
        let inner = self.inner.read().await;
        inner
            .entries
            .values()
            .filter(|entry| inner.is_running(&entry.owner))
            .cloned()
            .collect()
    }

    /// Route an invocation to the owning worker.
    ///
    /// Fails with `OwnerNotRunning` before any I/O when the owner is known but
    /// not running. Uses the owner's `call_timeout` unless `timeout` is given.
    /// Never retries.
    pub async fn invoke(
        &self,
        qualified_name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> std::result::Result<Value, InvocationFailure> {
        let owner = owner_of(qualified_name).ok_or_else(|| unknown(qualified_name))?;

        let (binding, local_name) = {
            let inner = self.inner.read().await;
            if let Some(state) = inner.owner_state(owner)
                && state != WorkerState::Running
            {
                return Err(InvocationFailure::new(
                    FailureCode::OwnerNotRunning,
                    owner,
                    qualified_name,
                    format!("plugin '{owner}' is {state}"),
                ));
            }
            let entry = inner
                .entries
                .get(qualified_name)
                .ok_or_else(|| unknown(qualified_name))?;
            let binding = inner.bindings.get(owner).cloned().ok_or_else(|| {
                InvocationFailure::new(
                    FailureCode::OwnerNotRunning,
                    owner,
                    qualified_name,
                    format!("plugin '{owner}' has no live channel"),
                )
            })?;
            (binding, entry.local_name.clone())
        };

        let timeout = timeout.unwrap_or(binding.call_timeout);
        debug!(plugin = %owner, capability = %local_name, ?timeout, "invoking capability");

        #[cfg(feature = "metrics")]
        let start = Instant::now();

        let result = binding.channel.invoke(&local_name, arguments, timeout).await;

        #[cfg(feature = "metrics")]
        {
            counter!(invocation_metrics::TOTAL, labels::PLUGIN => owner.to_string()).increment(1);
            histogram!(invocation_metrics::DURATION_SECONDS, labels::PLUGIN => owner.to_string())
                .record(start.elapsed().as_secs_f64());
            if let Err(failure) = &result {
                counter!(
                    invocation_metrics::ERRORS_TOTAL,
                    labels::PLUGIN => owner.to_string(),
                    labels::CODE => failure.code.as_str()
                )
                .increment(1);
            }
        }

        result
    }
}

/// The plugin part of a qualified name.
#[must_use]
pub fn owner_of(qualified_name: &str) -> Option<&str> {
    qualified_name
        .split_once('.')
        .map(|(owner, _)| owner)
        .filter(|owner| !owner.is_empty())
}

fn unknown(qualified_name: &str) -> InvocationFailure {
    InvocationFailure::new(
        FailureCode::UnknownCapability,
        owner_of(qualified_name).unwrap_or_default(),
        qualified_name,
        format!("no capability named '{qualified_name}'"),
    )
}
