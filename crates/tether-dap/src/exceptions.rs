//! Exception breakpoint filters.
//!
//! Adapters advertise a set of named filters ("uncaught exceptions", ...)
//! in their capabilities. The registry merges that set with the user's
//! persisted choices, answers which filters are currently applicable, and
//! pushes the full enabled-id list to every connected server whenever a
//! filter is toggled.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::client::DapClient;
use crate::dap::types::{ExceptionBreakpointsFilter, SetExceptionBreakpointsArguments};
use crate::error::SyncError;
use crate::settings::FilterSettingsStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionFilter {
    pub id: String,
    pub label: String,
    pub enabled: bool,
}

pub struct ExceptionFilterRegistry {
    adapter_id: String,
    store: Arc<FilterSettingsStore>,
    filters: RwLock<Vec<ExceptionFilter>>,
    servers: RwLock<Vec<DapClient>>,
}

impl ExceptionFilterRegistry {
    pub fn new(adapter_id: impl Into<String>, store: Arc<FilterSettingsStore>) -> Self {
        Self {
            adapter_id: adapter_id.into(),
            store,
            filters: RwLock::new(Vec::new()),
            servers: RwLock::new(Vec::new()),
        }
    }

    /// Merge server-advertised filters with the persisted enabled/disabled
    /// state (matched by filter id) and return the resulting enabled subset.
    /// Filters no longer advertised are dropped; newly advertised ones start
    /// from their server-declared default.
    pub fn refresh(&self, advertised: &[ExceptionBreakpointsFilter]) -> Vec<ExceptionFilter> {
        let persisted = self.store.exception_filters(&self.adapter_id);

        let merged: Vec<ExceptionFilter> = advertised
            .iter()
            .filter(|filter| !filter.filter.is_empty())
            .map(|filter| ExceptionFilter {
                id: filter.filter.clone(),
                label: if filter.label.is_empty() {
                    filter.filter.clone()
                } else {
                    filter.label.clone()
                },
                enabled: persisted
                    .get(&filter.filter)
                    .copied()
                    .unwrap_or(filter.default_enabled),
            })
            .collect();

        self.persist(&merged);
        *self.filters.write() = merged;
        self.applicable_filters()
    }

    /// The currently enabled subset.
    pub fn applicable_filters(&self) -> Vec<ExceptionFilter> {
        self.filters
            .read()
            .iter()
            .filter(|filter| filter.enabled)
            .cloned()
            .collect()
    }

    pub fn filters(&self) -> Vec<ExceptionFilter> {
        self.filters.read().clone()
    }

    /// Toggle one filter and re-send the full enabled-id list to every
    /// connected server. Failures are isolated per server.
    pub async fn set_enabled(&self, filter_id: &str, enabled: bool) -> Vec<SyncError> {
        {
            let mut filters = self.filters.write();
            let Some(filter) = filters.iter_mut().find(|f| f.id == filter_id) else {
                tracing::warn!(
                    target: "tether.dap",
                    filter = filter_id,
                    "toggled unknown exception filter"
                );
                return Vec::new();
            };
            filter.enabled = enabled;
            self.persist(&filters);
        }

        let servers: Vec<DapClient> = self.servers.read().clone();
        let mut failures = Vec::new();
        let mut calls = tokio::task::JoinSet::new();
        for server in servers {
            let arguments = self.arguments();
            calls.spawn(async move {
                let server_id = server.id();
                server
                    .set_exception_breakpoints(arguments)
                    .await
                    .map_err(|err| SyncError {
                        request: "setExceptionBreakpoints",
                        server: server_id,
                        path: None,
                        message: err.to_string(),
                    })
            });
        }
        while let Some(joined) = calls.join_next().await {
            if let Ok(Err(err)) = joined {
                tracing::warn!(target: "tether.dap", "{err}");
                failures.push(err);
            }
        }
        failures
    }

    /// Register a newly connected server, merge its advertised filters, and
    /// push the enabled set to it.
    pub async fn initialize(
        &self,
        server: &DapClient,
        advertised: &[ExceptionBreakpointsFilter],
    ) -> Result<(), SyncError> {
        self.servers.write().push(server.clone());
        if advertised.is_empty() {
            return Ok(());
        }
        self.refresh(advertised);
        server
            .set_exception_breakpoints(self.arguments())
            .await
            .map_err(|err| SyncError {
                request: "setExceptionBreakpoints",
                server: server.id(),
                path: None,
                message: err.to_string(),
            })
    }

    pub fn remove_server(&self, server_id: u64) {
        self.servers.write().retain(|s| s.id() != server_id);
    }

    fn arguments(&self) -> SetExceptionBreakpointsArguments {
        SetExceptionBreakpointsArguments {
            filters: self
                .applicable_filters()
                .into_iter()
                .map(|filter| filter.id)
                .collect(),
        }
    }

    fn persist(&self, filters: &[ExceptionFilter]) {
        let map: BTreeMap<String, bool> = filters
            .iter()
            .map(|filter| (filter.id.clone(), filter.enabled))
            .collect();
        self.store.set_exception_filters(&self.adapter_id, map);
    }
}
