//! Generic service lifecycle registry.
//!
//! Generalized from the teacher's `ServicesManager` (which hardcoded
//! auth/database/graphql/logging slots with typed getters) to a plain named
//! registry: this design has no such singletons, just the HTTP listener and
//! the Cleanup Reaper, both registered the same way any `Service` is.
//!
//! Services register with the manager and are started/stopped together, in
//! dependency order ([`Service::dependencies`]). Any service (or `main`) can
//! also contribute `/api/*` routes via [`ServicesManagerBuilder::add_api_routes`]
//! without the HTTP server needing to know about it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{info, warn};

use crate::app::AppState;

/// Health status of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Result of a service health check.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ServiceHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

/// A service that can be started, stopped, and health-checked by the
/// manager. Implement this for components that run background tasks (the
/// HTTP listener, the Cleanup Reaper) or hold a lifecycle of their own.
/// Plain `Arc`-shared components with no lifecycle (the Backend Registry,
/// Session Manager, Decision Engine, Segment Directory Service) are
/// constructed once in `main` and placed in `AppState` directly instead.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Unique name for logging and lookup (e.g. "http", "reaper").
    fn name(&self) -> &str;

    /// Names of services that must be started before this one.
    fn dependencies(&self) -> Vec<String> {
        Vec::new()
    }

    /// Start background tasks or connections. Idempotent allowed.
    async fn start(&self) -> Result<()>;

    /// Stop background tasks and release resources. Idempotent allowed.
    async fn stop(&self) -> Result<()>;

    /// Report current health. Used by the manager and by health endpoints.
    async fn health(&self) -> Result<ServiceHealth> {
        Ok(ServiceHealth::healthy())
    }

    /// Whether this service exposes HTTP routes.
    fn provides_routes(&self) -> bool {
        false
    }
}

type RouteBuilder = Box<dyn Fn(AppState) -> Router<AppState> + Send + Sync>;

/// Builder for [`ServicesManager`]: add services, then [`build`](Self::build)
/// or [`start`](Self::start).
#[derive(Default)]
pub struct ServicesManagerBuilder {
    services: Vec<Arc<dyn Service>>,
    api_route_builders: Vec<(String, RouteBuilder)>,
}

impl ServicesManagerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route builder for `/api/*`. All registered builders are
    /// merged in order when the app is built.
    pub fn add_api_routes<N, F>(mut self, name: N, builder: F) -> Self
    where
        N: Into<String>,
        F: Fn(AppState) -> Router<AppState> + Send + Sync + 'static,
    {
        self.api_route_builders.push((name.into(), Box::new(builder)));
        self
    }

    pub fn add_service(mut self, service: Arc<dyn Service>) -> Self {
        self.services.push(service);
        self
    }

    /// Build the manager and register all services. Does not start them.
    pub fn build(self) -> Arc<ServicesManager> {
        let manager = ServicesManager::new();
        for (name, builder) in self.api_route_builders {
            manager.register_api_routes(name, builder);
        }
        for service in self.services {
            manager.register_sync(service);
        }
        Arc::new(manager)
    }

    /// Build the manager, register all services, and start them in
    /// dependency order.
    pub async fn start(self) -> Result<Arc<ServicesManager>> {
        let manager = self.build();
        manager.start_all().await?;
        Ok(manager)
    }
}

/// Registry and lifecycle controller for services.
pub struct ServicesManager {
    services: RwLock<HashMap<String, Arc<dyn Service>>>,
    started: RwLock<HashSet<String>>,
    api_route_builders: RwLock<Vec<(String, RouteBuilder)>>,
}

impl Default for ServicesManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServicesManager {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            started: RwLock::new(HashSet::new()),
            api_route_builders: RwLock::new(Vec::new()),
        }
    }

    pub fn builder() -> ServicesManagerBuilder {
        ServicesManagerBuilder::new()
    }

    pub fn register_api_routes(&self, name: String, builder: RouteBuilder) {
        self.api_route_builders.write().push((name, builder));
    }

    /// Build the merged `/api` router from all registered route builders.
    pub fn build_api_router(&self, state: AppState) -> Router<AppState> {
        let builders = self.api_route_builders.read();
        let mut api = Router::new();
        for (name, f) in builders.iter() {
            api = api.merge(f(state.clone()));
            tracing::debug!(api_routes = %name, "merged API route builder");
        }
        api
    }

    fn register_sync(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let mut guard = self.services.write();
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "service '{}' reregistered, overwriting previous", name);
        }
    }

    pub async fn register(&self, service: Arc<dyn Service>) {
        let name = service.name().to_string();
        let mut guard = self.services.write();
        if guard.insert(name.clone(), service).is_some() {
            warn!(service = %name, "service '{}' reregistered, overwriting previous", name);
        } else {
            info!(service = %name, "service '{}' registered", name);
        }
    }

    async fn start_order(&self) -> Result<Vec<String>> {
        let guard = self.services.read();
        let names: HashSet<String> = guard.keys().cloned().collect();
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for (name, svc) in guard.iter() {
            let d = svc.dependencies();
            for dep in &d {
                if !names.contains(dep) {
                    anyhow::bail!("service {} depends on {} which is not registered", name, dep);
                }
            }
            deps.insert(name.clone(), d);
        }
        drop(guard);

        let mut in_degree: HashMap<String, usize> =
            deps.iter().map(|(name, d)| (name.clone(), d.len())).collect();
        let mut dependent_on: HashMap<String, Vec<String>> =
            names.iter().map(|n| (n.clone(), Vec::new())).collect();
        for (name, d) in &deps {
            for dep in d {
                dependent_on.get_mut(dep).unwrap().push(name.clone());
            }
        }
        let mut queue: Vec<String> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| n.clone())
            .collect();
        let mut order = Vec::with_capacity(names.len());
        while let Some(n) = queue.pop() {
            order.push(n.clone());
            for s in dependent_on.get(&n).unwrap_or(&vec![]) {
                let deg = in_degree.get_mut(s).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push(s.clone());
                }
            }
        }
        if order.len() != names.len() {
            anyhow::bail!("service dependency cycle detected");
        }
        Ok(order)
    }

    pub async fn start_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in &order {
            let svc = self.services.read().get(name).cloned();
            if let Some(s) = svc {
                if let Err(e) = s.start().await {
                    warn!(service = %name, error = %e, "service '{}' start failed", name);
                    return Err(e).context(format!("failed to start service {}", name));
                }
                self.started.write().insert(name.clone());
                info!(service = %name, "service '{}' started", name);
            }
        }
        Ok(())
    }

    pub async fn stop_all(&self) -> Result<()> {
        let order = self.start_order().await?;
        for name in order.into_iter().rev() {
            let svc = self.services.read().get(&name).cloned();
            if let Some(s) = svc {
                if let Err(e) = s.stop().await {
                    warn!(service = %name, error = %e, "service '{}' stop failed", name);
                } else {
                    info!(service = %name, "service '{}' stopped", name);
                }
                self.started.write().remove(&name);
            }
        }
        Ok(())
    }

    pub async fn health_all(&self) -> HashMap<String, ServiceHealth> {
        let names: Vec<String> = self.services.read().keys().cloned().collect();
        let mut out = HashMap::new();
        for name in names {
            let svc = self.services.read().get(&name).cloned();
            if let Some(s) = svc {
                let h = match s.health().await {
                    Ok(h) => h,
                    Err(e) => ServiceHealth::unhealthy(e.to_string()),
                };
                out.insert(name, h);
            }
        }
        out
    }

    pub async fn is_started(&self, name: &str) -> bool {
        self.started.read().contains(name)
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.read().get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}
