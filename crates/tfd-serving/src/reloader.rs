//! Fleet reconciliation: explicit reloads and the periodic drift loop.
//!
//! The explicit path (`reload_models`) resolves a fleet's endpoints and
//! drives them to the current config blob with a two-phase push: first
//! the blob with labels stripped, then the full blob. Instances refuse
//! labels that reference versions they have not yet loaded, so clearing
//! labels first guarantees the real push succeeds even for brand-new
//! versions.
//!
//! The periodic path compares each fleet's discovered endpoints against
//! the last observed snapshot and probes the first config entry's highest
//! version for availability; changed or drifted fleets get the same
//! two-phase push.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use tfd_core::{Lock, ServableId};
use tfd_discovery::Discoverer;
use tfd_metadata::ModelMetadata;

use crate::client::ServingClient;
use crate::config::ModelServerConfig;
use crate::servable_config::ServableConfig;
use crate::{Result, ServingError};

/// Distinguished lock key guarding the periodic reconcile pass.
pub const AUTO_RELOAD_LOCK_ID: &str = "ReloadInstancesIfNecessary";

const MAX_RELOAD_ATTEMPTS: u32 = 2;
const TIME_TO_WAIT_FOR_NEXT_RELOAD: Duration = Duration::from_millis(150);
const WATCHDOG_TICK: Duration = Duration::from_secs(1);

/// A fleet together with its currently observed endpoints.
#[derive(Debug, Clone)]
pub struct ServableInstances {
    /// The fleet identifier (name segment unused).
    pub id: ServableId,
    /// Observed `ip:port` endpoints.
    pub instances: Vec<String>,
}

impl ServableInstances {
    /// The snapshot key for this fleet.
    #[must_use]
    pub fn instance_name(&self) -> String {
        self.id.instance_name()
    }
}

/// The slice of metadata the reconciler needs.
pub trait ServableLister: Send + Sync {
    /// Returns the distinct `(team, project)` pairs with any record.
    fn list_unique_team_project(&self) -> Result<Vec<ServableId>>;
}

impl<T: ModelMetadata> ServableLister for T {
    fn list_unique_team_project(&self) -> Result<Vec<ServableId>> {
        ModelMetadata::list_unique_team_project(self)
            .map_err(|e| ServingError::Metadata(e.to_string()))
    }
}

/// Pushes config blobs to serving fleets and reconciles drift.
pub struct Reloader {
    discovery: Arc<dyn Discoverer>,
    metadata: Arc<dyn ServableLister>,
    servable_config: Arc<ServableConfig>,
    client: Arc<dyn ServingClient>,
    lock: Arc<Lock>,
    reload_interval: Duration,
    max_auto_reload_duration: u64,
    allow_labels_for_unavailable_models: bool,
    last_state: Mutex<HashMap<String, ServableInstances>>,
}

impl std::fmt::Debug for Reloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reloader")
            .field("reload_interval", &self.reload_interval)
            .field("max_auto_reload_duration", &self.max_auto_reload_duration)
            .field(
                "allow_labels_for_unavailable_models",
                &self.allow_labels_for_unavailable_models,
            )
            .finish_non_exhaustive()
    }
}

impl Reloader {
    /// Creates a reconciler over the given collaborators.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        discovery: Arc<dyn Discoverer>,
        metadata: Arc<dyn ServableLister>,
        servable_config: Arc<ServableConfig>,
        client: Arc<dyn ServingClient>,
        lock: Arc<Lock>,
        reload_interval: Duration,
        max_auto_reload_duration: u64,
        allow_labels_for_unavailable_models: bool,
    ) -> Self {
        Self {
            discovery,
            metadata,
            servable_config,
            client,
            lock,
            reload_interval,
            max_auto_reload_duration,
            allow_labels_for_unavailable_models,
            last_state: Mutex::new(HashMap::new()),
        }
    }

    /// Explicitly reloads a fleet's instances.
    ///
    /// `skip_short_config` requests skipping the labels-stripped phase;
    /// it is honoured only when the fleet's instances are known to accept
    /// labels for versions they have not loaded yet.
    ///
    /// # Errors
    ///
    /// Returns [`ServingError::ReloadFailed`] carrying the per-endpoint
    /// error strings when any push failed, or the underlying discovery,
    /// storage, or metadata error.
    pub async fn reload_models(
        &self,
        team: &str,
        project: &str,
        skip_short_config: bool,
    ) -> Result<()> {
        // team/project were validated at the API boundary
        let id = ServableId {
            team: team.to_string(),
            project: project.to_string(),
            name: String::new(),
        };
        let labels_only = self.allow_labels_for_unavailable_models && skip_short_config;

        let errors = self.reload_config(&id, labels_only, &[]).await?;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServingError::ReloadFailed { errors })
        }
    }

    /// Runs the periodic reconcile loop for the process lifetime.
    pub async fn run(self: Arc<Self>) {
        loop {
            tracing::info!("reload instances job start");
            self.reload_instances_if_necessary().await;
            tracing::info!("reload instances job end");
            tokio::time::sleep(self.reload_interval).await;
        }
    }

    /// One guarded reconcile iteration.
    ///
    /// Acquires the global reconcile lock (aborting silently when held),
    /// spawns the actual pass in the background, and polls the lock for
    /// at most `max_auto_reload_duration` seconds before forcing it open.
    pub async fn reload_instances_if_necessary(self: &Arc<Self>) {
        if let Err(err) = self.lock.lock_id(AUTO_RELOAD_LOCK_ID) {
            tracing::error!(error = %err, "auto-reload already in progress");
            return;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = this.reconcile_pass().await {
                tracing::error!(error = %err, "reconcile pass failed");
            }
            this.lock.unlock_id(AUTO_RELOAD_LOCK_ID);
        });

        for tick in 0..=self.max_auto_reload_duration {
            if !self.lock.is_locked_id(AUTO_RELOAD_LOCK_ID) {
                tracing::info!(tick, "skip unlock auto-reload action");
                return;
            }
            tokio::time::sleep(WATCHDOG_TICK).await;
        }
        tracing::info!("unlock auto-reload action");
        self.lock.unlock_id(AUTO_RELOAD_LOCK_ID);
    }

    /// One unguarded reconcile pass: discover, diff, probe, reload.
    ///
    /// # Errors
    ///
    /// Returns metadata or config-storage errors; per-fleet reload
    /// failures are logged and evict the fleet from the snapshot instead
    /// of aborting the pass.
    pub async fn reconcile_pass(&self) -> Result<()> {
        let servables = self.metadata.list_unique_team_project()?;
        let to_reload = self.servables_to_reload(&servables).await?;
        tracing::info!(count = to_reload.len(), "number of servables to reload");

        for servable in to_reload {
            tracing::info!(
                team = %servable.id.team,
                project = %servable.id.project,
                instances = %servable.instances.join(" "),
                "servable instances which should be reloaded"
            );
            let outcome = self
                .reload_config(
                    &servable.id,
                    self.allow_labels_for_unavailable_models,
                    &servable.instances,
                )
                .await;
            let failed = match outcome {
                Ok(errors) => !errors.is_empty(),
                Err(err) => {
                    tracing::error!(error = %err, "reload failed");
                    true
                }
            };
            if failed {
                self.evict_servable_instance(&servable).await;
            }
        }
        tracing::info!("auto-reload end");
        Ok(())
    }

    /// Clears a fleet's endpoints in the snapshot so the next pass sees
    /// the rediscovered set as a difference and reloads it.
    async fn evict_servable_instance(&self, servable: &ServableInstances) {
        let mut last = self.last_state.lock().await;
        if let Some(entry) = last.get_mut(&servable.instance_name()) {
            entry.instances.clear();
        }
    }

    /// Computes which fleets need a reload this pass.
    ///
    /// The first pass only records the snapshot; afterwards a fleet is
    /// marked when its endpoint set changed or when any endpoint reports
    /// the probed version as unavailable.
    async fn servables_to_reload(
        &self,
        servables: &[ServableId],
    ) -> Result<Vec<ServableInstances>> {
        let mut current: HashMap<String, ServableInstances> = HashMap::new();
        let mut invalid: Vec<ServableInstances> = Vec::new();

        for id in servables {
            let instances = match self.discovery.discover(id).await {
                Ok(instances) => instances,
                Err(err) => {
                    tracing::debug!(instance = %id.instance_name(), error = %err, "discovery failed");
                    Vec::new()
                }
            };
            current.insert(
                id.instance_name(),
                ServableInstances {
                    id: id.clone(),
                    instances: instances.clone(),
                },
            );

            let Some(config) = self.servable_config.try_config(&id.team, &id.project).await?
            else {
                continue;
            };

            // only the first entry's highest version is probed
            if let Some(entry) = config.model_config_list.config.first() {
                let versions = &entry.model_version_policy.specific.versions;
                if let Some(&highest) = versions.last() {
                    let bad = self
                        .invalid_instances(&entry.name, highest, &instances)
                        .await;
                    if !bad.is_empty() {
                        tracing::info!(
                            team = %id.team,
                            project = %id.project,
                            instances = %bad.join(" "),
                            "invalid servable instances which should be reloaded"
                        );
                        invalid.push(ServableInstances {
                            id: id.clone(),
                            instances: bad,
                        });
                    }
                }
            }
        }

        let mut last = self.last_state.lock().await;
        if last.is_empty() {
            *last = current;
            return Ok(Vec::new());
        }

        let mut result: Vec<ServableInstances> = Vec::new();
        for (key, observed) in &current {
            let Some(previous) = last.get(key) else {
                continue;
            };
            if !same_endpoint_set(&previous.instances, &observed.instances) {
                result.push(observed.clone());
            }
        }
        *last = current;
        drop(last);

        let extra = merge_invalid_instances(&result, invalid);
        tracing::info!(count = extra.len(), "number invalid servable instances");
        result.extend(extra);
        Ok(result)
    }

    /// Probes endpoints for the given `(name, version)`; an endpoint is
    /// invalid on transport failure or any state other than `AVAILABLE`.
    async fn invalid_instances(
        &self,
        name: &str,
        version: i64,
        instances: &[String],
    ) -> Vec<String> {
        let mut invalid = Vec::new();
        for endpoint in instances {
            match self.client.model_status(endpoint, name, version).await {
                Ok(status) if status.is_available() => {}
                Ok(_) => invalid.push(endpoint.clone()),
                Err(err) => {
                    tracing::error!(endpoint = %endpoint, error = %err, "model status probe failed");
                    invalid.push(endpoint.clone());
                }
            }
        }
        invalid
    }

    /// Two-phase config push with bounded retry.
    ///
    /// Returns the aggregated per-endpoint error strings; an empty list
    /// means every surviving endpoint converged.
    ///
    /// # Errors
    ///
    /// Returns discovery or config-storage errors; push failures are
    /// reported through the returned list.
    pub async fn reload_config(
        &self,
        id: &ServableId,
        labels_only: bool,
        instances: &[String],
    ) -> Result<Vec<String>> {
        let mut instances = if instances.is_empty() {
            self.discovery.discover(id).await?
        } else {
            instances.to_vec()
        };
        tracing::info!(instances = %instances.join(" "), "reload config instances");

        let Some(config) = self.servable_config.try_config(&id.team, &id.project).await? else {
            tracing::info!(team = %id.team, project = %id.project, "config doesn't exist for team project");
            return Ok(Vec::new());
        };

        let mut errors: Vec<String> = Vec::new();

        if labels_only {
            tracing::debug!(instance = %id.instance_name(), "skipping reload config without labels");
        } else {
            let stripped = self
                .servable_config
                .config_without_labels(&id.team, &id.project)
                .await?;
            let (survivors, phase_errors) = self.push_to_instances(&stripped, &instances).await;
            instances = survivors;
            errors.extend(phase_errors);
        }

        let (_, mut reload_errors) = self.push_to_instances(&config, &instances).await;

        let mut attempt = 1;
        while !reload_errors.is_empty() && attempt <= MAX_RELOAD_ATTEMPTS {
            tokio::time::sleep(TIME_TO_WAIT_FOR_NEXT_RELOAD * attempt).await;
            tracing::info!(attempt, errors = %reload_errors.join("; "), "next reload");
            (_, reload_errors) = self.push_to_instances(&config, &instances).await;
            attempt += 1;
        }
        errors.extend(reload_errors);

        if errors.is_empty() {
            tracing::info!("reload success");
        }
        Ok(errors)
    }

    /// Pushes one blob to every endpoint, returning the endpoints that
    /// acknowledged and the error strings for those that did not.
    async fn push_to_instances(
        &self,
        config: &ModelServerConfig,
        instances: &[String],
    ) -> (Vec<String>, Vec<String>) {
        let mut valid = Vec::new();
        let mut errors = Vec::new();

        for endpoint in instances {
            match self.client.reload_config(endpoint, config).await {
                Ok(()) => valid.push(endpoint.clone()),
                Err(err) => {
                    tracing::error!(endpoint = %endpoint, error = %err, "reload config push failed");
                    errors.push(err.to_string());
                }
            }
        }
        (valid, errors)
    }
}

/// Order-insensitive endpoint set comparison.
fn same_endpoint_set(a: &[String], b: &[String]) -> bool {
    a.len() == b.len() && a.iter().all(|item| b.contains(item))
}

/// Merges drift-detected endpoints into the reload candidates, skipping
/// endpoints a diff already marked for the same fleet.
fn merge_invalid_instances(
    marked: &[ServableInstances],
    invalid: Vec<ServableInstances>,
) -> Vec<ServableInstances> {
    if invalid.is_empty() {
        return Vec::new();
    }
    if marked.is_empty() {
        return invalid
            .into_iter()
            .filter(|entry| !entry.instances.is_empty())
            .collect();
    }

    let mut result = Vec::new();
    for entry in invalid {
        let Some(already) = marked
            .iter()
            .find(|m| m.instance_name() == entry.instance_name())
        else {
            continue;
        };
        let missing: Vec<String> = entry
            .instances
            .iter()
            .filter(|endpoint| !already.instances.contains(endpoint))
            .cloned()
            .collect();
        if !missing.is_empty() {
            result.push(ServableInstances {
                id: entry.id,
                instances: missing,
            });
        }
    }
    result
}
