use crate::lock::{LockManager, REGISTRY_LOCK};
use crate::types::{window_start, Agent, AgentStatus, RegistryStatus};
use chrono::Utc;
use convoy_core::{validate_agent_id, ConvoyError, ConvoyResult};
use convoy_store::{load, load_all, save, Collection, Store};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tracks registered agents, their capabilities and liveness.
///
/// Every mutation runs under the registry-wide lock so concurrent
/// register/deregister/heartbeat calls from different processes never lose
/// updates. Reads are unlocked.
pub struct AgentRegistry {
    store: Arc<dyn Store>,
    locks: Arc<LockManager>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn Store>, locks: Arc<LockManager>) -> Self {
        Self { store, locks }
    }

    /// Register (or re-register) an agent as active.
    ///
    /// Re-registering keeps the counters and refreshes capabilities. An id
    /// held by an active agent of another process is rejected.
    pub async fn register<I, S>(&self, id: &str, capabilities: I) -> ConvoyResult<Agent>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        validate_agent_id(id)?;
        let capabilities = normalize_capabilities(capabilities)?;
        let owner = self.locks.owner().to_string();

        let agent = self
            .locks
            .with_lock(REGISTRY_LOCK, || async {
                let existing: Option<Agent> =
                    load(self.store.as_ref(), Collection::Agents, id).await?;
                let agent = match existing {
                    Some(prev) if prev.is_active() && prev.owner != owner => {
                        return Err(ConvoyError::AgentExists(id.to_string()));
                    }
                    Some(mut prev) => {
                        let now = Utc::now();
                        prev.capabilities = capabilities;
                        prev.status = AgentStatus::Active;
                        prev.registered_at = now;
                        prev.last_heartbeat = now;
                        prev.owner = owner;
                        prev
                    }
                    None => Agent::new(id, capabilities, owner),
                };
                save(self.store.as_ref(), Collection::Agents, id, &agent).await?;
                Ok(agent)
            })
            .await?;

        info!(
            agent_id = id,
            capabilities = ?agent.capabilities,
            "Agent registered"
        );
        Ok(agent)
    }

    /// Mark an agent inactive and move it to the archive.
    pub async fn deregister(&self, id: &str) -> ConvoyResult<()> {
        self.locks
            .with_lock(REGISTRY_LOCK, || async {
                let mut agent: Agent = load(self.store.as_ref(), Collection::Agents, id)
                    .await?
                    .ok_or_else(|| ConvoyError::AgentNotFound(id.to_string()))?;
                agent.status = AgentStatus::Inactive;
                agent.deregistered_at = Some(Utc::now());
                save(self.store.as_ref(), Collection::AgentArchive, id, &agent).await?;
                self.store.delete(Collection::Agents, id).await?;
                Ok(())
            })
            .await?;
        info!(agent_id = id, "Agent deregistered");
        Ok(())
    }

    /// Refresh `last_heartbeat`. Best-effort: failures are logged, not returned.
    pub async fn heartbeat(&self, id: &str) {
        if let Err(e) = self.try_heartbeat(id).await {
            warn!(agent_id = id, error = %e, "Heartbeat failed");
        }
    }

    /// Refresh `last_heartbeat`, reactivating an agent the controller had
    /// marked inactive.
    pub async fn try_heartbeat(&self, id: &str) -> ConvoyResult<Agent> {
        self.locks
            .with_lock(REGISTRY_LOCK, || async {
                let mut agent: Agent = load(self.store.as_ref(), Collection::Agents, id)
                    .await?
                    .ok_or_else(|| ConvoyError::AgentNotFound(id.to_string()))?;
                agent.last_heartbeat = Utc::now();
                if !agent.is_active() {
                    info!(agent_id = id, "Heartbeat from inactive agent, reactivating");
                    agent.status = AgentStatus::Active;
                }
                save(self.store.as_ref(), Collection::Agents, id, &agent).await?;
                Ok(agent)
            })
            .await
    }

    pub async fn get(&self, id: &str) -> ConvoyResult<Option<Agent>> {
        load(self.store.as_ref(), Collection::Agents, id).await
    }

    /// Like [`get`](Self::get) but a missing agent is an error.
    pub async fn require(&self, id: &str) -> ConvoyResult<Agent> {
        self.get(id)
            .await?
            .ok_or_else(|| ConvoyError::AgentNotFound(id.to_string()))
    }

    /// Ids of active agents, optionally only those with `capability`.
    pub async fn list(&self, capability: Option<&str>) -> ConvoyResult<Vec<String>> {
        Ok(self
            .agents()
            .await?
            .into_iter()
            .filter(|a| a.is_active())
            .filter(|a| capability.map_or(true, |c| a.has_capability(c)))
            .map(|a| a.id)
            .collect())
    }

    /// Every registered (not deregistered) agent, active or not.
    pub async fn agents(&self) -> ConvoyResult<Vec<Agent>> {
        load_all(self.store.as_ref(), Collection::Agents).await
    }

    /// Active agent counts per capability tag.
    pub async fn status(&self) -> ConvoyResult<RegistryStatus> {
        let mut status = RegistryStatus::default();
        for agent in self.agents().await? {
            if !agent.is_active() {
                status.inactive += 1;
                continue;
            }
            status.active += 1;
            for capability in &agent.capabilities {
                *status.by_capability.entry(capability.clone()).or_default() += 1;
            }
        }
        Ok(status)
    }

    /// Mark every active agent whose last heartbeat is older than `timeout`
    /// inactive. Returns the ids that changed.
    pub async fn expire_stale(&self, timeout: Duration) -> ConvoyResult<Vec<String>> {
        self.locks
            .with_lock(REGISTRY_LOCK, || async {
                let mut expired = Vec::new();
                // Nobody has been silent longer than all of representable time.
                let Some(cutoff) = window_start(timeout) else {
                    return Ok(expired);
                };
                for mut agent in self.agents().await? {
                    if agent.is_active() && agent.last_heartbeat < cutoff {
                        agent.status = AgentStatus::Inactive;
                        save(self.store.as_ref(), Collection::Agents, &agent.id, &agent).await?;
                        warn!(
                            agent_id = %agent.id,
                            last_heartbeat = %agent.last_heartbeat,
                            "Agent heartbeat timed out, marked inactive"
                        );
                        expired.push(agent.id);
                    }
                }
                Ok(expired)
            })
            .await
    }

    /// Mark one agent inactive. Returns whether it was active.
    pub async fn mark_inactive(&self, id: &str) -> ConvoyResult<bool> {
        self.locks
            .with_lock(REGISTRY_LOCK, || async {
                let mut agent: Agent = load(self.store.as_ref(), Collection::Agents, id)
                    .await?
                    .ok_or_else(|| ConvoyError::AgentNotFound(id.to_string()))?;
                if !agent.is_active() {
                    return Ok(false);
                }
                agent.status = AgentStatus::Inactive;
                save(self.store.as_ref(), Collection::Agents, id, &agent).await?;
                Ok(true)
            })
            .await
    }

    /// Bump `tasks_completed` or `tasks_failed`. Agents that have since
    /// deregistered are skipped.
    pub async fn record_outcome(&self, id: &str, success: bool) -> ConvoyResult<()> {
        self.locks
            .with_lock(REGISTRY_LOCK, || async {
                let Some(mut agent) =
                    load::<Agent>(self.store.as_ref(), Collection::Agents, id).await?
                else {
                    debug!(agent_id = id, "Outcome for unknown agent ignored");
                    return Ok(());
                };
                if success {
                    agent.tasks_completed += 1;
                } else {
                    agent.tasks_failed += 1;
                }
                save(self.store.as_ref(), Collection::Agents, id, &agent).await
            })
            .await
    }
}

fn normalize_capabilities<I, S>(capabilities: I) -> ConvoyResult<BTreeSet<String>>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut set = BTreeSet::new();
    for capability in capabilities {
        let capability = capability.into().trim().to_string();
        if capability.is_empty() {
            return Err(ConvoyError::Validation("Empty capability tag".into()));
        }
        set.insert(capability);
    }
    Ok(set)
}
