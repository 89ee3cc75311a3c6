//! Agent registry — persistent worker-node records: registration,
//! heartbeats, liveness sweeping, and user-facing metadata.

use std::sync::Arc;

use thiserror::Error;

use crate::storage::{Agent, Storage, StorageError};
use crate::tokens::{TokenError, TokenService};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("agent-not-found")]
    NotFound,
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct AgentRegistry {
    storage: Arc<Storage>,
    tokens: Arc<TokenService>,
}

pub struct RegisterOutcome {
    pub agent: Agent,
    pub is_new: bool,
}

impl AgentRegistry {
    pub fn new(storage: Arc<Storage>, tokens: Arc<TokenService>) -> Self {
        Self { storage, tokens }
    }

    /// Validate the enrollment token, then either reuse an existing agent
    /// with the same machine identity or create a new one.
    pub fn register_by_token(
        &self,
        token: &str,
        machine_id: &str,
        ip: &str,
    ) -> Result<RegisterOutcome, AgentError> {
        let token_record = self.tokens.validate(token)?;

        if let Some(existing) = self.storage.get_agent_by_machine_id(machine_id)? {
            // Reuse: the new connecting token supersedes the old one on
            // the agent record. Per scenario S6, a reconnection still
            // spends a use of the presented token — `used_count` reaches
            // `max_uses` after the same machine connects twice with the
            // same token, not just once.
            self.tokens.consume(token_record.id)?;
            self.storage.update_agent_connection(existing.id, token, ip)?;
            let refreshed = self.storage.get_agent(existing.id)?;
            return Ok(RegisterOutcome {
                agent: refreshed,
                is_new: false,
            });
        }

        self.tokens.consume(token_record.id)?;
        let name = format!("agent-{}", &machine_id[..machine_id.len().min(8)]);
        let agent = self.storage.create_agent(&name, token, machine_id)?;
        Ok(RegisterOutcome {
            agent,
            is_new: true,
        })
    }

    pub fn heartbeat(
        &self,
        token: &str,
        version: &str,
        build_time: &str,
        hostname: &str,
        os: &str,
        arch: &str,
    ) -> Result<Agent, AgentError> {
        let agent = self
            .storage
            .get_agent_by_token(token)?
            .ok_or(AgentError::NotFound)?;
        if !agent.enabled {
            return Err(AgentError::NotFound);
        }
        self.storage
            .heartbeat_agent(agent.id, version, build_time, hostname, os, arch)?;
        Ok(self.storage.get_agent(agent.id)?)
    }

    pub fn get(&self, id: i64) -> Result<Agent, AgentError> {
        Ok(self.storage.get_agent(id)?)
    }

    pub fn get_by_token(&self, token: &str) -> Result<Option<Agent>, AgentError> {
        Ok(self.storage.get_agent_by_token(token)?)
    }

    pub fn get_by_machine_id(&self, machine_id: &str) -> Result<Option<Agent>, AgentError> {
        Ok(self.storage.get_agent_by_machine_id(machine_id)?)
    }

    pub fn list(&self) -> Result<Vec<Agent>, AgentError> {
        Ok(self.storage.list_agents()?)
    }

    pub fn update(
        &self,
        id: i64,
        name: &str,
        description: Option<&str>,
        enabled: bool,
    ) -> Result<Agent, AgentError> {
        self.storage.update_agent_metadata(id, name, description, enabled)?;
        Ok(self.storage.get_agent(id)?)
    }

    pub fn delete(&self, id: i64) -> Result<(), AgentError> {
        Ok(self.storage.delete_agent(id)?)
    }

    /// Mark offline any agent whose `last_seen` predates the idle
    /// threshold. Returns the number of agents transitioned.
    pub fn sweep_offline(&self, idle_threshold_secs: i64) -> Result<usize, AgentError> {
        Ok(self.storage.sweep_offline_agents(idle_threshold_secs)?)
    }

    /// Mark a single agent offline immediately, e.g. on connection close.
    pub fn mark_offline(&self, id: i64) -> Result<(), AgentError> {
        Ok(self.storage.mark_agent_offline(id)?)
    }

    pub fn set_force_update(&self, id: i64) -> Result<(), AgentError> {
        Ok(self.storage.set_force_update(id, true)?)
    }

    pub fn clear_force_update(&self, id: i64) -> Result<(), AgentError> {
        Ok(self.storage.set_force_update(id, false)?)
    }

    /// Atomically read-and-clear the force-update flag for use in a
    /// heartbeat ack.
    pub fn take_force_update(&self, id: i64) -> Result<bool, AgentError> {
        Ok(self.storage.take_force_update(id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> AgentRegistry {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let tokens = Arc::new(TokenService::new(storage.clone()));
        AgentRegistry::new(storage, tokens)
    }

    #[test]
    fn scenario_s6_same_machine_id_is_reused_and_still_spends_a_use() {
        // Covers S6 literally: is_new_agent flips to false, same agent_id,
        // same ip-independent machine_id match, and used_count reaches 2
        // after the second connection on a max_uses=2 token.
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let tokens = Arc::new(TokenService::new(storage.clone()));
        let registry = AgentRegistry::new(storage.clone(), tokens.clone());

        let token = tokens.create(None, 2, None).unwrap();

        let first = registry.register_by_token(&token.token, "M1", "10.0.0.1").unwrap();
        assert!(first.is_new);

        let second = registry.register_by_token(&token.token, "M1", "10.0.0.2").unwrap();
        assert!(!second.is_new);
        assert_eq!(second.agent.id, first.agent.id);

        let refreshed = tokens.validate(&token.token).unwrap();
        assert_eq!(refreshed.used_count, 2);
    }

    #[test]
    fn registering_with_unknown_token_fails() {
        let registry = registry();
        assert!(registry.register_by_token("bogus", "M1", "10.0.0.1").is_err());
    }

    #[test]
    fn delete_refuses_agent_with_bound_tasks() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let tokens = Arc::new(TokenService::new(storage.clone()));
        let registry = AgentRegistry::new(storage.clone(), tokens.clone());
        let token = tokens.create(None, 0, None).unwrap();
        let outcome = registry.register_by_token(&token.token, "M1", "10.0.0.1").unwrap();

        storage
            .create_task(&crate::storage::NewTask {
                name: "remote task".into(),
                command: "".into(),
                schedule: "0 * * * * *".into(),
                timeout_minutes: 5,
                work_dir: "".into(),
                env_ids: vec![],
                retention: crate::storage::Retention::None,
                enabled: true,
                agent_id: Some(outcome.agent.id),
            })
            .unwrap();

        assert!(registry.delete(outcome.agent.id).is_err());
    }

    #[test]
    fn force_update_flag_is_read_and_cleared_exactly_once() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let tokens = Arc::new(TokenService::new(storage.clone()));
        let registry = AgentRegistry::new(storage, tokens.clone());
        let token = tokens.create(None, 0, None).unwrap();
        let outcome = registry.register_by_token(&token.token, "M2", "10.0.0.3").unwrap();
        registry.set_force_update(outcome.agent.id).unwrap();
        assert!(registry.take_force_update(outcome.agent.id).unwrap());
        assert!(!registry.take_force_update(outcome.agent.id).unwrap());
    }
}
