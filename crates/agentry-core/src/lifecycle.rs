//! Agent lifecycle manager.
//!
//! Owns every agent instance of a run and applies events to each instance's
//! state machine:
//!
//! ```text
//! Pending -> Running -> {Completed, Failed, Cancelled}
//! Running <-> Paused   (budget warning / explicit resume)
//! any non-terminal -> Cancelled on agent.cancel
//! ```
//!
//! The `agent.cancel` and `agent.resume` control events are idempotent: they
//! leave an instance that is not in a matching state untouched.
//!
//! Each instance has an exclusive inbox: an unbounded control channel plus a
//! cancellation flag the agent checks before every side effect.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::budget::{Headroom, Limits};
use crate::domain::spec::validate_agent;
use crate::domain::{
    agent_id_for, kinds, AgentRole, AgentSpec, AgentState, EngineError, Event, Phase,
    PhaseBudget, Result,
};
use crate::metrics::METRICS;

// ---------------------------------------------------------------------------
// Inbox
// ---------------------------------------------------------------------------

/// Message delivered to a single agent.
#[derive(Debug, Clone)]
pub enum Control {
    /// Reply to an `agent.usage` report.
    Receipt(Headroom),
    Pause,
    Resume,
    Cancel,
    /// An `agent.message` routed to this agent.
    Deliver(Event),
}

/// Receiving side of an agent's inbox, handed to the agent task.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Control>,
    cancel: watch::Receiver<bool>,
}

impl Inbox {
    /// Wait for the next control message. `None` once the instance is gone.
    pub async fn recv(&mut self) -> Option<Control> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Control> {
        self.rx.try_recv().ok()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the instance is cancelled or reaped.
    pub async fn cancelled(&mut self) {
        while !*self.cancel.borrow() {
            if self.cancel.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug)]
struct InboxSender {
    tx: mpsc::UnboundedSender<Control>,
    cancel: watch::Sender<bool>,
}

fn inbox() -> (InboxSender, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    (
        InboxSender {
            tx,
            cancel: cancel_tx,
        },
        Inbox {
            rx,
            cancel: cancel_rx,
        },
    )
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Read-only view of an agent instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub role: AgentRole,
    pub phase: Phase,
    pub model: String,
    pub state: AgentState,
    pub slice: Limits,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct AgentInstance {
    agent_id: String,
    spec: AgentSpec,
    phase: Phase,
    state: AgentState,
    slice: Limits,
    created_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    sender: InboxSender,
    inbox: Option<Inbox>,
    task: Option<JoinHandle<()>>,
}

impl AgentInstance {
    fn snapshot(&self) -> AgentSnapshot {
        AgentSnapshot {
            agent_id: self.agent_id.clone(),
            role: self.spec.role,
            phase: self.phase,
            model: self.spec.model.clone(),
            state: self.state,
            slice: self.slice,
            created_at: self.created_at,
            finished_at: self.finished_at,
            error: self.error.clone(),
        }
    }

    fn set_state(&mut self, next: AgentState) {
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
            let _ = self.sender.cancel.send(true);
        }
    }

    fn invalid(&self, event_type: &str) -> EngineError {
        EngineError::InvalidTransition {
            agent_id: self.agent_id.clone(),
            state: self.state,
            event_type: event_type.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Owns and transitions all agent instances of a run.
#[derive(Default)]
pub struct LifecycleManager {
    instances: BTreeMap<String, AgentInstance>,
    order: Vec<String>,
    reaped: Vec<AgentSnapshot>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `spec.count` pending instances and return their ids.
    ///
    /// Each instance gets the explicit per-agent caps when configured, else
    /// an even share of the phase caps.
    pub fn spawn(
        &mut self,
        spec: &AgentSpec,
        spec_index: usize,
        budget: &PhaseBudget,
    ) -> Result<Vec<String>> {
        if spec.count == 0 {
            return Err(EngineError::Specification(format!(
                "{} agent spec #{spec_index}: count must be at least 1",
                spec.role
            )));
        }
        validate_agent(spec)?;

        let share = budget.instance_count.max(spec.count) as f64;
        let slice = Limits::new(
            spec.max_cost_usd
                .or(budget.max_cost_usd.map(|cap| cap / share)),
            spec.max_runtime_min
                .map(|m| m * 60.0)
                .or(budget.max_runtime_secs.map(|cap| cap / share)),
        );

        let mut ids = Vec::with_capacity(spec.count as usize);
        for replica in 1..=spec.count {
            let agent_id = agent_id_for(spec.role, spec_index, replica);
            if self.instances.contains_key(&agent_id) {
                return Err(EngineError::Specification(format!(
                    "agent id {agent_id} is already in use"
                )));
            }
            let (sender, inbox) = inbox();
            self.instances.insert(
                agent_id.clone(),
                AgentInstance {
                    agent_id: agent_id.clone(),
                    spec: spec.clone(),
                    phase: spec.role.phase(),
                    state: AgentState::Pending,
                    slice,
                    created_at: Utc::now(),
                    finished_at: None,
                    error: None,
                    sender,
                    inbox: Some(inbox),
                    task: None,
                },
            );
            self.order.push(agent_id.clone());
            METRICS.inc_agents_spawned();
            debug!(agent_id = %agent_id, "agent instance registered");
            ids.push(agent_id);
        }
        Ok(ids)
    }

    /// Apply one event to the agent's state machine and return the new state.
    pub fn advance(&mut self, agent_id: &str, event: &Event) -> Result<AgentState> {
        let instance = self
            .instances
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        let state = instance.state;
        let ty = event.event_type.as_str();

        let next = match ty {
            kinds::AGENT_CANCEL => {
                if state.is_terminal() {
                    return Ok(state);
                }
                let _ = instance.sender.tx.send(Control::Cancel);
                AgentState::Cancelled
            }
            kinds::AGENT_RESUME => {
                if state != AgentState::Paused {
                    debug!(agent_id = %agent_id, state = %state, "resume ignored, agent not paused");
                    return Ok(state);
                }
                let _ = instance.sender.tx.send(Control::Resume);
                AgentState::Running
            }
            // Bookkeeping keeps flowing after an agent has finished.
            kinds::AGENT_USAGE
            | kinds::AGENT_MESSAGE
            | kinds::RESOURCE_LIMIT_WARNING => state,
            kinds::RESOURCE_LIMIT_COST | kinds::RESOURCE_LIMIT_TIME => match state {
                AgentState::Running | AgentState::Paused => {
                    instance.error = Some(format!("budget exhausted ({ty})"));
                    AgentState::Failed
                }
                other => other,
            },
            _ if state.is_terminal() => return Err(instance.invalid(ty)),
            kinds::AGENT_STARTED => match state {
                AgentState::Pending => AgentState::Running,
                _ => return Err(instance.invalid(ty)),
            },
            kinds::AGENT_PAUSED => match state {
                AgentState::Running => {
                    let _ = instance.sender.tx.send(Control::Pause);
                    AgentState::Paused
                }
                _ => return Err(instance.invalid(ty)),
            },
            kinds::AGENT_RESUMED => match state {
                AgentState::Paused => {
                    let _ = instance.sender.tx.send(Control::Resume);
                    AgentState::Running
                }
                _ => return Err(instance.invalid(ty)),
            },
            kinds::AGENT_COMPLETED => match state {
                AgentState::Running => AgentState::Completed,
                _ => return Err(instance.invalid(ty)),
            },
            kinds::AGENT_FAILED | kinds::AGENT_ERROR => {
                instance.error = event
                    .payload_str("error")
                    .map(str::to_string)
                    .or_else(|| Some(ty.to_string()));
                AgentState::Failed
            }
            _ if kinds::is_work(ty) => match state {
                AgentState::Running => state,
                _ => return Err(instance.invalid(ty)),
            },
            _ => state,
        };

        if next != state {
            instance.set_state(next);
            info!(agent_id = %agent_id, from = %state, to = %next, "agent transition");
        }
        Ok(next)
    }

    /// Force a non-terminal instance into `Failed`. Terminal instances are left alone.
    pub fn force_fail(&mut self, agent_id: &str, reason: &str) -> Result<AgentState> {
        let instance = self
            .instances
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        if !instance.state.is_terminal() {
            instance.error = Some(reason.to_string());
            instance.set_state(AgentState::Failed);
        }
        Ok(instance.state)
    }

    /// Hand the inbox to the task that runs the agent. Only succeeds once.
    pub fn take_inbox(&mut self, agent_id: &str) -> Option<Inbox> {
        self.instances.get_mut(agent_id)?.inbox.take()
    }

    pub fn attach_task(&mut self, agent_id: &str, task: JoinHandle<()>) -> Result<()> {
        let instance = self
            .instances
            .get_mut(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        instance.task = Some(task);
        Ok(())
    }

    /// Send a control message to a live instance.
    pub fn send(&self, agent_id: &str, control: Control) -> Result<()> {
        let instance = self
            .instances
            .get(agent_id)
            .ok_or_else(|| EngineError::UnknownAgent(agent_id.to_string()))?;
        // A closed inbox means the task is gone; nothing left to tell it.
        let _ = instance.sender.tx.send(control);
        Ok(())
    }

    pub fn state(&self, agent_id: &str) -> Option<AgentState> {
        self.instances
            .get(agent_id)
            .map(|i| i.state)
            .or_else(|| {
                self.reaped
                    .iter()
                    .find(|s| s.agent_id == agent_id)
                    .map(|s| s.state)
            })
    }

    pub fn spec(&self, agent_id: &str) -> Option<&AgentSpec> {
        self.instances.get(agent_id).map(|i| &i.spec)
    }

    pub fn slice(&self, agent_id: &str) -> Option<Limits> {
        self.instances.get(agent_id).map(|i| i.slice)
    }

    /// Live instance ids in spawn order.
    pub fn ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.instances.contains_key(*id))
            .cloned()
            .collect()
    }

    /// Live, non-terminal instance ids.
    pub fn active_ids(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                self.instances
                    .get(*id)
                    .is_some_and(|i| !i.state.is_terminal())
            })
            .cloned()
            .collect()
    }

    pub fn ids_in_phase(&self, phase: Phase) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| self.instances.get(*id).is_some_and(|i| i.phase == phase))
            .cloned()
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state == AgentState::Running)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.instances.values().all(|i| i.state.is_terminal())
    }

    /// Whether every instance of `phase` (live or reaped) has finished.
    pub fn phase_finished(&self, phase: Phase) -> bool {
        self.instances
            .values()
            .filter(|i| i.phase == phase)
            .all(|i| i.state.is_terminal())
    }

    /// Remove terminal instances whose task has finished.
    pub fn reap(&mut self) -> Vec<AgentSnapshot> {
        let done: Vec<String> = self
            .instances
            .iter()
            .filter(|(_, i)| {
                i.state.is_terminal() && i.task.as_ref().map_or(true, |t| t.is_finished())
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut out = Vec::with_capacity(done.len());
        for id in done {
            if let Some(instance) = self.instances.remove(&id) {
                let snap = instance.snapshot();
                self.reaped.push(snap.clone());
                out.push(snap);
            }
        }
        out
    }

    /// Views of every instance, reaped ones included, in spawn order.
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.order
            .iter()
            .filter_map(|id| {
                self.instances.get(id).map(AgentInstance::snapshot).or_else(|| {
                    self.reaped.iter().find(|s| &s.agent_id == id).cloned()
                })
            })
            .collect()
    }

    /// Take every task handle still attached, for joining or aborting.
    pub fn take_tasks(&mut self) -> Vec<(String, JoinHandle<()>)> {
        self.instances
            .iter_mut()
            .filter_map(|(id, i)| i.task.take().map(|t| (id.clone(), t)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn budget(cost: Option<f64>, count: u32) -> PhaseBudget {
        PhaseBudget {
            max_cost_usd: cost,
            max_runtime_secs: None,
            instance_count: count,
        }
    }

    fn ev(ty: &str) -> Event {
        Event::new(Uuid::nil(), ty, json!({}))
    }

    fn running(manager: &mut LifecycleManager) -> String {
        let spec = AgentSpec::new(AgentRole::Builder, "m");
        let id = manager.spawn(&spec, 1, &budget(None, 1)).unwrap().remove(0);
        manager.advance(&id, &ev(kinds::AGENT_STARTED)).unwrap();
        id
    }

    #[test]
    fn test_spawn_creates_distinct_pending_instances() {
        let mut manager = LifecycleManager::new();
        let spec = AgentSpec::new(AgentRole::Builder, "m").with_count(3);
        let ids = manager.spawn(&spec, 1, &budget(Some(9.0), 3)).unwrap();
        assert_eq!(ids, vec!["builder-1-1", "builder-1-2", "builder-1-3"]);
        for id in &ids {
            assert_eq!(manager.state(id), Some(AgentState::Pending));
            assert_eq!(manager.slice(id).unwrap().max_cost_usd, Some(3.0));
        }
    }

    #[test]
    fn test_spawn_rejects_zero_count() {
        let mut manager = LifecycleManager::new();
        let spec = AgentSpec::new(AgentRole::Builder, "m").with_count(0);
        let err = manager.spawn(&spec, 1, &budget(None, 0)).unwrap_err();
        assert!(matches!(err, EngineError::Specification(_)));
        assert!(manager.ids().is_empty());
    }

    #[test]
    fn test_explicit_slice_overrides_share() {
        let mut manager = LifecycleManager::new();
        let spec = AgentSpec::new(AgentRole::Builder, "m").with_max_cost_usd(1.5);
        let id = manager
            .spawn(&spec, 1, &budget(Some(10.0), 2))
            .unwrap()
            .remove(0);
        assert_eq!(manager.slice(&id).unwrap().max_cost_usd, Some(1.5));
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        assert_eq!(
            manager.advance(&id, &ev(kinds::BUILD_STEP_COMPLETED)).unwrap(),
            AgentState::Running
        );
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_COMPLETED)).unwrap(),
            AgentState::Completed
        );
    }

    #[test]
    fn test_cancel_terminal_is_noop() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        manager.advance(&id, &ev(kinds::AGENT_COMPLETED)).unwrap();
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_CANCEL)).unwrap(),
            AgentState::Completed
        );
    }

    #[test]
    fn test_work_event_while_pending_is_invalid() {
        let mut manager = LifecycleManager::new();
        let spec = AgentSpec::new(AgentRole::Builder, "m");
        let id = manager.spawn(&spec, 1, &budget(None, 1)).unwrap().remove(0);
        let err = manager
            .advance(&id, &ev(kinds::BUILD_STEP_START))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
        assert_eq!(manager.force_fail(&id, "invalid").unwrap(), AgentState::Failed);
    }

    #[test]
    fn test_paused_rejects_work_until_resumed() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        manager.advance(&id, &ev(kinds::AGENT_PAUSED)).unwrap();
        assert!(manager.advance(&id, &ev(kinds::BUILD_STEP_START)).is_err());
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_RESUME)).unwrap(),
            AgentState::Running
        );
        assert!(manager.advance(&id, &ev(kinds::BUILD_STEP_START)).is_ok());
    }

    #[test]
    fn test_resume_without_pause_is_noop() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        let mut inbox = manager.take_inbox(&id).unwrap();
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_RESUME)).unwrap(),
            AgentState::Running
        );
        assert!(inbox.try_recv().is_none());

        manager.advance(&id, &ev(kinds::AGENT_COMPLETED)).unwrap();
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_RESUME)).unwrap(),
            AgentState::Completed
        );
        // an agent-published resume still has to follow a pause
        assert!(manager.advance(&id, &ev(kinds::AGENT_RESUMED)).is_err());
    }

    #[test]
    fn test_budget_exhaustion_fails_running_agent() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        assert_eq!(
            manager
                .advance(&id, &ev(kinds::RESOURCE_LIMIT_COST))
                .unwrap(),
            AgentState::Failed
        );
        // usage after the fact is still accepted
        assert_eq!(
            manager.advance(&id, &ev(kinds::AGENT_USAGE)).unwrap(),
            AgentState::Failed
        );
    }

    #[test]
    fn test_terminal_rejects_other_events() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        manager.advance(&id, &ev(kinds::AGENT_ERROR)).unwrap();
        assert!(manager.advance(&id, &ev(kinds::AGENT_COMPLETED)).is_err());
    }

    #[tokio::test]
    async fn test_cancel_sets_inbox_flag() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        let mut inbox = manager.take_inbox(&id).unwrap();
        assert!(manager.take_inbox(&id).is_none());
        manager.advance(&id, &ev(kinds::AGENT_CANCEL)).unwrap();
        assert!(inbox.is_cancelled());
        inbox.cancelled().await;
        assert!(matches!(inbox.try_recv(), Some(Control::Cancel)));
    }

    #[test]
    fn test_reap_keeps_snapshots() {
        let mut manager = LifecycleManager::new();
        let id = running(&mut manager);
        assert!(manager.reap().is_empty());
        manager.advance(&id, &ev(kinds::AGENT_COMPLETED)).unwrap();
        let reaped = manager.reap();
        assert_eq!(reaped.len(), 1);
        assert!(manager.ids().is_empty());
        assert_eq!(manager.state(&id), Some(AgentState::Completed));
        assert_eq!(manager.snapshot().len(), 1);
        assert!(manager.all_terminal());
    }
}
