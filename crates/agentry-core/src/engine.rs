//! Orchestration loop.
//!
//! The loop is the single serialized consumer of the bus. It owns the budget
//! ledger, the lifecycle states and the gate decisions, stages the phases
//! (build, then verify and/or operate) and decides when the run is over.
//!
//! Events the loop emits are never delivered back to its own subscription.
//! While one of its publishes is blocked on a full subscriber buffer, the loop
//! keeps draining its own subscription into a backlog, so agents blocked on
//! the loop's buffer always make progress.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::agents::verifier::review_test;
use crate::agents::{run_agent, AgentAssignment, AgentContext, AgentFactory, BuiltinAgentFactory};
use crate::backend::{LlmBackend, RetryPolicy};
use crate::budget::{BudgetMonitor, LedgerSnapshot, Limits, ThresholdCrossing, ThresholdLevel, Usage};
use crate::bus::{BusSummary, EventBus, EventFilter, Subscription, SubscriptionId, DEFAULT_CAPACITY};
use crate::domain::{
    kinds, AgentRole, AgentState, ArtifactFile, BudgetScope, BuildArtifact, EngineError, Event,
    Phase, PromotionDecision, Result, RunSpecification, VerificationOutcome,
};
use crate::executor::ProjectExecutor;
use crate::gate::{GateUpdate, VerificationGate};
use crate::lifecycle::{AgentSnapshot, Control, LifecycleManager};
use crate::metrics::METRICS;
use crate::obs;
use crate::sink::{spawn_sink, LogSink};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables of the loop itself. Run limits live in the specification.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the wall-clock and verifier-deadline check.
    pub tick: Duration,
    /// Subscriber buffer size of the run's bus.
    pub bus_capacity: usize,
    /// How long agent tasks may take to stop before they are aborted.
    pub grace_period: Duration,
    /// Overrides the backoff base delay of every agent's retry policy.
    pub retry_base_delay: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            bus_capacity: DEFAULT_CAPACITY,
            grace_period: Duration::from_secs(5),
            retry_base_delay: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Aborted,
}

/// Final summary of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,

    /// Why the run was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    pub ledger: LedgerSnapshot,

    /// Final state of every agent instance, in spawn order.
    pub agents: Vec<AgentSnapshot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BuildArtifact>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<PromotionDecision>,

    pub events: BusSummary,

    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Agents that ended `Failed`.
    pub fn failed_agents(&self) -> Vec<&AgentSnapshot> {
        self.agents
            .iter()
            .filter(|a| a.state == AgentState::Failed)
            .collect()
    }

    /// Whether any agent failed or the artifact was rejected.
    pub fn has_failures(&self) -> bool {
        !self.failed_agents().is_empty()
            || matches!(self.decision, Some(PromotionDecision::Rejected { .. }))
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Operator controls for a running engine. Each call publishes a control event.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    bus: Arc<EventBus>,
}

impl EngineHandle {
    /// Cancel one agent. Cancelling a finished agent does nothing.
    pub async fn cancel_agent(&self, agent_id: &str) -> Result<()> {
        self.control(kinds::AGENT_CANCEL, Some(agent_id)).await
    }

    /// Resume an agent paused on a budget warning.
    pub async fn resume(&self, agent_id: &str) -> Result<()> {
        self.control(kinds::AGENT_RESUME, Some(agent_id)).await
    }

    /// Cancel every agent and abort the run.
    pub async fn cancel_run(&self) -> Result<()> {
        self.control(kinds::AGENT_CANCEL, None).await
    }

    async fn control(&self, event_type: &str, agent_id: Option<&str>) -> Result<()> {
        let mut event = Event::new(self.bus.run_id(), event_type, json!({ "source": "operator" }));
        if let Some(agent_id) = agent_id {
            event = event.with_agent(agent_id);
        }
        self.bus.publish(event).await.map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs one validated specification to completion.
pub struct Engine {
    spec: Arc<RunSpecification>,
    backend: Arc<dyn LlmBackend>,
    executor: Arc<dyn ProjectExecutor>,
    factory: Arc<dyn AgentFactory>,
    sinks: Vec<Arc<dyn LogSink>>,
    config: EngineConfig,
    bus: Arc<EventBus>,
}

impl Engine {
    /// Build an engine for `spec`. The specification is validated first.
    pub fn new(
        spec: RunSpecification,
        backend: Arc<dyn LlmBackend>,
        executor: Arc<dyn ProjectExecutor>,
    ) -> Result<Self> {
        Self::with_config(spec, backend, executor, EngineConfig::default())
    }

    pub fn with_config(
        spec: RunSpecification,
        backend: Arc<dyn LlmBackend>,
        executor: Arc<dyn ProjectExecutor>,
        config: EngineConfig,
    ) -> Result<Self> {
        spec.validate()?;
        let bus = Arc::new(EventBus::with_capacity(Uuid::new_v4(), config.bus_capacity));
        Ok(Self {
            spec: Arc::new(spec),
            backend,
            executor,
            factory: Arc::new(BuiltinAgentFactory),
            sinks: Vec::new(),
            config,
            bus,
        })
    }

    /// Replace the factory that creates agents for spawned instances.
    pub fn with_factory(mut self, factory: Arc<dyn AgentFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Deliver every event of the run to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn run_id(&self) -> Uuid {
        self.bus.run_id()
    }

    /// The run's bus, for subscribing before the run starts.
    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            bus: self.bus.clone(),
        }
    }

    pub fn spec(&self) -> &RunSpecification {
        &self.spec
    }

    /// Run to completion and return the summary.
    pub async fn run(self) -> Result<RunOutcome> {
        let run_id = self.bus.run_id().to_string();
        let span = obs::run_span(&run_id);
        async move {
            let mut sink_tasks = Vec::with_capacity(self.sinks.len());
            for sink in &self.sinks {
                sink_tasks.push(spawn_sink(&self.bus, sink.clone()).await?);
            }
            let subscription = self.bus.subscribe(EventFilter::all()).await?;
            let run = RunLoop::new(self, subscription);
            run.execute(sink_tasks).await
        }
        .instrument(span)
        .await
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

struct RunLoop {
    spec: Arc<RunSpecification>,
    backend: Arc<dyn LlmBackend>,
    executor: Arc<dyn ProjectExecutor>,
    factory: Arc<dyn AgentFactory>,
    config: EngineConfig,
    bus: Arc<EventBus>,
    run_id: Uuid,

    sub: Option<Subscription>,
    sub_id: SubscriptionId,
    backlog: VecDeque<Event>,

    lifecycle: LifecycleManager,
    budget: BudgetMonitor,
    gate: Option<VerificationGate>,

    assignments: HashMap<String, AgentAssignment>,
    artifact_files: Vec<ArtifactFile>,
    artifact: Option<BuildArtifact>,
    verify_queue: VecDeque<String>,
    build_done: bool,
    verify_started: bool,
    operate_started: bool,
    abort_reason: Option<String>,
}

impl RunLoop {
    fn new(engine: Engine, sub: Subscription) -> Self {
        let constraints = &engine.spec.constraints;
        let budget = BudgetMonitor::new(
            Limits::new(
                constraints.max_cost_usd,
                constraints.max_runtime_min.map(|m| m * 60.0),
            ),
            constraints.warning_ratio,
        );
        Self {
            run_id: engine.bus.run_id(),
            spec: engine.spec,
            backend: engine.backend,
            executor: engine.executor,
            factory: engine.factory,
            config: engine.config,
            bus: engine.bus,
            sub_id: sub.id(),
            sub: Some(sub),
            backlog: VecDeque::new(),
            lifecycle: LifecycleManager::new(),
            budget,
            gate: None,
            assignments: HashMap::new(),
            artifact_files: Vec::new(),
            artifact: None,
            verify_queue: VecDeque::new(),
            build_done: false,
            verify_started: false,
            operate_started: false,
            abort_reason: None,
        }
    }

    async fn execute(mut self, sink_tasks: Vec<JoinHandle<()>>) -> Result<RunOutcome> {
        let started = Instant::now();
        let total_agents: usize = [Phase::Build, Phase::Verify, Phase::Operate]
            .iter()
            .map(|p| self.spec.phase_budget(*p).instance_count as usize)
            .sum();
        obs::emit_run_started(&self.run_id.to_string(), &self.spec.project.name, total_agents);

        self.emit(Event::new(
            self.run_id,
            kinds::RUN_STARTED,
            json!({
                "project": self.spec.project.name,
                "version": self.spec.project.version,
                "constraints": self.spec.constraints,
            }),
        ))
        .await?;
        self.start_build().await?;

        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.finished() {
            let event = match self.backlog.pop_front() {
                Some(event) => event,
                None => {
                    let Some(sub) = self.sub.as_mut() else {
                        break;
                    };
                    tokio::select! {
                        next = sub.recv() => match next {
                            Some(event) => event,
                            None => {
                                warn!("bus closed while the run was active");
                                break;
                            }
                        },
                        _ = tick.tick() => {
                            self.on_tick().await?;
                            continue;
                        }
                    }
                }
            };
            self.dispatch(event).await?;
            self.progress().await?;
            self.lifecycle.reap();
        }

        self.finish(started, sink_tasks).await
    }

    fn finished(&self) -> bool {
        if self.abort_reason.is_some() {
            return true;
        }
        self.build_done
            && self.lifecycle.all_terminal()
            && (!self.verify_started || self.decision().is_some())
    }

    fn decision(&self) -> Option<&PromotionDecision> {
        let artifact_id = &self.artifact.as_ref()?.artifact_id;
        self.gate.as_ref()?.decision(artifact_id)
    }

    // -- emitting -----------------------------------------------------------

    /// Publish an engine event without delivering it back to the loop.
    async fn emit(&mut self, event: Event) -> Result<u64> {
        let bus = self.bus.clone();
        let publish = bus.publish_excluding(self.sub_id, event);
        tokio::pin!(publish);
        let Some(sub) = self.sub.as_mut() else {
            return publish.await;
        };
        loop {
            tokio::select! {
                biased;
                result = &mut publish => return result,
                next = sub.recv() => match next {
                    Some(event) => self.backlog.push_back(event),
                    None => return (&mut publish).await,
                },
            }
        }
    }

    async fn emit_agent(&mut self, agent_id: &str, event_type: &str, payload: serde_json::Value) -> Result<u64> {
        self.emit(Event::new(self.run_id, event_type, payload).with_agent(agent_id))
            .await
    }

    // -- staging ------------------------------------------------------------

    async fn start_build(&mut self) -> Result<()> {
        let build = self.spec.build.clone();
        self.emit(Event::new(
            self.run_id,
            kinds::BUILD_START,
            json!({ "goal": build.goal, "agents": self.spec.phase_budget(Phase::Build).instance_count }),
        ))
        .await?;
        let assignment = AgentAssignment {
            project: Some(self.spec.project.clone()),
            phase_goal: build.goal.clone(),
            ..AgentAssignment::default()
        };
        let ids = self.spawn_phase(Phase::Build).await?;
        for id in ids {
            self.assignments.insert(id.clone(), assignment.clone());
            self.launch(&id)?;
        }
        Ok(())
    }

    async fn finish_build(&mut self) -> Result<()> {
        self.build_done = true;
        let artifact = BuildArtifact::from_files(self.artifact_files.drain(..));
        if artifact.is_empty() {
            warn!("build produced no files; skipping verify and operate");
            return Ok(());
        }
        info!(artifact_id = %artifact.artifact_id, files = artifact.files.len(), "build artifact ready");
        self.emit(Event::new(
            self.run_id,
            kinds::BUILD_ARTIFACT_READY,
            json!({ "artifact_id": artifact.artifact_id, "files": artifact.files }),
        ))
        .await?;
        self.artifact = Some(artifact);

        let gated = self
            .spec
            .verify
            .as_ref()
            .is_some_and(|v| v.strategy.blocks_operate());
        if self.spec.verify.is_some() {
            self.start_verify().await?;
        }
        if !gated {
            self.start_operate().await?;
        }
        Ok(())
    }

    async fn start_verify(&mut self) -> Result<()> {
        let (Some(verify), Some(artifact)) = (self.spec.verify.clone(), self.artifact.clone()) else {
            return Ok(());
        };
        self.verify_started = true;
        self.emit(Event::new(
            self.run_id,
            kinds::VERIFY_START,
            json!({
                "artifact_id": artifact.artifact_id,
                "strategy": verify.strategy,
                "tests": verify.tests.len(),
            }),
        ))
        .await?;

        let ids = self.spawn_phase(Phase::Verify).await?;
        let mut tests = vec![Vec::new(); ids.len()];
        if verify.tests.is_empty() {
            for assigned in &mut tests {
                assigned.push(review_test());
            }
        } else {
            for (i, test) in verify.tests.iter().enumerate() {
                tests[i % ids.len()].push(test.clone());
            }
        }
        for (id, tests) in ids.iter().zip(tests) {
            self.assignments.insert(
                id.clone(),
                AgentAssignment {
                    project: Some(self.spec.project.clone()),
                    phase_goal: self.spec.build.goal.clone(),
                    tests,
                    artifact: Some(artifact.clone()),
                    ..AgentAssignment::default()
                },
            );
        }

        let mut gate = VerificationGate::new(
            verify.strategy,
            verify.thresholds.clone(),
            Duration::from_secs(verify.timeout_secs),
        );
        gate.register(artifact, ids.clone());
        self.gate = Some(gate);

        if verify.strategy.runs_serially() {
            self.verify_queue = ids.into();
            self.launch_next_verifier()?;
        } else {
            for id in ids {
                self.launch_verifier(&id)?;
            }
        }
        Ok(())
    }

    fn launch_next_verifier(&mut self) -> Result<()> {
        if self.abort_reason.is_some() {
            return Ok(());
        }
        while let Some(id) = self.verify_queue.pop_front() {
            if self.lifecycle.state(&id) == Some(AgentState::Pending) {
                return self.launch_verifier(&id);
            }
        }
        Ok(())
    }

    fn launch_verifier(&mut self, id: &str) -> Result<()> {
        self.launch(id)?;
        if let (Some(gate), Some(artifact)) = (self.gate.as_mut(), self.artifact.as_ref()) {
            gate.start_verifier(&artifact.artifact_id, id, Instant::now())?;
        }
        Ok(())
    }

    async fn start_operate(&mut self) -> Result<()> {
        if self.operate_started || self.abort_reason.is_some() {
            return Ok(());
        }
        let Some(operate) = self.spec.operate.clone() else {
            return Ok(());
        };
        if let (Some(gate), Some(artifact)) = (self.gate.as_ref(), self.artifact.as_ref()) {
            if !gate.may_spawn_operate(&artifact.artifact_id) {
                info!(artifact_id = %artifact.artifact_id, "operate phase blocked by the gate");
                return Ok(());
            }
        }
        self.operate_started = true;
        let artifact_id = self.artifact.as_ref().map(|a| a.artifact_id.clone());
        self.emit(Event::new(
            self.run_id,
            kinds::OPERATE_START,
            json!({ "runtime": operate.runtime, "artifact_id": artifact_id }),
        ))
        .await?;

        let ids = self.spawn_phase(Phase::Operate).await?;
        for id in ids {
            self.emit_agent(&id, kinds::OPERATE_AGENT_SPAWNED, json!({ "runtime": operate.runtime }))
                .await?;
            self.assignments.insert(
                id.clone(),
                AgentAssignment {
                    project: Some(self.spec.project.clone()),
                    phase_goal: self.spec.build.goal.clone(),
                    commands: operate.commands.clone(),
                    artifact: self.artifact.clone(),
                    ..AgentAssignment::default()
                },
            );
            self.launch(&id)?;
        }
        Ok(())
    }

    /// Register every instance of a phase and announce it. Nothing is started.
    async fn spawn_phase(&mut self, phase: Phase) -> Result<Vec<String>> {
        let budget = self.spec.phase_budget(phase);
        let specs = self.spec.agents_for(phase).to_vec();
        let mut all = Vec::new();
        for (index, spec) in specs.iter().enumerate() {
            let ids = self.lifecycle.spawn(spec, index + 1, &budget)?;
            for id in ids {
                let slice = self.lifecycle.slice(&id).unwrap_or_default();
                self.budget.register(&id, slice);
                self.emit_agent(
                    &id,
                    kinds::AGENT_SPAWNED,
                    json!({ "role": spec.role, "phase": phase, "model": spec.model, "slice": slice }),
                )
                .await?;
                all.push(id);
            }
        }
        Ok(all)
    }

    /// Start the task of a registered instance.
    fn launch(&mut self, id: &str) -> Result<()> {
        let spec = self
            .lifecycle
            .spec(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))?;
        let inbox = self
            .lifecycle
            .take_inbox(id)
            .ok_or_else(|| EngineError::UnknownAgent(id.to_string()))?;
        let assignment = self.assignments.remove(id).unwrap_or_default();

        let mut ctx = AgentContext::new(
            id.to_string(),
            spec.clone(),
            self.bus.clone(),
            inbox,
            self.backend.clone(),
            self.executor.clone(),
        );
        if let Some(base) = self.config.retry_base_delay {
            ctx = ctx.with_retry(RetryPolicy::new(spec.max_retries).with_base_delay(base));
        }
        let agent = self.factory.create(id, &spec, assignment);
        let task = tokio::spawn(run_agent(agent, ctx).in_current_span());
        self.lifecycle.attach_task(id, task)?;
        debug!(agent_id = %id, "agent task started");
        Ok(())
    }

    /// Stage the next phase once the current one has finished.
    async fn progress(&mut self) -> Result<()> {
        if self.abort_reason.is_some() {
            return Ok(());
        }
        if !self.build_done && self.lifecycle.phase_finished(Phase::Build) {
            self.finish_build().await?;
        }
        Ok(())
    }

    // -- dispatch -----------------------------------------------------------

    async fn dispatch(&mut self, event: Event) -> Result<()> {
        let Some(agent_id) = event.agent_id.clone() else {
            if event.is(kinds::AGENT_CANCEL) {
                info!("run cancelled by operator");
                return self.abort("cancelled by operator".to_string()).await;
            }
            debug!(event_type = %event.event_type, "ignoring run-scoped event");
            return Ok(());
        };
        if kinds::is_engine_owned(&event.event_type) {
            warn!(agent_id = %agent_id, event_type = %event.event_type, "ignoring engine-owned event from outside the loop");
            return Ok(());
        }
        if self.lifecycle.state(&agent_id).is_none() {
            warn!(agent_id = %agent_id, event_type = %event.event_type, "event for unknown agent");
            return Ok(());
        }

        match event.event_type.as_str() {
            kinds::AGENT_USAGE => self.on_usage(&agent_id, &event).await,
            kinds::AGENT_MESSAGE => {
                self.route_message(&agent_id, event);
                Ok(())
            }
            kinds::VERIFY_REPORT => {
                let valid = self.transition(&agent_id, &event, true).await?;
                if valid {
                    self.on_report(&agent_id, &event).await?;
                }
                Ok(())
            }
            kinds::BUILD_STEP_COMPLETED => {
                let valid = self.transition(&agent_id, &event, true).await?;
                if valid {
                    match (event.payload_str("file_path"), event.payload_str("digest")) {
                        (Some(path), Some(digest)) => self.artifact_files.push(ArtifactFile {
                            path: path.to_string(),
                            digest: digest.to_string(),
                        }),
                        _ => warn!(agent_id = %agent_id, "build step without file_path/digest"),
                    }
                }
                Ok(())
            }
            _ => self.transition(&agent_id, &event, true).await.map(|_| ()),
        }
    }

    async fn on_usage(&mut self, agent_id: &str, event: &Event) -> Result<()> {
        let usage: Usage = match serde_json::from_value(event.payload.clone()) {
            Ok(usage) => usage,
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "malformed usage report");
                Usage::default()
            }
        };
        let headroom = match self.budget.account(agent_id, &usage) {
            Ok(headroom) => headroom,
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "usage not accounted");
                return Ok(());
            }
        };
        let crossings = self.budget.check_thresholds(agent_id);
        self.handle_crossings(crossings).await?;

        // Re-read: a crossing may have ended the run since `account`.
        let headroom = self.budget.headroom(agent_id).unwrap_or(headroom);
        if let Err(err) = self.lifecycle.send(agent_id, Control::Receipt(headroom)) {
            debug!(agent_id = %agent_id, error = %err, "receipt not delivered");
        }
        Ok(())
    }

    async fn handle_crossings(&mut self, crossings: Vec<ThresholdCrossing>) -> Result<()> {
        for crossing in crossings {
            let mut event = Event::new(self.run_id, crossing.event_type(), crossing.payload());
            if let Some(agent_id) = crossing.agent_id() {
                event = event.with_agent(agent_id);
            }
            if crossing.level == ThresholdLevel::Exceeded {
                METRICS.inc_budget_breaches();
                obs::emit_budget_exceeded(
                    &crossing.subject,
                    crossing.scope,
                    crossing.kind,
                    crossing.used,
                    crossing.cap,
                );
            }
            self.emit(event.clone()).await?;

            match (crossing.level, crossing.scope) {
                (ThresholdLevel::Exceeded, BudgetScope::Agent) => {
                    self.transition(&crossing.subject, &event, true).await?;
                }
                (ThresholdLevel::Exceeded, BudgetScope::Run) => {
                    self.abort(crossing.into_error().to_string()).await?;
                }
                (ThresholdLevel::Warning, BudgetScope::Agent)
                    if self.spec.constraints.pause_on_warning =>
                {
                    if self.lifecycle.state(&crossing.subject) == Some(AgentState::Running) {
                        let pause = Event::new(self.run_id, kinds::AGENT_PAUSED, crossing.payload())
                            .with_agent(&crossing.subject);
                        self.transition(&crossing.subject, &pause, false).await?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn route_message(&mut self, from: &str, event: Event) {
        let targets = match event.payload_str("to") {
            Some(to) => vec![to.to_string()],
            None => self
                .lifecycle
                .active_ids()
                .into_iter()
                .filter(|id| id != from)
                .collect(),
        };
        for target in targets {
            if let Err(err) = self.lifecycle.send(&target, Control::Deliver(event.clone())) {
                warn!(from = %from, to = %target, error = %err, "message not delivered");
            }
        }
    }

    async fn on_report(&mut self, agent_id: &str, event: &Event) -> Result<()> {
        let (Some(gate), Some(artifact)) = (self.gate.as_mut(), self.artifact.as_ref()) else {
            warn!(agent_id = %agent_id, "verification report without an artifact under verification");
            return Ok(());
        };
        let outcomes: Vec<VerificationOutcome> = event
            .payload
            .get("outcomes")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_else(|| {
                warn!(agent_id = %agent_id, "malformed verification report");
                vec![VerificationOutcome::failed("report", "malformed verification report")]
            });
        let artifact_id = artifact.artifact_id.clone();
        match gate.record(&artifact_id, agent_id, outcomes) {
            Ok(Some(decision)) => self.on_decision(&artifact_id, decision).await,
            Ok(None) => Ok(()),
            Err(err) => {
                warn!(agent_id = %agent_id, error = %err, "verification report rejected");
                Ok(())
            }
        }
    }

    async fn on_decision(&mut self, artifact_id: &str, decision: PromotionDecision) -> Result<()> {
        let outcomes = self
            .gate
            .as_ref()
            .map(|g| g.outcomes(artifact_id))
            .unwrap_or_default();
        let event_type = if decision.is_promoted() {
            kinds::VERIFY_GATE_PROMOTED
        } else {
            kinds::VERIFY_GATE_REJECTED
        };
        self.emit(Event::new(
            self.run_id,
            event_type,
            json!({
                "artifact_id": artifact_id,
                "outcomes": outcomes.len(),
                "violations": decision.violations(),
            }),
        ))
        .await?;
        if decision.is_promoted() {
            self.start_operate().await?;
        }
        Ok(())
    }

    // -- transitions --------------------------------------------------------

    /// Apply `trigger` to the agent's state machine. Returns whether the event
    /// was valid for the agent's state.
    ///
    /// `published` tells whether `trigger` is already on the bus; if not, the
    /// resulting state event is emitted even when it has the same type.
    async fn transition(&mut self, agent_id: &str, trigger: &Event, published: bool) -> Result<bool> {
        let Some(prev) = self.lifecycle.state(agent_id) else {
            return Ok(false);
        };
        match self.lifecycle.advance(agent_id, trigger) {
            Ok(next) => {
                if next != prev {
                    self.after_transition(agent_id, prev, next, trigger, published)
                        .await?;
                }
                Ok(true)
            }
            Err(err @ EngineError::InvalidTransition { .. }) => {
                obs::emit_invalid_transition(agent_id, &err);
                self.emit_agent(
                    agent_id,
                    kinds::AGENT_TRANSITION_INVALID,
                    json!({ "state": prev, "event_type": trigger.event_type, "error": err.to_string() }),
                )
                .await?;
                let next = self.lifecycle.force_fail(agent_id, &err.to_string())?;
                if next != prev {
                    let failed = Event::new(self.run_id, kinds::AGENT_FAILED, json!({ "error": err.to_string() }))
                        .with_agent(agent_id);
                    self.after_transition(agent_id, prev, next, &failed, false)
                        .await?;
                }
                Ok(false)
            }
            Err(EngineError::UnknownAgent(_)) => {
                debug!(agent_id = %agent_id, event_type = %trigger.event_type, "event for reaped agent");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn after_transition(
        &mut self,
        agent_id: &str,
        prev: AgentState,
        next: AgentState,
        trigger: &Event,
        published: bool,
    ) -> Result<()> {
        if let Some(event_type) = state_event(prev, next) {
            if !published || event_type != trigger.event_type {
                let mut payload = json!({ "from": prev, "to": next, "cause": trigger.event_type });
                if let Some(error) = trigger.payload_str("error") {
                    payload["error"] = json!(error);
                }
                self.emit_agent(agent_id, event_type, payload).await?;
            }
        }
        if next.is_terminal() {
            self.on_terminal(agent_id, next).await?;
        }
        Ok(())
    }

    async fn on_terminal(&mut self, agent_id: &str, state: AgentState) -> Result<()> {
        let role = self.lifecycle.spec(agent_id).map(|s| s.role);
        if role != Some(AgentRole::Verifier) {
            return Ok(());
        }
        let decided = match (self.gate.as_mut(), self.artifact.as_ref()) {
            (Some(gate), Some(artifact)) => {
                let artifact_id = artifact.artifact_id.clone();
                if gate.outstanding(&artifact_id).iter().any(|v| v == agent_id) {
                    gate.record_unreported(&artifact_id, agent_id, state)?
                        .map(|d| (artifact_id, d))
                } else {
                    None
                }
            }
            _ => None,
        };
        if let Some((artifact_id, decision)) = decided {
            self.on_decision(&artifact_id, decision).await?;
        }
        if self.gate.as_ref().is_some_and(|g| g.strategy().runs_serially()) {
            self.launch_next_verifier()?;
        }
        Ok(())
    }

    // -- tick, abort, finish ------------------------------------------------

    async fn on_tick(&mut self) -> Result<()> {
        let crossings = self.budget.check_run();
        self.handle_crossings(crossings).await?;
        if self.abort_reason.is_some() {
            return Ok(());
        }

        let updates = match self.gate.as_mut() {
            Some(gate) => gate.expire(Instant::now()),
            None => Vec::new(),
        };
        for update in updates {
            match update {
                GateUpdate::TimedOut { verifier_id, .. } => {
                    let timeout_secs = self.gate.as_ref().map_or(0, |g| g.timeout().as_secs());
                    warn!(agent_id = %verifier_id, timeout_secs, "verifier timed out");
                    let outcome = VerificationOutcome::timed_out(&verifier_id, timeout_secs);
                    self.emit_agent(
                        &verifier_id,
                        kinds::VERIFY_TEST_FAILED,
                        json!({ "test_type": outcome.test_type, "outcome": outcome }),
                    )
                    .await?;
                    let cancel = Event::new(
                        self.run_id,
                        kinds::AGENT_CANCEL,
                        json!({ "reason": EngineError::VerificationTimeout { agent_id: verifier_id.clone(), timeout_secs }.to_string() }),
                    )
                    .with_agent(&verifier_id);
                    self.transition(&verifier_id, &cancel, false).await?;
                }
                GateUpdate::Decided { artifact_id, decision } => {
                    self.on_decision(&artifact_id, decision).await?;
                }
            }
        }
        self.progress().await?;
        self.lifecycle.reap();
        Ok(())
    }

    /// Cancel every live instance and end the run as aborted.
    async fn abort(&mut self, reason: String) -> Result<()> {
        if self.abort_reason.is_some() {
            return Ok(());
        }
        warn!(reason = %reason, "aborting run");
        self.abort_reason = Some(reason.clone());
        for agent_id in self.lifecycle.active_ids() {
            let cancel = Event::new(self.run_id, kinds::AGENT_CANCEL, json!({ "reason": reason }))
                .with_agent(&agent_id);
            self.transition(&agent_id, &cancel, false).await?;
        }
        Ok(())
    }

    async fn finish(mut self, started: Instant, sink_tasks: Vec<JoinHandle<()>>) -> Result<RunOutcome> {
        // Stop consuming; agents still publishing only reach the sinks now.
        self.sub = None;
        self.backlog.clear();
        self.join_agents().await;

        let status = if self.abort_reason.is_some() {
            RunStatus::Aborted
        } else {
            RunStatus::Completed
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        let ledger = self.budget.snapshot();
        let agents = self.lifecycle.snapshot();
        let decision = self.decision().cloned();

        let event_type = match status {
            RunStatus::Completed => kinds::RUN_COMPLETED,
            RunStatus::Aborted => kinds::RUN_ABORTED,
        };
        let final_event = Event::new(
            self.run_id,
            event_type,
            json!({
                "status": status,
                "reason": self.abort_reason,
                "ledger": ledger,
                "agents": agents,
                "artifact_id": self.artifact.as_ref().map(|a| a.artifact_id.clone()),
                "decision": decision,
                "duration_ms": duration_ms,
            }),
        );
        if let Err(err) = self.bus.publish(final_event).await {
            warn!(error = %err, "final run event not published");
        }
        let events = self.bus.summary().await;
        self.bus.close().await;
        for task in sink_tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "log sink task failed");
            }
        }

        METRICS.flush();
        obs::emit_run_finished(
            &self.run_id.to_string(),
            duration_ms,
            events.total_events,
            status == RunStatus::Completed,
        );

        Ok(RunOutcome {
            run_id: self.run_id,
            status,
            reason: self.abort_reason,
            ledger,
            agents,
            artifact: self.artifact,
            decision,
            events,
            duration_ms,
        })
    }

    async fn join_agents(&mut self) {
        let grace = self.config.grace_period;
        for (agent_id, mut task) in self.lifecycle.take_tasks() {
            match tokio::time::timeout(grace, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(agent_id = %agent_id, error = %err, "agent task panicked"),
                Err(_) => {
                    warn!(agent_id = %agent_id, "agent task did not stop within the grace period");
                    task.abort();
                }
            }
        }
    }
}

/// The event announcing a state change, by resulting state.
fn state_event(prev: AgentState, next: AgentState) -> Option<&'static str> {
    Some(match next {
        AgentState::Pending => return None,
        AgentState::Running if prev == AgentState::Paused => kinds::AGENT_RESUMED,
        AgentState::Running => kinds::AGENT_STARTED,
        AgentState::Paused => kinds::AGENT_PAUSED,
        AgentState::Completed => kinds::AGENT_COMPLETED,
        AgentState::Failed => kinds::AGENT_FAILED,
        AgentState::Cancelled => kinds::AGENT_CANCELLED,
    })
}
