//! End-to-end runs of the orchestration loop.
//!
//! Uses `ScriptedBackend`, `MemoryExecutor` and `MemorySink` so every run is
//! deterministic and needs no network, disk or processes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use agentry_core::bus::EventFilter;
use agentry_core::domain::{
    kinds, AgentRole, AgentSpec, AgentState, BuildPhase, Constraints, Event, LoggingSpec,
    ProjectSpec, RunSpecification,
};
use agentry_core::fakes::{MemoryExecutor, MemorySink, ScriptedBackend};
use agentry_core::{
    Agent, AgentAssignment, AgentContext, AgentError, AgentFactory, BackendError,
    BuiltinAgentFactory, Engine, EngineConfig, RunStatus,
};

fn build_only(count: u32) -> RunSpecification {
    RunSpecification {
        project: ProjectSpec {
            name: "demo".to_string(),
            description: "demo service".to_string(),
            version: None,
            tags: Vec::new(),
        },
        build: BuildPhase {
            goal: "ship it".to_string(),
            agents: vec![AgentSpec::new(AgentRole::Builder, "gpt-4o-mini").with_count(count)],
            max_cost_usd: None,
            max_runtime_min: None,
        },
        verify: None,
        operate: None,
        constraints: Constraints::default(),
        logging: LoggingSpec::default(),
    }
}

fn count(types: &[String], event_type: &str) -> usize {
    types.iter().filter(|t| t.as_str() == event_type).count()
}

#[tokio::test]
async fn test_build_run_completes_and_writes_files() {
    let backend = Arc::new(ScriptedBackend::new());
    let executor = Arc::new(MemoryExecutor::new());
    let sink = Arc::new(MemorySink::new());

    let engine = Engine::new(build_only(1), backend.clone(), executor.clone())
        .unwrap()
        .with_sink(sink.clone());
    let run_id = engine.run_id();
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.run_id, run_id);
    assert_eq!(outcome.status, RunStatus::Completed);
    assert!(!outcome.has_failures());
    assert_eq!(outcome.agents.len(), 1);
    assert_eq!(outcome.agents[0].agent_id, "builder-1-1");
    assert_eq!(outcome.agents[0].state, AgentState::Completed);

    let artifact = outcome.artifact.expect("artifact");
    assert_eq!(artifact.files.len(), 2);
    assert_eq!(executor.paths(), vec!["README.md", "src/main.py"]);
    // One plan call plus one call per file.
    assert_eq!(backend.calls(), 3);

    let types = sink.event_types();
    assert_eq!(types.first().map(String::as_str), Some(kinds::RUN_STARTED));
    assert_eq!(types.last().map(String::as_str), Some(kinds::RUN_COMPLETED));
    assert_eq!(count(&types, kinds::BUILD_STEP_COMPLETED), 2);
    assert_eq!(count(&types, kinds::BUILD_ARTIFACT_READY), 1);
    assert_eq!(count(&types, kinds::AGENT_STARTED), 1);
    assert_eq!(count(&types, kinds::AGENT_COMPLETED), 1);
    assert!(sink.was_flushed());
}

#[tokio::test]
async fn test_spawned_instances_have_distinct_ids() {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(
        build_only(3),
        Arc::new(ScriptedBackend::new()),
        Arc::new(MemoryExecutor::new()),
    )
    .unwrap()
    .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    let ids: Vec<&str> = outcome.agents.iter().map(|a| a.agent_id.as_str()).collect();
    assert_eq!(ids, vec!["builder-1-1", "builder-1-2", "builder-1-3"]);
    assert!(outcome.agents.iter().all(|a| a.state == AgentState::Completed));

    let spawned: Vec<String> = sink
        .records()
        .into_iter()
        .filter(|r| r.event_type == kinds::AGENT_SPAWNED)
        .filter_map(|r| r.agent_id)
        .collect();
    assert_eq!(spawned.len(), 3);
}

#[tokio::test]
async fn test_sink_sees_contiguous_sequence_numbers() {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(
        build_only(2),
        Arc::new(ScriptedBackend::new()),
        Arc::new(MemoryExecutor::new()),
    )
    .unwrap()
    .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    let seqs: Vec<u64> = sink.records().iter().map(|r| r.seq).collect();
    let expected: Vec<u64> = (1..=seqs.len() as u64).collect();
    assert_eq!(seqs, expected);
    assert_eq!(outcome.events.total_events, seqs.len() as u64);
}

#[tokio::test]
async fn test_run_completes_with_single_slot_buffers() {
    let sink = Arc::new(MemorySink::new());
    let config = EngineConfig {
        bus_capacity: 1,
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(
        build_only(3),
        Arc::new(ScriptedBackend::new()),
        Arc::new(MemoryExecutor::new()),
        config,
    )
    .unwrap()
    .with_sink(sink.clone());

    let outcome = tokio::time::timeout(Duration::from_secs(30), engine.run())
        .await
        .expect("run stalled under backpressure")
        .unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.agents.iter().all(|a| a.state == AgentState::Completed));
    assert_eq!(count(&sink.event_types(), kinds::BUILD_STEP_COMPLETED), 6);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_run_aborts_and_cancels_agents() {
    let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_secs(60)));
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(build_only(2), backend, Arc::new(MemoryExecutor::new()))
        .unwrap()
        .with_sink(sink.clone());

    let mut started = engine
        .bus()
        .subscribe(EventFilter::by_type(kinds::AGENT_STARTED))
        .await
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    started.recv().await.expect("agent started");
    handle.cancel_run().await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.reason.as_deref(), Some("cancelled by operator"));
    assert!(outcome
        .agents
        .iter()
        .all(|a| a.state == AgentState::Cancelled));
    assert!(outcome.artifact.is_none());

    let types = sink.event_types();
    assert_eq!(types.last().map(String::as_str), Some(kinds::RUN_ABORTED));
    assert_eq!(count(&types, kinds::AGENT_CANCELLED), 2);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_agent_cancel_emits_once() {
    let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_secs(60)));
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(build_only(2), backend, Arc::new(MemoryExecutor::new()))
        .unwrap()
        .with_sink(sink.clone());

    let mut started = engine
        .bus()
        .subscribe(EventFilter::new(|e: &Event| {
            e.is(kinds::AGENT_STARTED) && e.agent_id.as_deref() == Some("builder-1-1")
        }))
        .await
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    started.recv().await.expect("builder-1-1 started");
    handle.cancel_agent("builder-1-1").await.unwrap();
    handle.cancel_agent("builder-1-1").await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.agents[0].state, AgentState::Cancelled);
    assert_eq!(outcome.agents[1].state, AgentState::Completed);

    let cancelled: Vec<_> = sink
        .records()
        .into_iter()
        .filter(|r| r.event_type == kinds::AGENT_CANCELLED)
        .collect();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].agent_id.as_deref(), Some("builder-1-1"));
}

#[tokio::test]
async fn test_backend_failure_marks_agent_failed() {
    let backend = Arc::new(ScriptedBackend::new().with_responder(|_| {
        Err(BackendError::Status {
            status: 400,
            body: "bad request".to_string(),
        })
    }));
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(build_only(1), backend, Arc::new(MemoryExecutor::new()))
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.has_failures());
    let failed = outcome.failed_agents();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.as_deref().unwrap_or_default().contains("400"));
    assert!(outcome.artifact.is_none());

    let types = sink.event_types();
    assert_eq!(count(&types, kinds::BUILD_FAILED), 1);
    assert_eq!(count(&types, kinds::AGENT_FAILED), 1);
    assert_eq!(count(&types, kinds::BUILD_ARTIFACT_READY), 0);
}

/// Publishes `agent.started` a second time, which is never valid while running.
#[tokio::test]
async fn test_resume_of_running_agent_is_ignored() {
    let backend = Arc::new(ScriptedBackend::new().with_delay(Duration::from_millis(100)));
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(build_only(1), backend, Arc::new(MemoryExecutor::new()))
        .unwrap()
        .with_sink(sink.clone());

    let mut started = engine
        .bus()
        .subscribe(EventFilter::by_type(kinds::AGENT_STARTED))
        .await
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    started.recv().await.expect("builder started");
    handle.resume("builder-1-1").await.unwrap();
    handle.resume("builder-1-1").await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    assert!(outcome.is_completed());
    assert!(!outcome.has_failures());
    assert_eq!(outcome.agents[0].state, AgentState::Completed);
    assert!(outcome.artifact.is_some());

    let types = sink.event_types();
    assert_eq!(count(&types, kinds::AGENT_RESUME), 2);
    assert_eq!(count(&types, kinds::AGENT_RESUMED), 0);
    assert_eq!(count(&types, kinds::AGENT_TRANSITION_INVALID), 0);
    assert_eq!(count(&types, kinds::AGENT_FAILED), 0);
}

/// Stays running until cancelled.
struct Idle;

#[async_trait]
impl Agent for Idle {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        loop {
            ctx.checkpoint().await?;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn handle_event(&mut self, _ctx: &mut AgentContext, _event: Event) -> Result<(), AgentError> {
        Ok(())
    }

    fn cancel(&mut self) {}
}

/// Built-in agents, except for specs whose model is `idle`.
struct IdleFactory;

impl AgentFactory for IdleFactory {
    fn create(&self, agent_id: &str, spec: &AgentSpec, assignment: AgentAssignment) -> Box<dyn Agent> {
        if spec.model == "idle" {
            Box::new(Idle)
        } else {
            BuiltinAgentFactory.create(agent_id, spec, assignment)
        }
    }
}

#[tokio::test]
async fn test_cancel_of_finished_agents_emits_nothing() {
    let mut spec = build_only(1);
    spec.build.agents = vec![
        AgentSpec::new(AgentRole::Builder, "broken"),
        AgentSpec::new(AgentRole::Builder, "gpt-4o-mini"),
        AgentSpec::new(AgentRole::Builder, "idle"),
    ];
    let backend = Arc::new(ScriptedBackend::new().with_responder(|req| {
        if req.model == "broken" {
            Err(BackendError::Decode("truncated reply".to_string()))
        } else {
            Ok(agentry_core::fakes::default_reply(req))
        }
    }));
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, backend, Arc::new(MemoryExecutor::new()))
        .unwrap()
        .with_factory(Arc::new(IdleFactory))
        .with_sink(sink.clone());

    let mut finished = engine
        .bus()
        .subscribe(EventFilter::new(|e: &Event| {
            e.is(kinds::AGENT_FAILED) || e.is(kinds::AGENT_COMPLETED)
        }))
        .await
        .unwrap();
    let handle = engine.handle();
    let run = tokio::spawn(engine.run());

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = finished.recv().await.expect("agent finished");
        seen.push((event.event_type.clone(), event.agent_id.clone().unwrap_or_default()));
    }
    seen.sort();
    assert_eq!(
        seen,
        vec![
            (kinds::AGENT_COMPLETED.to_string(), "builder-2-1".to_string()),
            (kinds::AGENT_FAILED.to_string(), "builder-1-1".to_string()),
        ]
    );

    for agent_id in ["builder-1-1", "builder-2-1", "builder-1-1", "builder-2-1"] {
        handle.cancel_agent(agent_id).await.unwrap();
    }
    handle.cancel_agent("builder-3-1").await.unwrap();
    let outcome = run.await.unwrap().unwrap();

    let states: Vec<AgentState> = outcome.agents.iter().map(|a| a.state).collect();
    assert_eq!(
        states,
        vec![AgentState::Failed, AgentState::Completed, AgentState::Cancelled]
    );

    let records = sink.records();
    let cancelled: Vec<_> = records
        .iter()
        .filter(|r| r.event_type == kinds::AGENT_CANCELLED)
        .filter_map(|r| r.agent_id.as_deref())
        .collect();
    assert_eq!(cancelled, vec!["builder-3-1"]);
    assert!(records
        .iter()
        .all(|r| r.event_type != kinds::AGENT_TRANSITION_INVALID));
    assert_eq!(
        records
            .iter()
            .filter(|r| r.event_type == kinds::AGENT_FAILED)
            .count(),
        1
    );
}

struct StartsTwice;

#[async_trait]
impl Agent for StartsTwice {
    async fn start(&mut self, ctx: &mut AgentContext) -> Result<serde_json::Value, AgentError> {
        ctx.publish(kinds::AGENT_STARTED, json!({})).await?;
        Ok(json!({}))
    }

    async fn handle_event(&mut self, _ctx: &mut AgentContext, _event: Event) -> Result<(), AgentError> {
        Ok(())
    }

    fn cancel(&mut self) {}
}

struct StartsTwiceFactory;

impl AgentFactory for StartsTwiceFactory {
    fn create(&self, _agent_id: &str, _spec: &AgentSpec, _assignment: AgentAssignment) -> Box<dyn Agent> {
        Box::new(StartsTwice)
    }
}

#[tokio::test]
async fn test_invalid_transition_fails_the_agent() {
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(
        build_only(1),
        Arc::new(ScriptedBackend::new()),
        Arc::new(MemoryExecutor::new()),
    )
    .unwrap()
    .with_factory(Arc::new(StartsTwiceFactory))
    .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.agents[0].state, AgentState::Failed);

    let invalid: Vec<_> = sink
        .records()
        .into_iter()
        .filter(|r| r.event_type == kinds::AGENT_TRANSITION_INVALID)
        .collect();
    assert!(!invalid.is_empty());
    assert_eq!(invalid[0].payload["state"], "running");
    assert_eq!(invalid[0].payload["event_type"], kinds::AGENT_STARTED);
}

#[tokio::test]
async fn test_invalid_specification_is_rejected_before_running() {
    let spec = build_only(0);
    let err = Engine::new(
        spec,
        Arc::new(ScriptedBackend::new()),
        Arc::new(MemoryExecutor::new()),
    )
    .err()
    .expect("zero count rejected");
    assert!(err.to_string().contains("count must be at least 1"));
}
