//! Verify-phase scheduling and promotion decisions through full engine runs.

use std::sync::Arc;
use std::time::Duration;

use agentry_core::domain::{
    kinds, AgentRole, AgentSpec, AgentState, BuildPhase, Constraints, GateRule, LoggingSpec,
    OperatePhase, ProjectSpec, RunSpecification, TestSpec, Thresholds, VerifyPhase,
    VerifyStrategy,
};
use agentry_core::fakes::{default_reply, MemoryExecutor, MemorySink, ScriptedBackend};
use agentry_core::{CommandOutput, Engine, EngineConfig, PromotionDecision, RunStatus};

fn spec(verify: VerifyPhase, operate: Option<OperatePhase>) -> RunSpecification {
    RunSpecification {
        project: ProjectSpec {
            name: "gated".to_string(),
            description: "service under verification".to_string(),
            version: None,
            tags: Vec::new(),
        },
        build: BuildPhase {
            goal: "build the service".to_string(),
            agents: vec![AgentSpec::new(AgentRole::Builder, "gpt-4o")],
            max_cost_usd: None,
            max_runtime_min: None,
        },
        verify: Some(verify),
        operate,
        constraints: Constraints::default(),
        logging: LoggingSpec::default(),
    }
}

fn verify_phase(strategy: VerifyStrategy, verifiers: u32, tests: Vec<TestSpec>) -> VerifyPhase {
    VerifyPhase {
        strategy,
        agents: vec![AgentSpec::new(AgentRole::Verifier, "gpt-4o").with_count(verifiers)],
        tests,
        thresholds: Thresholds {
            min_test_coverage: Some(80.0),
            max_critical_issues: Some(0),
        },
        timeout_secs: 600,
        max_cost_usd: None,
        max_runtime_min: None,
    }
}

fn operate_phase() -> OperatePhase {
    OperatePhase {
        runtime: "local".to_string(),
        agents: vec![AgentSpec::new(AgentRole::Operator, "gpt-4o-mini")],
        commands: vec!["deploy".to_string()],
        max_cost_usd: None,
        max_runtime_min: None,
    }
}

fn command_test(test_type: &str, command: &str) -> TestSpec {
    TestSpec {
        test_type: test_type.to_string(),
        path: None,
        command: Some(command.to_string()),
        timeout_secs: 300,
    }
}

fn output(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn position(types: &[String], event_type: &str) -> Option<usize> {
    types.iter().position(|t| t == event_type)
}

#[tokio::test]
async fn test_gated_operate_waits_for_promotion() {
    let spec = spec(
        verify_phase(VerifyStrategy::Gated, 1, Vec::new()),
        Some(operate_phase()),
    );
    let executor = Arc::new(MemoryExecutor::new());
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, Arc::new(ScriptedBackend::new()), executor.clone())
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.decision, Some(PromotionDecision::Promoted));
    assert!(outcome.agents.iter().all(|a| a.state == AgentState::Completed));
    assert_eq!(outcome.agents.len(), 3);
    assert_eq!(executor.commands_run(), vec!["deploy"]);

    let types = sink.event_types();
    let promoted = position(&types, kinds::VERIFY_GATE_PROMOTED).expect("promoted");
    let spawned = position(&types, kinds::OPERATE_AGENT_SPAWNED).expect("operate spawned");
    assert!(promoted < spawned);
    assert!(position(&types, kinds::OPERATE_START).unwrap() > promoted);
    assert!(position(&types, kinds::OPERATE_ACTION).is_some());
}

#[tokio::test(start_paused = true)]
async fn test_gated_operate_waits_for_slow_verifiers() {
    let spec = spec(
        verify_phase(VerifyStrategy::Gated, 2, Vec::new()),
        Some(operate_phase()),
    );
    let backend = ScriptedBackend::new().with_delay(Duration::from_secs(30));
    let executor = Arc::new(MemoryExecutor::new());
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, Arc::new(backend), executor.clone())
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert_eq!(outcome.decision, Some(PromotionDecision::Promoted));
    assert_eq!(executor.commands_run(), vec!["deploy"]);

    let types = sink.event_types();
    let reports: Vec<usize> = types
        .iter()
        .enumerate()
        .filter(|(_, t)| t.as_str() == kinds::VERIFY_REPORT)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(reports.len(), 2);
    let promoted = position(&types, kinds::VERIFY_GATE_PROMOTED).expect("promoted");
    let spawned = position(&types, kinds::OPERATE_AGENT_SPAWNED).expect("operate spawned");
    assert!(reports.iter().all(|&r| r < promoted));
    assert!(promoted < spawned);
}

#[tokio::test]
async fn test_gated_rejection_never_spawns_operate() {
    let backend = ScriptedBackend::new().with_responder(|req| {
        Ok(if req.prompt.contains("JSON object") {
            r#"{"passed": false, "coverage": 40, "critical_issues": 2, "detail": "no tests"}"#
                .to_string()
        } else {
            default_reply(req)
        })
    });
    let spec = spec(
        verify_phase(VerifyStrategy::Gated, 1, Vec::new()),
        Some(operate_phase()),
    );
    let executor = Arc::new(MemoryExecutor::new());
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, Arc::new(backend), executor.clone())
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert!(outcome.has_failures());
    let Some(PromotionDecision::Rejected { violations }) = &outcome.decision else {
        panic!("expected rejection, got {:?}", outcome.decision);
    };
    assert!(violations.iter().any(|v| v.rule == GateRule::AllPassed));
    assert!(violations
        .iter()
        .any(|v| matches!(v.rule, GateRule::MinTestCoverage { .. })));
    assert!(violations
        .iter()
        .any(|v| matches!(v.rule, GateRule::MaxCriticalIssues { .. })));

    assert!(outcome.agents.iter().all(|a| a.role != AgentRole::Operator));
    assert!(executor.commands_run().is_empty());

    let types = sink.event_types();
    assert!(position(&types, kinds::VERIFY_GATE_REJECTED).is_some());
    assert!(position(&types, kinds::OPERATE_START).is_none());
    assert!(position(&types, kinds::OPERATE_AGENT_SPAWNED).is_none());
}

#[tokio::test]
async fn test_sequential_verifiers_reject_low_coverage() {
    let spec = spec(
        verify_phase(
            VerifyStrategy::Sequential,
            2,
            vec![
                command_test("unit", "run-unit"),
                command_test("integration", "run-integration"),
            ],
        ),
        None,
    );
    let executor = Arc::new(
        MemoryExecutor::new()
            .with_command("run-unit", output("12 passed\ncoverage: 90%"))
            .with_command("run-integration", output("4 passed\ncoverage: 70%")),
    );
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, Arc::new(ScriptedBackend::new()), executor.clone())
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    let Some(PromotionDecision::Rejected { violations }) = &outcome.decision else {
        panic!("expected rejection, got {:?}", outcome.decision);
    };
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].rule, GateRule::MinTestCoverage { min: 80.0 });
    assert!(violations[0].reason.contains("integration"));
    assert_eq!(executor.commands_run(), vec!["run-unit", "run-integration"]);

    // The second verifier only starts once the first has finished.
    let records = sink.records();
    let index_of = |ty: &str, agent: &str| {
        records
            .iter()
            .position(|r| r.event_type == ty && r.agent_id.as_deref() == Some(agent))
            .unwrap_or_else(|| panic!("{ty} for {agent}"))
    };
    assert!(
        index_of(kinds::AGENT_COMPLETED, "verifier-1-1")
            < index_of(kinds::AGENT_STARTED, "verifier-1-2")
    );
}

#[tokio::test]
async fn test_parallel_strategy_does_not_hold_operate() {
    let spec = spec(
        verify_phase(
            VerifyStrategy::Parallel,
            2,
            vec![command_test("unit", "run-unit"), command_test("lint", "run-lint")],
        ),
        Some(operate_phase()),
    );
    let executor = Arc::new(
        MemoryExecutor::new()
            .with_command("run-unit", output("coverage: 91%\ncritical issues: 0"))
            .with_command("run-lint", output("coverage: 85%")),
    );
    let sink = Arc::new(MemorySink::new());
    let engine = Engine::new(spec, Arc::new(ScriptedBackend::new()), executor)
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.decision, Some(PromotionDecision::Promoted));
    assert!(outcome.agents.iter().all(|a| a.state == AgentState::Completed));

    let types = sink.event_types();
    let verify_start = position(&types, kinds::VERIFY_START).unwrap();
    let operate_start = position(&types, kinds::OPERATE_START).unwrap();
    let promoted = position(&types, kinds::VERIFY_GATE_PROMOTED).unwrap();
    assert!(verify_start < operate_start);
    assert!(operate_start < promoted);
}

#[tokio::test(start_paused = true)]
async fn test_silent_verifier_times_out_and_rejects() {
    let mut verify = verify_phase(
        VerifyStrategy::Gated,
        1,
        vec![TestSpec {
            timeout_secs: 7_200,
            ..command_test("e2e", "hang")
        }],
    );
    verify.timeout_secs = 5;
    let spec = spec(verify, Some(operate_phase()));
    let executor = Arc::new(MemoryExecutor::new().with_slow_command(
        "hang",
        output("coverage: 100%"),
        Duration::from_secs(3_600),
    ));
    let sink = Arc::new(MemorySink::new());
    let config = EngineConfig {
        tick: Duration::from_millis(500),
        ..EngineConfig::default()
    };
    let engine = Engine::with_config(spec, Arc::new(ScriptedBackend::new()), executor, config)
        .unwrap()
        .with_sink(sink.clone());
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.status, RunStatus::Completed);
    let Some(PromotionDecision::Rejected { violations }) = &outcome.decision else {
        panic!("expected rejection, got {:?}", outcome.decision);
    };
    assert!(violations.iter().any(|v| v.reason.contains("did not report within 5s")));

    let verifier = outcome
        .agents
        .iter()
        .find(|a| a.agent_id == "verifier-1-1")
        .unwrap();
    assert_eq!(verifier.state, AgentState::Cancelled);
    assert!(outcome.agents.iter().all(|a| a.role != AgentRole::Operator));

    let records = sink.records();
    let timed_out = records
        .iter()
        .find(|r| r.event_type == kinds::VERIFY_TEST_FAILED)
        .expect("timeout outcome published");
    assert_eq!(timed_out.agent_id.as_deref(), Some("verifier-1-1"));
    assert_eq!(timed_out.payload["outcome"]["passed"], false);
    assert!(records.iter().any(|r| r.event_type == kinds::VERIFY_GATE_REJECTED));
}
