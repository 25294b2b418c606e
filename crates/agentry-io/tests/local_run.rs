//! Full runs against the real file system: generated files land under the
//! project root and the NDJSON log mirrors the bus.

use std::sync::Arc;

use agentry_core::domain::{
    kinds, AgentRole, AgentSpec, BuildPhase, Constraints, LoggingSpec, ProjectSpec,
    RunSpecification, TestSpec, Thresholds, VerifyPhase, VerifyStrategy,
};
use agentry_core::fakes::ScriptedBackend;
use agentry_core::sink::{parse_records, FileSink};
use agentry_core::{Engine, PromotionDecision};
use agentry_io::LocalExecutor;

fn spec(verify: Option<VerifyPhase>) -> RunSpecification {
    RunSpecification {
        project: ProjectSpec {
            name: "local".to_string(),
            description: "written to disk".to_string(),
            version: None,
            tags: Vec::new(),
        },
        build: BuildPhase {
            goal: "write a script".to_string(),
            agents: vec![AgentSpec::new(AgentRole::Builder, "gpt-4o-mini")],
            max_cost_usd: None,
            max_runtime_min: None,
        },
        verify,
        operate: None,
        constraints: Constraints::default(),
        logging: LoggingSpec::default(),
    }
}

#[tokio::test]
async fn test_build_writes_into_project_root_and_logs_ndjson() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("project");
    let log_path = dir.path().join("logs/run.ndjson");

    let executor = Arc::new(LocalExecutor::create(&root).await.unwrap());
    let sink = Arc::new(FileSink::create(&log_path).await.unwrap());
    let engine = Engine::new(spec(None), Arc::new(ScriptedBackend::new()), executor)
        .unwrap()
        .with_sink(sink);
    let run_id = engine.run_id();
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert!(root.join("src/main.py").is_file());
    assert!(root.join("README.md").is_file());

    let text = tokio::fs::read_to_string(&log_path).await.unwrap();
    let records = parse_records(&text);
    assert_eq!(records.len() as u64, outcome.events.total_events);
    assert!(records.iter().all(|r| r.run_id == run_id));
    assert_eq!(records[0].event_type, kinds::RUN_STARTED);
    assert_eq!(records.last().unwrap().event_type, kinds::RUN_COMPLETED);
}

#[tokio::test]
async fn test_verifier_runs_shell_tests_in_project_root() {
    let dir = tempfile::tempdir().unwrap();
    let verify = VerifyPhase {
        strategy: VerifyStrategy::Gated,
        agents: vec![AgentSpec::new(AgentRole::Verifier, "gpt-4o-mini")],
        tests: vec![TestSpec {
            test_type: "unit".to_string(),
            path: None,
            command: Some("test -f src/main.py && echo 'coverage: 88%'".to_string()),
            timeout_secs: 30,
        }],
        thresholds: Thresholds {
            min_test_coverage: Some(80.0),
            max_critical_issues: None,
        },
        timeout_secs: 60,
        max_cost_usd: None,
        max_runtime_min: None,
    };
    let executor = Arc::new(LocalExecutor::create(dir.path()).await.unwrap());
    let engine = Engine::new(spec(Some(verify)), Arc::new(ScriptedBackend::new()), executor).unwrap();
    let outcome = engine.run().await.unwrap();

    assert_eq!(outcome.decision, Some(PromotionDecision::Promoted));
}

#[tokio::test]
async fn test_failing_shell_test_rejects_the_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let verify = VerifyPhase {
        strategy: VerifyStrategy::Gated,
        agents: vec![AgentSpec::new(AgentRole::Verifier, "gpt-4o-mini")],
        tests: vec![TestSpec {
            test_type: "unit".to_string(),
            path: None,
            command: Some("echo '1 failed' >&2; exit 1".to_string()),
            timeout_secs: 30,
        }],
        thresholds: Thresholds::default(),
        timeout_secs: 60,
        max_cost_usd: None,
        max_runtime_min: None,
    };
    let executor = Arc::new(LocalExecutor::create(dir.path()).await.unwrap());
    let engine = Engine::new(spec(Some(verify)), Arc::new(ScriptedBackend::new()), executor).unwrap();
    let outcome = engine.run().await.unwrap();

    assert!(outcome.is_completed());
    assert!(matches!(
        outcome.decision,
        Some(PromotionDecision::Rejected { .. })
    ));
}
