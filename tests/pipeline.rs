#![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing, clippy::panic)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use logicforge::correction::{
    transpile, Action, CancelFlag, CorrectionConfig, FailureReason, TranspileRequest, TranspileResult,
};
use logicforge::dsl::ast::{VarType, Variable};
use logicforge::dsl::cluster::{module_order, Strategy};
use logicforge::dsl::error::DefectKind;
use logicforge::dsl::parser::parse;
use logicforge::dsl::repair::repair;
use logicforge::dsl::validator::ValidateOptions;
use logicforge::dsl::{check_source, compile, repair_report};
use logicforge::llm::{Diagnostics, GenerationService, OfflineService, ServiceError};

fn var(name: &str, ty: VarType, value: serde_json::Value) -> Variable {
    Variable {
        name: name.into(),
        ty,
        value,
        origin_text: String::new(),
    }
}

async fn offline(draft: &str, variables: Vec<Variable>) -> TranspileResult {
    let config = CorrectionConfig {
        max_attempts: 1,
        ..CorrectionConfig::default()
    };
    let request = TranspileRequest {
        requirement: String::new(),
        variables,
        draft: Some(draft.to_string()),
    };
    transpile(&request, &OfflineService, &config, &CancelFlag::new()).await
}

/// Canned drafts, one per call.
struct Canned {
    drafts: Mutex<Vec<Result<String, ServiceError>>>,
    calls: AtomicUsize,
}

impl Canned {
    fn new(drafts: &[Result<&str, ServiceError>]) -> Self {
        Self {
            drafts: Mutex::new(
                drafts
                    .iter()
                    .rev()
                    .map(|d| d.clone().map(str::to_string))
                    .collect(),
            ),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl GenerationService for Canned {
    async fn generate(
        &self,
        _prompt: &str,
        _context: Option<&Diagnostics>,
    ) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.drafts
            .lock()
            .unwrap()
            .pop()
            .unwrap_or(Err(ServiceError::Unavailable("no more drafts".into())))
    }
}

/// Hangs on the first call, answers on later ones.
struct SlowFirst {
    calls: AtomicUsize,
}

#[async_trait]
impl GenerationService for SlowFirst {
    async fn generate(
        &self,
        _prompt: &str,
        _context: Option<&Diagnostics>,
    ) -> Result<String, ServiceError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok("RETURN 1\n".to_string())
    }
}

// ── Scenarios ────────────────────────────────────────────────────

#[test]
fn duplicate_definitions_get_sequential_names() {
    let src = "DEFINE {{d}}: Integer = 90\nDEFINE {{d}}: Integer = 30\nDEFINE {{d}}: Integer = 7";
    let report = check_source(src, &[], &ValidateOptions::default());
    assert_eq!(
        report
            .errors()
            .filter(|d| d.kind == DefectKind::DuplicateDefinition)
            .count(),
        2
    );

    let round = repair_report(&report, &[], &ValidateOptions::default());
    assert!(round.report.is_clean(), "{:?}", round.report.defects);
    let names: Vec<&str> = round.report.analysis.definitions.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["d", "d_2", "d_3"]);
}

#[test]
fn conditional_call_stays_in_one_block() {
    let upstream = vec![var("x", VarType::Integer, serde_json::json!(7))];
    let report = check_source("IF {{x}} > 5\n  CALL f()\nENDIF", &upstream, &ValidateOptions::default());
    assert!(report.is_clean(), "{:?}", report.defects);

    let compiled = compile(&report, &upstream, Strategy::Hybrid).unwrap();
    assert_eq!(compiled.modules.len(), 1);
    assert!(compiled.modules[0]
        .code
        .contains("    if x > 5:\n        await invoke_function(\"f\")\n"));
    assert_eq!(compiled.program.matches("invoke_function(\"f\"").count(), 1);
}

#[test]
fn producer_module_runs_before_consumer() {
    let src = "DEFINE {{x}}: Any\nDEFINE {{y}}: Any\n{{x}} = CALL a()\n{{y}} = CALL b({{x}})\nRETURN {{y}}";
    let report = check_source(src, &[], &ValidateOptions::default());
    assert!(report.is_clean(), "{:?}", report.defects);

    let compiled = compile(&report, &[], Strategy::IoIsolation).unwrap();
    let a = compiled.entry_point.find("step_1_a(").unwrap();
    let b = compiled.entry_point.find("step_2_b(").unwrap();
    assert!(a < b);
    assert_eq!(compiled.modules[1].depends_on, vec!["step_1_a"]);
}

#[test]
fn missing_endif_is_reported_then_closed() {
    let upstream = vec![var("x", VarType::Integer, serde_json::json!(1))];
    let report = check_source("IF {{x}} > 5\n  CALL f()\n", &upstream, &ValidateOptions::default());
    let unclosed: Vec<_> = report
        .errors()
        .filter(|d| d.kind == DefectKind::UnclosedBlock)
        .collect();
    assert_eq!(unclosed.len(), 1);
    assert_eq!(unclosed[0].span.line, 1);

    let round = repair_report(&report, &upstream, &ValidateOptions::default());
    assert!(round.report.is_clean());
    assert_eq!(round.fixed_kinds(), vec![DefectKind::UnclosedBlock]);
}

#[tokio::test]
async fn leading_digit_name_is_sanitized_consistently() {
    let src = "DEFINE {{95th_percentile}}: Float = 1.5\n{{p}} = CALL score({{95th_percentile}})\nRETURN {{p}}";
    let report = check_source(src, &[], &ValidateOptions::default());
    let invalid: Vec<_> = report
        .errors()
        .filter(|d| d.kind == DefectKind::InvalidIdentifier)
        .collect();
    assert_eq!(invalid.len(), 1);
    assert!(invalid[0].message.contains("`_95th_percentile`"));

    let result = offline(src, Vec::new()).await;
    assert!(result.is_success(), "{:?}", result.defects);
    let program = result.program.unwrap();
    assert!(program.contains("\"_95th_percentile\": 1.5"));
    assert!(program.contains("_95th_percentile=_95th_percentile"));
    assert!(!program.contains(" 95th_percentile"));
}

#[tokio::test]
async fn positional_keywords_never_repeat() {
    let src = "DEFINE {{arg2}}: Integer = 1\nCALL f({{arg2}}, 5)\nRETURN";
    let result = offline(src, Vec::new()).await;
    assert!(result.is_success(), "{:?}", result.defects);
    let program = result.program.unwrap();
    assert!(program.contains("await invoke_function(\"f\", arg2=arg2, arg2_2=5)"));
}

#[test]
fn repeated_upstream_names_stop_repair_rounds() {
    let upstream = vec![
        var("x", VarType::Integer, serde_json::json!(1)),
        var("x", VarType::Integer, serde_json::json!(2)),
    ];
    let options = ValidateOptions::default();
    let mut report = check_source("CALL f({{y}})", &upstream, &options);

    let first = repair_report(&report, &upstream, &options);
    assert_eq!(first.fixed_kinds(), vec![DefectKind::UndefinedVariable]);
    report = first.report;

    for _ in 0..3 {
        let round = repair_report(&report, &upstream, &options);
        assert!(!round.made_progress(), "{:?}", round.fixed);
        assert!(round.renames.is_empty());
        report = round.report;
    }
    let names: Vec<&str> = report.analysis.definitions.keys().map(String::as_str).collect();
    assert_eq!(names, vec!["y"]);
    assert!(report
        .errors()
        .any(|d| d.kind == DefectKind::DuplicateDefinition && d.subject.as_deref() == Some("x")));
}

// ── Properties ───────────────────────────────────────────────────

#[test]
fn parsing_is_deterministic() {
    let src = "DEFINE {{n}}: Integer = 3\nFOR {{i}} IN [1, 2]\n  IF {{i}} == {{n}} AND NOT CALL done({{i}})\n    {{n}} = {{n}} - 1\n  ENDIF\nENDFOR\nRETURN {{n}}";
    assert_eq!(parse(src), parse(src));
}

#[test]
fn repair_is_idempotent() {
    let src = "DEFINE {{a}}: Integer = 1\nDEFINE {{a}}: Integer = \"2\"\nIF {{b}} > 1\n  {{class}} = {{a}}\n";
    let report = check_source(src, &[], &ValidateOptions::default());
    let once = repair(report.statements.clone(), &report.defects);
    let twice = repair(once.statements.clone(), &[]);
    assert_eq!(twice.statements, once.statements);
    assert!(twice.fixed.is_empty());
}

#[tokio::test]
async fn successful_sessions_respect_module_dependencies() {
    let src = "DEFINE {{limit}}: Integer = 10\n{{rows}} = CALL fetch({{limit}})\n{{n}} = CALL count({{rows}})\nIF {{n}} > {{limit}}\n  CALL alert({{n}})\nENDIF\nRETURN {{n}}";
    let result = offline(src, Vec::new()).await;
    assert!(result.is_success(), "{:?}", result.defects);

    let modules = result.modules.unwrap();
    let order = module_order(&modules).unwrap();
    let position = |name: &str| order.iter().position(|&i| modules[i].name == name).unwrap();
    for module in &modules {
        for dep in &module.depends_on {
            assert!(position(dep) < position(&module.name), "{dep} after {}", module.name);
        }
    }
}

// ── Self-correction loop ─────────────────────────────────────────

#[tokio::test]
async fn generated_draft_is_repaired_without_another_call() {
    let service = Canned::new(&[Ok(
        "DEFINE {{t}}: Integer = 1\nDEFINE {{t}}: Integer = 2\nIF {{t}} > 1\n  CALL notify({{t}})\n",
    )]);
    let request = TranspileRequest {
        requirement: "notify when t is above one".into(),
        variables: Vec::new(),
        draft: None,
    };
    let result = transpile(&request, &service, &CorrectionConfig::default(), &CancelFlag::new()).await;
    assert!(result.is_success(), "{:?}", result.defects);
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.attempts_used, 1);
    assert!(result.dsl.contains("DEFINE {{t_2}}: Integer = 2"));
    assert!(result.dsl.contains("ENDIF"));
}

#[tokio::test]
async fn exhausted_budget_keeps_every_defect() {
    let service = Canned::new(&[Ok("CALL f(\n"), Ok("RETURN CALL g(,)\n")]);
    let request = TranspileRequest {
        requirement: "call f".into(),
        variables: Vec::new(),
        draft: Some("ENDIF\n".into()),
    };
    let result = transpile(&request, &service, &CorrectionConfig::default(), &CancelFlag::new()).await;
    assert_eq!(result.failure, Some(FailureReason::BudgetExhausted));
    assert_eq!(result.attempts_used, 3);
    assert!(!result.defects.is_empty());
    assert!(result.defects.iter().all(|d| d.span.line == 1));
    assert!(result.program.is_none());
    assert_eq!(result.attempt_log.last().unwrap().action_taken, Action::GaveUp);
}

#[tokio::test]
async fn malformed_response_ends_the_session() {
    let service = Canned::new(&[Err(ServiceError::MalformedResponse("no DSL".into())), Ok("RETURN\n")]);
    let request = TranspileRequest {
        requirement: "anything".into(),
        variables: Vec::new(),
        draft: None,
    };
    let result = transpile(&request, &service, &CorrectionConfig::default(), &CancelFlag::new()).await;
    assert!(matches!(
        result.failure,
        Some(FailureReason::ServiceFailed {
            error: ServiceError::MalformedResponse(_)
        })
    ));
    assert_eq!(service.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn timeout_consumes_an_attempt() {
    let service = SlowFirst {
        calls: AtomicUsize::new(0),
    };
    let config = CorrectionConfig {
        generation_timeout: Duration::from_millis(50),
        ..CorrectionConfig::default()
    };
    let request = TranspileRequest {
        requirement: "return one".into(),
        variables: Vec::new(),
        draft: Some("ENDIF\n".into()),
    };
    let result = transpile(&request, &service, &config, &CancelFlag::new()).await;
    assert!(result.is_success(), "{:?}", result.attempt_log);
    assert_eq!(result.attempts_used, 3);
    assert!(result.attempt_log.iter().any(|r| r.action_taken
        == Action::GenerationFailed {
            error: ServiceError::Timeout
        }));
}
