//! Bounded self-correction loop: validate a draft, repair what can be
//! repaired locally, regenerate the rest.
//!
//! ```text
//! Parsing → Validating ─┬→ Done(success)
//!                       ├→ Repairing ──→ Validating
//!                       ├→ Regenerating → Parsing
//!                       └→ Done(failure)
//! ```
//!
//! A session owns its draft and statement tree; sessions share nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::dsl::ast::Variable;
use crate::dsl::cluster::{Module, Strategy};
use crate::dsl::error::{Defect, DefectKind};
use crate::dsl::render::render_program;
use crate::dsl::validator::ValidateOptions;
use crate::dsl::{check_source, compile, repair_report, CheckReport, Compiled};
use crate::llm::{Diagnostics, GenerationService, ServiceError};
use crate::settings::CorrectionSettings;

#[derive(Debug, Clone)]
pub struct CorrectionConfig {
    /// Attempts per session, the first draft included.
    pub max_attempts: u32,
    pub generation_timeout: Duration,
    /// Repair rounds per attempt.
    pub max_repair_rounds: u32,
    pub strategy: Strategy,
    pub validate: ValidateOptions,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self::from(&CorrectionSettings::default())
    }
}

impl From<&CorrectionSettings> for CorrectionConfig {
    fn from(settings: &CorrectionSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            generation_timeout: Duration::from_secs(settings.generation_timeout_secs),
            max_repair_rounds: settings.max_repair_rounds,
            strategy: settings.strategy,
            validate: ValidateOptions {
                max_nesting_depth: settings.max_nesting_depth,
            },
        }
    }
}

/// Input of one transpile session.
#[derive(Debug, Clone, Default)]
pub struct TranspileRequest {
    /// Natural-language requirement, sent with every regeneration.
    pub requirement: String,
    pub variables: Vec<Variable>,
    /// First draft. When absent the first attempt asks the service for one.
    pub draft: Option<String>,
}

/// Cancellation flag shared between a session and its owner. Checked
/// between state transitions only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum State {
    Parsing,
    Validating,
    Repairing,
    Regenerating,
    Done,
}

/// What a transition did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    /// No errors left; the program was compiled.
    Accepted,
    Repaired { fixed: Vec<DefectKind> },
    /// Repair found nothing it could change.
    RepairStalled,
    Regenerated,
    GenerationFailed { error: ServiceError },
    /// Errors remain and no attempts are left.
    GaveUp,
    /// Modules could not be ordered.
    OrderingFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptRecord {
    pub attempt_number: u32,
    /// Error count when the transition started.
    pub defects_before: usize,
    /// Error count when it finished.
    pub defects_after: usize,
    pub action_taken: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExhausted,
    ServiceFailed { error: ServiceError },
    Cancelled,
    Unorderable,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranspileResult {
    pub session_id: Uuid,
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modules: Option<Vec<Module>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// The exported Python file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    /// Final DSL text of the session.
    pub dsl: String,
    /// Every defect of the final draft: warnings on success, everything
    /// unresolved on failure.
    pub defects: Vec<Defect>,
    pub attempts_used: u32,
    pub attempt_log: Vec<AttemptRecord>,
}

impl TranspileResult {
    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }
}

struct Session<'a> {
    id: Uuid,
    request: &'a TranspileRequest,
    config: &'a CorrectionConfig,
    prompt: String,
    attempt: u32,
    repair_rounds: u32,
    draft: String,
    report: Option<CheckReport>,
    log: Vec<AttemptRecord>,
}

impl Session<'_> {
    fn error_count(&self) -> usize {
        self.report.as_ref().map_or(0, |r| r.errors().count())
    }

    fn record(&mut self, defects_before: usize, action_taken: Action) {
        let defects_after = self.error_count();
        tracing::debug!(
            session = %self.id,
            attempt = self.attempt,
            defects_before,
            defects_after,
            action = ?action_taken,
            "attempt record"
        );
        self.log.push(AttemptRecord {
            attempt_number: self.attempt,
            defects_before,
            defects_after,
            action_taken,
        });
    }

    fn has_attempts_left(&self) -> bool {
        self.attempt < self.config.max_attempts
    }

    fn finish(self, failure: Option<FailureReason>, compiled: Option<Compiled>) -> TranspileResult {
        let defects = self
            .report
            .as_ref()
            .map(|report| report.defects.clone())
            .unwrap_or_default();
        let (modules, entry_point, program) = match compiled {
            Some(c) => (Some(c.modules), Some(c.entry_point), Some(c.program)),
            None => (None, None, None),
        };
        TranspileResult {
            session_id: self.id,
            status: if failure.is_none() {
                Status::Success
            } else {
                Status::Failure
            },
            failure,
            modules,
            entry_point,
            program,
            dsl: self.draft,
            defects,
            attempts_used: self.attempt,
            attempt_log: self.log,
        }
    }
}

/// Run one transpile session to completion.
pub async fn transpile(
    request: &TranspileRequest,
    service: &dyn GenerationService,
    config: &CorrectionConfig,
    cancel: &CancelFlag,
) -> TranspileResult {
    let mut session = Session {
        id: Uuid::new_v4(),
        request,
        config,
        prompt: crate::prompt::requirement_prompt(&request.requirement, &request.variables),
        attempt: 0,
        repair_rounds: 0,
        draft: String::new(),
        report: None,
        log: Vec::new(),
    };
    let mut state = match &request.draft {
        Some(draft) => {
            session.attempt = 1;
            session.draft.clone_from(draft);
            State::Parsing
        }
        None => State::Regenerating,
    };
    tracing::info!(session = %session.id, max_attempts = config.max_attempts, "transpile session started");

    loop {
        if cancel.is_cancelled() {
            let before = session.error_count();
            session.record(before, Action::Cancelled);
            tracing::warn!(session = %session.id, "transpile session cancelled");
            return session.finish(Some(FailureReason::Cancelled), None);
        }

        let next = match state {
            State::Parsing => {
                let report = check_source(&session.draft, &request.variables, &config.validate);
                tracing::debug!(
                    session = %session.id,
                    statements = report.statements.len(),
                    defects = report.defects.len(),
                    "draft parsed"
                );
                session.report = Some(report);
                State::Validating
            }
            State::Validating => validate_step(&mut session),
            State::Repairing => repair_step(&mut session),
            State::Regenerating => regenerate_step(&mut session, service).await,
            State::Done => State::Done,
        };

        if next == State::Done {
            return conclude(session);
        }
        if next != state {
            tracing::debug!(session = %session.id, from = ?state, to = ?next, "transition");
        }
        state = next;
    }
}

fn validate_step(session: &mut Session<'_>) -> State {
    let Some(report) = &session.report else {
        return State::Regenerating;
    };
    if report.is_clean() {
        return State::Done;
    }
    let repairable = report.errors().any(Defect::is_repairable);
    if repairable && session.repair_rounds < session.config.max_repair_rounds {
        State::Repairing
    } else if session.has_attempts_left() {
        State::Regenerating
    } else {
        State::Done
    }
}

fn repair_step(session: &mut Session<'_>) -> State {
    let Some(report) = session.report.take() else {
        return State::Regenerating;
    };
    let before = report.errors().count();
    session.repair_rounds += 1;

    let round = repair_report(&report, &session.request.variables, &session.config.validate);
    if !round.made_progress() {
        session.report = Some(report);
        session.record(before, Action::RepairStalled);
        return if session.has_attempts_left() {
            State::Regenerating
        } else {
            State::Done
        };
    }

    let fixed = round.fixed_kinds();
    if round.report.parse_defects.is_empty() {
        // Re-check the rendered text so spans point into the new draft.
        session.draft = render_program(&round.report.statements);
        session.report = Some(check_source(
            &session.draft,
            &session.request.variables,
            &session.config.validate,
        ));
    } else {
        // Lines the parser rejected are not in the tree, so rendering would
        // drop them. Keep the text the remaining spans refer to.
        session.report = Some(round.report);
    }
    tracing::info!(session = %session.id, fixed = ?fixed, renames = round.renames.len(), "draft repaired");
    session.record(before, Action::Repaired { fixed });
    State::Validating
}

async fn regenerate_step(session: &mut Session<'_>, service: &dyn GenerationService) -> State {
    let before = session.error_count();
    session.attempt += 1;
    session.repair_rounds = 0;

    let diagnostics = session.report.as_ref().map(|report| Diagnostics {
        defects: report.defects.clone(),
        previous_draft: session.draft.clone(),
        attempt: session.attempt,
    });
    tracing::info!(session = %session.id, attempt = session.attempt, "requesting new draft");

    let call = tokio::time::timeout(
        session.config.generation_timeout,
        service.generate(&session.prompt, diagnostics.as_ref()),
    )
    .await;
    let outcome = call.unwrap_or(Err(ServiceError::Timeout));

    match outcome {
        Ok(draft) => {
            session.draft = draft;
            session.report = None;
            session.record(before, Action::Regenerated);
            State::Parsing
        }
        Err(error) => {
            tracing::warn!(session = %session.id, attempt = session.attempt, %error, "generation failed");
            let retryable = error.is_retryable();
            session.record(before, Action::GenerationFailed { error });
            if retryable && session.has_attempts_left() {
                State::Regenerating
            } else {
                State::Done
            }
        }
    }
}

/// Turn the final state of a session into its result.
fn conclude(mut session: Session<'_>) -> TranspileResult {
    let hard_error = match session.log.last().map(|r| &r.action_taken) {
        Some(Action::GenerationFailed { error }) if !error.is_retryable() => Some(error.clone()),
        _ => None,
    };
    if let Some(error) = hard_error {
        tracing::warn!(session = %session.id, %error, "transpile session failed");
        return session.finish(Some(FailureReason::ServiceFailed { error }), None);
    }

    let clean = session.report.as_ref().is_some_and(CheckReport::is_clean);
    if !clean {
        let before = session.error_count();
        session.record(before, Action::GaveUp);
        tracing::warn!(
            session = %session.id,
            attempts = session.attempt,
            errors = before,
            "attempt budget exhausted"
        );
        return session.finish(Some(FailureReason::BudgetExhausted), None);
    }

    let Some(report) = session.report.as_ref() else {
        return session.finish(Some(FailureReason::BudgetExhausted), None);
    };
    match compile(report, &session.request.variables, session.config.strategy) {
        Ok(compiled) => {
            session.record(0, Action::Accepted);
            tracing::info!(
                session = %session.id,
                attempts = session.attempt,
                modules = compiled.modules.len(),
                "transpile session succeeded"
            );
            session.finish(None, Some(compiled))
        }
        Err(defect) => {
            session.record(0, Action::OrderingFailed);
            tracing::warn!(session = %session.id, %defect, "modules could not be ordered");
            let mut result = session.finish(Some(FailureReason::Unorderable), None);
            result.defects = vec![defect];
            result
        }
    }
}
