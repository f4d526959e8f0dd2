#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod ast;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod error;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod lexer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod parser;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod names;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod analyzer;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod validator;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod repair;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod render;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod synth;
#[allow(
    clippy::indexing_slicing,
    clippy::wildcard_imports,
    clippy::cast_possible_truncation,
    clippy::single_match_else,
    clippy::needless_pass_by_value,
    clippy::module_name_repetitions,
)]
pub mod cluster;

use analyzer::Analysis;
use ast::{Stmt, Variable};
use cluster::{Module, Strategy};
use error::{Defect, DefectKind};
use names::NameResolutionContext;
use repair::Rename;
use validator::ValidateOptions;

/// Everything known about one draft after parsing, analysis and validation.
#[derive(Debug, Clone)]
pub struct CheckReport {
    pub statements: Vec<Stmt>,
    /// Parser defects, kept so structural ones survive in-memory repair.
    pub parse_defects: Vec<Defect>,
    pub analysis: Analysis,
    /// Full validator output, errors and warnings, sorted by position.
    pub defects: Vec<Defect>,
}

impl CheckReport {
    pub fn errors(&self) -> impl Iterator<Item = &Defect> {
        self.defects.iter().filter(|d| d.is_error())
    }

    pub fn is_clean(&self) -> bool {
        self.errors().next().is_none()
    }
}

/// Parse, analyze and validate a DSL draft.
///
/// source → parse → analyze → validate
pub fn check_source(source: &str, upstream: &[Variable], options: &ValidateOptions) -> CheckReport {
    let (statements, parse_defects) = parser::parse(source);
    check_statements(statements, parse_defects, upstream, options)
}

/// Re-check an in-memory tree, e.g. after repair. `parse_defects` are the
/// defects of the text the tree came from.
pub fn check_statements(
    statements: Vec<Stmt>,
    parse_defects: Vec<Defect>,
    upstream: &[Variable],
    options: &ValidateOptions,
) -> CheckReport {
    let analysis = analyzer::analyze(&statements, upstream);
    let defects = validator::validate(&statements, &analysis, &parse_defects, options);
    CheckReport {
        statements,
        parse_defects,
        analysis,
        defects,
    }
}

/// One repair round applied to a checked draft.
#[derive(Debug, Clone)]
pub struct RepairRound {
    /// The repaired tree, re-checked.
    pub report: CheckReport,
    pub fixed: Vec<Defect>,
    pub renames: Vec<Rename>,
}

impl RepairRound {
    pub fn made_progress(&self) -> bool {
        !self.fixed.is_empty()
    }

    pub fn fixed_kinds(&self) -> Vec<DefectKind> {
        repair::distinct_kinds(&self.fixed)
    }
}

/// Repair `report` and re-check the result. Upstream names are never
/// handed out as fresh names; structural parse defects carry over.
pub fn repair_report(report: &CheckReport, upstream: &[Variable], options: &ValidateOptions) -> RepairRound {
    let names = NameResolutionContext::with_taken(upstream.iter().map(|v| v.name.clone()));
    let outcome = repair::repair_with_context(report.statements.clone(), &report.defects, names);
    let structural: Vec<Defect> = report
        .parse_defects
        .iter()
        .filter(|d| d.kind.is_structural())
        .cloned()
        .collect();
    RepairRound {
        report: check_statements(outcome.statements, structural, upstream, options),
        fixed: outcome.fixed,
        renames: outcome.renames,
    }
}

/// Generated code for a clean program.
#[derive(Debug, Clone)]
pub struct Compiled {
    pub modules: Vec<Module>,
    pub entry_point: String,
    /// The complete Python file.
    pub program: String,
}

/// Cluster, orchestrate and export a validated program.
pub fn compile(report: &CheckReport, upstream: &[Variable], strategy: Strategy) -> Result<Compiled, Defect> {
    let modules = cluster::cluster(&report.statements, &report.analysis.call_graph, strategy);
    let defaults = cluster::defaults(&report.statements, upstream);
    let entry_point = cluster::orchestrate(&modules, &defaults)?;
    let program = cluster::export_program(&modules, &entry_point);
    Ok(Compiled {
        modules,
        entry_point,
        program,
    })
}
