//! Semantic checks over a parsed statement tree.
//!
//! `validate` is pure and exhaustive: it returns every defect it can find in
//! one pass, sorted by position, so repair can batch its fixes.

use std::collections::HashSet;

use super::analyzer::Analysis;
use super::ast::*;
use super::error::{normalize, Defect, DefectKind};
use super::names;

/// Tunable limits for the warning-level checks.
#[derive(Debug, Clone, Copy)]
pub struct ValidateOptions {
    pub max_nesting_depth: usize,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            max_nesting_depth: 5,
        }
    }
}

/// Run every check. `parse_defects` are the parser's defects; those that can
/// be recomputed from the tree (unclosed blocks, unparsable expressions) are
/// recomputed so that a repaired tree is judged on its own.
pub fn validate(
    statements: &[Stmt],
    analysis: &Analysis,
    parse_defects: &[Defect],
    options: &ValidateOptions,
) -> Vec<Defect> {
    let mut defects: Vec<Defect> = parse_defects
        .iter()
        .filter(|d| d.kind.is_structural())
        .cloned()
        .collect();
    defects.extend(analysis.defects.iter().cloned());

    let mut checker = Checker {
        analysis,
        options,
        defects: Vec::new(),
        checked_names: HashSet::new(),
    };
    checker.block(statements, 0);
    checker.isolated_calls();
    defects.extend(checker.defects);

    // Unparsed expressions are reported both by the parser and by the tree
    // walk; both use `Defect::unparsable`, so they collapse here.
    normalize(&mut defects);
    defects
}

/// Defects that block success (warnings excluded).
pub fn errors(defects: &[Defect]) -> Vec<Defect> {
    defects.iter().filter(|d| d.is_error()).cloned().collect()
}

struct Checker<'a> {
    analysis: &'a Analysis,
    options: &'a ValidateOptions,
    defects: Vec<Defect>,
    checked_names: HashSet<String>,
}

impl Checker<'_> {
    fn block(&mut self, stmts: &[Stmt], depth: usize) {
        for stmt in stmts {
            self.stmt(stmt, depth);
        }
    }

    fn stmt(&mut self, stmt: &Stmt, depth: usize) {
        let span = stmt.span;
        for (expr_span, expr) in stmt.own_exprs() {
            self.expr(expr, expr_span);
        }
        if let StmtKind::Call { call, .. } = &stmt.kind {
            for arg in &call.arguments {
                self.expr(&arg.value, span);
            }
        }
        if let Some(name) = stmt.own_write() {
            self.identifier(name, span);
        }

        match &stmt.kind {
            StmtKind::Define {
                name,
                ty,
                initial_value: Some(value),
            } => self.define_type(name, *ty, value, span),
            StmtKind::If {
                condition,
                elif_branches,
                closed,
                ..
            } => {
                self.constant_condition("IF", condition, span);
                for branch in elif_branches {
                    self.constant_condition("ELIF", &branch.condition, branch.span);
                }
                self.unclosed(stmt, *closed);
            }
            StmtKind::For {
                loop_var,
                iterable,
                closed,
                ..
            } => {
                self.identifier(loop_var, span);
                if let Some(ty) = self.static_type(iterable) {
                    if !ty.is_iterable() {
                        self.defects.push(Defect::error(
                            DefectKind::TypeMismatch,
                            span,
                            format!("FOR cannot iterate over a value of type {}", ty.name()),
                        ));
                    }
                }
                self.unclosed(stmt, *closed);
            }
            StmtKind::While {
                condition, closed, ..
            } => {
                self.constant_condition("WHILE", condition, span);
                self.unclosed(stmt, *closed);
            }
            StmtKind::Define { .. }
            | StmtKind::Assign { .. }
            | StmtKind::Call { .. }
            | StmtKind::Return { .. } => {}
        }

        let level = depth + 1;
        if stmt.is_block() && level > self.options.max_nesting_depth {
            self.defects.push(Defect::warning(
                DefectKind::ExcessiveNesting,
                span,
                format!(
                    "block nested {level} levels deep (limit {})",
                    self.options.max_nesting_depth
                ),
            ));
        }
        for block in stmt.blocks() {
            self.block(block, depth + 1);
        }
    }

    fn isolated_calls(&mut self) {
        let graph = &self.analysis.call_graph;
        for id in graph.isolated_sites() {
            if let Some(site) = graph.site(id) {
                self.defects.push(Defect::warning(
                    DefectKind::IsolatedCall,
                    site.span,
                    format!(
                        "`{}` neither uses nor feeds the result of another call",
                        site.function
                    ),
                ));
            }
        }
    }

    fn unclosed(&mut self, stmt: &Stmt, closed: bool) {
        if !closed {
            if let Some(keyword) = stmt.block_keyword() {
                self.defects.push(Defect::unclosed(stmt.span, keyword));
            }
        }
    }

    /// Report each illegal name once, at its first occurrence.
    fn identifier(&mut self, name: &str, span: SourceSpan) {
        if !self.checked_names.insert(name.to_string()) {
            return;
        }
        if let Some(reason) = names::check(name) {
            self.defects.push(
                Defect::error(
                    DefectKind::InvalidIdentifier,
                    span,
                    format!(
                        "`{name}` {reason}; it would be emitted as `{}`",
                        names::sanitize(name)
                    ),
                )
                .with_subject(name),
            );
        }
    }

    fn expr(&mut self, expr: &Expr, span: SourceSpan) {
        expr.visit(&mut |e| match e {
            Expr::Var(name) => self.identifier(name, span),
            Expr::Unparsed { raw, reason } => {
                self.defects.push(Defect::unparsable(span, raw, reason));
            }
            Expr::Binary { op, left, right } => self.operands(*op, left, right, span),
            _ => {}
        });
    }

    fn operands(&mut self, op: BinOp, left: &Expr, right: &Expr, span: SourceSpan) {
        if op.is_ordering() {
            for side in [left, right] {
                if let Some(ty) = self.static_type(side) {
                    if !ty.is_numeric() && ty != VarType::Any {
                        self.defects.push(Defect::error(
                            DefectKind::TypeMismatch,
                            span,
                            format!("ordering comparison on a {} operand", ty.name()),
                        ));
                    }
                }
            }
        } else if matches!(op, BinOp::In | BinOp::NotIn) {
            if let Some(ty) = self.static_type(right) {
                if !ty.is_iterable() {
                    self.defects.push(Defect::error(
                        DefectKind::TypeMismatch,
                        span,
                        format!("IN needs a List, Dict or String, found {}", ty.name()),
                    ));
                }
            }
        }
    }

    fn static_type(&self, expr: &Expr) -> Option<VarType> {
        match expr {
            Expr::Var(name) => self.analysis.type_of(name),
            Expr::Binary { op, .. } if op.is_comparison() => Some(VarType::Boolean),
            Expr::Binary {
                op: BinOp::And | BinOp::Or,
                ..
            } => None,
            other => other.literal_type(),
        }
    }

    fn define_type(&mut self, name: &str, ty: VarType, value: &Expr, span: SourceSpan) {
        if let Some(found) = value.literal_type() {
            if !type_accepts(ty, found) {
                self.defects.push(
                    Defect::error(
                        DefectKind::TypeMismatch,
                        span,
                        format!(
                            "`{name}` is declared {} but initialised with a {} value",
                            ty.name(),
                            found.name()
                        ),
                    )
                    .with_subject(name),
                );
            }
        }
    }

    fn constant_condition(&mut self, keyword: &str, condition: &Expr, span: SourceSpan) {
        if let Some(value) = constant_truth(condition) {
            self.defects.push(Defect::warning(
                DefectKind::DeadBranch,
                span,
                format!("{keyword} condition is always {}", if value { "true" } else { "false" }),
            ));
        }
    }
}

/// Whether a declared type accepts a literal of type `found`.
pub fn type_accepts(declared: VarType, found: VarType) -> bool {
    match declared {
        VarType::Any => true,
        VarType::Float => found.is_numeric(),
        other => other == found,
    }
}

/// Truth value of a condition that does not depend on any input.
fn constant_truth(condition: &Expr) -> Option<bool> {
    match condition {
        Expr::Literal(Literal::Bool(b)) => Some(*b),
        Expr::Literal(Literal::Int(n)) => Some(*n != 0),
        Expr::Literal(Literal::None) => Some(false),
        Expr::Unary {
            op: UnaryOp::Not,
            operand,
        } => constant_truth(operand).map(|b| !b),
        Expr::Binary {
            op: op @ (BinOp::Eq | BinOp::Ne),
            left,
            right,
        } => match (left.as_ref(), right.as_ref()) {
            (Expr::Literal(a), Expr::Literal(b)) => {
                let equal = a == b;
                Some(if *op == BinOp::Eq { equal } else { !equal })
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::analyzer::analyze;
    use crate::dsl::parser::parse;

    fn check(src: &str) -> Vec<Defect> {
        let (stmts, parse_defects) = parse(src);
        let analysis = analyze(&stmts, &[]);
        validate(&stmts, &analysis, &parse_defects, &ValidateOptions::default())
    }

    fn kinds(src: &str) -> Vec<DefectKind> {
        check(src).into_iter().map(|d| d.kind).collect()
    }

    #[test]
    fn clean_program_has_no_defects() {
        let src = "DEFINE {{score}}: Float = 0.5\nDEFINE {{tags}}: List = [\"a\"]\nIF {{score}} > 0.3 AND \"a\" IN {{tags}}\n  {{score}} = CALL boost({{score}})\nENDIF\nRETURN {{score}}";
        assert!(check(src).is_empty(), "{:?}", check(src));
    }

    #[test]
    fn leading_digit_identifier() {
        let defects = check("DEFINE {{95th_percentile}}: Float = 1.5\nRETURN {{95th_percentile}}");
        assert_eq!(defects.len(), 1);
        assert_eq!(defects[0].kind, DefectKind::InvalidIdentifier);
        assert_eq!(defects[0].subject.as_deref(), Some("95th_percentile"));
        assert!(defects[0].message.contains("`_95th_percentile`"));
    }

    #[test]
    fn reserved_word_identifier() {
        assert_eq!(
            kinds("DEFINE {{class}}: String = \"x\""),
            vec![DefectKind::InvalidIdentifier]
        );
    }

    #[test]
    fn define_literal_type_mismatch() {
        let defects = check("DEFINE {{n}}: Integer = 3.5\nDEFINE {{s}}: String = 4\nDEFINE {{f}}: Float = 4");
        let subjects: Vec<_> = defects.iter().filter_map(|d| d.subject.as_deref()).collect();
        assert_eq!(subjects, vec!["n", "s"]);
        assert!(defects.iter().all(|d| d.kind == DefectKind::TypeMismatch));
    }

    #[test]
    fn integral_float_still_mismatches_integer() {
        assert_eq!(
            kinds("DEFINE {{n}}: Integer = 3.0"),
            vec![DefectKind::TypeMismatch]
        );
    }

    #[test]
    fn comparison_and_membership_types() {
        let src = "DEFINE {{name}}: String = \"a\"\nDEFINE {{n}}: Integer = 1\nIF {{name}} > 3\nENDIF\nIF 1 IN {{n}}\nENDIF\nFOR {{c}} IN {{n}}\nENDFOR";
        let defects = check(src);
        let lines: Vec<_> = defects.iter().map(|d| (d.kind, d.span.line)).collect();
        assert_eq!(
            lines,
            vec![
                (DefectKind::TypeMismatch, 3),
                (DefectKind::TypeMismatch, 5),
                (DefectKind::TypeMismatch, 7),
            ]
        );
    }

    #[test]
    fn dead_branches_are_warnings() {
        let defects = check("IF False\n  CALL f()\nELIF 1 == 1\n  CALL g()\nENDIF");
        assert_eq!(defects.len(), 2);
        assert!(defects.iter().all(|d| d.kind == DefectKind::DeadBranch && !d.is_error()));
        assert!(errors(&defects).is_empty());
    }

    #[test]
    fn unclosed_blocks_come_from_the_tree() {
        let defects = check("FOR {{i}} IN [1]\n  IF {{i}} > 0\n    CALL f()");
        let lines: Vec<_> = defects.iter().map(|d| (d.kind, d.span.line)).collect();
        assert_eq!(
            lines,
            vec![(DefectKind::UnclosedBlock, 1), (DefectKind::UnclosedBlock, 2)]
        );
    }

    #[test]
    fn structural_and_expression_defects_are_kept_once() {
        let defects = check("ENDFOR\n{{x}} = ??\nbogus line");
        let got: Vec<_> = defects.iter().map(|d| d.kind).collect();
        assert_eq!(
            got,
            vec![
                DefectKind::UnexpectedClose,
                DefectKind::UndefinedVariable,
                DefectKind::UnparsableCallExpression,
                DefectKind::MalformedStatement,
            ]
        );
    }

    #[test]
    fn disconnected_call_is_a_warning() {
        let defects = check(
            "DEFINE {{rows}}: List\nDEFINE {{n}}: Integer\n{{rows}} = CALL fetch()\n{{n}} = CALL count({{rows}})\nCALL log(\"done\")\nRETURN {{n}}",
        );
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].kind, DefectKind::IsolatedCall);
        assert_eq!(defects[0].span.line, 5);
        assert!(!defects[0].is_error());
        assert!(defects[0].message.contains("`log`"));
    }

    #[test]
    fn nesting_limit() {
        let src = "IF True\n IF True\n  IF True\n   IF True\n    IF True\n     IF True\n     ENDIF\n    ENDIF\n   ENDIF\n  ENDIF\n ENDIF\nENDIF";
        let nesting: Vec<_> = check(src)
            .into_iter()
            .filter(|d| d.kind == DefectKind::ExcessiveNesting)
            .collect();
        assert_eq!(nesting.len(), 1);
        assert_eq!(nesting[0].span.line, 6);
    }

    #[test]
    fn every_block_past_the_limit_warns_once() {
        let nesting_lines = |src: &str, limit: usize| -> Vec<usize> {
            let (stmts, parse_defects) = parse(src);
            let analysis = analyze(&stmts, &[]);
            let options = ValidateOptions {
                max_nesting_depth: limit,
            };
            validate(&stmts, &analysis, &parse_defects, &options)
                .into_iter()
                .filter(|d| d.kind == DefectKind::ExcessiveNesting)
                .map(|d| d.span.line)
                .collect()
        };
        let chain = "IF True\n IF True\n  WHILE True\n  ENDWHILE\n  FOR {{i}} IN [1]\n  ENDFOR\n ENDIF\nENDIF";
        assert_eq!(nesting_lines(chain, 3), Vec::<usize>::new());
        assert_eq!(nesting_lines(chain, 2), vec![3, 5]);
        assert_eq!(nesting_lines(chain, 1), vec![2, 3, 5]);
    }

    #[test]
    fn all_defects_reported_in_one_pass() {
        let src = "DEFINE {{d}}: Integer = 1\nDEFINE {{d}}: Integer = 2\nDEFINE {{1x}}: Integer = \"no\"\nIF {{missing}} > 1\n  CALL f()";
        let got = kinds(src);
        for kind in [
            DefectKind::DuplicateDefinition,
            DefectKind::InvalidIdentifier,
            DefectKind::TypeMismatch,
            DefectKind::UndefinedVariable,
            DefectKind::UnclosedBlock,
        ] {
            assert!(got.contains(&kind), "missing {kind:?} in {got:?}");
        }
    }
}
