//! Deterministic, local fixes for the repairable defect kinds.
//!
//! Fix groups run in a fixed order: duplicate definitions, undefined
//! variables, unclosed blocks, invalid identifiers, then literal type
//! mismatches. A defect is reported as fixed only when its fix actually
//! changed the tree; everything else comes back in `remaining`.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use super::ast::*;
use super::error::{Defect, DefectKind};
use super::names::{self, NameResolutionContext};

/// One identifier rewrite, kept so diagnostics can map emitted names back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rename {
    pub original: String,
    pub replacement: String,
    pub span: SourceSpan,
    pub reason: DefectKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RepairOutcome {
    pub statements: Vec<Stmt>,
    pub fixed: Vec<Defect>,
    pub remaining: Vec<Defect>,
    pub renames: Vec<Rename>,
}

impl RepairOutcome {
    /// Distinct kinds fixed, in fix order.
    pub fn fixed_kinds(&self) -> Vec<DefectKind> {
        distinct_kinds(&self.fixed)
    }

    pub fn made_progress(&self) -> bool {
        !self.fixed.is_empty()
    }
}

/// Distinct kinds of `defects`, in order of first appearance.
pub fn distinct_kinds(defects: &[Defect]) -> Vec<DefectKind> {
    let mut kinds: Vec<DefectKind> = Vec::new();
    for defect in defects {
        if !kinds.contains(&defect.kind) {
            kinds.push(defect.kind);
        }
    }
    kinds
}

/// Repair with a fresh name context seeded only from the tree itself.
pub fn repair(statements: Vec<Stmt>, defects: &[Defect]) -> RepairOutcome {
    repair_with_context(statements, defects, NameResolutionContext::new())
}

/// Repair using `names` as the set of identifiers already taken outside
/// the tree (upstream variables, for instance).
pub fn repair_with_context(
    mut statements: Vec<Stmt>,
    defects: &[Defect],
    mut names: NameResolutionContext,
) -> RepairOutcome {
    for name in all_names(&statements) {
        names.reserve(&name);
    }

    let mut fixed_ids: HashSet<usize> = HashSet::new();
    let mut renames = Vec::new();
    let of_kind = |kind: DefectKind| -> Vec<(usize, &Defect)> {
        defects
            .iter()
            .enumerate()
            .filter(|(_, d)| d.kind == kind)
            .collect()
    };

    let duplicates = of_kind(DefectKind::DuplicateDefinition);
    if !duplicates.is_empty() {
        // Upstream duplicates have no definition in the tree; inserted
        // definitions share their synthetic span.
        let targets: HashSet<(SourceSpan, String)> = duplicates
            .iter()
            .filter(|(_, d)| !d.span.is_synthetic())
            .filter_map(|(_, d)| Some((d.span, d.subject.clone()?)))
            .collect();
        let mut pass = DuplicatePass {
            targets: &targets,
            names: &mut names,
            alias: HashMap::new(),
            renamed: HashSet::new(),
            renames: &mut renames,
        };
        pass.block(&mut statements);
        let renamed = pass.renamed;
        fixed_ids.extend(
            duplicates
                .iter()
                .filter(|(_, d)| !d.span.is_synthetic() && renamed.contains(&d.span))
                .map(|(i, _)| *i),
        );
    }

    let undefined = of_kind(DefectKind::UndefinedVariable);
    let mut inserted = 0;
    let mut seen = HashSet::new();
    for (i, defect) in undefined {
        let Some(name) = defect.subject.as_deref() else {
            continue;
        };
        if seen.insert(name.to_string()) {
            let ty = infer_type(&statements, name);
            debug!(name, ty = ty.name(), "inserting missing definition");
            statements.insert(
                inserted,
                Stmt::new(
                    StmtKind::Define {
                        name: name.to_string(),
                        ty,
                        initial_value: Some(ty.default_value()),
                    },
                    SourceSpan::synthetic(),
                ),
            );
            inserted += 1;
        }
        fixed_ids.insert(i);
    }

    let unclosed = of_kind(DefectKind::UnclosedBlock);
    if !unclosed.is_empty() {
        let targets: HashSet<SourceSpan> = unclosed.iter().map(|(_, d)| d.span).collect();
        let mut closed = HashSet::new();
        close_blocks(&mut statements, &targets, &mut closed);
        fixed_ids.extend(
            unclosed
                .iter()
                .filter(|(_, d)| closed.contains(&d.span))
                .map(|(i, _)| *i),
        );
    }

    let invalid = of_kind(DefectKind::InvalidIdentifier);
    if !invalid.is_empty() {
        let mut mapping: IndexMap<String, String> = IndexMap::new();
        for (_, defect) in &invalid {
            let Some(original) = defect.subject.as_deref() else {
                continue;
            };
            if mapping.contains_key(original) || names::is_valid(original) {
                continue;
            }
            let replacement = names.fresh(&names::sanitize(original));
            renames.push(Rename {
                original: original.to_string(),
                replacement: replacement.clone(),
                span: defect.span,
                reason: DefectKind::InvalidIdentifier,
            });
            mapping.insert(original.to_string(), replacement);
        }
        for stmt in &mut statements {
            stmt.map_names(&mut |name| {
                if let Some(new) = mapping.get(name.as_str()) {
                    new.clone_into(name);
                }
            });
        }
        fixed_ids.extend(
            invalid
                .iter()
                .filter(|(_, d)| d.subject.as_ref().is_some_and(|s| mapping.contains_key(s)))
                .map(|(i, _)| *i),
        );
    }

    for (i, defect) in of_kind(DefectKind::TypeMismatch) {
        if defect.subject.is_some() && coerce_definition(&mut statements, defect.span) {
            fixed_ids.insert(i);
        }
    }

    let (fixed, remaining): (Vec<_>, Vec<_>) = defects
        .iter()
        .enumerate()
        .partition(|(i, _)| fixed_ids.contains(i));
    RepairOutcome {
        statements,
        fixed: fixed.into_iter().map(|(_, d)| d.clone()).collect(),
        remaining: remaining.into_iter().map(|(_, d)| d.clone()).collect(),
        renames,
    }
}

/// Every variable name in the tree, first-seen order.
pub fn all_names(statements: &[Stmt]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    walk(statements, 0, &mut |stmt, _| {
        let mut names = stmt.own_reads();
        names.extend(stmt.own_write());
        if let StmtKind::For { loop_var, .. } = &stmt.kind {
            names.push(loop_var);
        }
        for name in names {
            if seen.insert(name.to_string()) {
                out.push(name.to_string());
            }
        }
    });
    out
}

// ── Duplicate definitions ──────────────────────────────────────────

struct DuplicatePass<'a> {
    targets: &'a HashSet<(SourceSpan, String)>,
    names: &'a mut NameResolutionContext,
    /// Original name to the name of its most recent definition.
    alias: HashMap<String, String>,
    renamed: HashSet<SourceSpan>,
    renames: &'a mut Vec<Rename>,
}

impl DuplicatePass<'_> {
    fn block(&mut self, stmts: &mut [Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &mut Stmt) {
        let original = match &stmt.kind {
            StmtKind::Define { name, .. } => Some(name.clone()),
            _ => None,
        };
        let alias = &self.alias;
        stmt.map_own_names(&mut |name| {
            if let Some(current) = alias.get(name.as_str()) {
                current.clone_into(name);
            }
        });

        if let (Some(original), StmtKind::Define { name, .. }) = (original, &mut stmt.kind) {
            let target = (stmt.span, original.clone());
            if self.targets.contains(&target) && !self.renamed.contains(&stmt.span) {
                let fresh = self.names.fresh(&original);
                self.renames.push(Rename {
                    original: original.clone(),
                    replacement: fresh.clone(),
                    span: stmt.span,
                    reason: DefectKind::DuplicateDefinition,
                });
                fresh.clone_into(name);
                self.alias.insert(original, fresh);
                self.renamed.insert(stmt.span);
            } else {
                // The surviving definition; later references use its name.
                original.clone_into(name);
                self.alias.remove(&original);
            }
        }

        for block in stmt.blocks_mut() {
            self.block(block);
        }
    }
}

// ── Missing definitions ────────────────────────────────────────────

/// Best type guess for `name` from its first informative use.
pub fn infer_type(statements: &[Stmt], name: &str) -> VarType {
    let mut found = None;
    walk(statements, 0, &mut |stmt, _| {
        if found.is_some() {
            return;
        }
        found = infer_from_stmt(stmt, name);
    });
    found.unwrap_or(VarType::Any)
}

fn infer_from_stmt(stmt: &Stmt, name: &str) -> Option<VarType> {
    let is_var = |e: &Expr| matches!(e, Expr::Var(n) if n == name);
    match &stmt.kind {
        StmtKind::For { iterable, .. } if is_var(iterable) => return Some(VarType::List),
        StmtKind::If { condition, .. } | StmtKind::While { condition, .. } if is_var(condition) => {
            return Some(VarType::Boolean)
        }
        StmtKind::Assign { target, expression } if target == name => {
            if let Some(ty) = expression.literal_type() {
                return Some(ty);
            }
        }
        StmtKind::Call {
            result_binding: Some(binding),
            ..
        } if binding == name => return Some(VarType::Any),
        _ => {}
    }

    let mut exprs: Vec<&Expr> = stmt.own_exprs().into_iter().map(|(_, e)| e).collect();
    if let StmtKind::Call { call, .. } = &stmt.kind {
        exprs.extend(call.arguments.iter().map(|a| &a.value));
    }
    let mut found = None;
    for expr in exprs {
        expr.visit(&mut |e| {
            if found.is_some() {
                return;
            }
            if let Expr::Binary { op, left, right } = e {
                found = infer_from_operands(*op, left, right, name);
            }
        });
        if found.is_some() {
            break;
        }
    }
    found
}

fn infer_from_operands(op: BinOp, left: &Expr, right: &Expr, name: &str) -> Option<VarType> {
    let is_var = |e: &Expr| matches!(e, Expr::Var(n) if n == name);
    let other = if is_var(left) {
        right
    } else if is_var(right) {
        left
    } else {
        return None;
    };
    if matches!(op, BinOp::In | BinOp::NotIn) {
        return is_var(right).then_some(VarType::List);
    }
    let other_ty = other.literal_type();
    if op.is_ordering() {
        return Some(if other_ty == Some(VarType::Float) {
            VarType::Float
        } else {
            VarType::Integer
        });
    }
    if matches!(op, BinOp::Eq | BinOp::Ne) {
        return other_ty;
    }
    if op.is_arithmetic() {
        return other_ty.filter(|t| t.is_numeric());
    }
    None
}

// ── Unclosed blocks ────────────────────────────────────────────────

/// Close every targeted block, innermost first. Body statements indented no
/// deeper than the block's own line are moved out to follow the block.
fn close_blocks(
    stmts: &mut Vec<Stmt>,
    targets: &HashSet<SourceSpan>,
    closed: &mut HashSet<SourceSpan>,
) {
    let mut i = 0;
    while i < stmts.len() {
        let Some(stmt) = stmts.get_mut(i) else {
            break;
        };
        for block in stmt.blocks_mut() {
            close_blocks(block, targets, closed);
        }
        let mut spill = Vec::new();
        if targets.contains(&stmt.span) && close_one(stmt, &mut spill) {
            closed.insert(stmt.span);
        }
        let moved = spill.len();
        for (offset, moved_stmt) in spill.into_iter().enumerate() {
            stmts.insert(i + 1 + offset, moved_stmt);
        }
        i += 1 + moved;
    }
}

fn close_one(stmt: &mut Stmt, spill: &mut Vec<Stmt>) -> bool {
    let column = stmt.span.column;
    let (last, flag) = match &mut stmt.kind {
        StmtKind::If {
            then_branch,
            elif_branches,
            else_branch,
            closed,
            ..
        } => {
            let last = match (else_branch.as_mut(), elif_branches.last_mut()) {
                (Some(body), _) => body,
                (None, Some(branch)) => &mut branch.body,
                (None, None) => then_branch,
            };
            (last, closed)
        }
        StmtKind::For { body, closed, .. } | StmtKind::While { body, closed, .. } => (body, closed),
        _ => return false,
    };
    if *flag {
        return false;
    }
    if let Some(cut) = last
        .iter()
        .position(|s| !s.span.is_synthetic() && s.span.column <= column)
    {
        spill.extend(last.split_off(cut));
    }
    *flag = true;
    true
}

// ── Literal type coercion ──────────────────────────────────────────

fn coerce_definition(stmts: &mut [Stmt], span: SourceSpan) -> bool {
    for stmt in stmts {
        if stmt.span == span {
            if let StmtKind::Define {
                ty,
                initial_value: Some(value),
                ..
            } = &mut stmt.kind
            {
                if let Some(coerced) = coerce(value, *ty) {
                    *value = coerced;
                    return true;
                }
                return false;
            }
        }
        for block in stmt.blocks_mut() {
            if coerce_definition(block, span) {
                return true;
            }
        }
    }
    false
}

/// Convert a literal to `ty` when there is exactly one sensible reading.
pub fn coerce(value: &Expr, ty: VarType) -> Option<Expr> {
    if let Expr::Unary {
        op: UnaryOp::Neg,
        operand,
    } = value
    {
        return match coerce(operand, ty)? {
            Expr::Literal(Literal::Int(n)) => Some(Expr::Literal(Literal::Int(-n))),
            Expr::Literal(Literal::Float(x)) => Some(Expr::Literal(Literal::Float(-x))),
            Expr::Literal(Literal::Str(s)) => Some(Expr::Literal(Literal::Str(format!("-{s}")))),
            _ => None,
        };
    }
    let Expr::Literal(lit) = value else {
        return None;
    };
    let out = match (ty, lit) {
        #[allow(clippy::cast_possible_truncation)]
        (VarType::Integer, Literal::Float(x)) if x.fract() == 0.0 && x.abs() < 9.0e15 => {
            Literal::Int(*x as i64)
        }
        (VarType::Integer, Literal::Str(s)) => Literal::Int(s.trim().parse().ok()?),
        #[allow(clippy::cast_precision_loss)]
        (VarType::Float, Literal::Int(n)) => Literal::Float(*n as f64),
        (VarType::Float, Literal::Str(s)) => {
            Literal::Float(s.trim().parse::<f64>().ok().filter(|x| x.is_finite())?)
        }
        (VarType::Boolean, Literal::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Literal::Bool(true),
            "false" => Literal::Bool(false),
            _ => return None,
        },
        (VarType::Boolean, Literal::Int(0)) => Literal::Bool(false),
        (VarType::Boolean, Literal::Int(1)) => Literal::Bool(true),
        (VarType::String, Literal::Int(n)) => Literal::Str(n.to_string()),
        (VarType::String, Literal::Float(x)) => Literal::Str(x.to_string()),
        (VarType::String, Literal::Bool(b)) => {
            Literal::Str(if *b { "True" } else { "False" }.to_string())
        }
        _ => return None,
    };
    Some(Expr::Literal(out))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::analyzer::analyze;
    use crate::dsl::parser::parse;
    use crate::dsl::validator::{validate, ValidateOptions};
    use pretty_assertions::assert_eq;

    fn defects_of(stmts: &[Stmt], parse_defects: &[Defect]) -> Vec<Defect> {
        let analysis = analyze(stmts, &[]);
        validate(stmts, &analysis, parse_defects, &ValidateOptions::default())
    }

    fn repair_src(src: &str) -> RepairOutcome {
        let (stmts, parse_defects) = parse(src);
        let defects = defects_of(&stmts, &parse_defects);
        repair(stmts, &defects)
    }

    fn define_names(stmts: &[Stmt]) -> Vec<String> {
        let mut out = Vec::new();
        walk(stmts, 0, &mut |s, _| {
            if let StmtKind::Define { name, .. } = &s.kind {
                out.push(name.clone());
            }
        });
        out
    }

    #[test]
    fn duplicates_get_sequential_suffixes() {
        let out = repair_src("DEFINE {{d}}: Integer = 90\nDEFINE {{d}}: Integer = 30\nDEFINE {{d}}: Integer = 7");
        assert_eq!(define_names(&out.statements), vec!["d", "d_2", "d_3"]);
        assert_eq!(out.fixed_kinds(), vec![DefectKind::DuplicateDefinition]);
        assert!(out.remaining.is_empty());
        assert!(defects_of(&out.statements, &[]).is_empty());
    }

    #[test]
    fn references_follow_the_latest_definition() {
        let out = repair_src(
            "DEFINE {{d}}: Integer = 1\nCALL f({{d}})\nDEFINE {{d}}: Integer = {{d}} + 1\nCALL g({{d}})",
        );
        let args: Vec<String> = out
            .statements
            .iter()
            .filter_map(|s| match &s.kind {
                StmtKind::Call { call, .. } => match &call.arguments[0].value {
                    Expr::Var(n) => Some(n.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect();
        assert_eq!(args, vec!["d", "d_2"]);
        // The redefinition reads the value it replaces.
        match &out.statements[2].kind {
            StmtKind::Define {
                name,
                initial_value: Some(Expr::Binary { left, .. }),
                ..
            } => {
                assert_eq!(name, "d_2");
                assert_eq!(**left, Expr::Var("d".into()));
            }
            other => unreachable!("{other:?}"),
        }
    }

    #[test]
    fn suffix_skips_names_already_in_use() {
        let out = repair_src("DEFINE {{d_2}}: Integer = 0\nDEFINE {{d}}: Integer = 1\nDEFINE {{d}}: Integer = 2");
        assert_eq!(define_names(&out.statements), vec!["d_2", "d", "d_3"]);
    }

    #[test]
    fn missing_definitions_are_inserted_with_inferred_types() {
        let out = repair_src(
            "IF {{score}} > 0.5 AND {{tier}} == \"gold\"\n  FOR {{item}} IN {{items}}\n    {{total}} = CALL add({{item}})\n  ENDFOR\nENDIF",
        );
        let inserted: Vec<(String, VarType)> = out
            .statements
            .iter()
            .take_while(|s| s.span.is_synthetic())
            .filter_map(|s| match &s.kind {
                StmtKind::Define { name, ty, .. } => Some((name.clone(), *ty)),
                _ => None,
            })
            .collect();
        assert_eq!(
            inserted,
            vec![
                ("score".to_string(), VarType::Float),
                ("tier".to_string(), VarType::String),
                ("items".to_string(), VarType::List),
                ("total".to_string(), VarType::Any),
            ]
        );
        assert!(defects_of(&out.statements, &[]).is_empty());
    }

    #[test]
    fn integer_inference_from_ordering() {
        let (stmts, _) = parse("WHILE {{n}} < 10\n  {{n}} = {{n}} + 1\nENDWHILE");
        assert_eq!(infer_type(&stmts, "n"), VarType::Integer);
        assert_eq!(infer_type(&stmts, "absent"), VarType::Any);
    }

    #[test]
    fn unclosed_block_closes_where_indentation_ends() {
        let out = repair_src("DEFINE {{x}}: Integer = 1\nIF {{x}} > 5\n  CALL f()\nCALL g()");
        assert!(out.remaining.is_empty());
        assert_eq!(out.statements.len(), 3);
        match &out.statements[1].kind {
            StmtKind::If {
                then_branch,
                closed,
                ..
            } => {
                assert!(closed);
                assert_eq!(then_branch.len(), 1);
            }
            other => unreachable!("{other:?}"),
        }
        assert!(matches!(out.statements[2].kind, StmtKind::Call { .. }));
    }

    #[test]
    fn nested_unclosed_blocks_close_innermost_first() {
        let out = repair_src("FOR {{i}} IN [1, 2]\n  IF {{i}} > 1\n    CALL f({{i}})\n  CALL g({{i}})");
        assert_eq!(out.fixed.len(), 2);
        assert_eq!(out.statements.len(), 1);
        let body = out.statements[0].blocks()[0];
        assert_eq!(body.len(), 2);
        assert_eq!(body[0].blocks()[0].len(), 1);
        assert!(defects_of(&out.statements, &[]).is_empty());
    }

    #[test]
    fn unclosed_without_evidence_closes_at_end() {
        let out = repair_src("IF True\n  CALL f()");
        assert_eq!(out.fixed_kinds(), vec![DefectKind::UnclosedBlock]);
        assert_eq!(out.statements.len(), 1);
    }

    #[test]
    fn invalid_identifiers_are_renamed_everywhere() {
        let out = repair_src("DEFINE {{95th_percentile}}: Float = 1.5\nIF {{95th_percentile}} > 1\n  RETURN {{95th_percentile}}\nENDIF");
        assert_eq!(
            out.renames,
            vec![Rename {
                original: "95th_percentile".into(),
                replacement: "_95th_percentile".into(),
                span: SourceSpan::new(1, 1),
                reason: DefectKind::InvalidIdentifier,
            }]
        );
        assert_eq!(all_names(&out.statements), vec!["_95th_percentile"]);
        assert!(defects_of(&out.statements, &[]).is_empty());
    }

    #[test]
    fn sanitized_name_avoids_collisions() {
        let out = repair_src("DEFINE {{_class}}: Integer = 1\nDEFINE {{class}}: Integer = 2");
        assert_eq!(define_names(&out.statements), vec!["_class", "_class_2"]);
    }

    #[test]
    fn literal_coercions() {
        let out = repair_src(
            "DEFINE {{a}}: Integer = 3.0\nDEFINE {{b}}: Integer = \"42\"\nDEFINE {{c}}: Boolean = \"TRUE\"\nDEFINE {{d}}: String = -7\nDEFINE {{e}}: Integer = 2.5\nDEFINE {{f}}: List = 3",
        );
        let values: Vec<Option<Expr>> = out
            .statements
            .iter()
            .map(|s| match &s.kind {
                StmtKind::Define { initial_value, .. } => initial_value.clone(),
                _ => None,
            })
            .collect();
        assert_eq!(values[0], Some(Expr::Literal(Literal::Int(3))));
        assert_eq!(values[1], Some(Expr::Literal(Literal::Int(42))));
        assert_eq!(values[2], Some(Expr::Literal(Literal::Bool(true))));
        assert_eq!(values[3], Some(Expr::Literal(Literal::Str("-7".into()))));
        let remaining: Vec<_> = out.remaining.iter().filter_map(|d| d.subject.as_deref()).collect();
        assert_eq!(remaining, vec!["e", "f"]);
    }

    #[test]
    fn non_finite_strings_are_not_coerced() {
        for text in ["inf", "-infinity", "NaN"] {
            let value = Expr::Literal(Literal::Str(text.into()));
            assert_eq!(coerce(&value, VarType::Float), None, "{text}");
        }
        let value = Expr::Literal(Literal::Str(" 1e3 ".into()));
        assert_eq!(coerce(&value, VarType::Float), Some(Expr::Literal(Literal::Float(1000.0))));
    }

    #[test]
    fn unfixable_kinds_pass_through() {
        let out = repair_src("ENDIF\nCALL f(??)");
        assert!(out.fixed.is_empty());
        let kinds: Vec<_> = out.remaining.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![DefectKind::UnexpectedClose, DefectKind::UnparsableCallExpression]
        );
    }

    #[test]
    fn repair_is_idempotent() {
        let src = "DEFINE {{d}}: Integer = 1\nDEFINE {{d}}: Integer = 2\nIF {{x}} > 1\n  CALL f({{d}})";
        let once = repair_src(src);
        let twice = repair(once.statements.clone(), &[]);
        assert_eq!(twice.statements, once.statements);
        assert!(twice.fixed.is_empty());
        let again = repair(once.statements.clone(), &defects_of(&once.statements, &[]));
        assert_eq!(again.statements, once.statements);
    }

    #[test]
    fn upstream_duplicates_leave_inserted_definitions_alone() {
        let x = Variable {
            name: "x".into(),
            ty: VarType::Integer,
            value: serde_json::json!(1),
            origin_text: String::new(),
        };
        let upstream = vec![x.clone(), x];
        let check = |stmts: &[Stmt]| {
            let analysis = analyze(stmts, &upstream);
            validate(stmts, &analysis, &[], &ValidateOptions::default())
        };

        let (stmts, _) = parse("CALL f({{y}})");
        let defects = check(&stmts);
        let first = repair(stmts, &defects);
        assert_eq!(first.fixed_kinds(), vec![DefectKind::UndefinedVariable]);

        let defects = check(&first.statements);
        let second = repair(first.statements.clone(), &defects);
        assert!(second.fixed.is_empty(), "{:?}", second.fixed);
        assert!(second.renames.is_empty());
        assert_eq!(define_names(&second.statements), vec!["y"]);
        assert!(second
            .remaining
            .iter()
            .any(|d| d.kind == DefectKind::DuplicateDefinition && d.subject.as_deref() == Some("x")));
    }
}
