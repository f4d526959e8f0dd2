//! Python code generation for validated statement trees.
//!
//! Every call placement (statement, binding, condition, argument, return)
//! goes through `invoke`, so there is exactly one call translation.
//! Identifiers go through [`names::sanitize`], the same rule the validator
//! checks against.

use std::collections::HashSet;

use super::ast::*;
use super::names::{self, NameResolutionContext};
use super::render::{escape, format_float, needs_parens, NOT_PRECEDENCE, UNARY_PRECEDENCE};

pub const INDENT: &str = "    ";

/// Name of the boolean adaptor applied to call results used as conditions.
pub const BOOL_ADAPTOR: &str = "as_bool";

fn pad(depth: usize) -> String {
    INDENT.repeat(depth)
}

/// Python text for one statement at `depth`, nested blocks included.
/// Every emitted line ends with a newline.
pub fn synthesize(stmt: &Stmt, depth: usize) -> String {
    let indent = pad(depth);
    match &stmt.kind {
        StmtKind::Define {
            name,
            ty,
            initial_value,
        } => {
            let value = initial_value
                .as_ref()
                .map_or_else(|| synthesize_expr(&ty.default_value()), synthesize_expr);
            format!("{indent}{} = {value}\n", names::sanitize(name))
        }
        StmtKind::Assign { target, expression } => format!(
            "{indent}{} = {}\n",
            names::sanitize(target),
            synthesize_expr(expression)
        ),
        StmtKind::Call {
            result_binding: Some(target),
            call,
        } => format!("{indent}{} = {}\n", names::sanitize(target), invoke(call)),
        StmtKind::Call {
            result_binding: None,
            call,
        } => format!("{indent}{}\n", invoke(call)),
        StmtKind::If {
            condition,
            then_branch,
            elif_branches,
            else_branch,
            ..
        } => {
            let mut out = format!("{indent}if {}:\n", synthesize_condition(condition));
            out.push_str(&synthesize_block(then_branch, depth + 1));
            for branch in elif_branches {
                out.push_str(&format!(
                    "{indent}elif {}:\n",
                    synthesize_condition(&branch.condition)
                ));
                out.push_str(&synthesize_block(&branch.body, depth + 1));
            }
            if let Some(body) = else_branch {
                out.push_str(&format!("{indent}else:\n"));
                out.push_str(&synthesize_block(body, depth + 1));
            }
            out
        }
        StmtKind::For {
            loop_var,
            iterable,
            body,
            ..
        } => {
            let mut out = format!(
                "{indent}for {} in {}:\n",
                names::sanitize(loop_var),
                synthesize_expr(iterable)
            );
            out.push_str(&synthesize_block(body, depth + 1));
            out
        }
        StmtKind::While {
            condition, body, ..
        } => {
            let mut out = format!("{indent}while {}:\n", synthesize_condition(condition));
            out.push_str(&synthesize_block(body, depth + 1));
            out
        }
        StmtKind::Return { expression: None } => format!("{indent}return\n"),
        StmtKind::Return {
            expression: Some(e),
        } => format!("{indent}return {}\n", synthesize_expr(e)),
    }
}

/// A statement list at `depth`; an empty list becomes `pass`.
pub fn synthesize_block(stmts: &[Stmt], depth: usize) -> String {
    if stmts.is_empty() {
        return format!("{}pass\n", pad(depth));
    }
    stmts.iter().map(|s| synthesize(s, depth)).collect()
}

/// A condition. A bare call is wrapped in the boolean adaptor.
pub fn synthesize_condition(condition: &Expr) -> String {
    match condition {
        Expr::Call(call) => format!("{BOOL_ADAPTOR}({})", invoke(call)),
        other => synthesize_expr(other),
    }
}

/// The single call primitive: `await invoke_function("name", k=v, ...)`.
///
/// Arguments are passed by keyword. A positional variable argument uses its
/// own name as the keyword; other positional arguments, and repeats, get a
/// free `arg<N>` name that no other argument of the call claims.
pub fn invoke(call: &CallExpr) -> String {
    let preferred: Vec<Option<String>> = call
        .arguments
        .iter()
        .map(|arg| match (&arg.name, &arg.value) {
            (Some(name), _) => Some(names::sanitize(name)),
            (None, Expr::Var(var)) => Some(names::sanitize(var)),
            (None, _) => None,
        })
        .collect();
    let mut fallback = NameResolutionContext::with_taken(preferred.iter().flatten().cloned());
    let mut used: HashSet<String> = HashSet::new();

    let mut parts = vec![format!("\"{}\"", escape(&call.function_name))];
    for (i, (arg, keyword)) in call.arguments.iter().zip(preferred).enumerate() {
        let keyword = match keyword {
            Some(name) if used.insert(name.clone()) => name,
            _ => fallback.fresh(&format!("arg{}", i + 1)),
        };
        parts.push(format!("{keyword}={}", synthesize_expr(&arg.value)));
    }
    format!("await invoke_function({})", parts.join(", "))
}

pub fn synthesize_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(lit) => python_literal(lit),
        Expr::Var(name) => names::sanitize(name),
        Expr::List(items) => {
            let items: Vec<String> = items.iter().map(synthesize_expr).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Dict(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", synthesize_expr(k), synthesize_expr(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Expr::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("-{}", operand_text(operand, UNARY_PRECEDENCE, false)),
            UnaryOp::Not => format!("not {}", operand_text(operand, NOT_PRECEDENCE, false)),
        },
        Expr::Binary { op, left, right } => format!(
            "{} {} {}",
            operand_text(left, op.precedence(), false),
            python_operator(*op),
            operand_text(right, op.precedence(), true)
        ),
        Expr::Call(call) => invoke(call),
        // Validated trees contain none of these.
        Expr::Unparsed { .. } => "None".to_string(),
    }
}

fn operand_text(child: &Expr, parent: u8, right_side: bool) -> String {
    let text = synthesize_expr(child);
    if needs_parens(child, parent, right_side) {
        format!("({text})")
    } else {
        text
    }
}

fn python_literal(lit: &Literal) -> String {
    match lit {
        Literal::Int(n) => n.to_string(),
        Literal::Float(x) if x.is_nan() => "float(\"nan\")".to_string(),
        Literal::Float(x) if x.is_infinite() && *x < 0.0 => "float(\"-inf\")".to_string(),
        Literal::Float(x) if x.is_infinite() => "float(\"inf\")".to_string(),
        Literal::Float(x) => format_float(*x),
        Literal::Str(s) => format!("\"{}\"", escape(s)),
        Literal::Bool(true) => "True".to_string(),
        Literal::Bool(false) => "False".to_string(),
        Literal::None => "None".to_string(),
    }
}

fn python_operator(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::Mod => "%",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::Lt => "<",
        BinOp::Gt => ">",
        BinOp::Le => "<=",
        BinOp::Ge => ">=",
        BinOp::In => "in",
        BinOp::NotIn => "not in",
        BinOp::And => "and",
        BinOp::Or => "or",
    }
}

/// Python literal for an upstream variable value.
pub fn python_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "None".to_string(),
        serde_json::Value::Bool(true) => "True".to_string(),
        serde_json::Value::Bool(false) => "False".to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => format!("\"{}\"", escape(s)),
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(python_value).collect();
            format!("[{}]", items.join(", "))
        }
        serde_json::Value::Object(map) => {
            let entries: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("\"{}\": {}", escape(k), python_value(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::dsl::parser::parse;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn py(src: &str) -> String {
        let (stmts, defects) = parse(src);
        assert!(defects.is_empty(), "{defects:?}");
        synthesize_block(&stmts, 0)
    }

    #[test]
    fn conditional_call_is_a_single_block() {
        let out = py("IF {{x}} > 5\n  CALL f()\nENDIF");
        assert_eq!(out, "if x > 5:\n    await invoke_function(\"f\")\n");
        assert_eq!(out.matches("invoke_function(\"f\"").count(), 1);
    }

    #[test]
    fn every_call_placement_uses_invoke() {
        let out = py(
            "IF CALL is_ready({{job}})\n  {{r}} = CALL run({{job}}, retries=3)\nELIF NOT CALL fallback_ok()\n  RETURN CALL summarize({{r}}, \"short\")\nELSE\nENDIF",
        );
        assert_eq!(
            out,
            "if as_bool(await invoke_function(\"is_ready\", job=job)):\n    \
             r = await invoke_function(\"run\", job=job, retries=3)\n\
             elif not await invoke_function(\"fallback_ok\"):\n    \
             return await invoke_function(\"summarize\", r=r, arg2=\"short\")\n\
             else:\n    pass\n"
        );
    }

    #[test]
    fn loops_and_defines() {
        let out = py("DEFINE {{total}}: Float\nFOR {{x}} IN {{items}}\n  {{total}} = {{total}} + {{x}} * 2\nENDFOR\nWHILE {{total}} > 100\n  {{total}} = {{total}} / 2\nENDWHILE");
        assert_eq!(
            out,
            "total = 0.0\nfor x in items:\n    total = total + x * 2\nwhile total > 100:\n    total = total / 2\n"
        );
    }

    #[test]
    fn identifiers_share_the_sanitizer() {
        let (stmts, _) = parse("DEFINE {{95th_percentile}}: Float = 1.5");
        assert_eq!(synthesize(&stmts[0], 1), "    _95th_percentile = 1.5\n");
    }

    #[test]
    fn duplicate_keywords_fall_back_to_positions() {
        let (stmts, _) = parse("CALL f({{a}}, {{a}}, a=1)");
        assert_eq!(
            synthesize(&stmts[0], 0),
            "await invoke_function(\"f\", a=a, arg2=a, arg3=1)\n"
        );
    }

    #[test]
    fn fallback_keywords_avoid_claimed_names() {
        let (stmts, _) = parse("CALL f({{arg2}}, 5)\nCALL g(7, {{arg1}}, arg3=1, 2)");
        assert_eq!(
            synthesize_block(&stmts, 0),
            "await invoke_function(\"f\", arg2=arg2, arg2_2=5)\n\
             await invoke_function(\"g\", arg1_2=7, arg1=arg1, arg3=1, arg4=2)\n"
        );
    }

    #[test]
    fn non_finite_floats_are_python_expressions() {
        let lit = |x: f64| synthesize_expr(&Expr::Literal(Literal::Float(x)));
        assert_eq!(lit(f64::INFINITY), "float(\"inf\")");
        assert_eq!(lit(f64::NEG_INFINITY), "float(\"-inf\")");
        assert_eq!(lit(f64::NAN), "float(\"nan\")");
        assert_eq!(lit(2.0), "2.0");
    }

    #[test]
    fn precedence_is_preserved() {
        let (stmts, _) = parse("RETURN ({{a}} OR {{b}}) AND NOT {{c}} IN [1, 2] AND -({{d}} - 1) < 0");
        assert_eq!(
            synthesize(&stmts[0], 0),
            "return (a or b) and not c in [1, 2] and -(d - 1) < 0\n"
        );
    }

    #[test]
    fn upstream_values() {
        assert_eq!(
            python_value(&json!({"k": [1, true, null, "x\"y"]})),
            "{\"k\": [1, True, None, \"x\\\"y\"]}"
        );
        assert_eq!(python_value(&json!(2.5)), "2.5");
    }
}
