//! Render a statement tree back to DSL text.
//!
//! Used to show repaired programs, to feed the previous draft into a
//! regeneration prompt, and as the `dsl` field of a transpile result.
//! Parsing the rendered text yields the same tree (spans aside).

use std::fmt::Write;

use super::ast::*;

const INDENT: &str = "  ";

pub fn render_program(statements: &[Stmt]) -> String {
    let mut out = String::new();
    render_block(&mut out, statements, 0);
    out
}

fn render_block(out: &mut String, stmts: &[Stmt], depth: usize) {
    for stmt in stmts {
        render_stmt(out, stmt, depth);
    }
}

fn line(out: &mut String, depth: usize, text: &str) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
    out.push_str(text);
    out.push('\n');
}

fn render_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    match &stmt.kind {
        StmtKind::Define {
            name,
            ty,
            initial_value,
        } => {
            let mut text = format!("DEFINE {{{{{name}}}}}: {}", ty.name());
            if let Some(value) = initial_value {
                let _ = write!(text, " = {}", render_expr(value));
            }
            line(out, depth, &text);
        }
        StmtKind::Assign { target, expression } => {
            line(out, depth, &format!("{{{{{target}}}}} = {}", render_expr(expression)));
        }
        StmtKind::Call {
            result_binding,
            call,
        } => {
            let call = render_call(call);
            match result_binding {
                Some(target) => line(out, depth, &format!("{{{{{target}}}}} = {call}")),
                None => line(out, depth, &call),
            }
        }
        StmtKind::If {
            condition,
            then_branch,
            elif_branches,
            else_branch,
            closed,
        } => {
            line(out, depth, &format!("IF {}", render_expr(condition)));
            render_block(out, then_branch, depth + 1);
            for branch in elif_branches {
                line(out, depth, &format!("ELIF {}", render_expr(&branch.condition)));
                render_block(out, &branch.body, depth + 1);
            }
            if let Some(body) = else_branch {
                line(out, depth, "ELSE");
                render_block(out, body, depth + 1);
            }
            if *closed {
                line(out, depth, "ENDIF");
            }
        }
        StmtKind::For {
            loop_var,
            iterable,
            body,
            closed,
        } => {
            line(
                out,
                depth,
                &format!("FOR {{{{{loop_var}}}}} IN {}", render_expr(iterable)),
            );
            render_block(out, body, depth + 1);
            if *closed {
                line(out, depth, "ENDFOR");
            }
        }
        StmtKind::While {
            condition,
            body,
            closed,
        } => {
            line(out, depth, &format!("WHILE {}", render_expr(condition)));
            render_block(out, body, depth + 1);
            if *closed {
                line(out, depth, "ENDWHILE");
            }
        }
        StmtKind::Return { expression } => match expression {
            Some(e) => line(out, depth, &format!("RETURN {}", render_expr(e))),
            None => line(out, depth, "RETURN"),
        },
    }
}

fn render_call(call: &CallExpr) -> String {
    let args: Vec<String> = call
        .arguments
        .iter()
        .map(|a| match &a.name {
            Some(name) => format!("{name}={}", render_expr(&a.value)),
            None => render_expr(&a.value),
        })
        .collect();
    format!("CALL {}({})", call.function_name, args.join(", "))
}

fn render_literal(lit: &Literal) -> String {
    match lit {
        Literal::Int(n) => n.to_string(),
        Literal::Float(x) => format_float(*x),
        Literal::Str(s) => format!("\"{}\"", escape(s)),
        Literal::Bool(true) => "True".to_string(),
        Literal::Bool(false) => "False".to_string(),
        Literal::None => "None".to_string(),
    }
}

/// Floats always keep a decimal point so they re-lex as floats.
pub fn format_float(x: f64) -> String {
    let text = x.to_string();
    if text.contains(['.', 'e', 'E', 'N', 'n']) {
        text
    } else {
        format!("{text}.0")
    }
}

/// Escape a string body for a double-quoted literal.
pub fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

pub fn render_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(lit) => render_literal(lit),
        Expr::Var(name) => format!("{{{{{name}}}}}"),
        Expr::List(items) => {
            let items: Vec<String> = items.iter().map(render_expr).collect();
            format!("[{}]", items.join(", "))
        }
        Expr::Dict(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("{}: {}", render_expr(k), render_expr(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        Expr::Unary { op, operand } => match op {
            UnaryOp::Neg => format!("-{}", render_operand(operand, UNARY_PRECEDENCE, false)),
            UnaryOp::Not => format!("NOT {}", render_operand(operand, NOT_PRECEDENCE, false)),
        },
        Expr::Binary { op, left, right } => format!(
            "{} {} {}",
            render_operand(left, op.precedence(), false),
            dsl_operator(*op),
            render_operand(right, op.precedence(), true)
        ),
        Expr::Call(call) => render_call(call),
        Expr::Unparsed { raw, .. } => raw.clone(),
    }
}

pub(crate) const NOT_PRECEDENCE: u8 = 3;
pub(crate) const UNARY_PRECEDENCE: u8 = 7;

/// Binding strength of an expression's top-level operator.
pub(crate) fn expr_precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::Binary { op, .. } => op.precedence(),
        Expr::Unary {
            op: UnaryOp::Not, ..
        } => NOT_PRECEDENCE,
        Expr::Unary { .. } => UNARY_PRECEDENCE,
        _ => u8::MAX,
    }
}

/// Whether `child` needs parentheses under a parent of precedence `parent`.
/// Operators are left-associative and comparisons do not chain.
pub(crate) fn needs_parens(child: &Expr, parent: u8, right_side: bool) -> bool {
    let own = expr_precedence(child);
    own < parent || (own == parent && (right_side || parent == 4))
}

fn render_operand(child: &Expr, parent: u8, right_side: bool) -> String {
    let text = render_expr(child);
    if needs_parens(child, parent, right_side) {
        format!("({text})")
    } else {
        text
    }
}

fn dsl_operator(op: BinOp) -> &'static str {
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
        BinOp::In => "IN",
        BinOp::NotIn => "NOT IN",
        BinOp::And => "AND",
        BinOp::Or => "OR",
    }
}
