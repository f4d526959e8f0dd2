//! Prompt construction for draft regeneration.

use std::fmt::Write;

use crate::dsl::ast::Variable;
use crate::dsl::error::{Defect, Severity};
use crate::llm::Diagnostics;

/// Defects listed per severity in the feedback block.
const FEEDBACK_LIMIT: usize = 5;

pub const SYSTEM_PROMPT: &str = "\
You translate business requirements into a line-oriented pseudocode DSL.
Output only DSL lines. No explanations, no markdown.

Statements (one per line):
  DEFINE {{name}}: Type [= expression]
  {{name}} = expression
  {{name}} = CALL function(arg, key=value)
  CALL function(arg, key=value)
  IF condition / ELIF condition / ELSE / ENDIF
  FOR {{item}} IN expression / ENDFOR
  WHILE condition / ENDWHILE
  RETURN [expression]
  # comment

Types: Integer, Float, String, Boolean, List, Dict, Any.
Expressions: numbers, \"strings\", True, False, None, {{variables}}, [lists],
{key: value} dicts, + - * / %, == != < > <= >=, IN, NOT IN, AND, OR, NOT,
parentheses and nested CALL.

Rules:
1. Every variable is written as {{name}} and is DEFINEd before first use.
2. Never DEFINE the same variable twice.
3. Every IF, FOR and WHILE has a matching ENDIF, ENDFOR or ENDWHILE.
4. Indent block bodies by two spaces.
5. Variable names use letters, digits and underscores and do not start with a digit.
6. Output the complete program every time, not only the changed lines.";

/// The requirement together with the variables already resolved for it.
pub fn requirement_prompt(requirement: &str, variables: &[Variable]) -> String {
    let mut out = String::new();
    if !variables.is_empty() {
        out.push_str("Variables:\n");
        for var in variables {
            let _ = write!(out, "- {}: {}", var.name, var.ty.name());
            if !var.value.is_null() {
                let _ = write!(out, " = {}", var.value);
            }
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str("Requirement:\n");
    out.push_str(requirement.trim());
    out.push('\n');
    out
}

/// User message for one generation call: the prompt, then the previous
/// draft and its feedback when regenerating.
pub fn user_message(prompt: &str, context: Option<&Diagnostics>) -> String {
    let Some(diagnostics) = context else {
        return prompt.to_string();
    };
    let mut out = prompt.to_string();
    if !diagnostics.previous_draft.trim().is_empty() {
        out.push_str("\nPrevious draft:\n");
        out.push_str(diagnostics.previous_draft.trim_end());
        out.push('\n');
    }
    out.push_str("\nFeedback:\n");
    out.push_str(&feedback(&diagnostics.defects));
    out.push_str("Fix the problems above and output the corrected program.\n");
    out
}

/// Counts per severity followed by at most five defects of each.
pub fn feedback(defects: &[Defect]) -> String {
    let errors: Vec<&Defect> = defects.iter().filter(|d| d.is_error()).collect();
    let warnings: Vec<&Defect> = defects
        .iter()
        .filter(|d| d.severity == Severity::Warning)
        .collect();

    let mut out = format!(
        "The draft has {} error(s) and {} warning(s).\n",
        errors.len(),
        warnings.len()
    );
    for (title, list) in [("Errors (must fix):", &errors), ("Warnings:", &warnings)] {
        if list.is_empty() {
            continue;
        }
        out.push_str(title);
        out.push('\n');
        for defect in list.iter().take(FEEDBACK_LIMIT) {
            let _ = writeln!(out, "  - [{}] {defect}", defect.kind.label());
        }
        if list.len() > FEEDBACK_LIMIT {
            let _ = writeln!(out, "  ... and {} more", list.len() - FEEDBACK_LIMIT);
        }
    }
    out
}
