use serde::Serialize;

use super::ast::SourceSpan;

/// Closed taxonomy of rule violations found by parsing, analysis or validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DefectKind {
    DuplicateDefinition,
    UndefinedVariable,
    UnclosedBlock,
    UnexpectedClose,
    InvalidIdentifier,
    TypeMismatch,
    CyclicDependency,
    UnparsableCallExpression,
    /// A line that is not any known statement shape.
    MalformedStatement,
    /// Condition that is constant at parse time.
    DeadBranch,
    /// Blocks nested deeper than the configured limit.
    ExcessiveNesting,
    /// Call site with no data or nesting link to any other call.
    IsolatedCall,
}

impl DefectKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::DuplicateDefinition => "duplicate-definition",
            Self::UndefinedVariable => "undefined-variable",
            Self::UnclosedBlock => "unclosed-block",
            Self::UnexpectedClose => "unexpected-close",
            Self::InvalidIdentifier => "invalid-identifier",
            Self::TypeMismatch => "type-mismatch",
            Self::CyclicDependency => "cyclic-dependency",
            Self::UnparsableCallExpression => "unparsable-expression",
            Self::MalformedStatement => "malformed-statement",
            Self::DeadBranch => "dead-branch",
            Self::ExcessiveNesting => "excessive-nesting",
            Self::IsolatedCall => "isolated-call",
        }
    }

    /// Kinds the auto-repair engine has a deterministic fix for.
    pub fn is_repairable(self) -> bool {
        matches!(
            self,
            Self::DuplicateDefinition
                | Self::UndefinedVariable
                | Self::UnclosedBlock
                | Self::InvalidIdentifier
                | Self::TypeMismatch
        )
    }

    /// Parse defects that leave no trace in the statement tree and so cannot
    /// be recomputed from it.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::UnexpectedClose | Self::MalformedStatement | Self::UnparsableCallExpression
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

/// A single rule violation with its location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Defect {
    pub span: SourceSpan,
    pub kind: DefectKind,
    pub severity: Severity,
    pub message: String,
    /// Variable the defect is about, when there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
}

impl Defect {
    pub fn error(kind: DefectKind, span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            span,
            kind,
            severity: Severity::Error,
            message: message.into(),
            subject: None,
        }
    }

    pub fn warning(kind: DefectKind, span: SourceSpan, message: impl Into<String>) -> Self {
        Self {
            span,
            kind,
            severity: Severity::Warning,
            message: message.into(),
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn unclosed(span: SourceSpan, keyword: &str) -> Self {
        Self::error(
            DefectKind::UnclosedBlock,
            span,
            format!("{keyword} opened on line {} is never closed", span.line),
        )
    }

    pub fn unparsable(span: SourceSpan, raw: &str, reason: &str) -> Self {
        Self::error(
            DefectKind::UnparsableCallExpression,
            span,
            format!("cannot parse `{raw}`: {reason}"),
        )
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Whether repair can act on this defect. Duplicates among the upstream
    /// variables sit at the synthetic span and have no definition to rename.
    pub fn is_repairable(&self) -> bool {
        self.kind.is_repairable()
            && !(self.kind == DefectKind::DuplicateDefinition && self.span.is_synthetic())
    }

    /// Format the defect with the offending source line underneath.
    pub fn format_with_source(&self, source: &str) -> String {
        let head = format!(
            "[{}] {} {}: {}",
            match self.severity {
                Severity::Error => "error",
                Severity::Warning => "warning",
            },
            self.kind.label(),
            self.span,
            self.message,
        );
        match source.lines().nth(self.span.line.wrapping_sub(1)) {
            Some(text) if !self.span.is_synthetic() => format!("{head}\n    | {}", text.trim_end()),
            _ => head,
        }
    }
}

impl std::fmt::Display for Defect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.span, self.message)
    }
}

/// Sort defects by position then kind and drop exact duplicates.
pub fn normalize(defects: &mut Vec<Defect>) {
    defects.sort();
    defects.dedup();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[test]
    fn format_includes_source_line() {
        let src = "DEFINE {{a}}: Integer = 1\nIF {{a}} > 0\n";
        let d = Defect::unclosed(SourceSpan::new(2, 1), "IF");
        let text = d.format_with_source(src);
        assert!(text.starts_with("[error] unclosed-block 2:1"));
        assert!(text.ends_with("| IF {{a}} > 0"));
    }

    #[test]
    fn synthetic_span_has_no_source_line() {
        let d = Defect::warning(DefectKind::DeadBranch, SourceSpan::synthetic(), "x");
        assert_eq!(d.format_with_source("IF True"), "[warning] dead-branch <repair>: x");
    }

    #[test]
    fn normalize_orders_and_dedups() {
        let a = Defect::error(DefectKind::TypeMismatch, SourceSpan::new(3, 1), "t");
        let b = Defect::error(DefectKind::DuplicateDefinition, SourceSpan::new(1, 1), "d");
        let mut v = vec![a.clone(), b.clone(), a.clone()];
        normalize(&mut v);
        assert_eq!(v, vec![b, a]);
    }

    #[test]
    fn upstream_duplicates_are_not_repairable() {
        let upstream = Defect::error(DefectKind::DuplicateDefinition, SourceSpan::synthetic(), "u")
            .with_subject("x");
        let local = Defect::error(DefectKind::DuplicateDefinition, SourceSpan::new(2, 1), "d")
            .with_subject("x");
        assert!(!upstream.is_repairable());
        assert!(local.is_repairable());
    }
}
