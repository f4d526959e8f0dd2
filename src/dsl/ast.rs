//! Statement tree for the pseudocode DSL.

use serde::Serialize;

/// Source position for diagnostics. `column` is the indentation of the
/// line plus one, so block structure can be recovered from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SourceSpan {
    pub line: usize,
    pub column: usize,
}

impl SourceSpan {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Span used for statements synthesized by repair (no source line).
    pub fn synthetic() -> Self {
        Self { line: 0, column: 1 }
    }

    pub fn is_synthetic(self) -> bool {
        self.line == 0
    }
}

impl std::fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_synthetic() {
            write!(f, "<repair>")
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Declared type of a DSL variable.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize, schemars::JsonSchema,
)]
pub enum VarType {
    Integer,
    Float,
    String,
    Boolean,
    List,
    Dict,
    Any,
}

impl VarType {
    /// Parse a type name as written after `DEFINE {{x}}:`. Case-insensitive.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "integer" | "int" => Some(Self::Integer),
            "float" | "number" => Some(Self::Float),
            "string" | "str" => Some(Self::String),
            "boolean" | "bool" => Some(Self::Boolean),
            "list" => Some(Self::List),
            "dict" => Some(Self::Dict),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Integer => "Integer",
            Self::Float => "Float",
            Self::String => "String",
            Self::Boolean => "Boolean",
            Self::List => "List",
            Self::Dict => "Dict",
            Self::Any => "Any",
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Whether `IN` / `FOR` can iterate a value of this type.
    pub fn is_iterable(self) -> bool {
        matches!(self, Self::List | Self::Dict | Self::String | Self::Any)
    }

    /// Neutral initial value used when a definition has to be synthesized.
    pub fn default_value(self) -> Expr {
        match self {
            Self::Integer => Expr::Literal(Literal::Int(0)),
            Self::Float => Expr::Literal(Literal::Float(0.0)),
            Self::String => Expr::Literal(Literal::Str(String::new())),
            Self::Boolean => Expr::Literal(Literal::Bool(false)),
            Self::List => Expr::List(Vec::new()),
            Self::Dict => Expr::Dict(Vec::new()),
            Self::Any => Expr::Literal(Literal::None),
        }
    }
}

/// A variable resolved upstream (entity extraction), immutable for a session.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: VarType,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default)]
    pub origin_text: String,
}

/// A scalar literal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    None,
}

impl Literal {
    /// Static type of the literal. `None` fits any declared type.
    pub fn var_type(&self) -> VarType {
        match self {
            Self::Int(_) => VarType::Integer,
            Self::Float(_) => VarType::Float,
            Self::Str(_) => VarType::String,
            Self::Bool(_) => VarType::Boolean,
            Self::None => VarType::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

impl BinOp {
    /// Binding strength, higher binds tighter.
    pub fn precedence(self) -> u8 {
        match self {
            Self::Or => 1,
            Self::And => 2,
            Self::Eq | Self::Ne | Self::Lt | Self::Gt | Self::Le | Self::Ge | Self::In | Self::NotIn => 4,
            Self::Add | Self::Sub => 5,
            Self::Mul | Self::Div | Self::Mod => 6,
        }
    }

    pub fn is_ordering(self) -> bool {
        matches!(self, Self::Lt | Self::Gt | Self::Le | Self::Ge)
    }

    pub fn is_comparison(self) -> bool {
        self.precedence() == 4
    }

    pub fn is_arithmetic(self) -> bool {
        matches!(self, Self::Add | Self::Sub | Self::Mul | Self::Div | Self::Mod)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UnaryOp {
    Neg,
    Not,
}

/// `CALL name(args)` in any position: statement, condition, argument or return.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallExpr {
    pub function_name: String,
    pub arguments: Vec<Argument>,
}

/// Positional (`name: None`) or keyword argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Argument {
    pub name: Option<String>,
    pub value: Expr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Literal(Literal),
    /// `{{name}}` with the delimiters stripped.
    Var(String),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Call(CallExpr),
    /// Text the expression grammar could not make sense of.
    Unparsed {
        raw: String,
        reason: String,
    },
}

impl Expr {
    /// Visit this expression and its sub-expressions, parents first, left to right.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Expr)) {
        f(self);
        match self {
            Expr::Literal(_) | Expr::Var(_) | Expr::Unparsed { .. } => {}
            Expr::List(items) => items.iter().for_each(|e| e.visit(f)),
            Expr::Dict(entries) => {
                for (k, v) in entries {
                    k.visit(f);
                    v.visit(f);
                }
            }
            Expr::Unary { operand, .. } => operand.visit(f),
            Expr::Binary { left, right, .. } => {
                left.visit(f);
                right.visit(f);
            }
            Expr::Call(call) => {
                for arg in &call.arguments {
                    arg.value.visit(f);
                }
            }
        }
    }

    /// Rewrite every variable reference in place.
    pub fn map_vars(&mut self, f: &mut impl FnMut(&mut String)) {
        match self {
            Expr::Var(name) => f(name),
            Expr::Literal(_) | Expr::Unparsed { .. } => {}
            Expr::List(items) => items.iter_mut().for_each(|e| e.map_vars(f)),
            Expr::Dict(entries) => {
                for (k, v) in entries {
                    k.map_vars(f);
                    v.map_vars(f);
                }
            }
            Expr::Unary { operand, .. } => operand.map_vars(f),
            Expr::Binary { left, right, .. } => {
                left.map_vars(f);
                right.map_vars(f);
            }
            Expr::Call(call) => {
                for arg in &mut call.arguments {
                    arg.value.map_vars(f);
                }
            }
        }
    }

    /// Variable names referenced, in first-appearance order, duplicates kept.
    pub fn variables(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.visit(&mut |e| {
            if let Expr::Var(name) = e {
                out.push(name.as_str());
            }
        });
        out
    }

    pub fn contains_call(&self) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= matches!(e, Expr::Call(_)));
        found
    }

    /// True for literals and list/dict displays built only from literals.
    pub fn is_constant(&self) -> bool {
        match self {
            Expr::Literal(_) => true,
            Expr::List(items) => items.iter().all(Expr::is_constant),
            Expr::Dict(entries) => entries.iter().all(|(k, v)| k.is_constant() && v.is_constant()),
            Expr::Unary { op: UnaryOp::Neg, operand } => {
                matches!(**operand, Expr::Literal(Literal::Int(_) | Literal::Float(_)))
            }
            _ => false,
        }
    }

    /// Static type when it is evident from the expression alone.
    pub fn literal_type(&self) -> Option<VarType> {
        match self {
            Expr::Literal(Literal::None) => None,
            Expr::Literal(lit) => Some(lit.var_type()),
            Expr::List(_) => Some(VarType::List),
            Expr::Dict(_) => Some(VarType::Dict),
            Expr::Unary { op: UnaryOp::Neg, operand } => operand.literal_type(),
            Expr::Unary { op: UnaryOp::Not, .. } => Some(VarType::Boolean),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElifBranch {
    pub condition: Expr,
    pub body: Vec<Stmt>,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: SourceSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StmtKind {
    /// `DEFINE {{name}}: Type [= expr]`
    Define {
        name: String,
        ty: VarType,
        initial_value: Option<Expr>,
    },
    /// `{{target}} = expr`
    Assign { target: String, expression: Expr },
    /// `CALL f(args)` or `{{x}} = CALL f(args)`
    Call {
        result_binding: Option<String>,
        call: CallExpr,
    },
    /// `IF cond ... [ELIF cond ...]* [ELSE ...] ENDIF`
    ///
    /// `closed` is false when the source never closed the block; the parser
    /// closes it at end of input and repair relocates the close.
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        elif_branches: Vec<ElifBranch>,
        else_branch: Option<Vec<Stmt>>,
        closed: bool,
    },
    /// `FOR {{v}} IN expr ... ENDFOR`
    For {
        loop_var: String,
        iterable: Expr,
        body: Vec<Stmt>,
        closed: bool,
    },
    /// `WHILE cond ... ENDWHILE`
    While {
        condition: Expr,
        body: Vec<Stmt>,
        closed: bool,
    },
    /// `RETURN [expr]`
    Return { expression: Option<Expr> },
}

impl Stmt {
    pub fn new(kind: StmtKind, span: SourceSpan) -> Self {
        Self { kind, span }
    }

    pub fn is_block(&self) -> bool {
        matches!(
            self.kind,
            StmtKind::If { .. } | StmtKind::For { .. } | StmtKind::While { .. }
        )
    }

    /// Opening keyword of a block statement.
    pub fn block_keyword(&self) -> Option<&'static str> {
        match self.kind {
            StmtKind::If { .. } => Some("IF"),
            StmtKind::For { .. } => Some("FOR"),
            StmtKind::While { .. } => Some("WHILE"),
            _ => None,
        }
    }

    /// Expressions evaluated on this statement's own line, with that line's span.
    /// `ELIF` conditions carry their own span.
    pub fn own_exprs(&self) -> Vec<(SourceSpan, &Expr)> {
        match &self.kind {
            StmtKind::Define { initial_value, .. } => {
                initial_value.iter().map(|e| (self.span, e)).collect()
            }
            StmtKind::Assign { expression, .. } => vec![(self.span, expression)],
            StmtKind::Call { .. } => Vec::new(),
            StmtKind::If {
                condition,
                elif_branches,
                ..
            } => {
                let mut out = vec![(self.span, condition)];
                out.extend(elif_branches.iter().map(|b| (b.span, &b.condition)));
                out
            }
            StmtKind::For { iterable, .. } => vec![(self.span, iterable)],
            StmtKind::While { condition, .. } => vec![(self.span, condition)],
            StmtKind::Return { expression } => {
                expression.iter().map(|e| (self.span, e)).collect()
            }
        }
    }

    /// Variables read on this statement's own line, call arguments included.
    pub fn own_reads(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let StmtKind::Call { call, .. } = &self.kind {
            for arg in &call.arguments {
                out.extend(arg.value.variables());
            }
        }
        for (_, expr) in self.own_exprs() {
            out.extend(expr.variables());
        }
        out
    }

    /// Variable assigned by this statement, loop variables excluded.
    pub fn own_write(&self) -> Option<&str> {
        match &self.kind {
            StmtKind::Define { name, .. } => Some(name),
            StmtKind::Assign { target, .. } => Some(target),
            StmtKind::Call { result_binding, .. } => result_binding.as_deref(),
            _ => None,
        }
    }

    /// Nested statement lists, in source order.
    pub fn blocks(&self) -> Vec<&Vec<Stmt>> {
        match &self.kind {
            StmtKind::If {
                then_branch,
                elif_branches,
                else_branch,
                ..
            } => {
                let mut out = vec![then_branch];
                out.extend(elif_branches.iter().map(|b| &b.body));
                out.extend(else_branch.iter());
                out
            }
            StmtKind::For { body, .. } | StmtKind::While { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    pub fn blocks_mut(&mut self) -> Vec<&mut Vec<Stmt>> {
        match &mut self.kind {
            StmtKind::If {
                then_branch,
                elif_branches,
                else_branch,
                ..
            } => {
                let mut out = vec![then_branch];
                out.extend(elif_branches.iter_mut().map(|b| &mut b.body));
                out.extend(else_branch.iter_mut());
                out
            }
            StmtKind::For { body, .. } | StmtKind::While { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    /// Rewrite every variable name slot: definitions, targets, bindings,
    /// loop variables and references, recursively.
    pub fn map_names(&mut self, f: &mut impl FnMut(&mut String)) {
        self.map_own_names(f);
        for block in self.blocks_mut() {
            for stmt in block.iter_mut() {
                stmt.map_names(f);
            }
        }
    }

    /// Like `map_names`, but only the slots on this statement's own line.
    /// Reads are visited before the written name.
    pub fn map_own_names(&mut self, f: &mut impl FnMut(&mut String)) {
        match &mut self.kind {
            StmtKind::Define {
                name,
                initial_value,
                ..
            } => {
                if let Some(e) = initial_value {
                    e.map_vars(f);
                }
                f(name);
            }
            StmtKind::Assign { target, expression } => {
                expression.map_vars(f);
                f(target);
            }
            StmtKind::Call {
                result_binding,
                call,
            } => {
                for arg in &mut call.arguments {
                    arg.value.map_vars(f);
                }
                if let Some(b) = result_binding {
                    f(b);
                }
            }
            StmtKind::If {
                condition,
                elif_branches,
                ..
            } => {
                condition.map_vars(f);
                for b in elif_branches.iter_mut() {
                    b.condition.map_vars(f);
                }
            }
            StmtKind::For {
                loop_var, iterable, ..
            } => {
                iterable.map_vars(f);
                f(loop_var);
            }
            StmtKind::While { condition, .. } => condition.map_vars(f),
            StmtKind::Return { expression } => {
                if let Some(e) = expression {
                    e.map_vars(f);
                }
            }
        }
    }

    /// Call sites on this statement's own line in visiting order. The
    /// `(span, ordinal)` pair identifies a call site across passes.
    pub fn own_calls(&self) -> Vec<(SourceSpan, usize, &CallExpr)> {
        let mut found: Vec<(SourceSpan, &CallExpr)> = Vec::new();
        if let StmtKind::Call { call, .. } = &self.kind {
            found.push((self.span, call));
            let mut nested = Vec::new();
            for arg in &call.arguments {
                collect_calls(&arg.value, &mut nested);
            }
            found.extend(nested.into_iter().map(|c| (self.span, c)));
        }
        for (span, expr) in self.own_exprs() {
            let mut nested = Vec::new();
            collect_calls(expr, &mut nested);
            found.extend(nested.into_iter().map(|c| (span, c)));
        }

        let mut out = Vec::with_capacity(found.len());
        for (i, &(span, call)) in found.iter().enumerate() {
            let ordinal = found.iter().take(i).filter(|(s, _)| *s == span).count();
            out.push((span, ordinal, call));
        }
        out
    }
}

fn collect_calls<'a>(expr: &'a Expr, out: &mut Vec<&'a CallExpr>) {
    expr.visit(&mut |e| {
        if let Expr::Call(c) = e {
            out.push(c);
        }
    });
}

/// Depth-first walk over a statement list; `depth` is 0 for top-level statements.
pub fn walk<'a>(stmts: &'a [Stmt], depth: usize, f: &mut impl FnMut(&'a Stmt, usize)) {
    for stmt in stmts {
        f(stmt, depth);
        for block in stmt.blocks() {
            walk(block, depth + 1, f);
        }
    }
}

/// True if any statement in the tree is a `RETURN`.
pub fn contains_return(stmts: &[Stmt]) -> bool {
    let mut found = false;
    walk(stmts, 0, &mut |s, _| {
        found |= matches!(s.kind, StmtKind::Return { .. });
    });
    found
}

pub fn contains_call(stmts: &[Stmt]) -> bool {
    let mut found = false;
    walk(stmts, 0, &mut |s, _| {
        found |= !s.own_calls().is_empty();
    });
    found
}
