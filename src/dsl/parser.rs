use super::ast::*;
use super::error::{normalize, Defect, DefectKind};
use super::lexer::{indentation, lex_line, SpannedToken, Token};

/// Parse DSL text into a statement tree plus the defects found while parsing.
///
/// Never fails: unclosed blocks are closed at end of input (and flagged),
/// stray closes and malformed lines are reported and skipped, and expressions
/// the grammar cannot handle are kept as `Expr::Unparsed`.
pub fn parse(source: &str) -> (Vec<Stmt>, Vec<Defect>) {
    let mut parser = Parser::new();
    for (idx, line) in source.lines().enumerate() {
        parser.parse_line(idx + 1, line);
    }
    parser.finish()
}

/// An open block waiting for its close keyword.
enum Frame {
    If {
        span: SourceSpan,
        condition: Expr,
        then_branch: Vec<Stmt>,
        elif_branches: Vec<ElifBranch>,
        else_branch: Option<Vec<Stmt>>,
    },
    For {
        span: SourceSpan,
        loop_var: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },
    While {
        span: SourceSpan,
        condition: Expr,
        body: Vec<Stmt>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    If,
    For,
    While,
}

impl BlockKind {
    fn open_keyword(self) -> &'static str {
        match self {
            Self::If => "IF",
            Self::For => "FOR",
            Self::While => "WHILE",
        }
    }

    fn close_keyword(self) -> &'static str {
        match self {
            Self::If => "ENDIF",
            Self::For => "ENDFOR",
            Self::While => "ENDWHILE",
        }
    }
}

impl Frame {
    fn kind(&self) -> BlockKind {
        match self {
            Frame::If { .. } => BlockKind::If,
            Frame::For { .. } => BlockKind::For,
            Frame::While { .. } => BlockKind::While,
        }
    }

    fn span(&self) -> SourceSpan {
        match self {
            Frame::If { span, .. } | Frame::For { span, .. } | Frame::While { span, .. } => *span,
        }
    }

    /// Statement list new statements are appended to.
    fn target(&mut self) -> &mut Vec<Stmt> {
        match self {
            Frame::If {
                then_branch,
                elif_branches,
                else_branch,
                ..
            } => {
                if let Some(body) = else_branch {
                    body
                } else if let Some(last) = elif_branches.last_mut() {
                    &mut last.body
                } else {
                    then_branch
                }
            }
            Frame::For { body, .. } | Frame::While { body, .. } => body,
        }
    }

    fn into_stmt(self, closed: bool) -> Stmt {
        match self {
            Frame::If {
                span,
                condition,
                then_branch,
                elif_branches,
                else_branch,
            } => Stmt::new(
                StmtKind::If {
                    condition,
                    then_branch,
                    elif_branches,
                    else_branch,
                    closed,
                },
                span,
            ),
            Frame::For {
                span,
                loop_var,
                iterable,
                body,
            } => Stmt::new(
                StmtKind::For {
                    loop_var,
                    iterable,
                    body,
                    closed,
                },
                span,
            ),
            Frame::While {
                span,
                condition,
                body,
            } => Stmt::new(
                StmtKind::While {
                    condition,
                    body,
                    closed,
                },
                span,
            ),
        }
    }
}

struct Parser {
    stack: Vec<Frame>,
    root: Vec<Stmt>,
    defects: Vec<Defect>,
}

impl Parser {
    fn new() -> Self {
        Self {
            stack: Vec::new(),
            root: Vec::new(),
            defects: Vec::new(),
        }
    }

    fn finish(mut self) -> (Vec<Stmt>, Vec<Defect>) {
        while let Some(frame) = self.stack.pop() {
            self.defects
                .push(Defect::unclosed(frame.span(), frame.kind().open_keyword()));
            let stmt = frame.into_stmt(false);
            self.push_stmt(stmt);
        }
        normalize(&mut self.defects);
        (self.root, self.defects)
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        match self.stack.last_mut() {
            Some(frame) => frame.target().push(stmt),
            None => self.root.push(stmt),
        }
    }

    fn malformed(&mut self, span: SourceSpan, message: impl Into<String>) {
        self.defects
            .push(Defect::error(DefectKind::MalformedStatement, span, message));
    }

    fn note_unparsed(&mut self, span: SourceSpan, expr: &Expr) {
        expr.visit(&mut |e| {
            if let Expr::Unparsed { raw, reason } = e {
                self.defects.push(Defect::unparsable(span, raw, reason));
            }
        });
    }

    /// Parse an expression and record any part of it the grammar rejected.
    fn expr(&mut self, span: SourceSpan, tokens: &[SpannedToken], line: &str) -> Expr {
        let expr = parse_expression(tokens, line);
        self.note_unparsed(span, &expr);
        expr
    }

    fn parse_line(&mut self, line_no: usize, line: &str) {
        let text = line.trim();
        if text.is_empty() || text.starts_with('#') {
            return;
        }
        let span = SourceSpan::new(line_no, indentation(line) + 1);
        let lexed = lex_line(line);
        let tokens: &[SpannedToken] = &lexed;
        let rest = move |n: usize| tokens.get(n..).unwrap_or(&[]);

        match tokens.first().map(|t| &t.token) {
            Some(Token::Define) => self.parse_define(span, tokens, line),
            Some(Token::Call) => match parse_expression(tokens, line) {
                Expr::Call(call) => self.push_stmt(Stmt::new(
                    StmtKind::Call {
                        result_binding: None,
                        call,
                    },
                    span,
                )),
                Expr::Unparsed { raw, reason } => {
                    self.defects.push(Defect::unparsable(span, &raw, &reason));
                }
                _ => self.defects.push(Defect::unparsable(
                    span,
                    text,
                    "a CALL statement must be a single call",
                )),
            },
            Some(Token::VarRef(target))
                if matches!(tokens.get(1).map(|t| &t.token), Some(Token::Eq)) =>
            {
                let target = target.clone();
                let kind = match self.expr(span, rest(2), line) {
                    Expr::Call(call) => StmtKind::Call {
                        result_binding: Some(target),
                        call,
                    },
                    expression => StmtKind::Assign { target, expression },
                };
                self.push_stmt(Stmt::new(kind, span));
            }
            Some(Token::If) => {
                let condition = self.expr(span, condition_tokens(rest(1)), line);
                self.stack.push(Frame::If {
                    span,
                    condition,
                    then_branch: Vec::new(),
                    elif_branches: Vec::new(),
                    else_branch: None,
                });
            }
            Some(Token::Elif) => self.parse_elif(span, rest(1), line),
            Some(Token::Else) => self.parse_else(span),
            Some(Token::EndIf) => self.close(span, BlockKind::If),
            Some(Token::For) => self.parse_for(span, tokens, line),
            Some(Token::EndFor) => self.close(span, BlockKind::For),
            Some(Token::While) => {
                let condition = self.expr(span, condition_tokens(rest(1)), line);
                self.stack.push(Frame::While {
                    span,
                    condition,
                    body: Vec::new(),
                });
            }
            Some(Token::EndWhile) => self.close(span, BlockKind::While),
            Some(Token::Return) => {
                let expression = if tokens.len() == 1 {
                    None
                } else {
                    Some(self.expr(span, rest(1), line))
                };
                self.push_stmt(Stmt::new(StmtKind::Return { expression }, span));
            }
            _ => self.malformed(span, format!("unrecognized statement `{text}`")),
        }
    }

    fn parse_define(&mut self, span: SourceSpan, tokens: &[SpannedToken], line: &str) {
        let head: Vec<&Token> = tokens.iter().take(4).map(|t| &t.token).collect();
        let (name, type_name) = match head.as_slice() {
            [Token::Define, Token::VarRef(name), Token::Colon, Token::Ident(ty)] => (name, ty),
            _ => {
                self.malformed(span, "DEFINE expects `DEFINE {{name}}: Type [= value]`");
                return;
            }
        };
        let Some(ty) = VarType::from_name(type_name) else {
            self.malformed(span, format!("unknown type `{type_name}` for `{name}`"));
            return;
        };
        let name = name.clone();
        let initial_value = match tokens.get(4..).unwrap_or(&[]) {
            [] => None,
            [eq, value @ ..] if eq.token == Token::Eq => Some(self.expr(span, value, line)),
            _ => {
                self.malformed(span, format!("expected `=` after the type of `{name}`"));
                return;
            }
        };
        self.push_stmt(Stmt::new(
            StmtKind::Define {
                name,
                ty,
                initial_value,
            },
            span,
        ));
    }

    fn parse_for(&mut self, span: SourceSpan, tokens: &[SpannedToken], line: &str) {
        let loop_var = match (tokens.get(1).map(|t| &t.token), tokens.get(2).map(|t| &t.token)) {
            (Some(Token::VarRef(v)), Some(Token::In)) => v.clone(),
            _ => {
                self.malformed(span, "FOR expects `FOR {{item}} IN expression`");
                return;
            }
        };
        let iterable = self.expr(span, condition_tokens(tokens.get(3..).unwrap_or(&[])), line);
        self.stack.push(Frame::For {
            span,
            loop_var,
            iterable,
            body: Vec::new(),
        });
    }

    fn parse_elif(&mut self, span: SourceSpan, tokens: &[SpannedToken], line: &str) {
        let condition = self.expr(span, condition_tokens(tokens), line);
        match self.stack.last_mut() {
            Some(Frame::If {
                elif_branches,
                else_branch: None,
                ..
            }) => elif_branches.push(ElifBranch {
                condition,
                body: Vec::new(),
                span,
            }),
            Some(Frame::If { .. }) => self.malformed(span, "ELIF after ELSE"),
            _ => self.defects.push(Defect::error(
                DefectKind::UnexpectedClose,
                span,
                "ELIF without matching IF",
            )),
        }
    }

    fn parse_else(&mut self, span: SourceSpan) {
        match self.stack.last_mut() {
            Some(Frame::If { else_branch, .. }) if else_branch.is_none() => {
                *else_branch = Some(Vec::new());
            }
            Some(Frame::If { .. }) => self.malformed(span, "duplicate ELSE"),
            _ => self.defects.push(Defect::error(
                DefectKind::UnexpectedClose,
                span,
                "ELSE without matching IF",
            )),
        }
    }

    /// Pop the innermost block if `kind` closes it; otherwise report the
    /// stray close and leave the stack untouched.
    fn close(&mut self, span: SourceSpan, kind: BlockKind) {
        match self.stack.last() {
            Some(frame) if frame.kind() == kind => {
                if let Some(frame) = self.stack.pop() {
                    let stmt = frame.into_stmt(true);
                    self.push_stmt(stmt);
                }
            }
            Some(frame) => {
                let message = format!(
                    "{} does not match the {} opened on line {}",
                    kind.close_keyword(),
                    frame.kind().open_keyword(),
                    frame.span().line,
                );
                self.defects
                    .push(Defect::error(DefectKind::UnexpectedClose, span, message));
            }
            None => self.defects.push(Defect::error(
                DefectKind::UnexpectedClose,
                span,
                format!(
                    "{} without matching {}",
                    kind.close_keyword(),
                    kind.open_keyword()
                ),
            )),
        }
    }
}

/// Drop an optional trailing `:` or `THEN` from a block header.
fn condition_tokens(tokens: &[SpannedToken]) -> &[SpannedToken] {
    match tokens.split_last() {
        Some((last, init)) if last.token == Token::Colon => init,
        Some((last, init)) if last.token == Token::Ident("THEN".to_string()) => init,
        _ => tokens,
    }
}

// ── Expressions ────────────────────────────────────────────────────

/// Parse a full expression. Anything the grammar rejects, including
/// trailing tokens, becomes `Expr::Unparsed` with the raw text preserved.
pub fn parse_expression(tokens: &[SpannedToken], line: &str) -> Expr {
    let raw = tokens
        .first()
        .and_then(|t| line.get(t.offset..))
        .unwrap_or("")
        .trim()
        .to_string();
    if tokens.is_empty() {
        return Expr::Unparsed {
            raw,
            reason: "missing expression".to_string(),
        };
    }
    let mut parser = ExprParser { tokens, pos: 0 };
    match parser.parse_or() {
        Ok(expr) if parser.at_end() => expr,
        Ok(_) => Expr::Unparsed {
            raw,
            reason: format!("unexpected `{}`", parser.peek_describe()),
        },
        Err(reason) => Expr::Unparsed { raw, reason },
    }
}

struct ExprParser<'t> {
    tokens: &'t [SpannedToken],
    pos: usize,
}

impl<'t> ExprParser<'t> {
    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn peek_at(&self, ahead: usize) -> Option<&'t Token> {
        self.tokens.get(self.pos + ahead).map(|t| &t.token)
    }

    fn peek_describe(&self) -> String {
        self.peek().map_or_else(|| "end of line".to_string(), Token::describe)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn advance(&mut self) -> Option<&'t Token> {
        let tok = self.peek();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.peek() == Some(expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!(
                "expected `{}`, found `{}`",
                expected.describe(),
                self.peek_describe()
            ))
        }
    }

    fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.parse_and()?;
            left = Self::binary(BinOp::Or, left, right);
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.parse_not()?;
            left = Self::binary(BinOp::And, left, right);
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Ge) => BinOp::Ge,
                Some(Token::In) => BinOp::In,
                Some(Token::Not) if self.peek_at(1) == Some(&Token::In) => {
                    self.pos += 1;
                    BinOp::NotIn
                }
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_additive()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_unary()?;
            left = Self::binary(op, left, right);
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                let operand = self.parse_unary()?;
                Ok(Expr::Unary {
                    op: UnaryOp::Neg,
                    operand: Box::new(operand),
                })
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.parse_unary()
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        let Some(token) = self.advance() else {
            return Err("unexpected end of expression".to_string());
        };
        match token {
            Token::Int(n) => Ok(Expr::Literal(Literal::Int(*n))),
            Token::Float(x) => Ok(Expr::Literal(Literal::Float(*x))),
            Token::Str(s) => Ok(Expr::Literal(Literal::Str(s.clone()))),
            Token::True => Ok(Expr::Literal(Literal::Bool(true))),
            Token::False => Ok(Expr::Literal(Literal::Bool(false))),
            Token::None => Ok(Expr::Literal(Literal::None)),
            Token::VarRef(name) => Ok(Expr::Var(name.clone())),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                while self.peek() != Some(&Token::RBracket) {
                    items.push(self.parse_or()?);
                    if self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                self.expect(&Token::RBracket)?;
                Ok(Expr::List(items))
            }
            Token::LBrace => {
                let mut entries = Vec::new();
                while self.peek() != Some(&Token::RBrace) {
                    let key = self.parse_or()?;
                    self.expect(&Token::Colon)?;
                    let value = self.parse_or()?;
                    entries.push((key, value));
                    if self.peek() == Some(&Token::Comma) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                self.expect(&Token::RBrace)?;
                Ok(Expr::Dict(entries))
            }
            Token::Call => match self.advance() {
                Some(Token::Ident(name)) => self.parse_call_tail(name.clone()),
                Some(other) => Err(format!("expected a function name after CALL, found `{}`", other.describe())),
                None => Err("expected a function name after CALL".to_string()),
            },
            Token::Ident(name) => Err(format!("bare identifier `{name}` (variables are written `{{{{{name}}}}}`)")),
            Token::Unknown(c) => Err(format!("unexpected character `{c}`")),
            other => Err(format!("unexpected `{}`", other.describe())),
        }
    }

    fn parse_call_tail(&mut self, function_name: String) -> Result<Expr, String> {
        self.expect(&Token::LParen)?;
        let mut arguments = Vec::new();
        while self.peek() != Some(&Token::RParen) {
            let name = match (self.peek(), self.peek_at(1)) {
                (Some(Token::Ident(kw)), Some(Token::Eq)) => {
                    self.pos += 2;
                    Some(kw.clone())
                }
                _ => None,
            };
            let value = self.parse_or()?;
            arguments.push(Argument { name, value });
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            } else {
                break;
            }
        }
        self.expect(&Token::RParen)?;
        Ok(Expr::Call(CallExpr {
            function_name,
            arguments,
        }))
    }
}
