//! Line lexer. The DSL is line-oriented, so tokens never span lines and
//! lexing a line cannot fail: anything unrecognized becomes `Token::Unknown`
//! and is reported later by the expression parser.

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    None,

    /// `{{name}}`, delimiters stripped and inner whitespace trimmed.
    VarRef(String),
    /// Bare word that is not a keyword (function names, type names, kwargs).
    Ident(String),

    // Statement keywords
    Define,
    Call,
    If,
    Elif,
    Else,
    EndIf,
    For,
    EndFor,
    While,
    EndWhile,
    Return,

    // Word operators
    And,
    Or,
    Not,
    In,

    // Punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,   // =
    EqEq, // ==
    Ne,   // !=
    Lt,
    Gt,
    Le, // <=
    Ge, // >=

    Unknown(char),
}

impl Token {
    /// Source-like rendering for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Token::Int(n) => n.to_string(),
            Token::Float(x) => x.to_string(),
            Token::Str(s) => format!("\"{s}\""),
            Token::VarRef(n) => format!("{{{{{n}}}}}"),
            Token::Ident(n) => n.clone(),
            Token::Unknown(c) => c.to_string(),
            other => other.fixed_text().to_string(),
        }
    }

    fn fixed_text(&self) -> &'static str {
        match self {
            Token::True => "True",
            Token::False => "False",
            Token::None => "None",
            Token::Define => "DEFINE",
            Token::Call => "CALL",
            Token::If => "IF",
            Token::Elif => "ELIF",
            Token::Else => "ELSE",
            Token::EndIf => "ENDIF",
            Token::For => "FOR",
            Token::EndFor => "ENDFOR",
            Token::While => "WHILE",
            Token::EndWhile => "ENDWHILE",
            Token::Return => "RETURN",
            Token::And => "AND",
            Token::Or => "OR",
            Token::Not => "NOT",
            Token::In => "IN",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Eq => "=",
            Token::EqEq => "==",
            Token::Ne => "!=",
            Token::Lt => "<",
            Token::Gt => ">",
            Token::Le => "<=",
            Token::Ge => ">=",
            Token::Int(_)
            | Token::Float(_)
            | Token::Str(_)
            | Token::VarRef(_)
            | Token::Ident(_)
            | Token::Unknown(_) => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpannedToken {
    pub token: Token,
    /// Byte offset of the token within its line.
    pub offset: usize,
}

/// Lex a single line (without its newline).
pub fn lex_line(line: &str) -> Vec<SpannedToken> {
    let mut lexer = Lexer::new(line);
    lexer.tokenize();
    lexer.tokens
}

/// Indentation width of a line, tabs counting as four columns.
pub fn indentation(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .map(|c| if c == '\t' { 4 } else { 1 })
        .sum()
}

struct Lexer<'a> {
    source: &'a str,
    pos: usize,
    tokens: Vec<SpannedToken>,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            pos: 0,
            tokens: Vec::new(),
        }
    }

    fn rest(&self) -> &'a str {
        self.source.get(self.pos..).unwrap_or("")
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn push(&mut self, token: Token, start: usize) {
        self.tokens.push(SpannedToken {
            token,
            offset: start,
        });
    }

    fn tokenize(&mut self) {
        while let Some(ch) = self.peek() {
            let start = self.pos;
            if ch.is_whitespace() {
                self.pos += ch.len_utf8();
                continue;
            }
            let rest = self.rest();

            if rest.starts_with("{{") {
                self.lex_var_ref();
                continue;
            }

            let two = match rest.get(..2) {
                Some("==") => Some(Token::EqEq),
                Some("!=") => Some(Token::Ne),
                Some("<=") => Some(Token::Le),
                Some(">=") => Some(Token::Ge),
                _ => None,
            };
            if let Some(tok) = two {
                self.pos += 2;
                self.push(tok, start);
                continue;
            }

            let single = match ch {
                '(' => Some(Token::LParen),
                ')' => Some(Token::RParen),
                '[' => Some(Token::LBracket),
                ']' => Some(Token::RBracket),
                '{' => Some(Token::LBrace),
                '}' => Some(Token::RBrace),
                ',' => Some(Token::Comma),
                ':' => Some(Token::Colon),
                '+' => Some(Token::Plus),
                '-' => Some(Token::Minus),
                '*' => Some(Token::Star),
                '/' => Some(Token::Slash),
                '%' => Some(Token::Percent),
                '=' => Some(Token::Eq),
                '<' => Some(Token::Lt),
                '>' => Some(Token::Gt),
                _ => None,
            };
            if let Some(tok) = single {
                self.pos += 1;
                self.push(tok, start);
                continue;
            }

            match ch {
                '"' | '\'' => self.lex_string(ch),
                c if c.is_ascii_digit() => self.lex_number(),
                c if c.is_alphabetic() || c == '_' => self.lex_word(),
                other => {
                    self.pos += other.len_utf8();
                    self.push(Token::Unknown(other), start);
                }
            }
        }
    }

    fn lex_var_ref(&mut self) {
        let start = self.pos;
        let body_start = start + 2;
        let body = self.source.get(body_start..).unwrap_or("");
        if let Some(end) = body.find("}}") {
            let name = body.get(..end).unwrap_or("").trim().to_string();
            self.pos = body_start + end + 2;
            self.push(Token::VarRef(name), start);
        } else {
            // Unterminated: keep the brace as an unknown token and move on.
            self.pos += 1;
            self.push(Token::Unknown('{'), start);
        }
    }

    fn lex_number(&mut self) {
        let start = self.pos;
        let rest = self.rest();
        let mut len = rest.chars().take_while(char::is_ascii_digit).count();
        let mut is_float = false;
        let after = rest.get(len..).unwrap_or("");
        if after.starts_with('.') && after.chars().nth(1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            len += 1 + after.chars().skip(1).take_while(char::is_ascii_digit).count();
        }
        let text = rest.get(..len).unwrap_or("");
        self.pos += len;
        let float = || text.parse::<f64>().ok().filter(|x| x.is_finite());
        let token = if is_float {
            float().map_or(Token::Unknown('.'), Token::Float)
        } else {
            // Out-of-range integers degrade to floats rather than failing.
            text.parse::<i64>()
                .map(Token::Int)
                .unwrap_or_else(|_| float().map_or(Token::Unknown('0'), Token::Float))
        };
        self.push(token, start);
    }

    fn lex_word(&mut self) {
        let start = self.pos;
        let word: String = self
            .rest()
            .chars()
            .take_while(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        self.pos += word.len();
        let token = match word.as_str() {
            "DEFINE" => Token::Define,
            "CALL" => Token::Call,
            "IF" => Token::If,
            "ELIF" | "ELSEIF" => Token::Elif,
            "ELSE" => Token::Else,
            "ENDIF" => Token::EndIf,
            "FOR" => Token::For,
            "ENDFOR" => Token::EndFor,
            "WHILE" => Token::While,
            "ENDWHILE" => Token::EndWhile,
            "RETURN" => Token::Return,
            "AND" | "and" => Token::And,
            "OR" | "or" => Token::Or,
            "NOT" | "not" => Token::Not,
            "IN" | "in" => Token::In,
            "True" | "TRUE" | "true" => Token::True,
            "False" | "FALSE" | "false" => Token::False,
            "None" | "NONE" | "null" => Token::None,
            _ => Token::Ident(word),
        };
        self.push(token, start);
    }

    fn lex_string(&mut self, quote: char) {
        let start = self.pos;
        self.pos += 1;
        let mut value = String::new();
        let mut chars = self.rest().chars();
        let mut consumed = 0;
        let mut terminated = false;
        while let Some(c) = chars.next() {
            consumed += c.len_utf8();
            if c == quote {
                terminated = true;
                break;
            }
            if c == '\\' {
                if let Some(esc) = chars.next() {
                    consumed += esc.len_utf8();
                    value.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                continue;
            }
            value.push(c);
        }
        self.pos += consumed;
        if terminated {
            self.push(Token::Str(value), start);
        } else {
            self.push(Token::Unknown(quote), start);
        }
    }
}
