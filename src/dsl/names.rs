//! Identifier legality and sanitization, shared by the validator, the
//! repair engine and the code synthesizer.

use std::collections::HashSet;

/// Python keywords plus the names generated code reserves for itself.
pub const RESERVED_WORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield", "match", "case",
    // globals the generated step functions rely on
    "invoke_function", "as_bool", "asyncio",
];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_WORDS.contains(&name)
}

fn is_legal_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Why `name` is not a legal identifier, or `None` if it is.
pub fn check(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        Some("is empty")
    } else if name.starts_with(|c: char| c.is_ascii_digit()) {
        Some("starts with a digit")
    } else if !name.chars().all(is_legal_char) {
        Some("contains illegal characters")
    } else if is_reserved(name) {
        Some("is a reserved word")
    } else {
        None
    }
}

pub fn is_valid(name: &str) -> bool {
    check(name).is_none()
}

/// Map any name onto a legal identifier. Legal names map to themselves.
///
/// Spaces and dashes become underscores, other illegal characters are
/// dropped, and a leading digit or a reserved word gets a `_` prefix.
pub fn sanitize(name: &str) -> String {
    let mut out: String = name
        .trim()
        .chars()
        .filter_map(|c| match c {
            ' ' | '-' | '.' => Some('_'),
            c if is_legal_char(c) => Some(c),
            _ => None,
        })
        .collect();
    if out.is_empty() {
        return "_var".to_string();
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) || is_reserved(&out) {
        out.insert(0, '_');
    }
    out
}

/// Lower-case slug for generated function names.
pub fn function_slug(name: &str) -> String {
    sanitize(&name.to_lowercase())
}

/// Names taken within one analysis or repair run. Hands out `name`,
/// `name_2`, `name_3`, ... without consulting any shared state.
#[derive(Debug, Default, Clone)]
pub struct NameResolutionContext {
    taken: HashSet<String>,
}

impl NameResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_taken<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            taken: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn reserve(&mut self, name: &str) {
        self.taken.insert(name.to_string());
    }

    pub fn is_taken(&self, name: &str) -> bool {
        self.taken.contains(name)
    }

    /// First free name among `base`, `base_2`, `base_3`, ...; reserves it.
    pub fn fresh(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.taken.contains(&candidate) {
            candidate = format!("{base}_{n}");
            n += 1;
        }
        self.taken.insert(candidate.clone());
        candidate
    }

    /// First free suffixed name, never `base` itself.
    pub fn fresh_suffixed(&mut self, base: &str) -> String {
        self.reserve(base);
        self.fresh(base)
    }
}
