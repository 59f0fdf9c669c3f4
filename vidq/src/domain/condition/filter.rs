//! Match filter expressions evaluated against extractor metadata.
//!
//! The syntax follows yt-dlp's `--match-filter`:
//! - `field` passes when the field is present and not `false`; `!field` is the inverse.
//! - `field OP value` compares, with `OP` one of `= != < <= > >= ~= *= ^= $=`.
//!   A `?` after the operator lets the clause pass when the field is missing.
//! - Clauses are joined with `&`; alternatives with `||`.
//!
//! Numeric values accept decimal (`k`, `M`, `G`, `T`) and binary (`Ki`, `Mi`, ...) suffixes,
//! optionally followed by `B`.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

/// Error type for filter parsing failures.
#[derive(Debug, thiserror::Error)]
pub enum FilterParseError {
    #[error("Empty clause in filter: {0}")]
    EmptyClause(String),

    #[error("Invalid clause: {0}")]
    InvalidClause(String),

    #[error("Unterminated quote in filter: {0}")]
    UnterminatedQuote(String),

    #[error("Invalid regex pattern {pattern}: {message}")]
    InvalidRegex { pattern: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Matches,
    Contains,
    StartsWith,
    EndsWith,
}

impl Op {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "=" => Self::Eq,
            "!=" => Self::Ne,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "~=" => Self::Matches,
            "*=" => Self::Contains,
            "^=" => Self::StartsWith,
            "$=" => Self::EndsWith,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
enum Clause {
    Truthy(String),
    Falsy(String),
    Compare {
        field: String,
        op: Op,
        text: String,
        number: Option<f64>,
        regex: Option<Regex>,
        missing_passes: bool,
    },
}

fn comparison_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?P<key>[A-Za-z0-9_.]+)\s*(?P<op><=|>=|!=|~=|\*=|\^=|\$=|=|<|>)(?P<none>\?)?\s*(?P<value>.*)$",
        )
        .unwrap()
    })
}

fn unary_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?P<neg>!)?\s*(?P<key>[A-Za-z0-9_.]+)$").unwrap())
}

/// A compiled match filter.
#[derive(Debug, Clone)]
pub struct MatchFilter {
    source: String,
    alternatives: Vec<Vec<Clause>>,
}

impl MatchFilter {
    /// Parse a filter expression. An empty expression matches everything.
    pub fn parse(source: &str) -> Result<Self, FilterParseError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Ok(Self {
                source: String::new(),
                alternatives: vec![Vec::new()],
            });
        }

        let mut alternatives = Vec::new();
        for alternative in split_unquoted(trimmed, "||")? {
            let mut clauses = Vec::new();
            for clause in split_unquoted(&alternative, "&")? {
                clauses.push(parse_clause(clause.trim())?);
            }
            alternatives.push(clauses);
        }

        Ok(Self {
            source: trimmed.to_string(),
            alternatives,
        })
    }

    /// The expression this filter was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against an info object.
    pub fn matches(&self, info: &Value) -> bool {
        self.alternatives
            .iter()
            .any(|clauses| clauses.iter().all(|clause| clause_matches(clause, info)))
    }
}

fn parse_clause(clause: &str) -> Result<Clause, FilterParseError> {
    if clause.is_empty() {
        return Err(FilterParseError::EmptyClause(clause.to_string()));
    }

    if let Some(caps) = unary_regex().captures(clause) {
        let key = caps["key"].to_string();
        return Ok(if caps.name("neg").is_some() {
            Clause::Falsy(key)
        } else {
            Clause::Truthy(key)
        });
    }

    let caps = comparison_regex()
        .captures(clause)
        .ok_or_else(|| FilterParseError::InvalidClause(clause.to_string()))?;

    let op = Op::parse(&caps["op"])
        .ok_or_else(|| FilterParseError::InvalidClause(clause.to_string()))?;
    let raw = caps["value"].trim();
    let quoted = is_quoted(raw);
    let text = if quoted { unquote(raw) } else { raw.to_string() };
    let number = if quoted { None } else { parse_number(&text) };

    let regex = match op {
        Op::Matches => Some(Regex::new(&text).map_err(|e| FilterParseError::InvalidRegex {
            pattern: text.clone(),
            message: e.to_string(),
        })?),
        _ => None,
    };

    Ok(Clause::Compare {
        field: caps["key"].to_string(),
        op,
        text,
        number,
        regex,
        missing_passes: caps.name("none").is_some(),
    })
}

/// Split on `sep` outside single or double quotes.
fn split_unquoted(s: &str, sep: &str) -> Result<Vec<String>, FilterParseError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut i = 0;

    while i < s.len() {
        let rest = &s[i..];
        let Some(c) = rest.chars().next() else {
            break;
        };

        if escaped {
            escaped = false;
        } else if c == '\\' && quote.is_some() {
            escaped = true;
        } else if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else if c == '"' || c == '\'' {
            quote = Some(c);
        } else if rest.starts_with(sep) {
            parts.push(std::mem::take(&mut current));
            i += sep.len();
            continue;
        }

        current.push(c);
        i += c.len_utf8();
    }

    if quote.is_some() {
        return Err(FilterParseError::UnterminatedQuote(s.to_string()));
    }
    parts.push(current);
    Ok(parts)
}

fn is_quoted(s: &str) -> bool {
    s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
}

fn unquote(s: &str) -> String {
    let quote = s.chars().next().unwrap_or('"');
    let inner = &s[1..s.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\'
            && let Some(&next) = chars.peek()
            && (next == quote || next == '\\')
        {
            out.push(next);
            chars.next();
            continue;
        }
        out.push(c);
    }
    out
}

fn parse_number(s: &str) -> Option<f64> {
    if let Ok(n) = s.parse::<f64>() {
        return Some(n);
    }

    let s = s.strip_suffix(['B', 'b']).unwrap_or(s);
    let (s, base) = match s.strip_suffix('i') {
        Some(rest) => (rest, 1024f64),
        None => (s, 1000f64),
    };
    let (digits, exp) = match s.chars().last()?.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 1),
        'm' => (&s[..s.len() - 1], 2),
        'g' => (&s[..s.len() - 1], 3),
        't' => (&s[..s.len() - 1], 4),
        _ => return None,
    };
    digits.trim().parse::<f64>().ok().map(|n| n * base.powi(exp))
}

/// Resolve a dotted path.
fn lookup<'a>(info: &'a Value, field: &str) -> Option<&'a Value> {
    let mut current = info;
    for part in field.split('.') {
        current = match current {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    if current.is_null() { None } else { Some(current) }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_number(s),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn clause_matches(clause: &Clause, info: &Value) -> bool {
    match clause {
        Clause::Truthy(field) => !matches!(lookup(info, field), None | Some(Value::Bool(false))),
        Clause::Falsy(field) => matches!(lookup(info, field), None | Some(Value::Bool(false))),
        Clause::Compare {
            field,
            op,
            text,
            number,
            regex,
            missing_passes,
        } => {
            let Some(actual) = lookup(info, field) else {
                return *missing_passes;
            };

            if let Value::Array(items) = actual
                && *op == Op::Contains
            {
                return items.iter().any(|item| as_text(item) == *text);
            }

            let numeric = number.zip(as_number(actual));
            match op {
                Op::Eq => match numeric {
                    Some((expected, actual)) => actual == expected,
                    None => as_text(actual) == *text,
                },
                Op::Ne => match numeric {
                    Some((expected, actual)) => actual != expected,
                    None => as_text(actual) != *text,
                },
                Op::Lt => numeric.is_some_and(|(e, a)| a < e),
                Op::Le => numeric.is_some_and(|(e, a)| a <= e),
                Op::Gt => numeric.is_some_and(|(e, a)| a > e),
                Op::Ge => numeric.is_some_and(|(e, a)| a >= e),
                Op::Matches => regex
                    .as_ref()
                    .is_some_and(|re| re.is_match(&as_text(actual))),
                Op::Contains => as_text(actual).contains(text.as_str()),
                Op::StartsWith => as_text(actual).starts_with(text.as_str()),
                Op::EndsWith => as_text(actual).ends_with(text.as_str()),
            }
        }
    }
}
