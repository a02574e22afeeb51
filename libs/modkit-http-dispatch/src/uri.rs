//! URI templates (RFC 6570 level 4 expressions).
//!
//! Supported expressions: `{var}`, `{+var}`, `{#var}`, `{.var}`, `{/var}`,
//! `{;var}`, `{?var}` and `{&var}`, with the `*` explode and `:n` prefix
//! modifiers. Undefined and `null` variables expand to nothing.

use std::fmt;

use serde_json::{Map, Value};

/// Characters kept verbatim by reserved (`+`) and fragment (`#`) expansion.
const RESERVED: &str = ":/?#[]@!$&'()*+,;=";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Simple,
    Reserved,
    Fragment,
    Label,
    PathSegment,
    PathParam,
    Query,
    QueryContinuation,
}

impl Operator {
    fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '+' => Self::Reserved,
            '#' => Self::Fragment,
            '.' => Self::Label,
            '/' => Self::PathSegment,
            ';' => Self::PathParam,
            '?' => Self::Query,
            '&' => Self::QueryContinuation,
            _ => return None,
        })
    }

    fn prefix(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved => "",
            Self::Fragment => "#",
            Self::Label => ".",
            Self::PathSegment => "/",
            Self::PathParam => ";",
            Self::Query => "?",
            Self::QueryContinuation => "&",
        }
    }

    fn separator(self) -> &'static str {
        match self {
            Self::Simple | Self::Reserved | Self::Fragment => ",",
            Self::Label => ".",
            Self::PathSegment => "/",
            Self::PathParam => ";",
            Self::Query | Self::QueryContinuation => "&",
        }
    }

    fn named(self) -> bool {
        matches!(self, Self::PathParam | Self::Query | Self::QueryContinuation)
    }

    fn if_empty(self) -> &'static str {
        match self {
            Self::Query | Self::QueryContinuation => "=",
            _ => "",
        }
    }

    fn allow_reserved(self) -> bool {
        matches!(self, Self::Reserved | Self::Fragment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct VarSpec {
    name: String,
    explode: bool,
    prefix: Option<usize>,
}

impl VarSpec {
    fn parse(spec: &str) -> Self {
        if let Some(name) = spec.strip_suffix('*') {
            return Self {
                name: name.to_owned(),
                explode: true,
                prefix: None,
            };
        }
        if let Some((name, len)) = spec.split_once(':')
            && let Ok(len) = len.parse()
        {
            return Self {
                name: name.to_owned(),
                explode: false,
                prefix: Some(len),
            };
        }
        Self {
            name: spec.to_owned(),
            explode: false,
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Literal(String),
    Expression { op: Operator, vars: Vec<VarSpec> },
}

/// A parsed URI template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriTemplate {
    raw: String,
    parts: Vec<Part>,
}

impl UriTemplate {
    /// Parses a template. An unterminated `{` is kept as literal text.
    #[must_use]
    pub fn parse(template: &str) -> Self {
        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            if open > 0 {
                parts.push(Part::Literal(rest[..open].to_owned()));
            }
            parts.push(parse_expression(&rest[open + 1..open + close]));
            rest = &rest[open + close + 1..];
        }
        if !rest.is_empty() {
            parts.push(Part::Literal(rest.to_owned()));
        }

        Self {
            raw: template.to_owned(),
            parts,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Appends `child` to this template, joining path segments with exactly
    /// one `/`. Query, fragment and other operator expressions are appended
    /// without a separator.
    #[must_use]
    pub fn nest(&self, child: &str) -> Self {
        if child.is_empty() {
            return self.clone();
        }
        let base = self.raw.trim_end_matches('/');
        let glued = ["/", "{/", "{?", "{&", "{#", "{.", "{;", "?", "#"]
            .iter()
            .any(|p| child.starts_with(p));
        if glued {
            Self::parse(&format!("{base}{child}"))
        } else {
            Self::parse(&format!("{base}/{child}"))
        }
    }

    /// Variable names in order of first appearance.
    #[must_use]
    pub fn variables(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for part in &self.parts {
            if let Part::Expression { vars, .. } = part {
                for var in vars {
                    if !names.contains(&var.name.as_str()) {
                        names.push(&var.name);
                    }
                }
            }
        }
        names
    }

    /// Expands the template against `values`.
    #[must_use]
    pub fn expand(&self, values: &Map<String, Value>) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for part in &self.parts {
            match part {
                Part::Literal(text) => out.push_str(text),
                Part::Expression { op, vars } => expand_expression(*op, vars, values, &mut out),
            }
        }
        out
    }
}

impl From<&str> for UriTemplate {
    fn from(template: &str) -> Self {
        Self::parse(template)
    }
}

impl fmt::Display for UriTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_expression(body: &str) -> Part {
    let mut chars = body.chars();
    let (op, list) = match chars.next().and_then(Operator::from_char) {
        Some(op) => (op, chars.as_str()),
        None => (Operator::Simple, body),
    };
    let vars = list
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(VarSpec::parse)
        .collect();
    Part::Expression { op, vars }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn encode(text: &str, allow_reserved: bool) -> String {
    if !allow_reserved {
        return urlencoding::encode(text).into_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || "-._~%".contains(ch) || RESERVED.contains(ch) {
            out.push(ch);
        } else {
            out.push_str(&urlencoding::encode(ch.encode_utf8(&mut buf)));
        }
    }
    out
}

fn expand_expression(op: Operator, vars: &[VarSpec], values: &Map<String, Value>, out: &mut String) {
    let mut first = true;
    let allow = op.allow_reserved();

    for var in vars {
        let Some(value) = values.get(&var.name) else {
            continue;
        };
        let expanded = match value {
            Value::Null => None,
            Value::Array(items) => expand_list(op, var, items, allow),
            Value::Object(map) => expand_map(op, var, map, allow),
            scalar => scalar_text(scalar).map(|text| {
                let text = match var.prefix {
                    Some(len) => text.chars().take(len).collect(),
                    None => text,
                };
                let encoded = encode(&text, allow);
                if !op.named() {
                    encoded
                } else if encoded.is_empty() {
                    format!("{}{}", var.name, op.if_empty())
                } else {
                    format!("{}={encoded}", var.name)
                }
            }),
        };

        if let Some(expanded) = expanded {
            out.push_str(if first { op.prefix() } else { op.separator() });
            out.push_str(&expanded);
            first = false;
        }
    }
}

fn expand_list(op: Operator, var: &VarSpec, items: &[Value], allow: bool) -> Option<String> {
    let items: Vec<String> = items
        .iter()
        .filter_map(scalar_text)
        .map(|s| encode(&s, allow))
        .collect();
    if items.is_empty() {
        return None;
    }

    if var.explode {
        let joined = if op.named() {
            items
                .iter()
                .map(|item| format!("{}={item}", var.name))
                .collect::<Vec<_>>()
                .join(op.separator())
        } else {
            items.join(op.separator())
        };
        return Some(joined);
    }

    let joined = items.join(",");
    Some(if op.named() {
        format!("{}={joined}", var.name)
    } else {
        joined
    })
}

fn expand_map(op: Operator, var: &VarSpec, map: &Map<String, Value>, allow: bool) -> Option<String> {
    let pairs: Vec<(String, String)> = map
        .iter()
        .filter_map(|(k, v)| scalar_text(v).map(|v| (encode(k, allow), encode(&v, allow))))
        .collect();
    if pairs.is_empty() {
        return None;
    }

    if var.explode {
        return Some(
            pairs
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(op.separator()),
        );
    }

    let joined = pairs
        .iter()
        .map(|(k, v)| format!("{k},{v}"))
        .collect::<Vec<_>>()
        .join(",");
    Some(if op.named() {
        format!("{}={joined}", var.name)
    } else {
        joined
    })
}
