use std::fmt::{self, Display};

use crate::{Error, Info, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Prefix,
    Present,
}

impl Operator {
    pub fn from_str(operator: &str) -> Result<Self> {
        match operator {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Neq),
            "~=" => Ok(Self::Prefix),
            _ => Err(Error::invalid_argument(format!(
                "invalid filter operator: {}",
                operator
            ))),
        }
    }
}

impl Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Operator::Eq => "==",
                Operator::Neq => "!=",
                Operator::Prefix => "~=",
                Operator::Present => "",
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Name,
    Parent,
    Kind,
    Label(String),
}

impl Field {
    fn from_str(field: &str) -> Result<Self> {
        match field {
            "name" => Ok(Self::Name),
            "parent" => Ok(Self::Parent),
            "kind" => Ok(Self::Kind),
            _ => match field.strip_prefix("labels.") {
                Some(label) if !label.is_empty() && !unquote(label).contains('"') => {
                    Ok(Self::Label(unquote(label).to_string()))
                }
                _ => Err(Error::invalid_argument(format!(
                    "unsupported filter field: {}",
                    field
                ))),
            },
        }
    }

    fn value<'a>(&self, info: &'a Info) -> Option<&'a str> {
        match self {
            Field::Name => Some(info.name.as_str()),
            Field::Parent => Some(info.parent.as_str()),
            Field::Kind => Some(info.kind.as_ref()),
            Field::Label(key) => info.labels.get(key).map(String::as_str),
        }
    }
}

impl Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Name => write!(f, "name"),
            Field::Parent => write!(f, "parent"),
            Field::Kind => write!(f, "kind"),
            Field::Label(key) => write!(f, "labels.{}", key),
        }
    }
}

fn unquote(value: &str) -> &str {
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

const OPERATORS: [&str; 3] = ["!=", "~=", "=="];

/// Byte offsets of the characters of `str` that sit outside double quotes.
fn unquoted_offsets(str: &str) -> Result<Vec<(usize, char)>> {
    let mut quoted = false;
    let mut offsets = Vec::new();
    for (i, c) in str.char_indices() {
        if c == '"' {
            quoted = !quoted;
        } else if !quoted {
            offsets.push((i, c));
        }
    }
    if quoted {
        return Err(Error::invalid_argument(format!(
            "unterminated quote in filter: {}",
            str
        )));
    }
    Ok(offsets)
}

/// Split `str` on every `separator` outside double quotes.
fn split_unquoted(str: &str, separator: char) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut start = 0;
    for (i, c) in unquoted_offsets(str)? {
        if c == separator {
            parts.push(&str[start..i]);
            start = i + c.len_utf8();
        }
    }
    parts.push(&str[start..]);
    Ok(parts)
}

/// First operator outside double quotes and its byte offset.
fn find_operator(str: &str) -> Result<Option<(usize, &'static str)>> {
    for (i, _) in unquoted_offsets(str)? {
        if let Some(operator) = OPERATORS.into_iter().find(|op| str[i..].starts_with(*op)) {
            return Ok(Some((i, operator)));
        }
    }
    Ok(None)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub field: Field,
    pub value: String,
    pub operator: Operator,
}

impl Expression {
    pub fn from_str(str: &str) -> Result<Self> {
        let str = str.trim();
        if let Some((at, operator)) = find_operator(str)? {
            let field = Field::from_str(str[..at].trim())?;
            let value = unquote(str[at + operator.len()..].trim());
            if value.contains('"') {
                return Err(Error::invalid_argument(format!(
                    "invalid filter value: {}",
                    str
                )));
            }
            return Ok(Self {
                field,
                value: value.to_string(),
                operator: Operator::from_str(operator)?,
            });
        }
        if str.is_empty() || split_unquoted(str, '=')?.len() > 1 {
            return Err(Error::invalid_argument(format!("invalid filter: {}", str)));
        }
        Ok(Self {
            field: Field::from_str(str)?,
            value: String::new(),
            operator: Operator::Present,
        })
    }

    pub fn matches(&self, info: &Info) -> bool {
        let value = self.field.value(info);
        match self.operator {
            Operator::Eq => value == Some(self.value.as_str()),
            Operator::Neq => value != Some(self.value.as_str()),
            Operator::Prefix => value.is_some_and(|v| v.starts_with(&self.value)),
            Operator::Present => value.is_some_and(|v| !v.is_empty()),
        }
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Present => write!(f, "{}", self.field),
            _ => write!(f, "{}{}{:?}", self.field, self.operator, self.value),
        }
    }
}

/// Conjunction of expressions parsed from one comma separated filter string.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conjunction(pub Vec<Expression>);

impl Conjunction {
    pub fn from_str(str: &str) -> Result<Self> {
        split_unquoted(str, ',')?
            .into_iter()
            .map(Expression::from_str)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn matches(&self, info: &Info) -> bool {
        self.0.iter().all(|expr| expr.matches(info))
    }
}

/// Filters given to a walk. Each filter string is a conjunction and the
/// walk matches a snapshot if any of them matches. No filters match
/// everything.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SnapshotFilter(pub Vec<Conjunction>);

impl SnapshotFilter {
    pub fn parse<S: AsRef<str>>(filters: &[S]) -> Result<Self> {
        filters
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| !f.trim().is_empty())
            .map(Conjunction::from_str)
            .collect::<Result<Vec<_>>>()
            .map(Self)
    }

    pub fn matches(&self, info: &Info) -> bool {
        self.0.is_empty() || self.0.iter().any(|c| c.matches(info))
    }
}
