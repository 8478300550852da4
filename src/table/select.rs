// src/table/select.rs

use regex::Regex;
use tracing::{debug, warn};

use crate::error::MetricError;

/// A source column picked by a `FieldSelector`, with its year token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedField {
    pub name: String,
    pub year: String,
}

/// Selects year-keyed columns by regular expression.
///
/// The year token is capture group 1 when the pattern has one, otherwise the
/// last `year_width` characters of the column name. Either way it must be all
/// ASCII digits.
#[derive(Debug, Clone)]
pub struct FieldSelector {
    regex: Regex,
    year_width: usize,
}

impl FieldSelector {
    pub fn new(pattern: &str, year_width: usize) -> Result<Self, regex::Error> {
        Ok(Self {
            regex: Regex::new(pattern)?,
            year_width,
        })
    }

    pub fn pattern(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_anchored(&self) -> bool {
        let p = self.pattern();
        p.starts_with('^') && p.ends_with('$')
    }

    fn year_token(&self, name: &str) -> Result<String, MetricError> {
        let token = if self.regex.captures_len() > 1 {
            self.regex
                .captures(name)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        } else {
            let chars: Vec<char> = name.chars().collect();
            (chars.len() >= self.year_width)
                .then(|| chars[chars.len() - self.year_width..].iter().collect())
        };

        match token {
            Some(t) if !t.is_empty() && t.chars().all(|c| c.is_ascii_digit()) => Ok(t),
            _ => Err(MetricError::YearSuffix {
                field: name.to_string(),
                pattern: self.pattern().to_string(),
            }),
        }
    }

    /// Match `columns` in order. With `strict`, zero matches is an error;
    /// otherwise it is logged and an empty list returned.
    pub fn select<'a, I>(&self, columns: I, strict: bool) -> Result<Vec<MatchedField>, MetricError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = Vec::new();
        for name in columns {
            if self.regex.is_match(name) {
                out.push(MatchedField {
                    name: name.to_string(),
                    year: self.year_token(name)?,
                });
            }
        }

        if out.is_empty() {
            if strict {
                return Err(MetricError::NoMatchingFields {
                    pattern: self.pattern().to_string(),
                });
            }
            warn!(pattern = %self.pattern(), "no source columns matched");
        } else {
            debug!(pattern = %self.pattern(), matched = out.len(), "selected fields");
        }
        Ok(out)
    }
}
