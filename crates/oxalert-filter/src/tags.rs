use crate::error::{FilterError, Result};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagOp {
    Eq,
    NotEq,
    Match,
    NotMatch,
}

/// Longest tokens first so `!=~` is not read as `!=`.
const OPERATORS: [(&str, TagOp); 5] = [
    ("!=~", TagOp::NotMatch),
    ("!~", TagOp::NotMatch),
    ("=~", TagOp::Match),
    ("!=", TagOp::NotEq),
    ("=", TagOp::Eq),
];

/// Position, token and kind of the first operator in `expr`.
fn find_operator(expr: &str) -> Option<(usize, &'static str, TagOp)> {
    let start = expr.find(['=', '!'])?;
    let rest = &expr[start..];
    OPERATORS
        .iter()
        .find(|(token, _)| rest.starts_with(token))
        .map(|(token, op)| (start, *token, *op))
}

/// One `key<op>value` clause of a `seriesByTag` selector.
#[derive(Debug, Clone)]
pub struct TagClause {
    pub key: String,
    pub op: TagOp,
    pub value: String,
    regex: Option<Regex>,
}

impl TagClause {
    fn parse(expr: &str) -> std::result::Result<Self, String> {
        let (at, token, op) = find_operator(expr).ok_or_else(|| format!("no operator in '{expr}'"))?;
        let key = expr[..at].trim();
        if key.is_empty() {
            return Err(format!("empty key in '{expr}'"));
        }
        let value = &expr[at + token.len()..];
        let regex = if matches!(op, TagOp::Match | TagOp::NotMatch) {
            Some(Regex::new(&format!("^(?:{value})")).map_err(|e| e.to_string())?)
        } else {
            None
        };
        Ok(Self {
            key: key.to_string(),
            op,
            value: value.to_string(),
            regex,
        })
    }

    /// Evaluates the clause against a series' labels (including `name`).
    /// A missing tag reads as the empty string.
    pub fn matches(&self, labels: &BTreeMap<String, String>, name: &str) -> bool {
        let actual = if self.key == "name" {
            name
        } else {
            labels.get(&self.key).map(String::as_str).unwrap_or("")
        };
        match self.op {
            TagOp::Eq => actual == self.value,
            TagOp::NotEq => actual != self.value,
            TagOp::Match => {
                !actual.is_empty() && self.regex.as_ref().is_some_and(|r| r.is_match(actual))
            }
            TagOp::NotMatch => {
                actual.is_empty() || !self.regex.as_ref().is_some_and(|r| r.is_match(actual))
            }
        }
    }
}

/// Parses `seriesByTag('k=v', "k2=~re", ...)` into its clauses.
///
/// # Examples
///
/// ```
/// use oxalert_filter::tags::{parse_selector, TagOp};
///
/// let clauses = parse_selector("seriesByTag('name=cpu', 'host=~web.*')").unwrap();
/// assert_eq!(clauses.len(), 2);
/// assert_eq!(clauses[1].op, TagOp::Match);
/// ```
pub fn parse_selector(pattern: &str) -> Result<Vec<TagClause>> {
    let invalid = |reason: String| FilterError::InvalidPattern {
        pattern: pattern.to_string(),
        reason,
    };
    let body = pattern
        .trim()
        .strip_prefix("seriesByTag(")
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid("not a seriesByTag call".to_string()))?;

    let mut clauses = Vec::new();
    let mut chars = body.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace() || *c == ',') {
            chars.next();
        }
        let Some(quote) = chars.next() else { break };
        if quote != '\'' && quote != '"' {
            return Err(invalid(format!("expected quoted argument, found '{quote}'")));
        }
        let mut arg = String::new();
        let mut closed = false;
        for c in chars.by_ref() {
            if c == quote {
                closed = true;
                break;
            }
            arg.push(c);
        }
        if !closed {
            return Err(invalid("unterminated quote".to_string()));
        }
        clauses.push(TagClause::parse(&arg).map_err(invalid)?);
    }
    if clauses.is_empty() {
        return Err(invalid("no tag expressions".to_string()));
    }
    Ok(clauses)
}

/// Tag selectors bucketed by their strictest equality clause.
#[derive(Debug, Default)]
pub struct TagIndex {
    buckets: HashMap<(String, String), Vec<(usize, Vec<TagClause>)>>,
    fallback: Vec<(usize, Vec<TagClause>)>,
}

impl TagIndex {
    pub fn insert(&mut self, clauses: Vec<TagClause>, id: usize) {
        let strict = clauses
            .iter()
            .filter(|c| c.op == TagOp::Eq && !c.value.is_empty())
            .min_by_key(|c| if c.key == "name" { 0 } else { 1 })
            .map(|c| (c.key.clone(), c.value.clone()));
        match strict {
            Some(bucket) => self.buckets.entry(bucket).or_default().push((id, clauses)),
            None => self.fallback.push((id, clauses)),
        }
    }

    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    pub fn len(&self) -> usize {
        self.fallback.len() + self.buckets.values().map(Vec::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of every selector matching the series, appended to `out`.
    pub fn matches(&self, name: &str, labels: &BTreeMap<String, String>, out: &mut Vec<usize>) {
        if self.is_empty() {
            return;
        }
        let eval = |entries: &[(usize, Vec<TagClause>)], out: &mut Vec<usize>| {
            for (id, clauses) in entries {
                if clauses.iter().all(|c| c.matches(labels, name)) {
                    out.push(*id);
                }
            }
        };
        if let Some(entries) = self.buckets.get(&("name".to_string(), name.to_string())) {
            eval(entries, out);
        }
        for (k, v) in labels {
            if let Some(entries) = self.buckets.get(&(k.clone(), v.clone())) {
                eval(entries, out);
            }
        }
        eval(&self.fallback, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_all_operators() {
        let c = parse_selector(r#"seriesByTag('a=1', 'b!=2', "c=~x.*", 'd!~y')"#).unwrap();
        let ops: Vec<TagOp> = c.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![TagOp::Eq, TagOp::NotEq, TagOp::Match, TagOp::NotMatch]);
        assert_eq!(c[2].value, "x.*");
    }

    #[test]
    fn negated_regex_accepts_both_spellings() {
        let c = parse_selector("seriesByTag('name=cpu','dc!~eu.*','rack!=~r1')").unwrap();
        assert_eq!(c[1].key, "dc");
        assert_eq!(c[1].op, TagOp::NotMatch);
        assert_eq!(c[1].value, "eu.*");
        assert_eq!(c[2].key, "rack");
        assert_eq!(c[2].op, TagOp::NotMatch);
        assert_eq!(c[2].value, "r1");

        let us = labels(&[("dc", "us-east"), ("rack", "r2")]);
        let eu = labels(&[("dc", "eu-west"), ("rack", "r2")]);
        assert!(c.iter().all(|clause| clause.matches(&us, "cpu")));
        assert!(!c[1].matches(&eu, "cpu"));
    }

    #[test]
    fn rejects_malformed_selectors() {
        assert!(parse_selector("seriesByTag()").is_err());
        assert!(parse_selector("seriesByTag('a=1'").is_err());
        assert!(parse_selector("seriesByTag(a=1)").is_err());
        assert!(parse_selector("seriesByTag('nooperator')").is_err());
        assert!(parse_selector("seriesByTag('a=~(')").is_err());
    }

    #[test]
    fn clause_semantics_for_missing_tags() {
        let l = labels(&[("host", "web1")]);
        let c = |s: &str| TagClause::parse(s).unwrap();
        assert!(c("host=web1").matches(&l, "cpu"));
        assert!(c("dc!=eu").matches(&l, "cpu"));
        assert!(!c("dc=~e.*").matches(&l, "cpu"));
        assert!(c("dc!~e.*").matches(&l, "cpu"));
        assert!(c("name=cpu").matches(&l, "cpu"));
        // Regexes anchor at the start
        assert!(!c("host=~eb").matches(&l, "cpu"));
    }

    #[test]
    fn index_buckets_and_fallback() {
        let mut idx = TagIndex::default();
        idx.insert(parse_selector("seriesByTag('name=cpu','host=~web.*')").unwrap(), 0);
        idx.insert(parse_selector("seriesByTag('dc=eu')").unwrap(), 1);
        idx.insert(parse_selector("seriesByTag('host=~db.*')").unwrap(), 2);
        assert_eq!(idx.fallback_len(), 1);
        assert_eq!(idx.len(), 3);

        let mut out = Vec::new();
        idx.matches("cpu", &labels(&[("host", "web1"), ("dc", "eu")]), &mut out);
        out.sort_unstable();
        assert_eq!(out, vec![0, 1]);

        out.clear();
        idx.matches("mem", &labels(&[("host", "db2")]), &mut out);
        assert_eq!(out, vec![2]);
    }
}
