// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Label matchers and the `name{label="value", ...}` selector syntax.

use crate::error::{Error, Result};
use crate::model::{Labels, LABEL_NAME_METRIC};
use regex::Regex;
use std::fmt;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MatchType {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchType {
    fn as_str(self) -> &'static str {
        match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regex => "=~",
            MatchType::NotRegex => "!~",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Matcher {
    pub kind: MatchType,
    pub name: String,
    pub value: String,
    re: Option<Regex>,
}

impl Matcher {
    pub fn new(kind: MatchType, name: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let value = value.into();
        let re = match kind {
            MatchType::Regex | MatchType::NotRegex => Some(
                // Fully anchored, like Prometheus matchers.
                Regex::new(&format!("^(?:{value})$"))
                    .map_err(|err| Error::InvalidSelector(err.to_string()))?,
            ),
            MatchType::Equal | MatchType::NotEqual => None,
        };
        Ok(Self {
            kind,
            name,
            value,
            re,
        })
    }

    pub fn equal(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: MatchType::Equal,
            name: name.into(),
            value: value.into(),
            re: None,
        }
    }

    pub fn matches(&self, value: &str) -> bool {
        match (self.kind, &self.re) {
            (MatchType::Equal, _) => value == self.value,
            (MatchType::NotEqual, _) => value != self.value,
            (MatchType::Regex, Some(re)) => re.is_match(value),
            (MatchType::NotRegex, Some(re)) => !re.is_match(value),
            (MatchType::Regex | MatchType::NotRegex, None) => false,
        }
    }

    /// A label missing from the set matches as the empty string.
    pub fn matches_labels(&self, labels: &Labels) -> bool {
        self.matches(labels.get(&self.name).unwrap_or_default())
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.name, self.kind.as_str(), self.value)
    }
}

pub fn matches_all(matchers: &[Matcher], labels: &Labels) -> bool {
    matchers.iter().all(|m| m.matches_labels(labels))
}

/// Parses `metric{a="b", c!="d", e=~"f.*", g!~"h"}`. Both the metric name
/// and the braces are optional; an empty selector matches everything.
pub fn parse_selector(input: &str) -> Result<Vec<Matcher>> {
    let mut p = Parser {
        input,
        pos: 0,
    };
    let mut matchers = Vec::new();
    p.skip_ws();
    if p.peek().is_some_and(is_name_start) {
        let metric = p.name()?;
        matchers.push(Matcher::equal(LABEL_NAME_METRIC, metric));
        p.skip_ws();
    }
    if p.eat('{') {
        loop {
            p.skip_ws();
            if p.eat('}') {
                break;
            }
            let name = p.name()?;
            p.skip_ws();
            let kind = p.op()?;
            p.skip_ws();
            let value = p.quoted()?;
            matchers.push(Matcher::new(kind, name, value)?);
            p.skip_ws();
            if p.eat(',') {
                continue;
            }
            p.skip_ws();
            if !p.eat('}') {
                return Err(p.error("expected ',' or '}'"));
            }
            break;
        }
    }
    p.skip_ws();
    if p.peek().is_some() {
        return Err(p.error("unexpected trailing input"));
    }
    Ok(matchers)
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl Parser<'_> {
    fn rest(&self) -> &str {
        self.input.get(self.pos..).unwrap_or_default()
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.pos += c.len_utf8();
            true
        } else {
            false
        }
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, msg: &str) -> Error {
        Error::InvalidSelector(format!("{msg} at position {} in {:?}", self.pos, self.input))
    }

    fn name(&mut self) -> Result<String> {
        let start = self.pos;
        match self.peek() {
            Some(c) if is_name_start(c) => {}
            _ => return Err(self.error("expected label name")),
        }
        while self.peek().is_some_and(is_name_char) {
            self.bump();
        }
        Ok(self.input[start..self.pos].to_string())
    }

    fn op(&mut self) -> Result<MatchType> {
        if self.eat('=') {
            return Ok(if self.eat('~') {
                MatchType::Regex
            } else {
                MatchType::Equal
            });
        }
        if self.eat('!') {
            if self.eat('=') {
                return Ok(MatchType::NotEqual);
            }
            if self.eat('~') {
                return Ok(MatchType::NotRegex);
            }
        }
        Err(self.error("expected one of =, !=, =~, !~"))
    }

    fn quoted(&mut self) -> Result<String> {
        if !self.eat('"') {
            return Err(self.error("expected '\"'"));
        }
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(c) => out.push(c),
                    None => break,
                },
                Some(c) => out.push(c),
                None => break,
            }
        }
        Err(self.error("unterminated string"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LabelPair;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        Labels::new(pairs.iter().map(|(k, v)| LabelPair::new(*k, *v)).collect())
    }

    #[test]
    fn parse_full_selector() {
        let m = parse_selector(r#"process_cpu{job="api", env!="dev", pod=~"api-.*" , az!~"b|c"}"#)
            .unwrap();
        assert_eq!(m.len(), 5);
        assert_eq!(m[0].name, LABEL_NAME_METRIC);
        assert_eq!(m[0].value, "process_cpu");
        assert_eq!(m[1].kind, MatchType::Equal);
        assert_eq!(m[2].kind, MatchType::NotEqual);
        assert_eq!(m[3].kind, MatchType::Regex);
        assert_eq!(m[4].kind, MatchType::NotRegex);
        assert_eq!(m[3].to_string(), r#"pod=~"api-.*""#);

        let l = labels(&[
            ("__name__", "process_cpu"),
            ("job", "api"),
            ("env", "prod"),
            ("pod", "api-1"),
            ("az", "a"),
        ]);
        assert!(matches_all(&m, &l));
        assert!(!matches_all(&m, &l.with("az", "b")));
    }

    #[test]
    fn empty_selectors() {
        assert!(parse_selector("").unwrap().is_empty());
        assert!(parse_selector(" {} ").unwrap().is_empty());
        assert_eq!(parse_selector(r#"{a="b",}"#).unwrap().len(), 1);
    }

    #[test]
    fn regex_is_anchored() {
        let m = Matcher::new(MatchType::Regex, "pod", "api").unwrap();
        assert!(m.matches("api"));
        assert!(!m.matches("api-1"));
        // Missing labels match as empty.
        let m = Matcher::new(MatchType::Equal, "missing", "").unwrap();
        assert!(m.matches_labels(&Labels::default()));
    }

    #[test]
    fn escapes() {
        let m = parse_selector(r#"{msg="say \"hi\"\n"}"#).unwrap();
        assert_eq!(m[0].value, "say \"hi\"\n");
    }

    #[test]
    fn invalid_selectors() {
        for input in [
            r#"{job="api""#,
            r#"{job=api}"#,
            r#"{job~"api"}"#,
            r#"{="api"}"#,
            r#"{job="api"} extra"#,
            r#"{job=~"("}"#,
        ] {
            assert!(
                matches!(parse_selector(input), Err(Error::InvalidSelector(_))),
                "{input}"
            );
        }
    }
}
