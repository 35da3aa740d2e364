//! Tag predicate trees and their evaluation against a measurement's indexes.

use crate::error::IndexError;
use crate::measurement::Measurement;
use crate::series_id_set::SeriesIdSet;
use crate::tag_value_index::TagValueIndex;
use regex::Regex;
use std::fmt;

/// How a tag value is compared.
#[derive(Debug, Clone)]
pub enum TagMatcher {
    Equal(String),
    NotEqual(String),
    /// Unanchored match, `regex` crate semantics.
    Regex(Regex),
    NotRegex(Regex),
}

/// A leaf comparison on one tag key.
#[derive(Debug, Clone)]
pub struct TagCondition {
    pub key: String,
    pub matcher: TagMatcher,
}

/// Boolean tree of tag conditions, built by the query layer.
#[derive(Debug, Clone)]
pub enum Predicate {
    Tag(TagCondition),
    And(Box<Predicate>, Box<Predicate>),
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// `key = value`
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::tag(key, TagMatcher::Equal(value.into()))
    }

    /// `key != value`
    pub fn ne(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::tag(key, TagMatcher::NotEqual(value.into()))
    }

    /// `key =~ /pattern/`
    pub fn regex(key: impl Into<String>, pattern: &str) -> Result<Self, IndexError> {
        Ok(Self::tag(key, TagMatcher::Regex(compile(pattern)?)))
    }

    /// `key !~ /pattern/`
    pub fn not_regex(key: impl Into<String>, pattern: &str) -> Result<Self, IndexError> {
        Ok(Self::tag(key, TagMatcher::NotRegex(compile(pattern)?)))
    }

    pub fn and(lhs: Predicate, rhs: Predicate) -> Self {
        Predicate::And(Box::new(lhs), Box::new(rhs))
    }

    pub fn or(lhs: Predicate, rhs: Predicate) -> Self {
        Predicate::Or(Box::new(lhs), Box::new(rhs))
    }

    fn tag(key: impl Into<String>, matcher: TagMatcher) -> Self {
        Predicate::Tag(TagCondition {
            key: key.into(),
            matcher,
        })
    }
}

fn compile(pattern: &str) -> Result<Regex, IndexError> {
    Regex::new(pattern).map_err(|source| IndexError::InvalidPattern {
        pattern: pattern.to_owned(),
        source,
    })
}

impl fmt::Display for TagCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.matcher {
            TagMatcher::Equal(v) => write!(f, "{} = '{}'", self.key, v),
            TagMatcher::NotEqual(v) => write!(f, "{} != '{}'", self.key, v),
            TagMatcher::Regex(re) => write!(f, "{} =~ /{}/", self.key, re.as_str()),
            TagMatcher::NotRegex(re) => write!(f, "{} !~ /{}/", self.key, re.as_str()),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Tag(cond) => cond.fmt(f),
            Predicate::And(l, r) => write!(f, "({} AND {})", l, r),
            Predicate::Or(l, r) => write!(f, "({} OR {})", l, r),
        }
    }
}

/// Resolves `predicate` to live series ids of `m`.
///
/// Each leaf takes at most one lock at a time and none is held across the recursion.
pub(crate) fn evaluate(m: &Measurement, predicate: &Predicate) -> SeriesIdSet {
    match predicate {
        Predicate::Tag(cond) => evaluate_condition(m, cond),
        Predicate::And(l, r) => {
            let (first, second) = if estimate(m, l) <= estimate(m, r) {
                (l, r)
            } else {
                (r, l)
            };
            let lhs = evaluate(m, first);
            if lhs.is_empty() {
                return lhs;
            }
            lhs.intersect(&evaluate(m, second))
        }
        Predicate::Or(l, r) => evaluate(m, l).union(&evaluate(m, r)),
    }
}

fn evaluate_condition(m: &Measurement, cond: &TagCondition) -> SeriesIdSet {
    let Some(index) = m.tag_value_index(&cond.key) else {
        return match cond.matcher {
            TagMatcher::Equal(_) | TagMatcher::Regex(_) => SeriesIdSet::new(),
            TagMatcher::NotEqual(_) | TagMatcher::NotRegex(_) => m.series_ids(),
        };
    };

    match &cond.matcher {
        TagMatcher::Equal(value) => index.load(value).as_ref().clone(),
        TagMatcher::NotEqual(value) => {
            let matched = index.load(value);
            m.series_ids().reject(&matched)
        }
        TagMatcher::Regex(re) => regex_matches(&index, re),
        TagMatcher::NotRegex(re) => {
            let matched = regex_matches(&index, re);
            m.series_ids().reject(&matched)
        }
    }
}

fn regex_matches(index: &TagValueIndex, re: &Regex) -> SeriesIdSet {
    let sets = index.load_matching(|value| re.is_match(value));
    SeriesIdSet::union_all(sets.iter().map(|s| s.as_ref()))
}

/// Rough upper bound on the result size, used to order AND operands.
pub(crate) fn estimate(m: &Measurement, predicate: &Predicate) -> usize {
    match predicate {
        Predicate::Tag(TagCondition {
            key,
            matcher: TagMatcher::Equal(value),
        }) => m
            .tag_value_index(key)
            .map(|index| index.load(value).len())
            .unwrap_or(0),
        Predicate::Tag(_) => usize::MAX,
        Predicate::And(l, r) => estimate(m, l).min(estimate(m, r)),
        Predicate::Or(l, r) => estimate(m, l).saturating_add(estimate(m, r)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Series;
    use crate::types::{Tag, Tags};
    use std::sync::Arc;

    fn measurement() -> Arc<Measurement> {
        let m = Measurement::new("db0", "cpu");
        let rows: &[&[(&str, &str)]] = &[
            &[("host", "a"), ("region", "us")],
            &[("host", "b"), ("region", "us")],
            &[("host", "c"), ("region", "eu")],
            &[("region", "eu")],
        ];
        for (i, row) in rows.iter().enumerate() {
            let tags = Tags::new(row.iter().map(|(k, v)| Tag::new(*k, *v)));
            assert!(m.add_series(Some(Series::new(i as u64 + 1, &m, tags))));
        }
        m
    }

    fn ids(m: &Measurement, p: &Predicate) -> Vec<u64> {
        evaluate(m, p).into_vec()
    }

    #[test]
    fn equality_and_inequality() {
        let m = measurement();
        assert_eq!(ids(&m, &Predicate::eq("host", "a")), vec![1]);
        assert_eq!(ids(&m, &Predicate::eq("host", "zzz")), Vec::<u64>::new());
        // Series 4 has no host tag, so it satisfies `!=`.
        assert_eq!(ids(&m, &Predicate::ne("host", "a")), vec![2, 3, 4]);
    }

    #[test]
    fn regex_and_not_regex() {
        let m = measurement();
        let re = Predicate::regex("host", "^[ab]$").unwrap();
        assert_eq!(ids(&m, &re), vec![1, 2]);
        let nre = Predicate::not_regex("host", "^[ab]$").unwrap();
        assert_eq!(ids(&m, &nre), vec![3, 4]);
        // Unanchored.
        let partial = Predicate::regex("region", "u").unwrap();
        assert_eq!(ids(&m, &partial), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_tag_key() {
        let m = measurement();
        assert!(ids(&m, &Predicate::eq("dc", "x")).is_empty());
        assert!(ids(&m, &Predicate::regex("dc", ".*").unwrap()).is_empty());
        assert_eq!(ids(&m, &Predicate::ne("dc", "x")), vec![1, 2, 3, 4]);
        assert_eq!(ids(&m, &Predicate::not_regex("dc", ".*").unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn and_or_combinations() {
        let m = measurement();
        let p = Predicate::and(Predicate::eq("region", "us"), Predicate::ne("host", "a"));
        assert_eq!(ids(&m, &p), vec![2]);

        let p = Predicate::or(Predicate::eq("host", "a"), Predicate::eq("region", "eu"));
        assert_eq!(ids(&m, &p), vec![1, 3, 4]);

        let p = Predicate::and(
            Predicate::or(Predicate::eq("host", "a"), Predicate::eq("host", "c")),
            Predicate::regex("region", "^e").unwrap(),
        );
        assert_eq!(ids(&m, &p), vec![3]);

        let empty = Predicate::and(Predicate::eq("host", "nope"), Predicate::ne("host", "a"));
        assert!(ids(&m, &empty).is_empty());
    }

    #[test]
    fn estimate_prefers_selective_equality() {
        let m = measurement();
        assert_eq!(estimate(&m, &Predicate::eq("region", "us")), 2);
        assert_eq!(estimate(&m, &Predicate::eq("dc", "x")), 0);
        assert_eq!(estimate(&m, &Predicate::ne("host", "a")), usize::MAX);
        let and = Predicate::and(Predicate::eq("host", "a"), Predicate::ne("host", "b"));
        assert_eq!(estimate(&m, &and), 1);
        let or = Predicate::or(Predicate::eq("host", "a"), Predicate::ne("host", "b"));
        assert_eq!(estimate(&m, &or), usize::MAX);
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let err = Predicate::regex("host", "(unclosed").unwrap_err();
        match err {
            IndexError::InvalidPattern { pattern, .. } => assert_eq!(pattern, "(unclosed"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn display_renders_query_text() {
        let p = Predicate::and(
            Predicate::eq("host", "a"),
            Predicate::or(
                Predicate::ne("region", "us"),
                Predicate::not_regex("dc", r"dc\d").unwrap(),
            ),
        );
        assert_eq!(p.to_string(), r"(host = 'a' AND (region != 'us' OR dc !~ /dc\d/))");
    }
}
