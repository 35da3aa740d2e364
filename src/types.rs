use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Numeric series identifier. Process-unique, assigned monotonically, never reused.
pub type SeriesId = u64;

/// TagSet type (using a HashMap for flexibility). Input form of a series' tags.
pub type TagSet = HashMap<String, String>;

/// A single tag key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Tags of one series, sorted by key with unique keys.
///
/// Sorting by key makes the canonical series key stable regardless of the order in which tags
/// were supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tags(Vec<Tag>);

impl Tags {
    /// Builds a tag list from arbitrary pairs. When a key repeats, the last value wins.
    pub fn new(tags: impl IntoIterator<Item = Tag>) -> Self {
        let mut tags: Vec<Tag> = tags.into_iter().collect();
        // Stable sort keeps input order among equal keys so the dedup below can keep the last.
        tags.sort_by(|a, b| a.key.cmp(&b.key));
        let mut out: Vec<Tag> = Vec::with_capacity(tags.len());
        for tag in tags {
            match out.last_mut() {
                Some(last) if last.key == tag.key => *last = tag,
                _ => out.push(tag),
            }
        }
        Tags(out)
    }

    /// Value for `key`, if the series carries that tag.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .binary_search_by(|t| t.key.as_str().cmp(key))
            .ok()
            .map(|i| self.0[i].value.as_str())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tag> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&TagSet> for Tags {
    fn from(tags: &TagSet) -> Self {
        Tags::new(tags.iter().map(|(k, v)| Tag::new(k.clone(), v.clone())))
    }
}

impl From<TagSet> for Tags {
    fn from(tags: TagSet) -> Self {
        Tags::new(tags.into_iter().map(|(k, v)| Tag::new(k, v)))
    }
}

impl FromIterator<Tag> for Tags {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Tags::new(iter)
    }
}

impl<'a> IntoIterator for &'a Tags {
    type Item = &'a Tag;
    type IntoIter = std::slice::Iter<'a, Tag>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Builds the canonical series key `measurement,k1=v1,k2=v2` (tags sorted by key).
///
/// Backslashes, commas and spaces in the measurement, and backslashes, commas, spaces and `=` in
/// tag keys and values, are backslash-escaped so two different tag combinations can never render
/// the same key.
pub fn series_key(measurement: &str, tags: &Tags) -> String {
    let mut key = String::with_capacity(
        measurement.len() + tags.iter().map(|t| t.key.len() + t.value.len() + 2).sum::<usize>(),
    );
    escape_into(&mut key, measurement, &['\\', ',', ' ']);
    for tag in tags {
        key.push(',');
        escape_into(&mut key, &tag.key, &['\\', ',', ' ', '=']);
        key.push('=');
        escape_into(&mut key, &tag.value, &['\\', ',', ' ', '=']);
    }
    key
}

fn escape_into(dst: &mut String, s: &str, special: &[char]) {
    for c in s.chars() {
        if special.contains(&c) {
            dst.push('\\');
        }
        dst.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn tags_are_sorted_by_key() {
        let t = Tags::from(&tags(&[("region", "us"), ("host", "a"), ("dc", "x")]));
        let keys: Vec<&str> = t.iter().map(|t| t.key.as_str()).collect();
        assert_eq!(keys, vec!["dc", "host", "region"]);
        assert_eq!(t.get("host"), Some("a"));
        assert_eq!(t.get("missing"), None);
    }

    #[test]
    fn duplicate_keys_keep_last_value() {
        let t = Tags::new(vec![Tag::new("host", "a"), Tag::new("host", "b")]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get("host"), Some("b"));
    }

    #[test]
    fn series_key_canonical_ordering() {
        let t1 = Tags::from(&tags(&[("b", "2"), ("a", "1")]));
        let t2 = Tags::from(&tags(&[("a", "1"), ("b", "2")]));
        assert_eq!(series_key("cpu", &t1), "cpu,a=1,b=2");
        assert_eq!(series_key("cpu", &t1), series_key("cpu", &t2));
    }

    #[test]
    fn series_key_without_tags_is_measurement_name() {
        assert_eq!(series_key("cpu", &Tags::default()), "cpu");
    }

    #[test]
    fn series_key_escapes_separators() {
        let t = Tags::from(&tags(&[("host", "a,b=c")]));
        assert_eq!(series_key("cpu load", &t), r"cpu\ load,host=a\,b\=c");

        // Without escaping these two would collide as "m,a=1,b=2".
        let split = Tags::from(&tags(&[("a", "1"), ("b", "2")]));
        let joined = Tags::from(&tags(&[("a", "1,b=2")]));
        assert_ne!(series_key("m", &split), series_key("m", &joined));
    }

    #[test]
    fn series_key_escapes_backslashes() {
        let t = Tags::from(&tags(&[("path", r"c:\tmp")]));
        assert_eq!(series_key(r"disk\io", &t), r"disk\\io,path=c:\\tmp");

        // A trailing backslash in a value must not swallow the following separator.
        let trailing = Tags::from(&tags(&[("a", "x\\"), ("b\\", "y")]));
        let embedded = Tags::from(&tags(&[("a", "x,b=y")]));
        assert_ne!(series_key("m", &trailing), series_key("m", &embedded));
        assert_eq!(series_key("m", &trailing), r"m,a=x\\,b\\=y");
        assert_eq!(series_key("m", &embedded), r"m,a=x\,b\=y");
    }
}
