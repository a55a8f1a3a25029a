use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use regex::Regex;
use url::Url;

/// A plain value, the application-facing counterpart of a doc value.
///
/// Lists and maps are plain data: a `Plain::Map` read from a controller is a
/// snapshot of a shared container, not a live view. Maps preserve insertion
/// order. `Bytes` exists so foreign buffers read from a remote doc have a
/// projection; the converter rejects it on the write path.
#[derive(Clone, Debug)]
pub enum Plain {
    /// The null value.
    Null,
    /// A boolean.
    Bool(bool),
    /// A number. Only finite numbers can be written to a doc.
    Number(f64),
    /// A string.
    String(String),
    /// A point in time, written to the doc as its RFC 3339 string.
    Date(DateTime<Utc>),
    /// A compiled regex, written to the doc as its pattern string.
    Regex(Regex),
    /// A URL, written to the doc as its href string.
    Url(Url),
    /// A byte buffer. Read-only projection, rejected on write.
    Bytes(Vec<u8>),
    /// An ordered sequence.
    List(Vec<Plain>),
    /// A key to value mapping in insertion order.
    Map(IndexMap<String, Plain>),
}

impl Plain {
    /// Builds a list from anything convertible to plain values.
    pub fn list<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Plain>,
    {
        Plain::List(items.into_iter().map(Into::into).collect())
    }

    /// Builds a map from key/value pairs, preserving their order.
    pub fn map<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Plain>,
    {
        Plain::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Returns true for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Plain::Null)
    }

    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Plain::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the number if this is a `Number`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Plain::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the string if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Plain::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the elements if this is a `List`.
    pub fn as_list(&self) -> Option<&[Plain]> {
        match self {
            Plain::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is a `Map`.
    pub fn as_map(&self) -> Option<&IndexMap<String, Plain>> {
        match self {
            Plain::Map(entries) => Some(entries),
            _ => None,
        }
    }

    /// Looks up a key in a `Map`.
    pub fn get(&self, key: &str) -> Option<&Plain> {
        self.as_map()?.get(key)
    }

    /// Looks up an index in a `List`.
    pub fn at(&self, index: usize) -> Option<&Plain> {
        self.as_list()?.get(index)
    }

    /// The string a special writes to the doc, if this is one.
    pub(crate) fn special_string(&self) -> Option<String> {
        match self {
            Plain::Date(d) => Some(d.to_rfc3339_opts(SecondsFormat::Millis, true)),
            Plain::Regex(r) => Some(r.as_str().to_owned()),
            Plain::Url(u) => Some(u.as_str().to_owned()),
            _ => None,
        }
    }

}

impl PartialEq for Plain {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Plain::Null, Plain::Null) => true,
            (Plain::Bool(a), Plain::Bool(b)) => a == b,
            (Plain::Number(a), Plain::Number(b)) => a == b,
            (Plain::String(a), Plain::String(b)) => a == b,
            (Plain::Date(a), Plain::Date(b)) => a == b,
            (Plain::Regex(a), Plain::Regex(b)) => a.as_str() == b.as_str(),
            (Plain::Url(a), Plain::Url(b)) => a == b,
            (Plain::Bytes(a), Plain::Bytes(b)) => a == b,
            (Plain::List(a), Plain::List(b)) => a == b,
            (Plain::Map(a), Plain::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Plain {
    fn from(value: bool) -> Self {
        Plain::Bool(value)
    }
}

impl From<f64> for Plain {
    fn from(value: f64) -> Self {
        Plain::Number(value)
    }
}

impl From<i64> for Plain {
    fn from(value: i64) -> Self {
        Plain::Number(value as f64)
    }
}

impl From<i32> for Plain {
    fn from(value: i32) -> Self {
        Plain::Number(value as f64)
    }
}

impl From<u32> for Plain {
    fn from(value: u32) -> Self {
        Plain::Number(value as f64)
    }
}

impl From<&str> for Plain {
    fn from(value: &str) -> Self {
        Plain::String(value.to_owned())
    }
}

impl From<String> for Plain {
    fn from(value: String) -> Self {
        Plain::String(value)
    }
}

impl From<DateTime<Utc>> for Plain {
    fn from(value: DateTime<Utc>) -> Self {
        Plain::Date(value)
    }
}

impl From<Regex> for Plain {
    fn from(value: Regex) -> Self {
        Plain::Regex(value)
    }
}

impl From<Url> for Plain {
    fn from(value: Url) -> Self {
        Plain::Url(value)
    }
}

impl From<Vec<Plain>> for Plain {
    fn from(value: Vec<Plain>) -> Self {
        Plain::List(value)
    }
}

impl From<IndexMap<String, Plain>> for Plain {
    fn from(value: IndexMap<String, Plain>) -> Self {
        Plain::Map(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_preserved() {
        let map = Plain::map([("z", 1), ("a", 2), ("m", 3)]);
        let keys: Vec<_> = map.as_map().unwrap().keys().cloned().collect();
        assert_eq!(keys, ["z", "a", "m"]);
    }

    #[test]
    fn specials_render_to_strings() {
        let date = Plain::from("2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap());
        assert_eq!(date.special_string().unwrap(), "2024-05-01T12:00:00.000Z");
        let re = Plain::Regex(Regex::new("a+b").unwrap());
        assert_eq!(re.special_string().unwrap(), "a+b");
        let url = Plain::Url(Url::parse("https://example.com/x").unwrap());
        assert_eq!(url.special_string().unwrap(), "https://example.com/x");
        assert!(Plain::from(1.0).special_string().is_none());
    }

    #[test]
    fn regexes_compare_by_pattern() {
        let a = Plain::Regex(Regex::new("x?y").unwrap());
        let b = Plain::Regex(Regex::new("x?y").unwrap());
        assert_eq!(a, b);
    }
}
