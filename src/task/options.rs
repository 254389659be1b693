use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

const SEED: i64 = 1125899906842597;

/// Free-form, immutable key/value configuration of a task.
///
/// Entries are kept sorted so that the declaration order never affects the
/// cache identity of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Options(BTreeMap<String, String>);

impl Options {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    /// Only a case-insensitive `true` reads as `true`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    /// Falls back to `default` when the value is missing or malformed.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// 64-bit rolling hash over the sorted entries, `0` when empty.
    ///
    /// Stable across processes and platforms, which `std` hashers are not.
    pub fn hash(&self) -> u64 {
        if self.0.is_empty() {
            return 0;
        }

        let mut h = SEED;
        for (key, value) in &self.0 {
            h = h.wrapping_mul(31).wrapping_add(string_hash(key) as i64);
            h = h.wrapping_mul(31).wrapping_add(string_hash(value) as i64);
        }

        h as u64
    }
}

impl<K, V> FromIterator<(K, V)> for Options
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut builder = OptionsBuilder::default();
        for (key, value) in iter {
            builder.put(key, value);
        }
        builder.build()
    }
}

fn string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

/// Collects option entries for [`TaskBuilder::options`](crate::TaskBuilder::options).
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    values: BTreeMap<String, String>,
}

impl OptionsBuilder {
    /// Blank keys are ignored, a repeated key keeps the last value.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        if !key.trim().is_empty() {
            self.values.insert(key, value.into());
        }
        self
    }

    pub fn put_bool(&mut self, key: impl Into<String>, value: bool) -> &mut Self {
        self.put(key, value.to_string())
    }

    pub fn put_i64(&mut self, key: impl Into<String>, value: i64) -> &mut Self {
        self.put(key, value.to_string())
    }

    pub fn build(self) -> Options {
        Options(self.values)
    }
}
