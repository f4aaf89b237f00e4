//! Form decoding for handlers that need multi-valued fields (`tags[]`)
//! or dynamic keys (`sockets-min`, `cores-max`, ...), which the plain
//! `Form` extractor cannot express.

use std::collections::HashMap;

/// Decoded `application/x-www-form-urlencoded` body preserving repeated
/// keys in submission order.
#[derive(Debug, Default)]
pub struct FormFields {
    pairs: Vec<(String, String)>,
}

impl FormFields {
    pub fn parse(body: &[u8]) -> Self {
        let pairs = url::form_urlencoded::parse(body)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        Self { pairs }
    }

    /// First value for `key`, trimmed. Empty values count as absent.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn require(&self, key: &str) -> Result<&str, String> {
        self.first(key).ok_or_else(|| format!("missing field {}", key))
    }

    /// All values for `key`, accepting both `key` and `key[]` spellings.
    pub fn all(&self, key: &str) -> Vec<&str> {
        let bracketed = format!("{}[]", key);
        self.pairs
            .iter()
            .filter(|(k, _)| k == key || *k == bracketed)
            .map(|(_, v)| v.trim())
            .filter(|v| !v.is_empty())
            .collect()
    }

    pub fn parsed<T: std::str::FromStr>(&self, key: &str) -> Result<T, String> {
        self.require(key)?
            .parse()
            .map_err(|_| format!("invalid value for {}", key))
    }

    pub fn parsed_or<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T, String> {
        match self.first(key) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| format!("invalid value for {}", key)),
        }
    }

    /// Snapshot used to re-populate a form after a validation failure.
    pub fn to_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for (k, v) in &self.pairs {
            map.entry(k.clone()).or_insert_with(|| v.clone());
        }
        map
    }
}
