use std::collections::HashMap;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use std::convert::Infallible;

pub const LANG_COOKIE: &str = "pvmss_lang";
pub const DEFAULT_LOCALE: &str = "en";

/// Embedded message catalogues. Lookup falls back to English, then to the
/// key itself so a missing entry is visible instead of blank.
pub struct I18n {
    locales: HashMap<&'static str, HashMap<String, String>>,
}

impl I18n {
    pub fn new() -> Self {
        let mut locales = HashMap::new();
        for (tag, raw) in [
            ("en", include_str!("../locales/en.json")),
            ("fr", include_str!("../locales/fr.json")),
        ] {
            let catalog: HashMap<String, String> =
                serde_json::from_str(raw).expect("embedded locale catalogue is valid JSON");
            locales.insert(tag, catalog);
        }
        Self { locales }
    }

    pub fn supported(&self, tag: &str) -> bool {
        self.locales.contains_key(tag)
    }

    pub fn t(&self, locale: &str, key: &str) -> String {
        self.locales
            .get(locale)
            .and_then(|c| c.get(key))
            .or_else(|| self.locales.get(DEFAULT_LOCALE).and_then(|c| c.get(key)))
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }

    pub fn catalog(&self, locale: &str) -> &HashMap<String, String> {
        self.locales
            .get(locale)
            .or_else(|| self.locales.get(DEFAULT_LOCALE))
            .expect("default locale always present")
    }

    /// Resolution order: explicit `lang` query parameter, the locale
    /// cookie, then the first supported `Accept-Language` entry.
    pub fn resolve(
        &self,
        query: Option<&str>,
        cookie_header: Option<&str>,
        accept_language: Option<&str>,
    ) -> String {
        if let Some(query) = query {
            if let Some(lang) = query_param(query, "lang") {
                if self.supported(&lang) {
                    return lang;
                }
            }
        }
        if let Some(header) = cookie_header {
            let found = cookie::Cookie::split_parse(header.to_string())
                .filter_map(Result::ok)
                .find(|c| c.name() == LANG_COOKIE)
                .map(|c| c.value().to_string());
            if let Some(lang) = found {
                if self.supported(&lang) {
                    return lang;
                }
            }
        }
        if let Some(accept) = accept_language {
            for entry in accept.split(',') {
                let tag = entry.split(';').next().unwrap_or("").trim();
                let primary = tag.split('-').next().unwrap_or("").to_ascii_lowercase();
                if self.supported(&primary) {
                    return primary;
                }
            }
        }
        DEFAULT_LOCALE.to_string()
    }
}

impl Default for I18n {
    fn default() -> Self {
        Self::new()
    }
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

/// Per-request locale, resolved from the bare request parts so any handler
/// can take it as an argument.
#[derive(Debug, Clone)]
pub struct Locale(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Locale
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        // The middleware stack resolves the locale once and stores it; the
        // fallback covers routes mounted outside the stack.
        if let Some(locale) = parts.extensions.get::<Locale>() {
            return Ok(locale.clone());
        }
        Ok(Locale(DEFAULT_LOCALE.to_string()))
    }
}
