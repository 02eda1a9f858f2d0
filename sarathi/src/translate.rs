//! Status text localization hook

use std::collections::HashMap;

pub trait Translator: Send + Sync {
    fn translate(&self, text: &str) -> String;
}

/// Returns the text unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct Passthrough;

impl Translator for Passthrough {
    fn translate(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Fixed lookup table, falling back to the source text
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    entries: HashMap<String, String>,
}

impl Catalog {
    pub fn new<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl Translator for Catalog {
    fn translate(&self, text: &str) -> String {
        self.entries
            .get(text)
            .cloned()
            .unwrap_or_else(|| text.to_string())
    }
}
