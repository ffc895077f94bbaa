use std::collections::HashMap;

use serde::Deserialize;

/// The shape deserialized by the outer runtime to configure a [`crate::store::Store`].
/// Loading this from a config file is itself out of scope for this crate.
#[derive(Clone, Debug, Deserialize)]
pub struct StoreConfig {
    /// Connection URL. A `mysql://` scheme selects the MySQL dialect; a
    /// `sqlite:` scheme, a bare filesystem path, or `:memory:` selects the
    /// SQLite dialect (the embedded stand-in for the source's H2 dialect).
    pub url: String,
    #[serde(default)]
    pub prefix: String,
    /// Legacy mapping kept for on-disk compatibility; the core has no active
    /// semantics for it.
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

impl StoreConfig {
    /// Normalizes the configured prefix: empty stays empty; a non-empty
    /// prefix gets a trailing `_` appended unless it already ends in one.
    pub fn normalized_prefix(&self) -> String {
        normalize_prefix(&self.prefix)
    }
}

pub(crate) fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        String::new()
    } else if prefix.ends_with('_') {
        prefix.to_string()
    } else {
        format!("{prefix}_")
    }
}

#[cfg(test)]
mod tests {
    use super::normalize_prefix;

    #[test]
    fn empty_prefix_stays_empty() {
        assert_eq!(normalize_prefix(""), "");
    }

    #[test]
    fn non_empty_prefix_gets_underscore() {
        assert_eq!(normalize_prefix("pex"), "pex_");
        assert_eq!(normalize_prefix("pex_"), "pex_");
    }
}
