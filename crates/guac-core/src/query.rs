//! Query-string parameters of the WebSocket upgrade request.

use std::collections::BTreeMap;

/// Parsed query string. Keys may repeat; values keep their order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
    params: BTreeMap<String, Vec<String>>,
}

impl QueryParams {
    /// Parse the query part of a request URI (or a bare query string).
    ///
    /// Everything before the first `?` is ignored when one is present.
    pub fn parse(uri: &str) -> Self {
        let query = match uri.split_once('?') {
            Some((_, query)) => query,
            None if uri.starts_with('/') => "",
            None => uri,
        };

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }
        Self { params }
    }

    /// Remove a parameter, returning its first value.
    pub fn take(&mut self, key: &str) -> Option<String> {
        self.params
            .remove(key)
            .and_then(|values| values.into_iter().next())
    }

    /// First value of a parameter.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values of a parameter, in the order they appeared.
    pub fn values(&self, key: &str) -> &[String] {
        self.params.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Iterate over `(key, first value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.params
            .iter()
            .filter_map(|(k, v)| v.first().map(|first| (k.as_str(), first.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_request_uri() {
        let query = QueryParams::parse("/guac?token=abc%2B%3D&width=800");
        assert_eq!(query.first("token"), Some("abc+="));
        assert_eq!(query.first("width"), Some("800"));
        assert!(!query.contains("height"));
    }

    #[test]
    fn path_without_query() {
        assert_eq!(QueryParams::parse("/"), QueryParams::default());
    }

    #[test]
    fn repeated_keys_keep_order() {
        let query = QueryParams::parse("?GUAC_AUDIO=audio/L8&GUAC_AUDIO=audio/L16");
        assert_eq!(query.values("GUAC_AUDIO"), ["audio/L8", "audio/L16"]);
        assert_eq!(query.first("GUAC_AUDIO"), Some("audio/L8"));
        assert!(query.values("GUAC_VIDEO").is_empty());
    }

    #[test]
    fn take_removes_key() {
        let mut query = QueryParams::parse("token=t1&dpi=120");
        assert_eq!(query.take("token").as_deref(), Some("t1"));
        assert!(!query.contains("token"));
        assert_eq!(query.iter().collect::<Vec<_>>(), [("dpi", "120")]);
    }
}
