use std::collections::HashMap;

/// Parse the query string of a request into key/value pairs.
///
/// Values are percent-decoded (`+` counts as a space, as browsers send it).
/// Repeated keys keep the last value.
///
/// # Example
/// ```
/// use microblog::core::query_params::parse_query;
/// let params = parse_query("page=2&next=%2Fexplore");
/// assert_eq!(params.get("page"), Some(&"2".to_string()));
/// assert_eq!(params.get("next"), Some(&"/explore".to_string()));
/// ```
pub fn parse_query(query: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();

    for param in query.split('&').filter(|p| !p.is_empty()) {
        let (key, raw) = param.split_once('=').unwrap_or((param, ""));
        let raw = raw.replace('+', " ");
        let decoded = urlencoding::decode(&raw)
            .map(|v| v.into_owned())
            .unwrap_or(raw);
        params.insert(key.to_string(), decoded);
    }

    params
}

pub fn get_string(params: &HashMap<String, String>, key: &str) -> Option<String> {
    params.get(key).filter(|v| !v.is_empty()).cloned()
}

/// 1-based page number; anything missing or malformed is page 1.
pub fn get_page(params: &HashMap<String, String>) -> usize {
    params
        .get("page")
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1)
}

/// Builds `path?page=N`, keeping the link form used by every paginated view.
pub fn page_url(path: &str, page: usize) -> String {
    format!("{}?page={}", path, page)
}

pub fn login_url(next: &str) -> String {
    format!("/login?next={}", urlencoding::encode(next))
}
