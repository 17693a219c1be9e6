//! Request data visible to templates.

use std::collections::HashMap;

/// Request data handed to the template engine.
///
/// Header names are matched case-insensitively. Cookies can be supplied
/// directly or are read from the `Cookie` header.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    client_ip: String,
    method: String,
    path: String,
    headers: HashMap<String, String>,
    query: HashMap<String, String>,
    cookies: HashMap<String, String>,
    result: HashMap<String, String>,
}

impl RequestContext {
    /// Create a context for a request from `client_ip`.
    pub fn new(client_ip: impl Into<String>) -> Self {
        Self {
            client_ip: client_ip.into(),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(name.into(), value.into());
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    /// Attach a column of the query result, for post-query templates.
    pub fn with_result_column(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.result.insert(column.into(), value.into());
        self
    }

    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Look up a cookie, falling back to parsing the `Cookie` header.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        if let Some(value) = self.cookies.get(name) {
            return Some(value.as_str());
        }

        self.header("cookie")?.split(';').find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
    }

    pub fn result_column(&self, column: &str) -> Option<&str> {
        self.result.get(column).map(String::as_str)
    }
}
