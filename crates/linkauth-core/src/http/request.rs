use chrono::Utc;
pub use reqwest::Method;
use serde_json::{Map, Value};
use url::Url;

use crate::auth::utils;

/// How request parameters are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterEncoding {
    Query,
    FormBody,
    JsonBody,
}

impl ParameterEncoding {
    pub fn default_for(method: &Method) -> Self {
        if matches!(*method, Method::GET | Method::HEAD | Method::DELETE) {
            ParameterEncoding::Query
        } else {
            ParameterEncoding::FormBody
        }
    }
}

/// One outgoing API call. Transformations return a new context; the nonce and
/// timestamp are fixed at creation so signing the same context twice is stable.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestContext {
    pub method: Method,
    pub url: Url,
    pub params: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub encoding: ParameterEncoding,
    pub nonce: String,
    pub timestamp: i64,
    /// Credential generation the request was authorized with; set by the interceptor.
    pub credential_generation: u64,
}

impl RequestContext {
    pub fn new(method: Method, url: Url) -> Self {
        let encoding = ParameterEncoding::default_for(&method);
        Self {
            method,
            url,
            params: vec![],
            headers: vec![],
            encoding,
            nonce: utils::random_token(32),
            timestamp: Utc::now().timestamp(),
            credential_generation: 0,
        }
    }

    pub fn with_encoding(mut self, encoding: ParameterEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (name, value) in headers {
            self.set_header(name, value);
        }
        self
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Replace any header with the same (case-insensitive) name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    /// Put `key=value` in the URL query, dropping every other occurrence of `key` from
    /// the query and from query-encoded parameters.
    pub fn set_query_param(&mut self, key: &str, value: &str) {
        self.remove_query_param(key);
        self.url.query_pairs_mut().append_pair(key, value);
    }

    pub fn remove_query_param(&mut self, key: &str) {
        let remaining: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(existing, _)| existing != key)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        if remaining.is_empty() {
            self.url.set_query(None);
        } else {
            self.url
                .query_pairs_mut()
                .clear()
                .extend_pairs(remaining.iter());
        }
        if self.encoding == ParameterEncoding::Query {
            self.params.retain(|(existing, _)| existing != key);
        }
    }

    /// Query-string lookup on the final URL.
    pub fn query_param(&self, key: &str) -> Option<String> {
        self.final_url()
            .query_pairs()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.into_owned())
    }

    /// Parameters that take part in an OAuth1 signature (JSON bodies do not).
    pub fn signable_params(&self) -> &[(String, String)] {
        match self.encoding {
            ParameterEncoding::Query | ParameterEncoding::FormBody => &self.params,
            ParameterEncoding::JsonBody => &[],
        }
    }

    /// URL sent on the wire. Query-encoded parameters override URL query pairs with the
    /// same key so nothing is sent twice.
    pub fn final_url(&self) -> Url {
        if self.encoding != ParameterEncoding::Query || self.params.is_empty() {
            return self.url.clone();
        }
        let mut url = self.url.clone();
        let existing: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(key, _)| !self.params.iter().any(|(param, _)| param == key))
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(existing.iter())
            .extend_pairs(self.params.iter());
        url
    }

    /// Request body, if the encoding carries one.
    pub fn body(&self) -> Option<(String, &'static str)> {
        match self.encoding {
            ParameterEncoding::Query => None,
            ParameterEncoding::FormBody => Some((
                url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(self.params.iter())
                    .finish(),
                "application/x-www-form-urlencoded",
            )),
            ParameterEncoding::JsonBody => {
                let object: Map<String, Value> = self
                    .params
                    .iter()
                    .map(|(key, value)| (key.clone(), Value::String(value.clone())))
                    .collect();
                Some((Value::Object(object).to_string(), "application/json"))
            }
        }
    }
}
