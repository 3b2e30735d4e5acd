//! OAuth 1.0a request signing and the three-legged token exchange.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use sha1::Sha1;
use tracing::debug;
use url::Url;

use super::{utils, AuthError};

const OAUTH_VERSION: &str = "1.0";
const USER_AGENT: &str = concat!("linkauth/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMethod {
    HmacSha1,
    Plaintext,
}

impl SignatureMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureMethod::HmacSha1 => "HMAC-SHA1",
            SignatureMethod::Plaintext => "PLAINTEXT",
        }
    }
}

/// Where the `oauth_*` protocol parameters travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuth1Placement {
    Header,
    Query,
}

/// RFC 3986 percent-encoding: everything except `A-Z a-z 0-9 - . _ ~`.
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// `scheme://host[:port]/path` with default ports removed and no query or fragment.
pub fn normalized_url(url: &Url) -> String {
    let mut normalized = format!(
        "{}://{}",
        url.scheme().to_ascii_lowercase(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    normalized.push_str(url.path());
    normalized
}

/// Encode every key and value, sort by encoded key then encoded value, and join.
pub fn normalized_parameters(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(key, value)| (percent_encode(key), percent_encode(value)))
        .collect();
    encoded.sort();
    encoded
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Canonical signature base string: `METHOD&enc(url)&enc(params)`. The URL's own query
/// pairs are folded into the parameter set.
pub fn signature_base_string(method: &Method, url: &Url, params: &[(String, String)]) -> String {
    let mut all: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    all.extend(params.iter().cloned());
    format!(
        "{}&{}&{}",
        method.as_str().to_ascii_uppercase(),
        percent_encode(&normalized_url(url)),
        percent_encode(&normalized_parameters(&all))
    )
}

/// Signs requests on behalf of one consumer and (optionally) one token.
#[derive(Debug, Clone)]
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
    token: Option<String>,
    token_secret: Option<String>,
    method: SignatureMethod,
}

impl OAuth1Signer {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            token: None,
            token_secret: None,
            method: SignatureMethod::HmacSha1,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>, secret: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self.token_secret = Some(secret.into());
        self
    }

    pub fn with_method(mut self, method: SignatureMethod) -> Self {
        self.method = method;
        self
    }

    fn signing_key(&self) -> String {
        format!(
            "{}&{}",
            percent_encode(&self.consumer_secret),
            percent_encode(self.token_secret.as_deref().unwrap_or_default())
        )
    }

    pub fn signature(&self, base_string: &str) -> String {
        let key = self.signing_key();
        match self.method {
            SignatureMethod::Plaintext => key,
            SignatureMethod::HmacSha1 => {
                let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
                    .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
                mac.update(base_string.as_bytes());
                STANDARD.encode(mac.finalize().into_bytes())
            }
        }
    }

    /// Produce the full `oauth_*` parameter set, `oauth_signature` included.
    ///
    /// `params` are the request parameters that participate in signing (query and
    /// form body); `extra` carries flow-specific protocol parameters such as
    /// `oauth_callback` or `oauth_verifier`.
    pub fn sign(
        &self,
        method: &Method,
        url: &Url,
        params: &[(String, String)],
        extra: &[(String, String)],
        nonce: &str,
        timestamp: i64,
    ) -> Vec<(String, String)> {
        let mut oauth = vec![
            ("oauth_consumer_key".to_string(), self.consumer_key.clone()),
            ("oauth_nonce".to_string(), nonce.to_owned()),
            (
                "oauth_signature_method".to_string(),
                self.method.as_str().to_owned(),
            ),
            ("oauth_timestamp".to_string(), timestamp.to_string()),
            ("oauth_version".to_string(), OAUTH_VERSION.to_string()),
        ];
        if let Some(token) = &self.token {
            oauth.push(("oauth_token".to_string(), token.clone()));
        }
        oauth.extend(extra.iter().cloned());

        let mut signed = params.to_vec();
        signed.extend(oauth.iter().cloned());
        let base = signature_base_string(method, url, &signed);
        oauth.push(("oauth_signature".to_string(), self.signature(&base)));
        oauth.sort();
        oauth
    }
}

/// Render protocol parameters as an `Authorization: OAuth ...` header value.
pub fn authorization_header(oauth_params: &[(String, String)]) -> String {
    let rendered = oauth_params
        .iter()
        .map(|(key, value)| format!("{}=\"{}\"", percent_encode(key), percent_encode(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {rendered}")
}

/// Endpoints of a provider's three-legged OAuth1 flow.
#[derive(Debug, Clone)]
pub struct OAuth1Endpoints {
    pub request_token_url: Url,
    pub authorize_url: Url,
    pub access_token_url: Url,
}

/// Temporary credentials issued by the request-token step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemporaryCredentials {
    pub token: String,
    pub token_secret: String,
}

/// Token credentials returned by the access-token step, plus any extra response fields
/// (`screen_name`, `user_id`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenResponse {
    pub token: String,
    pub token_secret: String,
    pub extra: BTreeMap<String, String>,
}

/// Performs the three-legged OAuth1 exchange against a provider.
#[derive(Debug, Clone)]
pub struct OAuth1Client {
    http: Client,
    consumer_key: String,
    consumer_secret: String,
    callback_url: Url,
    endpoints: OAuth1Endpoints,
    method: SignatureMethod,
}

impl OAuth1Client {
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        callback_url: Url,
        endpoints: OAuth1Endpoints,
    ) -> Result<Self, AuthError> {
        let http = Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            http,
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            callback_url,
            endpoints,
            method: SignatureMethod::HmacSha1,
        })
    }

    pub fn with_method(mut self, method: SignatureMethod) -> Self {
        self.method = method;
        self
    }

    pub fn consumer_key(&self) -> &str {
        &self.consumer_key
    }

    pub fn consumer_secret(&self) -> &str {
        &self.consumer_secret
    }

    pub fn callback_url(&self) -> &Url {
        &self.callback_url
    }

    fn signer(&self) -> OAuth1Signer {
        OAuth1Signer::new(&self.consumer_key, &self.consumer_secret).with_method(self.method)
    }

    /// Obtain temporary credentials (step one).
    pub async fn request_token(&self) -> Result<TemporaryCredentials, AuthError> {
        let extra = vec![(
            "oauth_callback".to_string(),
            self.callback_url.to_string(),
        )];
        let fields = self
            .signed_post(&self.signer(), &self.endpoints.request_token_url, &extra)
            .await?;
        let token = required_field(&fields, "oauth_token")?;
        let token_secret = required_field(&fields, "oauth_token_secret")?;
        if fields.get("oauth_callback_confirmed").map(String::as_str) == Some("false") {
            return Err(AuthError::Failed("provider rejected the callback URL".into()));
        }
        Ok(TemporaryCredentials {
            token,
            token_secret,
        })
    }

    /// URL the user visits to authorize the temporary credentials (step two).
    pub fn authorization_url(&self, temporary: &TemporaryCredentials) -> Url {
        let mut url = self.endpoints.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("oauth_token", &temporary.token);
        url
    }

    /// Exchange the verifier delivered on the callback for token credentials (step three).
    pub async fn access_token(
        &self,
        temporary: &TemporaryCredentials,
        verifier: &str,
    ) -> Result<AccessTokenResponse, AuthError> {
        let signer = self
            .signer()
            .with_token(&temporary.token, &temporary.token_secret);
        let extra = vec![("oauth_verifier".to_string(), verifier.to_owned())];
        let mut fields = self
            .signed_post(&signer, &self.endpoints.access_token_url, &extra)
            .await?;
        let token = required_field(&fields, "oauth_token")?;
        let token_secret = required_field(&fields, "oauth_token_secret")?;
        fields.remove("oauth_token");
        fields.remove("oauth_token_secret");
        Ok(AccessTokenResponse {
            token,
            token_secret,
            extra: fields,
        })
    }

    async fn signed_post(
        &self,
        signer: &OAuth1Signer,
        url: &Url,
        extra: &[(String, String)],
    ) -> Result<BTreeMap<String, String>, AuthError> {
        let nonce = utils::random_token(32);
        let timestamp = Utc::now().timestamp();
        let oauth = signer.sign(&Method::POST, url, &[], extra, &nonce, timestamp);
        debug!(endpoint = %normalized_url(url), "requesting OAuth1 token");

        let response = self
            .http
            .post(url.clone())
            .header("Authorization", authorization_header(&oauth))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(AuthError::TokenEndpoint { status, body });
        }
        Ok(url::form_urlencoded::parse(body.trim().as_bytes())
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect())
    }
}

fn required_field(fields: &BTreeMap<String, String>, key: &str) -> Result<String, AuthError> {
    fields
        .get(key)
        .filter(|value| !value.is_empty())
        .cloned()
        .ok_or_else(|| AuthError::Failed(format!("token response missing {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    const CONSUMER_KEY: &str = "xvz1evFS4wEEPTGEFPHBog";
    const CONSUMER_SECRET: &str = "kAcSOqF21Fu85e7zjz7ZN2U4ZRhfV3WpwPAoE3Z7kBw";
    const TOKEN: &str = "370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb";
    const TOKEN_SECRET: &str = "LswwdoUaIvS8ltyTt5jkRh4J50vUPVVHtR2YPi5kE";
    const NONCE: &str = "kYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg";
    const TIMESTAMP: i64 = 1318622958;

    fn status_update() -> (Url, Vec<(String, String)>) {
        let url = Url::parse("https://api.twitter.com/1.1/statuses/update.json?include_entities=true")
            .unwrap();
        let params = vec![(
            "status".to_string(),
            "Hello Ladies + Gentlemen, a signed OAuth request!".to_string(),
        )];
        (url, params)
    }

    fn signer() -> OAuth1Signer {
        OAuth1Signer::new(CONSUMER_KEY, CONSUMER_SECRET).with_token(TOKEN, TOKEN_SECRET)
    }

    #[test]
    fn base_string_matches_reference() {
        let (url, mut params) = status_update();
        params.extend([
            ("oauth_consumer_key".to_string(), CONSUMER_KEY.to_string()),
            ("oauth_nonce".to_string(), NONCE.to_string()),
            ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
            ("oauth_timestamp".to_string(), TIMESTAMP.to_string()),
            ("oauth_token".to_string(), TOKEN.to_string()),
            ("oauth_version".to_string(), "1.0".to_string()),
        ]);
        let base = signature_base_string(&Method::POST, &url, &params);
        assert_eq!(
            base,
            "POST&https%3A%2F%2Fapi.twitter.com%2F1.1%2Fstatuses%2Fupdate.json&include_entities%3Dtrue%26oauth_consumer_key%3Dxvz1evFS4wEEPTGEFPHBog%26oauth_nonce%3DkYjzVBB8Y0ZFabxSWbWovY3uYSQ2pTgmZeNu2VS4cg%26oauth_signature_method%3DHMAC-SHA1%26oauth_timestamp%3D1318622958%26oauth_token%3D370773112-GmHxMAgYyLbNEtIKZeRNFsMKPR9EyMZeS9weJAEb%26oauth_version%3D1.0%26status%3DHello%2520Ladies%2520%252B%2520Gentlemen%252C%2520a%2520signed%2520OAuth%2520request%2521"
        );
    }

    #[test]
    fn hmac_sha1_signature_matches_reference() {
        let (url, params) = status_update();
        let oauth = signer().sign(&Method::POST, &url, &params, &[], NONCE, TIMESTAMP);
        let signature = oauth
            .iter()
            .find(|(key, _)| key == "oauth_signature")
            .map(|(_, value)| value.as_str());
        assert_eq!(signature, Some("hCtSmYh+iHYCEqBWrE7C7hYmtUk="));
    }

    #[test]
    fn signing_is_deterministic_and_sensitive() {
        let (url, params) = status_update();
        let first = signer().sign(&Method::POST, &url, &params, &[], NONCE, TIMESTAMP);
        let second = signer().sign(&Method::POST, &url, &params, &[], NONCE, TIMESTAMP);
        assert_eq!(first, second);

        let changed = vec![("status".to_string(), "Hello Ladies + Gentlemen!".to_string())];
        let third = signer().sign(&Method::POST, &url, &changed, &[], NONCE, TIMESTAMP);
        assert_ne!(first, third);
    }

    #[test]
    fn parameters_sort_by_key_then_value() {
        let params = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "z".to_string()),
            ("a".to_string(), "b c".to_string()),
        ];
        assert_eq!(normalized_parameters(&params), "a=b%20c&a=z&b=2");
    }

    #[test]
    fn normalized_url_drops_default_port_and_query() {
        let url = Url::parse("HTTPS://Api.Example.com:443/r%20v/x?y=1#frag").unwrap();
        assert_eq!(normalized_url(&url), "https://api.example.com/r%20v/x");
        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(normalized_url(&url), "http://example.com:8080/");
    }

    #[test]
    fn plaintext_signature_is_the_key() {
        let signer = OAuth1Signer::new("ck", "c&s")
            .with_token("t", "t s")
            .with_method(SignatureMethod::Plaintext);
        assert_eq!(signer.signature("ignored"), "c%26s&t%20s");
    }

    #[test]
    fn header_renders_encoded_pairs() {
        let header = authorization_header(&[
            ("oauth_callback".to_string(), "app://cb".to_string()),
            ("oauth_nonce".to_string(), "n".to_string()),
        ]);
        assert_eq!(header, "OAuth oauth_callback=\"app%3A%2F%2Fcb\", oauth_nonce=\"n\"");
    }

    fn client(server: &MockServer) -> OAuth1Client {
        OAuth1Client::new(
            "consumer",
            "secret",
            Url::parse("linkauth://oauth1/callback").unwrap(),
            OAuth1Endpoints {
                request_token_url: Url::parse(&server.url("/oauth/request_token")).unwrap(),
                authorize_url: Url::parse(&server.url("/oauth/authorize")).unwrap(),
                access_token_url: Url::parse(&server.url("/oauth/access_token")).unwrap(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn three_legged_exchange() {
        let server = MockServer::start();
        let request_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/request_token")
                .header_exists("authorization");
            then.status(200)
                .body("oauth_token=temp&oauth_token_secret=temp-secret&oauth_callback_confirmed=true");
        });
        let access_mock = server.mock(|when, then| {
            when.method(POST)
                .path("/oauth/access_token")
                .header_exists("authorization");
            then.status(200).body(
                "oauth_token=final&oauth_token_secret=final-secret&screen_name=photographer&user_id=42",
            );
        });

        let client = client(&server);
        let temporary = client.request_token().await.unwrap();
        request_mock.assert();
        assert_eq!(temporary.token, "temp");

        let authorize = client.authorization_url(&temporary);
        assert!(authorize.as_str().ends_with("/oauth/authorize?oauth_token=temp"));

        let tokens = client.access_token(&temporary, "v3r1f13r").await.unwrap();
        access_mock.assert();
        assert_eq!(tokens.token, "final");
        assert_eq!(tokens.token_secret, "final-secret");
        assert_eq!(tokens.extra.get("screen_name").map(String::as_str), Some("photographer"));
    }

    #[tokio::test]
    async fn request_token_failure_reports_endpoint_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/oauth/request_token");
            then.status(401).body("Invalid consumer key");
        });
        let err = client(&server).request_token().await.unwrap_err();
        match err {
            AuthError::TokenEndpoint { status, body } => {
                assert_eq!(status.as_u16(), 401);
                assert_eq!(body, "Invalid consumer key");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
