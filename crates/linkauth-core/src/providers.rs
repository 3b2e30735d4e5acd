//! Static descriptors for the supported providers.

use std::borrow::Cow;

use url::Url;

use crate::auth::{
    AuthStrategy, CookieStrategy, OAuth1Endpoints, OAuth1Placement, OAuth1Strategy, OAuth2Strategy,
    OAuthClient, OAuthEndpoints, SignatureMethod, TokenLocation,
};

/// How a provider authenticates, with the endpoints its login flow needs.
#[derive(Debug, Clone)]
pub enum AuthScheme {
    OAuth1 {
        placement: OAuth1Placement,
        method: SignatureMethod,
        request_token_url: &'static str,
        authorize_url: &'static str,
        access_token_url: &'static str,
    },
    OAuth2 {
        location: TokenLocation,
        authorize_url: &'static str,
        token_url: &'static str,
        default_scopes: &'static [&'static str],
    },
    Cookie {
        login_url: &'static str,
        cookies_domain: &'static str,
        session_cookie: &'static str,
        csrf_cookie: Option<&'static str>,
        csrf_header: Option<&'static str>,
        /// Pages that indicate a finished login when no redirect URL exists.
        /// Entries match exactly, ignoring query and fragment; a trailing `*` matches by prefix.
        success_pages: &'static [&'static str],
    },
}

/// Static per-provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub api_base_url: &'static str,
    pub scheme: AuthScheme,
    /// Sent on every call (API version pins, media types).
    pub fixed_headers: &'static [(&'static str, &'static str)],
    /// Added to every call's parameters, before signing.
    pub fixed_params: &'static [(&'static str, &'static str)],
    /// Header that carries the account's `app_id`, when the provider wants one.
    pub app_id_header: Option<&'static str>,
    /// JSON pointers checked, in order, for an error message on non-2xx responses.
    pub error_paths: &'static [&'static str],
}

impl ProviderDescriptor {
    pub fn kind_name(&self) -> &'static str {
        match self.scheme {
            AuthScheme::OAuth1 { .. } => "oauth1",
            AuthScheme::OAuth2 { .. } => "oauth2",
            AuthScheme::Cookie { .. } => "cookie",
        }
    }

    pub fn api_base(&self) -> Result<Url, url::ParseError> {
        Url::parse(self.api_base_url)
    }

    /// Strategy for this provider. `oauth` enables OAuth2 refresh and is ignored for other
    /// schemes.
    pub fn strategy(&self, oauth: Option<OAuthClient>) -> AuthStrategy {
        match &self.scheme {
            AuthScheme::OAuth1 {
                placement, method, ..
            } => AuthStrategy::OAuth1(OAuth1Strategy {
                placement: *placement,
                method: *method,
            }),
            AuthScheme::OAuth2 { location, .. } => AuthStrategy::OAuth2(OAuth2Strategy {
                location: location.clone(),
                oauth,
            }),
            AuthScheme::Cookie { csrf_header, .. } => AuthStrategy::Cookie(CookieStrategy {
                csrf_header: csrf_header.map(Cow::Borrowed),
            }),
        }
    }

    pub fn oauth_endpoints(&self) -> Result<Option<OAuthEndpoints>, url::ParseError> {
        match &self.scheme {
            AuthScheme::OAuth2 {
                authorize_url,
                token_url,
                ..
            } => Ok(Some(OAuthEndpoints {
                authorization_url: Url::parse(authorize_url)?,
                token_url: Url::parse(token_url)?,
            })),
            _ => Ok(None),
        }
    }

    pub fn oauth1_endpoints(&self) -> Result<Option<OAuth1Endpoints>, url::ParseError> {
        match &self.scheme {
            AuthScheme::OAuth1 {
                request_token_url,
                authorize_url,
                access_token_url,
                ..
            } => Ok(Some(OAuth1Endpoints {
                request_token_url: Url::parse(request_token_url)?,
                authorize_url: Url::parse(authorize_url)?,
                access_token_url: Url::parse(access_token_url)?,
            })),
            _ => Ok(None),
        }
    }

    pub fn default_scopes(&self) -> &'static [&'static str] {
        match self.scheme {
            AuthScheme::OAuth2 { default_scopes, .. } => default_scopes,
            _ => &[],
        }
    }

    /// Environment variable prefix for client credentials, e.g. `LINKAUTH_GITHUB`.
    pub fn env_prefix(&self) -> String {
        format!("LINKAUTH_{}", self.id.to_ascii_uppercase())
    }
}

/// Error locations tried after a provider's own list.
pub const DEFAULT_ERROR_PATHS: &[&str] = &["/meta/errorDetail", "/message", "/title", "/detail", "/error"];

static PROVIDERS: [ProviderDescriptor; 13] = [
    ProviderDescriptor {
        id: "github",
        name: "GitHub",
        api_base_url: "https://api.github.com",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            default_scopes: &["read:user"],
        },
        fixed_headers: &[
            ("Accept", "application/vnd.github+json"),
            ("X-GitHub-Api-Version", "2022-11-28"),
        ],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/message"],
    },
    ProviderDescriptor {
        id: "reddit",
        name: "Reddit",
        api_base_url: "https://oauth.reddit.com",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://www.reddit.com/api/v1/authorize.compact",
            token_url: "https://www.reddit.com/api/v1/access_token",
            default_scopes: &["identity", "read"],
        },
        fixed_headers: &[],
        fixed_params: &[("raw_json", "1")],
        app_id_header: None,
        error_paths: &["/message", "/error"],
    },
    ProviderDescriptor {
        id: "twitter",
        name: "Twitter",
        api_base_url: "https://api.twitter.com/1.1",
        scheme: AuthScheme::OAuth1 {
            placement: OAuth1Placement::Header,
            method: SignatureMethod::HmacSha1,
            request_token_url: "https://api.twitter.com/oauth/request_token",
            authorize_url: "https://api.twitter.com/oauth/authorize",
            access_token_url: "https://api.twitter.com/oauth/access_token",
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/errors", "/error"],
    },
    ProviderDescriptor {
        id: "tumblr",
        name: "Tumblr",
        api_base_url: "https://api.tumblr.com/v2",
        scheme: AuthScheme::OAuth1 {
            placement: OAuth1Placement::Header,
            method: SignatureMethod::HmacSha1,
            request_token_url: "https://www.tumblr.com/oauth/request_token",
            authorize_url: "https://www.tumblr.com/oauth/authorize",
            access_token_url: "https://www.tumblr.com/oauth/access_token",
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/errors", "/meta/msg"],
    },
    ProviderDescriptor {
        id: "flickr",
        name: "Flickr",
        api_base_url: "https://api.flickr.com/services/rest",
        scheme: AuthScheme::OAuth1 {
            placement: OAuth1Placement::Query,
            method: SignatureMethod::HmacSha1,
            request_token_url: "https://www.flickr.com/services/oauth/request_token",
            authorize_url: "https://www.flickr.com/services/oauth/authorize",
            access_token_url: "https://www.flickr.com/services/oauth/access_token",
        },
        fixed_headers: &[],
        fixed_params: &[("format", "json"), ("nojsoncallback", "1")],
        app_id_header: None,
        error_paths: &["/message"],
    },
    ProviderDescriptor {
        id: "pinterest",
        name: "Pinterest",
        api_base_url: "https://api.pinterest.com/v5",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://www.pinterest.com/oauth/",
            token_url: "https://api.pinterest.com/v5/oauth/token",
            default_scopes: &["user_accounts:read", "boards:read", "pins:read"],
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/message", "/error/message"],
    },
    ProviderDescriptor {
        id: "foursquare",
        name: "Foursquare",
        api_base_url: "https://api.foursquare.com/v2",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Query(Cow::Borrowed("oauth_token")),
            authorize_url: "https://foursquare.com/oauth2/authenticate",
            token_url: "https://foursquare.com/oauth2/access_token",
            default_scopes: &[],
        },
        fixed_headers: &[],
        fixed_params: &[("v", "20231010")],
        app_id_header: None,
        error_paths: &["/meta/errorDetail", "/meta/errorType"],
    },
    ProviderDescriptor {
        id: "twitch",
        name: "Twitch",
        api_base_url: "https://api.twitch.tv/helix",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://id.twitch.tv/oauth2/authorize",
            token_url: "https://id.twitch.tv/oauth2/token",
            default_scopes: &["user:read:email"],
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: Some("Client-Id"),
        error_paths: &["/message", "/error"],
    },
    ProviderDescriptor {
        id: "instagram",
        name: "Instagram",
        api_base_url: "https://i.instagram.com/api/v1",
        scheme: AuthScheme::Cookie {
            login_url: "https://www.instagram.com/accounts/login/",
            cookies_domain: ".instagram.com",
            session_cookie: "sessionid",
            csrf_cookie: Some("csrftoken"),
            csrf_header: Some("X-CSRFToken"),
            success_pages: &[
                "https://www.instagram.com/",
                "https://www.instagram.com/accounts/onetap/*",
            ],
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: Some("X-IG-App-ID"),
        error_paths: &["/message", "/feedback_message"],
    },
    ProviderDescriptor {
        id: "dribbble",
        name: "Dribbble",
        api_base_url: "https://api.dribbble.com/v2",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://dribbble.com/oauth/authorize",
            token_url: "https://dribbble.com/oauth/token",
            default_scopes: &["public"],
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/message", "/errors"],
    },
    ProviderDescriptor {
        id: "deviantart",
        name: "DeviantArt",
        api_base_url: "https://www.deviantart.com/api/v1/oauth2",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Query(Cow::Borrowed("access_token")),
            authorize_url: "https://www.deviantart.com/oauth2/authorize",
            token_url: "https://www.deviantart.com/oauth2/token",
            default_scopes: &["browse", "user"],
        },
        fixed_headers: &[],
        fixed_params: &[("mature_content", "false")],
        app_id_header: None,
        error_paths: &["/error_description", "/error"],
    },
    ProviderDescriptor {
        id: "imgur",
        name: "Imgur",
        api_base_url: "https://api.imgur.com/3",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://api.imgur.com/oauth2/authorize",
            token_url: "https://api.imgur.com/oauth2/token",
            default_scopes: &[],
        },
        fixed_headers: &[],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/data/error"],
    },
    ProviderDescriptor {
        id: "unsplash",
        name: "Unsplash",
        api_base_url: "https://api.unsplash.com",
        scheme: AuthScheme::OAuth2 {
            location: TokenLocation::Header,
            authorize_url: "https://unsplash.com/oauth/authorize",
            token_url: "https://unsplash.com/oauth/token",
            default_scopes: &["public"],
        },
        fixed_headers: &[("Accept-Version", "v1")],
        fixed_params: &[],
        app_id_header: None,
        error_paths: &["/errors"],
    },
];

pub fn all() -> &'static [ProviderDescriptor] {
    &PROVIDERS
}

/// Case-insensitive lookup by provider id.
pub fn find(id: &str) -> Option<&'static ProviderDescriptor> {
    PROVIDERS
        .iter()
        .find(|provider| provider.id.eq_ignore_ascii_case(id))
}
