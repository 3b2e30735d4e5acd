use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, warn};

use super::credential::{normalize_domain, Cookie};

/// Error returned when the cookie jar refuses a write.
#[derive(Debug, Error)]
#[error("cookie jar rejected '{name}': {reason}")]
pub struct CookieJarError {
    pub name: String,
    pub reason: String,
}

/// Shared HTTP cookie storage of the platform web view. The jar is shared by every
/// provider, so callers go through [`ScopedCookieJar`] rather than touching it directly.
#[async_trait]
pub trait CookieJar: Send + Sync {
    async fn all_cookies(&self) -> Vec<Cookie>;
    async fn set_cookie(&self, cookie: Cookie) -> Result<(), CookieJarError>;
    async fn delete_cookie(&self, cookie: &Cookie) -> Result<(), CookieJarError>;
}

/// In-process cookie jar, used by the CLI and in tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryCookieJar {
    cookies: Arc<Mutex<Vec<Cookie>>>,
}

impl MemoryCookieJar {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CookieJar for MemoryCookieJar {
    async fn all_cookies(&self) -> Vec<Cookie> {
        self.cookies
            .lock()
            .map(|cookies| cookies.clone())
            .unwrap_or_default()
    }

    async fn set_cookie(&self, cookie: Cookie) -> Result<(), CookieJarError> {
        let mut cookies = self.cookies.lock().map_err(|_| CookieJarError {
            name: cookie.name.clone(),
            reason: "cookie storage poisoned".into(),
        })?;
        cookies.retain(|existing| !existing.same_slot(&cookie));
        cookies.push(cookie);
        Ok(())
    }

    async fn delete_cookie(&self, cookie: &Cookie) -> Result<(), CookieJarError> {
        let mut cookies = self.cookies.lock().map_err(|_| CookieJarError {
            name: cookie.name.clone(),
            reason: "cookie storage poisoned".into(),
        })?;
        cookies.retain(|existing| !existing.same_slot(cookie));
        Ok(())
    }
}

/// Domain-filtered view of the shared cookie jar. Reads only return cookies in scope
/// and writes outside the scope are refused.
#[derive(Clone)]
pub struct ScopedCookieJar {
    jar: Arc<dyn CookieJar>,
    domain: String,
}

impl fmt::Debug for ScopedCookieJar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedCookieJar")
            .field("domain", &self.domain)
            .finish_non_exhaustive()
    }
}

impl ScopedCookieJar {
    pub fn new(jar: Arc<dyn CookieJar>, domain: impl Into<String>) -> Self {
        Self {
            jar,
            domain: domain.into(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Whether a host name (e.g. `www.instagram.com`) belongs to this scope.
    pub fn covers_host(&self, host: &str) -> bool {
        let host = normalize_domain(host);
        let scope = normalize_domain(&self.domain);
        !scope.is_empty() && (host == scope || host.ends_with(&format!(".{scope}")))
    }

    /// Unexpired cookies belonging to this scope.
    pub async fn cookies(&self) -> Vec<Cookie> {
        self.jar
            .all_cookies()
            .await
            .into_iter()
            .filter(|cookie| cookie.matches_domain(&self.domain) && !cookie.is_expired())
            .collect()
    }

    pub async fn find(&self, name: &str) -> Option<Cookie> {
        self.cookies()
            .await
            .into_iter()
            .find(|cookie| cookie.name == name && !cookie.value.is_empty())
    }

    /// Write cookies back into the jar concurrently. Out-of-scope cookies are skipped and
    /// individual write failures are logged; returns how many cookies were written.
    pub async fn inject(&self, cookies: &[Cookie]) -> usize {
        let writes = cookies
            .iter()
            .filter(|cookie| {
                let in_scope = cookie.matches_domain(&self.domain);
                if !in_scope {
                    debug!(
                        cookie = %cookie.name,
                        domain = %cookie.domain,
                        scope = %self.domain,
                        "skipping cookie outside provider scope"
                    );
                }
                in_scope
            })
            .map(|cookie| self.jar.set_cookie(cookie.clone()));

        let mut written = 0;
        for result in join_all(writes).await {
            match result {
                Ok(()) => written += 1,
                Err(err) => warn!(scope = %self.domain, error = %err, "failed to restore cookie"),
            }
        }
        written
    }

    /// Remove every cookie in scope; failures are logged and skipped.
    pub async fn clear(&self) {
        let cookies = self.cookies().await;
        let deletes = cookies.iter().map(|cookie| self.jar.delete_cookie(cookie));
        for result in join_all(deletes).await {
            if let Err(err) = result {
                warn!(scope = %self.domain, error = %err, "failed to delete cookie");
            }
        }
    }
}
