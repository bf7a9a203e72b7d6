//! HTTP client wrapper for the Neko service.
//!
//! Owns the shared `reqwest::Client`, resolves endpoint URLs from the
//! configured API root, and builds the header sets every call needs.
//! Timeouts are applied per request: the stream call must stay unbounded
//! while the bookkeeping calls carry short budgets.

use std::time::Duration;

use reqwest::header::{
    ACCEPT, CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, ORIGIN, REFERER, USER_AGENT,
};
use reqwest::{Client, Response};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::{Credentials, NekoConfig};
use crate::neko::NekoError;

const SITE_ORIGIN: &str = "https://anuneko.com";
const SITE_REFERER: &str = "https://anuneko.com/";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0";
const APP_ID: &str = "com.anuttacon.neko";
const CLIENT_TYPE: &str = "4";

const X_APP_ID: HeaderName = HeaderName::from_static("x-app_id");
const X_CLIENT_TYPE: HeaderName = HeaderName::from_static("x-client_type");
const X_DEVICE_ID: HeaderName = HeaderName::from_static("x-device_id");
const X_TOKEN: HeaderName = HeaderName::from_static("x-token");

/// Shared handle to the Neko API. Cheap to clone: `reqwest::Client` is an
/// `Arc` internally.
#[derive(Debug, Clone)]
pub struct NekoClient {
    http: Client,
    base_url: String,
    device_id: String,
    credentials: Credentials,
    request_timeout: Duration,
    choice_timeout: Duration,
}

impl NekoClient {
    pub fn new(config: &NekoConfig, credentials: Credentials) -> Result<Self, NekoError> {
        let http = Client::builder()
            .build()
            .map_err(|e| NekoError::Request(format!("failed to build HTTP client: {e}")))?;

        if credentials.token.is_none() {
            warn!("ANUNEKO_TOKEN not set; requests will be sent without x-token");
        }

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            device_id: config.device_id.clone(),
            credentials,
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            choice_timeout: Duration::from_secs(config.choice_timeout_seconds),
        })
    }

    // ── Endpoints ─────────────────────────────────────────────────────────────

    pub fn chat_url(&self) -> String {
        format!("{}/chat", self.base_url)
    }

    pub fn select_model_url(&self) -> String {
        format!("{}/user/select_model", self.base_url)
    }

    pub fn stream_url(&self, conversation_id: &str) -> String {
        format!("{}/msg/{conversation_id}/stream", self.base_url)
    }

    pub fn select_choice_url(&self) -> String {
        format!("{}/msg/select-choice", self.base_url)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn choice_timeout(&self) -> Duration {
        self.choice_timeout
    }

    // ── Headers ───────────────────────────────────────────────────────────────

    /// Full header set for JSON API calls.
    pub fn api_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ORIGIN, HeaderValue::from_static(SITE_ORIGIN));
        headers.insert(REFERER, HeaderValue::from_static(SITE_REFERER));
        headers.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(X_APP_ID, HeaderValue::from_static(APP_ID));
        headers.insert(X_CLIENT_TYPE, HeaderValue::from_static(CLIENT_TYPE));
        insert_lossy(&mut headers, X_DEVICE_ID, &self.device_id);
        self.insert_credentials(&mut headers);
        headers
    }

    /// Slim header set the stream endpoint expects.
    pub fn stream_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self.insert_credentials(&mut headers);
        headers
    }

    fn insert_credentials(&self, headers: &mut HeaderMap) {
        if let Some(token) = &self.credentials.token {
            insert_lossy(headers, X_TOKEN, token);
        }
        if let Some(cookie) = &self.credentials.cookie {
            insert_lossy(headers, COOKIE, cookie);
        }
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    /// POST a JSON body with the API header set and a per-call timeout.
    ///
    /// The status is not checked here; callers decide what counts as success.
    pub(crate) async fn post_json<B: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &B,
        timeout: Duration,
    ) -> Result<Response, NekoError> {
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string(body)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(%url, payload = %json, "neko request payload");
        }

        let response = self
            .http
            .post(url)
            .headers(self.api_headers())
            .json(body)
            .timeout(timeout)
            .send()
            .await?;

        debug!(%url, status = %response.status(), "neko response");
        Ok(response)
    }

    /// Open the reply stream for `conversation_id`. No timeout.
    pub(crate) async fn open_stream(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<Response, NekoError> {
        let body = serde_json::to_string(&StreamRequest { contents: [text] })
            .map_err(|e| NekoError::Decode(e.to_string()))?;
        let url = self.stream_url(conversation_id);

        debug!(%url, content_len = text.len(), "opening neko stream");

        let response = self
            .http
            .post(&url)
            .headers(self.stream_headers())
            .body(body)
            .send()
            .await?;

        debug!(%url, status = %response.status(), "neko stream opened");
        Ok(response)
    }
}

#[derive(Serialize)]
struct StreamRequest<'a> {
    contents: [&'a str; 1],
}

/// Insert `value` under `name`, skipping (with a warning) values that are not
/// valid header text.
fn insert_lossy(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(v) => {
            headers.insert(name, v);
        }
        Err(_) => warn!(header = %name, "skipping invalid header value"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(credentials: Credentials) -> NekoClient {
        NekoClient::new(&NekoConfig::with_base_url("http://neko.test/api/v1/"), credentials).unwrap()
    }

    fn creds(token: Option<&str>, cookie: Option<&str>) -> Credentials {
        Credentials {
            token: token.map(str::to_string),
            cookie: cookie.map(str::to_string),
        }
    }

    #[test]
    fn endpoints_derive_from_base_url() {
        let c = client(Credentials::default());
        assert_eq!(c.chat_url(), "http://neko.test/api/v1/chat");
        assert_eq!(c.select_model_url(), "http://neko.test/api/v1/user/select_model");
        assert_eq!(c.stream_url("abc"), "http://neko.test/api/v1/msg/abc/stream");
        assert_eq!(c.select_choice_url(), "http://neko.test/api/v1/msg/select-choice");
    }

    #[test]
    fn timeouts_come_from_config() {
        let c = client(Credentials::default());
        assert_eq!(c.request_timeout(), Duration::from_secs(10));
        assert_eq!(c.choice_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn api_headers_carry_device_and_token() {
        let h = client(creds(Some("tok-1"), None)).api_headers();
        assert_eq!(h["x-token"], "tok-1");
        assert_eq!(h["x-device_id"], "7b75a432-6b24-48ad-b9d3-3dc57648e3e3");
        assert_eq!(h["x-app_id"], "com.anuttacon.neko");
        assert_eq!(h["x-client_type"], "4");
        assert_eq!(h[CONTENT_TYPE], "application/json");
        assert!(h.get(COOKIE).is_none());
    }

    #[test]
    fn cookie_is_added_when_configured() {
        let h = client(creds(Some("t"), Some("sid=42"))).api_headers();
        assert_eq!(h[COOKIE], "sid=42");
    }

    #[test]
    fn missing_token_omits_header() {
        let h = client(Credentials::default()).api_headers();
        assert!(h.get("x-token").is_none());
    }

    #[test]
    fn invalid_token_is_skipped() {
        let h = client(creds(Some("bad\ntoken"), None)).api_headers();
        assert!(h.get("x-token").is_none());
    }

    #[test]
    fn stream_headers_are_slim() {
        let h = client(creds(Some("tok"), Some("c=1"))).stream_headers();
        assert_eq!(h.len(), 3);
        assert_eq!(h[CONTENT_TYPE], "text/plain");
        assert_eq!(h["x-token"], "tok");
        assert_eq!(h[COOKIE], "c=1");
    }

    #[test]
    fn stream_body_keeps_unicode() {
        let body = serde_json::to_string(&StreamRequest { contents: ["你好"] }).unwrap();
        assert_eq!(body, r#"{"contents":["你好"]}"#);
    }
}
