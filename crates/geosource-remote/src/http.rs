//! HTTP transport shared by the remote sources: timeout, credentials, an
//! admission gate on in-flight requests and transparent gzip decoding.

use bytes::Bytes;
use flate2::read::GzDecoder;
use geosource_core::config::{AuthConfig, HttpSettings};
use geosource_core::error::{GeosourceError, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use std::fmt;
use std::io::Read;
use std::sync::Arc;
use tokio::sync::Semaphore;
use url::Url;

const DEFAULT_USER_AGENT: &str = concat!("geosource/", env!("CARGO_PKG_VERSION"));
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Client for one remote source
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    auth: AuthConfig,
    gate: Arc<Semaphore>,
    max_concurrent: usize,
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let auth = match &self.auth {
            AuthConfig::None => "none",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::ApiKey { .. } => "api_key",
        };
        f.debug_struct("HttpClient")
            .field("auth", &auth)
            .field("max_concurrent", &self.max_concurrent)
            .finish()
    }
}

fn transport_error(url: &Url, error: reqwest::Error) -> GeosourceError {
    if error.is_timeout() {
        GeosourceError::Http(format!("request to {url} timed out"))
    } else if error.is_connect() {
        GeosourceError::Connection { message: format!("{url}: {error}") }
    } else {
        GeosourceError::Http(format!("{url}: {error}"))
    }
}

/// Inflate a gzip body; anything else passes through untouched
pub fn decompress(body: Bytes) -> Result<Bytes> {
    if !body.starts_with(&GZIP_MAGIC) {
        return Ok(body);
    }
    let mut inflated = Vec::with_capacity(body.len() * 4);
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut inflated)
        .map_err(|e| GeosourceError::format("gzip", e.to_string()))?;
    Ok(Bytes::from(inflated))
}

/// Parse a JSON body
pub fn parse_json(body: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(body).map_err(|e| GeosourceError::Serialization(e.to_string()))
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        settings.validate()?;
        let user_agent = settings.user_agent.clone().unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let client = reqwest::Client::builder()
            .connect_timeout(settings.timeout())
            .timeout(settings.timeout())
            .user_agent(user_agent)
            .build()
            .map_err(|e| GeosourceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            auth: settings.auth.clone(),
            gate: Arc::new(Semaphore::new(settings.max_concurrent)),
            max_concurrent: settings.max_concurrent,
        })
    }

    /// Maximum simultaneous in-flight requests
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    fn request(&self, method: Method, url: &Url) -> RequestBuilder {
        let builder = self.client.request(method, url.clone());
        match &self.auth {
            AuthConfig::None => builder,
            AuthConfig::Bearer { token } => builder.bearer_auth(token),
            AuthConfig::ApiKey { header, key } => builder.header(header.as_str(), key.as_str()),
        }
    }

    /// Send a request once a slot is free. Waits rather than failing when
    /// the gate is saturated. `None` for 404.
    async fn send(&self, builder: RequestBuilder, url: &Url) -> Result<Option<Bytes>> {
        let _permit = Arc::clone(&self.gate)
            .acquire_owned()
            .await
            .map_err(|_| GeosourceError::Http("request gate closed".to_string()))?;

        tracing::debug!(%url, "HTTP request");
        let response = builder.send().await.map_err(|e| transport_error(url, e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let text: String = text.chars().take(200).collect();
            return Err(GeosourceError::Http(format!("{status} from {url}: {text}")));
        }
        let body = response.bytes().await.map_err(|e| transport_error(url, e))?;
        decompress(body).map(Some)
    }

    /// GET a body, treating 404 as absent
    pub async fn get_optional(&self, url: &Url) -> Result<Option<Bytes>> {
        self.send(self.request(Method::GET, url), url).await
    }

    pub async fn get_bytes(&self, url: &Url) -> Result<Bytes> {
        self.get_optional(url)
            .await?
            .ok_or_else(|| GeosourceError::NotFound { what: url.to_string() })
    }

    pub async fn get_text(&self, url: &Url) -> Result<String> {
        let body = self.get_bytes(url).await?;
        String::from_utf8(body.to_vec()).map_err(|e| GeosourceError::format("HTTP body", e.to_string()))
    }

    pub async fn get_json(&self, url: &Url) -> Result<serde_json::Value> {
        parse_json(&self.get_bytes(url).await?)
    }

    /// Send a JSON body; returns the parsed response body when there is one
    pub async fn send_json(
        &self,
        method: Method,
        url: &Url,
        body: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        let response = self
            .send(self.request(method, url).json(body), url)
            .await?
            .ok_or_else(|| GeosourceError::NotFound { what: url.to_string() })?;
        if response.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        parse_json(&response).map(Some)
    }

    /// DELETE; false when the resource does not exist
    pub async fn delete(&self, url: &Url) -> Result<bool> {
        Ok(self.send(self.request(Method::DELETE, url), url).await?.is_some())
    }
}

/// Parse a configured URL
pub fn parse_url(text: &str) -> Result<Url> {
    Url::parse(text).map_err(|e| GeosourceError::ConfigInvalid {
        key: "url".to_string(),
        reason: format!("{text}: {e}"),
    })
}

/// Join a path template result onto a base URL, keeping the base path
pub fn join_path(base: &Url, path: &str) -> Result<Url> {
    if path.starts_with("http://") || path.starts_with("https://") {
        return parse_url(path);
    }
    let mut url = base.clone();
    let joined = format!("{}/{}", base.path().trim_end_matches('/'), path.trim_start_matches('/'));
    url.set_path(&joined);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_gzip_is_inflated() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = Bytes::from(encoder.finish().unwrap());

        let body = decompress(compressed).unwrap();
        assert_eq!(body.as_ref(), b"{\"ok\":true}");
        assert_eq!(decompress(Bytes::from_static(b"plain")).unwrap().as_ref(), b"plain");
    }

    #[test]
    fn test_truncated_gzip_is_a_format_error() {
        let err = decompress(Bytes::from_static(&[0x1f, 0x8b, 0x08])).unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_join_path_keeps_base_path() {
        let base = parse_url("https://example.com/api/v1/").unwrap();
        assert_eq!(join_path(&base, "/roads/7").unwrap().as_str(), "https://example.com/api/v1/roads/7");
        let base = parse_url("https://example.com").unwrap();
        assert_eq!(join_path(&base, "roads").unwrap().as_str(), "https://example.com/roads");
        assert_eq!(
            join_path(&base, "https://other.example.com/x").unwrap().as_str(),
            "https://other.example.com/x"
        );
    }

    #[test]
    fn test_debug_hides_credentials() {
        let settings = HttpSettings {
            auth: AuthConfig::Bearer { token: "secret-token".into() },
            ..HttpSettings::default()
        };
        let client = HttpClient::new(&settings).unwrap();
        let text = format!("{client:?}");
        assert!(text.contains("bearer"));
        assert!(!text.contains("secret-token"));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = HttpSettings { max_concurrent: 0, ..HttpSettings::default() };
        assert!(HttpClient::new(&settings).is_err());
    }
}
