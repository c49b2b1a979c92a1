use crate::retry::RetryPolicy;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use derive_more::{Display, Error};
use reqwest::Client;

pub const DEFAULT_MAX_IMAGE_BYTES: usize = 15 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct FetchedImage {
    pub bytes: Bytes,
    pub content_type: String,
}

#[derive(Debug, Display, Error)]
pub enum FetchError {
    #[display("HTTP {status} for {url}")]
    Http { status: u16, url: String },
    #[display("network error for {url}: {reason}")]
    Network { url: String, reason: String },
    #[display("{url} is not an image (content type: {content_type})")]
    NotAnImage { url: String, content_type: String },
    #[display("{url} exceeds the {limit} byte ceiling")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    /// Stable tag for summaries and logs.
    pub fn reason(&self) -> &'static str {
        match self {
            FetchError::Http { .. } => "http_error",
            FetchError::Network { .. } => "network_error",
            FetchError::NotAnImage { .. } => "not_an_image",
            FetchError::TooLarge { .. } => "too_large",
        }
    }

    /// Only transient outcomes are worth another attempt; a 404 or a
    /// non-image body will not get better.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            FetchError::Network { .. } => true,
            FetchError::NotAnImage { .. } | FetchError::TooLarge { .. } => false,
        }
    }
}

pub fn is_image_content_type(raw: &str) -> bool {
    raw.trim()
        .parse::<mime::Mime>()
        .map(|m| m.type_() == mime::IMAGE)
        .unwrap_or(false)
}

#[async_trait]
pub trait ImageFetch: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError>;
}

pub struct HttpImageFetcher {
    client: Client,
    policy: RetryPolicy,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(client: Client, policy: RetryPolicy, max_bytes: usize) -> Self {
        Self {
            client,
            policy,
            max_bytes,
        }
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedImage, FetchError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Network {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if !is_image_content_type(&content_type) {
            return Err(FetchError::NotAnImage {
                url: url.to_string(),
                content_type,
            });
        }
        let mut resp = resp;
        let mut buf = BytesMut::new();
        loop {
            let chunk = resp.chunk().await.map_err(|err| FetchError::Network {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
            match chunk {
                Some(chunk) => {
                    if buf.len() + chunk.len() > self.max_bytes {
                        return Err(FetchError::TooLarge {
                            url: url.to_string(),
                            limit: self.max_bytes,
                        });
                    }
                    buf.extend_from_slice(&chunk);
                }
                None => break,
            }
        }
        log::debug!("Downloaded {url}: {} byte(s), {content_type}", buf.len());
        Ok(FetchedImage {
            bytes: buf.freeze(),
            content_type,
        })
    }
}

#[async_trait]
impl ImageFetch for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FetchError> {
        self.policy
            .run(|| self.fetch_once(url), FetchError::is_retryable)
            .await
    }
}

#[cfg(test)]
pub mod test {

    use super::*;

    fn http(status: u16) -> FetchError {
        FetchError::Http {
            status,
            url: "https://example.com/a.jpg".to_string(),
        }
    }

    #[test]
    fn retries_only_transient_statuses() {
        for status in [429, 500, 502, 503, 504] {
            assert!(http(status).is_retryable(), "{status} should retry");
        }
        for status in [400, 401, 403, 404, 410] {
            assert!(!http(status).is_retryable(), "{status} should not retry");
        }
        assert!(FetchError::Network {
            url: String::new(),
            reason: "connection reset".to_string()
        }
        .is_retryable());
        assert!(!FetchError::NotAnImage {
            url: String::new(),
            content_type: "text/html".to_string()
        }
        .is_retryable());
        assert!(!FetchError::TooLarge {
            url: String::new(),
            limit: 1
        }
        .is_retryable());
    }

    #[test]
    fn tags_every_failure_reason() {
        assert_eq!("http_error", http(503).reason());
        assert_eq!(
            "network_error",
            FetchError::Network {
                url: String::new(),
                reason: String::new()
            }
            .reason()
        );
        assert_eq!(
            "not_an_image",
            FetchError::NotAnImage {
                url: String::new(),
                content_type: String::new()
            }
            .reason()
        );
        assert_eq!(
            "too_large",
            FetchError::TooLarge {
                url: String::new(),
                limit: 0
            }
            .reason()
        );
    }

    #[test]
    fn validates_image_content_types() {
        assert!(is_image_content_type("image/jpeg"));
        assert!(is_image_content_type("image/png"));
        assert!(is_image_content_type("image/webp; charset=binary"));
        assert!(!is_image_content_type("text/html"));
        assert!(!is_image_content_type("application/octet-stream"));
        assert!(!is_image_content_type(""));
    }
}
