use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode, Url};

use crate::error::FetchError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Retrieves a raw response body for a provider request.
///
/// Knows nothing about providers, weather, or persistence.
#[async_trait]
pub trait Fetcher: Send + Sync + Debug {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<String, FetchError>;
}

/// Uncached GET over HTTP(S). Only 200 and 201 count as success.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Result<Self, FetchError> {
        let http = Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("weather-refresh/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<String, FetchError> {
        // The response (and its connection) is dropped on every return path.
        let res = self
            .http
            .get(url.clone())
            .header(header::CACHE_CONTROL, "no-cache")
            .timeout(timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = res.status();
        let body = res.text().await.map_err(classify)?;

        match status {
            StatusCode::OK | StatusCode::CREATED => Ok(body),
            _ => Err(FetchError::Status {
                status: status.as_u16(),
                body: truncate_body(&body),
            }),
        }
    }
}

fn classify(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err)
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    const MAX: usize = 200;
    if body.len() > MAX {
        let mut end = MAX;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &body[..end])
    } else {
        body.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[tokio::test]
    async fn returns_body_on_200_and_201() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .and(header("cache-control", "no-cache"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"a\":1}"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/created"))
            .respond_with(ResponseTemplate::new(201).set_body_string("made"))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new().unwrap();
        let body = fetcher
            .fetch(&url(&server, "/ok"), DEFAULT_READ_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(body, "{\"a\":1}");

        let body = fetcher
            .fetch(&url(&server, "/created"), DEFAULT_READ_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(body, "made");
    }

    #[tokio::test]
    async fn other_statuses_are_errors() {
        let server = MockServer::start().await;
        for (p, status) in [("/nc", 204), ("/bad", 401), ("/boom", 503)] {
            Mock::given(method("GET"))
                .and(path(p))
                .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
                .mount(&server)
                .await;
        }

        let fetcher = HttpFetcher::new().unwrap();
        for (p, expected) in [("/nc", 204), ("/bad", 401), ("/boom", 503)] {
            let err = fetcher
                .fetch(&url(&server, p), DEFAULT_READ_TIMEOUT)
                .await
                .unwrap_err();
            match err {
                FetchError::Status { status, .. } => assert_eq!(status, expected),
                other => panic!("unexpected error: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let err = HttpFetcher::new()
            .unwrap()
            .fetch(&url(&server, "/slow"), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Timeout), "got {err:?}");
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        // Port 9 (discard) on localhost is expected to refuse connections.
        let err = HttpFetcher::new()
            .unwrap()
            .fetch(
                &Url::parse("http://127.0.0.1:9/").unwrap(),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            FetchError::Transport(_) | FetchError::Timeout
        ));
    }

    #[test]
    fn truncate_body_respects_char_boundaries() {
        let long = "é".repeat(150);
        let out = truncate_body(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 203);
        assert_eq!(truncate_body("short"), "short");
    }
}
