use anyhow::Context;
use async_trait::async_trait;
use chrono::NaiveDate;
use log::debug;
use reqwest::{header, Client};
use thiserror::Error;

use crate::cfg::TargetConfig;

use super::{AvailabilityResult, Detector};

/// Why a page could not be read. Fetch failures are values, not panics:
/// the watcher decides per date whether to skip or to abort.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// No response at all (connect failure, timeout, truncated body).
    #[error("transport error: {0}")]
    Transport(String),
    /// The server answered with a non success status.
    #[error("unexpected status: {0}")]
    Status(String),
}

#[async_trait]
pub trait Fetch: Send + Sync {
    /// Reads the calendar, optionally asking for the window around
    /// `target_date`. Exactly one request is made; nothing is retried.
    async fn check_availability(
        &self,
        target_date: Option<NaiveDate>,
    ) -> Result<AvailabilityResult, FetchError>;
}

pub struct Fetcher {
    client: Client,
    url: String,
    date_param: String,
    detector: Detector,
}

impl Fetcher {
    pub fn new(config: &TargetConfig, detector: Detector) -> Result<Self, anyhow::Error> {
        let timeout = humantime::parse_duration(&config.timeout)
            .context("invalid format in the timeout duration")?;

        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(timeout)
            .build()
            .context("failed to build the http client")?;

        Ok(Self::with_client(client, config, detector))
    }

    pub fn with_client(client: Client, config: &TargetConfig, detector: Detector) -> Self {
        Self {
            client,
            url: config.url.clone(),
            date_param: config.date_param.clone(),
            detector,
        }
    }

    async fn fetch_page(&self, target_date: Option<NaiveDate>) -> Result<String, FetchError> {
        let mut request = self
            .client
            .get(&self.url)
            .header(header::ACCEPT, "text/html,application/xhtml+xml");

        if let Some(date) = target_date {
            request = request.query(&[(
                self.date_param.as_str(),
                date.format("%Y-%m-%d").to_string(),
            )]);
        }

        let response = request
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.to_string()));
        }

        // decoded using the charset announced by the page (often Shift_JIS)
        response
            .text()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }
}

#[async_trait]
impl Fetch for Fetcher {
    async fn check_availability(
        &self,
        target_date: Option<NaiveDate>,
    ) -> Result<AvailabilityResult, FetchError> {
        let markup = self.fetch_page(target_date).await?;
        debug!(
            "fetched {} bytes for {}",
            markup.len(),
            target_date.map_or_else(|| "all dates".to_string(), |d| d.to_string())
        );

        Ok(self.detector.detect(&markup, target_date))
    }
}

#[cfg(test)]
mod test {
    use chrono::NaiveDate;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    use crate::{
        calendar::{Detector, Fetch, FetchError},
        cfg::TargetConfig,
    };

    use super::Fetcher;

    fn fetcher(url: String) -> Fetcher {
        // straight to the local listener, whatever the proxy environment says
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        Fetcher::with_client(client, &target(url), Detector::new().unwrap())
    }

    fn target(url: String) -> TargetConfig {
        TargetConfig {
            url,
            date_param: "date".to_string(),
            user_agent: "vacancy-watch/test".to_string(),
            timeout: "5s".to_string(),
        }
    }

    /// Answers a single request with `status` and `body`, and hands back the
    /// request head that was received.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (send, recv) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            let _ = send.send(String::from_utf8_lossy(&head).to_string());
        });

        (format!("http://{addr}/calendar"), recv)
    }

    #[tokio::test]
    async fn success_goes_through_detector() {
        let body = r#"<table class="calendar"><tr><th></th><th>1/3</th></tr><tr><th>12:00</th><td>○</td></tr></table>"#;
        let (url, head) = serve_once("200 OK", body).await;
        let fetcher = fetcher(url);

        let date = NaiveDate::from_ymd_opt(2025, 1, 3).unwrap();
        let result = fetcher.check_availability(Some(date)).await.unwrap();

        assert!(result.has_availability);
        assert_eq!(result.time_slots[&date], vec!["12:00".to_string()]);

        let head = head.await.unwrap();
        assert!(head.starts_with("GET /calendar?date=2025-01-03 "));
    }

    #[tokio::test]
    async fn error_status_is_reported() {
        let (url, _head) = serve_once("503 Service Unavailable", "busy").await;
        let fetcher = fetcher(url);

        let result = fetcher.check_availability(None).await;
        assert!(matches!(result, Err(FetchError::Status(s)) if s.starts_with("503")));
    }

    #[tokio::test]
    async fn refused_connection_is_transport() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = fetcher(format!("http://{addr}/calendar"));

        let result = fetcher.check_availability(None).await;
        assert!(matches!(result, Err(FetchError::Transport(_))));
    }

    #[test]
    fn bad_timeout_is_rejected() {
        let mut config = target("http://localhost".to_string());
        config.timeout = "soon".to_string();

        assert!(Fetcher::new(&config, Detector::new().unwrap()).is_err());
    }
}
