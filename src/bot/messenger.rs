use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;

use crate::cfg::MessagingConfig;

#[derive(Debug, Error)]
pub enum MessengerError {
    #[error("failed to reach the messaging api: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("messaging api answered {status}: {body}")]
    Rejected { status: String, body: String },
}

/// Delivers text messages to the registered recipient.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn push(&self, to: &str, text: &str) -> Result<(), MessengerError>;
}

#[derive(Serialize)]
struct TextMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    text: &'a str,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    to: &'a str,
    messages: [TextMessage<'a>; 1],
}

/// Client for a push style messaging api (`POST {endpoint}/push` with a
/// bearer token and a json body).
pub struct HttpMessenger {
    client: Client,
    endpoint: String,
    token: String,
}

impl HttpMessenger {
    pub fn new(config: &MessagingConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .build()
            .context("failed to build the messaging client")?;

        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &MessagingConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        }
    }
}

#[async_trait]
impl Messenger for HttpMessenger {
    async fn push(&self, to: &str, text: &str) -> Result<(), MessengerError> {
        let body = PushRequest {
            to,
            messages: [TextMessage { kind: "text", text }],
        };

        let response = self
            .client
            .post(format!("{}/push", self.endpoint))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(MessengerError::Rejected {
                status: status.to_string(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
pub use fake::FakeMessenger;


#[cfg(test)]
mod test {
    use serde_json::Value;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
        sync::oneshot,
    };

    use crate::cfg::MessagingConfig;

    use super::{HttpMessenger, Messenger, MessengerError};

    fn messenger(endpoint: String, token: &str) -> HttpMessenger {
        let client = reqwest::Client::builder().no_proxy().build().unwrap();
        HttpMessenger::with_client(
            client,
            &MessagingConfig {
                endpoint,
                token: token.to_string(),
            },
        )
    }

    /// Reads one full request (head and body) and answers with `status`.
    async fn serve_once(status: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (send, recv) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);

                let text = String::from_utf8_lossy(&request).to_string();
                if let Some((head, body)) = text.split_once("\r\n\r\n") {
                    let length = head
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if body.len() >= length {
                        break;
                    }
                }
            }

            let response =
                format!("HTTP/1.1 {status}\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}");
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            let _ = send.send(String::from_utf8_lossy(&request).to_string());
        });

        (format!("http://{addr}/v2/bot/message/"), recv)
    }

    #[tokio::test]
    async fn push_posts_a_text_message() {
        let (endpoint, request) = serve_once("200 OK").await;
        let messenger = messenger(endpoint, "secret");

        messenger.push("U123", "slots are open").await.unwrap();

        let request = request.await.unwrap();
        let (head, body) = request.split_once("\r\n\r\n").unwrap();
        assert!(head.starts_with("POST /v2/bot/message/push "));
        assert!(head.to_ascii_lowercase().contains("authorization: bearer secret"));

        let body: Value = serde_json::from_str(body).unwrap();
        assert_eq!(body["to"], "U123");
        assert_eq!(body["messages"][0]["type"], "text");
        assert_eq!(body["messages"][0]["text"], "slots are open");
    }

    #[tokio::test]
    async fn rejected_push_is_an_error() {
        let (endpoint, _request) = serve_once("401 Unauthorized").await;
        let messenger = messenger(endpoint, "wrong");

        let result = messenger.push("U123", "hello").await;
        assert!(matches!(result, Err(MessengerError::Rejected { status, .. }) if status.starts_with("401")));
    }
}
