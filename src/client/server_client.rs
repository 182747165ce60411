// HTTP client for the storage registration server
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::error::{BinderError, Result};

/// Remote collaborator told about capacity and liveness.
///
/// Every call is best-effort from the controller's point of view: failures
/// are logged, never rolled back.
#[async_trait]
pub trait ServerNotifier: Send + Sync {
    /// Announce (or refresh) this address with its capacity in bytes.
    async fn register(&self, address: &str, capacity_bytes: u64) -> Result<()>;
    async fn heartbeat(&self, address: &str) -> Result<()>;
    /// Tell the server this address no longer provides storage.
    async fn remove(&self, address: &str) -> Result<()>;
}

pub struct HttpNotifier {
    base_url: String,
    client: Client,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let url = format!("{}/{}", self.base_url, endpoint);
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BinderError::Server(format!("Cannot reach server at {}: {}", url, e)))?
            .error_for_status()
            .map_err(|e| BinderError::Server(format!("{} rejected request: {}", url, e)))?;

        // Some endpoints answer with an empty body
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| BinderError::Server(format!("Failed to parse response from {}: {}", url, e)))
    }
}

#[async_trait]
impl ServerNotifier for HttpNotifier {
    async fn register(&self, address: &str, capacity_bytes: u64) -> Result<()> {
        let res = self
            .post(
                "verify_storage",
                json!({
                    "user_id": address,
                    "capacity": capacity_bytes.to_string(),
                }),
            )
            .await?;

        match res["status"].as_str() {
            Some("success") => Ok(()),
            other => Err(BinderError::Server(format!(
                "Failed to update user info on the server (status: {})",
                other.unwrap_or("missing")
            ))),
        }
    }

    async fn heartbeat(&self, address: &str) -> Result<()> {
        self.post("heartbeat", json!({ "user_id": address })).await?;
        Ok(())
    }

    async fn remove(&self, address: &str) -> Result<()> {
        self.post("remove_storage", json!({ "user_id": address })).await?;
        Ok(())
    }
}

/// Used when no server is configured.
pub struct NoopNotifier;

#[async_trait]
impl ServerNotifier for NoopNotifier {
    async fn register(&self, _address: &str, _capacity_bytes: u64) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _address: &str) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _address: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Accept one HTTP request, reply with `body`, hand back the request body.
    async fn one_shot_server(status_line: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            let body_start = loop {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
                if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    break pos + 4;
                }
            };
            let head = String::from_utf8_lossy(&buf[..body_start]).to_lowercase();
            let content_length: usize = head
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .map(|v| v.trim().parse().unwrap())
                .unwrap_or(0);
            while buf.len() < body_start + content_length {
                let n = socket.read(&mut chunk).await.unwrap();
                buf.extend_from_slice(&chunk[..n]);
            }
            let response = format!(
                "{}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.flush().await.unwrap();
            String::from_utf8_lossy(&buf[body_start..body_start + content_length]).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_register_sends_capacity_as_string() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK", r#"{"status":"success"}"#).await;
        let notifier = HttpNotifier::new(&url, Duration::from_secs(5)).unwrap();

        notifier.register("0xabc", 524_288_000).await.unwrap();

        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["user_id"], "0xabc");
        assert_eq!(body["capacity"], "524288000");
    }

    #[tokio::test]
    async fn test_register_rejects_non_success_status() {
        let (url, _server) = one_shot_server("HTTP/1.1 200 OK", r#"{"status":"error"}"#).await;
        let notifier = HttpNotifier::new(&url, Duration::from_secs(5)).unwrap();
        assert!(matches!(notifier.register("0xabc", 1).await, Err(BinderError::Server(_))));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let (url, _server) = one_shot_server("HTTP/1.1 400 Bad Request", "").await;
        let notifier = HttpNotifier::new(&url, Duration::from_secs(5)).unwrap();
        assert!(matches!(notifier.heartbeat("0xabc").await, Err(BinderError::Server(_))));
    }

    #[tokio::test]
    async fn test_remove_posts_user_id() {
        let (url, server) = one_shot_server("HTTP/1.1 200 OK", r#"{"status":"success"}"#).await;
        let notifier = HttpNotifier::new(&url, Duration::from_secs(5)).unwrap();
        notifier.remove("0xdef").await.unwrap();
        let body: serde_json::Value = serde_json::from_str(&server.await.unwrap()).unwrap();
        assert_eq!(body["user_id"], "0xdef");
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let notifier = HttpNotifier::new(&url, Duration::from_secs(2)).unwrap();
        assert!(matches!(notifier.heartbeat("0xabc").await, Err(BinderError::Server(_))));
    }
}
