// Client for the proxy's Clash-compatible controller API

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CONTROLLER: &str = "http://127.0.0.1:9091";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// Bytes/sec sent
    pub up: i64,
    /// Bytes/sec received
    pub down: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionMeta {
    pub network: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "sourceIP")]
    pub source_ip: String,
    #[serde(rename = "destinationIP")]
    pub destination_ip: String,
    #[serde(rename = "sourcePort")]
    pub source_port: String,
    #[serde(rename = "destinationPort")]
    pub destination_port: String,
    pub host: String,
    #[serde(rename = "dnsMode")]
    pub dns_mode: String,
    #[serde(rename = "inboundIp")]
    pub inbound_ip: String,
    #[serde(rename = "inboundPort")]
    pub inbound_port: String,
}

/// One proxied connection as reported by the controller
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connection {
    pub id: String,
    pub metadata: ConnectionMeta,
    pub upload: i64,
    pub download: i64,
    pub start: Option<DateTime<Utc>>,
    pub chains: Vec<String>,
    pub rule: String,
    #[serde(rename = "rulePayload")]
    pub rule_payload: String,
}

#[derive(Deserialize)]
struct ConnectionList {
    #[serde(default)]
    connections: Option<Vec<Connection>>,
}

/// Thin pass-through to the controller; every call is a single request
#[derive(Debug, Clone)]
pub struct ControllerClient {
    base: String,
    http: reqwest::Client,
}

impl ControllerClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build controller HTTP client")?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn local() -> Result<Self> {
        Self::new(DEFAULT_CONTROLLER)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = request
            .send()
            .await
            .context(format!("Failed to reach controller for {}", what))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Controller {} failed (HTTP {}): {}", what, status, body.trim());
        }
        Ok(resp)
    }

    /// Current throughput.
    ///
    /// `/traffic` streams one JSON object per second and never ends, so only
    /// the first line is read.
    pub async fn traffic(&self) -> Result<TrafficStats> {
        let mut resp = self.send(self.http.get(self.url("/traffic")), "traffic").await?;

        let mut buf = Vec::new();
        while let Some(chunk) = resp.chunk().await.context("Failed to read traffic stream")? {
            buf.extend_from_slice(&chunk);
            if buf.contains(&b'\n') {
                break;
            }
        }

        let first = buf
            .split(|b| *b == b'\n')
            .find(|line| !line.iter().all(u8::is_ascii_whitespace))
            .ok_or_else(|| anyhow!("Controller sent no traffic sample"))?;
        serde_json::from_slice(first).context("Failed to parse traffic sample")
    }

    pub async fn connections(&self) -> Result<Vec<Connection>> {
        let list: ConnectionList = self
            .send(self.http.get(self.url("/connections")), "connections")
            .await?
            .json()
            .await
            .context("Failed to parse connections")?;
        Ok(list.connections.unwrap_or_default())
    }

    /// Proxy groups and nodes, passed through untouched
    pub async fn proxies(&self) -> Result<serde_json::Value> {
        self.send(self.http.get(self.url("/proxies")), "proxies")
            .await?
            .json()
            .await
            .context("Failed to parse proxies")
    }

    /// Switch the selected node of a selector group
    pub async fn select_proxy(&self, group: &str, name: &str) -> Result<()> {
        let request = self
            .http
            .put(self.url(&format!("/proxies/{}", group)))
            .json(&serde_json::json!({ "name": name }));
        self.send(request, "proxy selection").await?;
        log::info!("Selected {} in group {}", name, group);
        Ok(())
    }

    pub async fn close_connection(&self, id: &str) -> Result<()> {
        let request = self.http.delete(self.url(&format!("/connections/{}", id)));
        self.send(request, "connection close").await?;
        log::debug!("Closed connection {}", id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn client_for(server: &MockServer) -> ControllerClient {
        ControllerClient::new(server.uri()).unwrap()
    }

    #[tokio::test]
    async fn test_traffic_reads_first_sample() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/traffic"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("{\"up\":120,\"down\":4096}\n{\"up\":1,\"down\":2}\n"),
            )
            .mount(&server)
            .await;

        let stats = client_for(&server).await.traffic().await.unwrap();
        assert_eq!(stats, TrafficStats { up: 120, down: 4096 });
    }

    #[tokio::test]
    async fn test_connections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "downloadTotal": 10,
                "uploadTotal": 20,
                "connections": [{
                    "id": "c1",
                    "metadata": {
                        "network": "tcp",
                        "type": "tproxy",
                        "sourceIP": "192.168.1.2",
                        "destinationIP": "1.1.1.1",
                        "sourcePort": "50000",
                        "destinationPort": "443",
                        "host": "one.one.one.one"
                    },
                    "upload": 10,
                    "download": 20,
                    "start": "2024-05-01T10:00:00.123456789Z",
                    "chains": ["proxy", "select"],
                    "rule": "final",
                    "rulePayload": ""
                }]
            })))
            .mount(&server)
            .await;

        let conns = client_for(&server).await.connections().await.unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].id, "c1");
        assert_eq!(conns[0].metadata.kind, "tproxy");
        assert_eq!(conns[0].metadata.destination_port, "443");
        assert_eq!(conns[0].chains, vec!["proxy", "select"]);
        assert!(conns[0].start.is_some());
    }

    #[tokio::test]
    async fn test_null_connections_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/connections"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "connections": null })),
            )
            .mount(&server)
            .await;

        let conns = client_for(&server).await.connections().await.unwrap();
        assert!(conns.is_empty());
    }

    #[tokio::test]
    async fn test_select_proxy_sends_name() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/proxies/select"))
            .and(body_json(serde_json::json!({ "name": "tokyo-01" })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server)
            .await
            .select_proxy("select", "tokyo-01")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_error_status_includes_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/proxies/select"))
            .respond_with(ResponseTemplate::new(400).set_body_string("Selector update error: not found"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .await
            .select_proxy("select", "missing")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("400"));
        assert!(message.contains("not found"));
    }

    #[tokio::test]
    async fn test_close_connection() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/connections/abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).await.close_connection("abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_proxies_passthrough() {
        let server = MockServer::start().await;
        let body = serde_json::json!({ "proxies": { "select": { "type": "Selector", "now": "a" } } });
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body.clone()))
            .mount(&server)
            .await;

        assert_eq!(client_for(&server).await.proxies().await.unwrap(), body);
    }
}
