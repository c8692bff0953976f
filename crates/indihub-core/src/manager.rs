//! INDI-server manager client
//!
//! Thin wrapper over the manager's local REST API: query status, switch
//! profiles and list drivers. The manager is what actually starts and
//! stops the INDI-server process.

use serde::Deserialize;

use crate::error::{AgentError, Result};
use crate::protocol::{IndiDriver, IndiProfile};

#[derive(Debug, Deserialize)]
struct ServerStatus {
    status: String,
    active_profile: String,
}

pub struct ManagerClient {
    http: reqwest::Client,
    addr: String,
}

impl ManagerClient {
    /// `addr` is the manager's `host:port`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            addr: addr.into(),
        }
    }

    /// Whether the INDI-server is running and which profile is active.
    pub async fn get_status(&self) -> Result<(bool, String)> {
        let statuses: Vec<ServerStatus> = self
            .http
            .get(format!("http://{}/api/server/status", self.addr))
            .send()
            .await?
            .json()
            .await?;

        let status = statuses.into_iter().next().ok_or_else(|| {
            AgentError::Manager("empty status reply from INDI-server manager".to_string())
        })?;
        Ok((status.status == "True", status.active_profile))
    }

    pub async fn stop_server(&self) -> Result<()> {
        let resp = self
            .http
            .post(format!("http://{}/api/server/stop", self.addr))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Manager(format!(
                "could not stop INDI-server, response code {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn start_profile(&self, profile: &str) -> Result<()> {
        let resp = self
            .http
            .post(format!("http://{}/api/server/start/{profile}", self.addr))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AgentError::Manager(format!(
                "could not start INDI-server with profile {profile}, response code {}",
                resp.status()
            )));
        }
        Ok(())
    }

    pub async fn get_profile(&self, profile: &str) -> Result<IndiProfile> {
        Ok(self
            .http
            .get(format!("http://{}/api/profiles/{profile}", self.addr))
            .send()
            .await?
            .json()
            .await?)
    }

    pub async fn get_drivers(&self) -> Result<Vec<IndiDriver>> {
        Ok(self
            .http
            .get(format!("http://{}/api/server/drivers", self.addr))
            .send()
            .await?
            .json()
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_reply_shape() {
        let json = r#"[{"status": "True", "active_profile": "Simulators"}]"#;
        let statuses: Vec<ServerStatus> = serde_json::from_str(json).unwrap();
        assert_eq!(statuses[0].status, "True");
        assert_eq!(statuses[0].active_profile, "Simulators");
    }

    #[tokio::test]
    async fn test_status_against_canned_server() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await.unwrap();
            let body = r#"[{"status": "False", "active_profile": ""}]"#;
            let reply = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                 content-length: {}\r\nconnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(reply.as_bytes()).await.unwrap();
        });

        let client = ManagerClient::new(addr.to_string());
        let (running, profile) = client.get_status().await.unwrap();
        assert!(!running);
        assert!(profile.is_empty());
    }
}
