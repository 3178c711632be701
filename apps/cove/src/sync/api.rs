//! REST surface of the local sync agent. Kept behind a trait so the driver
//! can be exercised without a running engine.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use super::SyncError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn ping(&self) -> Result<(), SyncError>;
    async fn completion(&self, folder: &str, device: &str) -> Result<f64, SyncError>;
    async fn override_changes(&self, folder: &str) -> Result<(), SyncError>;
    async fn restart(&self) -> Result<(), SyncError>;
    /// Whether the remote peer is currently connected.
    async fn connected(&self) -> Result<bool, SyncError>;
}

pub struct RestSyncApi {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl RestSyncApi {
    pub fn new(gui_port: u16, api_key: &str) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(Self {
            client,
            base: format!("http://127.0.0.1:{gui_port}"),
            api_key: api_key.to_string(),
        })
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.base))
            .header("X-API-Key", &self.api_key)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{path}", self.base))
            .header("X-API-Key", &self.api_key)
    }
}

#[derive(Deserialize)]
struct CompletionResponse {
    completion: f64,
}

#[derive(Deserialize)]
struct ConnectionsResponse {
    #[serde(default)]
    connections: HashMap<String, ConnectionInfo>,
}

#[derive(Deserialize)]
struct ConnectionInfo {
    #[serde(default)]
    connected: bool,
}

#[async_trait]
impl SyncApi for RestSyncApi {
    async fn ping(&self) -> Result<(), SyncError> {
        self.get("/rest/system/ping")
            .send()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .error_for_status()
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(())
    }

    async fn completion(&self, folder: &str, device: &str) -> Result<f64, SyncError> {
        let response: CompletionResponse = self
            .get("/rest/db/completion")
            .query(&[("folder", folder), ("device", device)])
            .send()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .error_for_status()
            .map_err(|err| SyncError::Api(err.to_string()))?
            .json()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(response.completion)
    }

    async fn override_changes(&self, folder: &str) -> Result<(), SyncError> {
        self.post("/rest/db/override")
            .query(&[("folder", folder)])
            .send()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .error_for_status()
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(())
    }

    async fn restart(&self) -> Result<(), SyncError> {
        self.post("/rest/system/restart")
            .send()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .error_for_status()
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(())
    }

    async fn connected(&self) -> Result<bool, SyncError> {
        let response: ConnectionsResponse = self
            .get("/rest/system/connections")
            .send()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?
            .error_for_status()
            .map_err(|err| SyncError::Api(err.to_string()))?
            .json()
            .await
            .map_err(|err| SyncError::Api(err.to_string()))?;
        Ok(response.connections.values().any(|c| c.connected))
    }
}
