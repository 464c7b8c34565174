//! HTTP remote store for the reference server's REST API.

use std::marker::PhantomData;

use async_trait::async_trait;
use rebound_engine::{Entity, Payload, PositionUpdate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::{ConfigError, RemoteError};
use crate::remote::RemoteStore;

#[derive(Serialize)]
struct CreateRequest<'a, T> {
    payload: &'a T,
}

#[derive(Serialize)]
struct PatchRequest<'a, P> {
    patch: &'a P,
}

#[derive(Serialize)]
struct PositionsRequest<'a> {
    updates: &'a [PositionUpdate],
}

/// Error body returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// [`RemoteStore`] for one entity type behind `{api_url}/collections/{entity_type}`.
pub struct HttpRemoteStore<T> {
    http: reqwest::Client,
    base_url: String,
    entity_type: String,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for HttpRemoteStore<T> {
    fn clone(&self) -> Self {
        Self {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            entity_type: self.entity_type.clone(),
            _payload: PhantomData,
        }
    }
}

impl<T: Payload> HttpRemoteStore<T> {
    /// Create a store with a default HTTP client.
    pub fn new(api_url: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url, entity_type)
    }

    /// Create a store sharing an existing HTTP client.
    pub fn with_client(
        http: reqwest::Client,
        api_url: impl Into<String>,
        entity_type: impl Into<String>,
    ) -> Self {
        let api_url: String = api_url.into();
        let entity_type = entity_type.into();
        Self {
            http,
            base_url: format!(
                "{}/collections/{}",
                api_url.trim_end_matches('/'),
                entity_type
            ),
            entity_type,
            _payload: PhantomData,
        }
    }

    /// Create a store from client configuration (timeouts included).
    pub fn from_config(
        config: &ClientConfig,
        entity_type: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_client(
            config.http_client()?,
            config.api_url.clone(),
            entity_type,
        ))
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}/{}", self.base_url, suffix)
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::new("request timed out")
    } else {
        RemoteError::new(err.to_string())
    }
}

/// Turn a non-success response into the server's message.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    if let Ok(body) = serde_json::from_str::<ErrorBody>(&text) {
        return Err(RemoteError::new(body.error));
    }

    Err(RemoteError::new(format!("request failed ({})", status)))
}

async fn parse<R: DeserializeOwned>(response: reqwest::Response) -> Result<R, RemoteError> {
    let response = check(response).await?;
    response
        .json()
        .await
        .map_err(|e| RemoteError::new(format!("invalid response: {}", e)))
}

#[async_trait]
impl<T: Payload> RemoteStore<T> for HttpRemoteStore<T> {
    async fn list(&self) -> Result<Vec<Entity<T>>, RemoteError> {
        let response = self
            .http
            .get(&self.base_url)
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn create(&self, payload: &T) -> Result<Entity<T>, RemoteError> {
        let response = self
            .http
            .post(&self.base_url)
            .json(&CreateRequest { payload })
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn update(&self, id: &str, patch: &T::Patch) -> Result<Entity<T>, RemoteError> {
        let response = self
            .http
            .patch(self.url(id))
            .json(&PatchRequest { patch })
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let response = self
            .http
            .delete(self.url(id))
            .send()
            .await
            .map_err(transport)?;
        check(response).await.map(|_| ())
    }

    async fn batch_set_positions(&self, updates: &[PositionUpdate]) -> Result<(), RemoteError> {
        let response = self
            .http
            .put(self.url("positions"))
            .json(&PositionsRequest { updates })
            .send()
            .await
            .map_err(transport)?;
        check(response).await.map(|_| ())
    }
}
