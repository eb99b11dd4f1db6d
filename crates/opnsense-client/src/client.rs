//! OPNsense API client
//!
//! Implements the uniform settings API used by the HAProxy, dnsmasq, Unbound,
//! OpenBGPD and FRR plugins. Requests authenticate with an API key/secret pair
//! using HTTP basic auth.

use crate::endpoint::{Endpoint, Subsystem};
use crate::error::OpnSenseError;
use crate::models::{MutationResponse, Row, SearchRequest, SearchResponse, ServiceResponse};
use crate::opnsense_trait::OpnSenseClientTrait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// OPNsense API client
#[derive(Debug, Clone)]
pub struct OpnSenseClient {
    client: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

/// Builder for [`OpnSenseClient`]
#[derive(Debug)]
pub struct OpnSenseClientBuilder {
    base_url: String,
    api_key: String,
    api_secret: String,
    timeout: Duration,
    accept_invalid_certs: bool,
}

impl OpnSenseClientBuilder {
    /// Request timeout (default 10 seconds)
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Skip TLS certificate verification.
    ///
    /// Appliances commonly run with a self-signed web GUI certificate.
    #[must_use]
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }

    /// Build the client
    ///
    /// # Errors
    /// Returns an error if the base URL is empty or the HTTP client cannot be built.
    pub fn build(self) -> Result<OpnSenseClient, OpnSenseError> {
        let base_url = self.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(OpnSenseError::InvalidRequest("OPNsense base URL is empty".to_string()));
        }

        let client = Client::builder()
            .timeout(self.timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()?;

        Ok(OpnSenseClient { client, base_url, api_key: self.api_key, api_secret: self.api_secret })
    }
}

impl OpnSenseClient {
    /// Start building a client
    ///
    /// # Arguments
    /// * `base_url` - Appliance URL (e.g., "https://opnsense.local")
    /// * `api_key` - API key
    /// * `api_secret` - API secret
    pub fn builder(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> OpnSenseClientBuilder {
        OpnSenseClientBuilder {
            base_url: base_url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            timeout: DEFAULT_TIMEOUT,
            accept_invalid_certs: false,
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .header("Accept", "application/json")
    }

    /// Map non-success statuses to errors and decode the body.
    async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, OpnSenseError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    OpnSenseError::Authentication(format!("{what}: {status} - {body}"))
                }
                StatusCode::NOT_FOUND => OpnSenseError::NotFound(what.to_string()),
                _ => OpnSenseError::Api { status: status.as_u16(), message: format!("{what}: {body}") },
            });
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| OpnSenseError::Api {
            status: status.as_u16(),
            message: format!(
                "{what}: error decoding response body: {e} - Response (first 500 chars): {}",
                text.chars().take(500).collect::<String>()
            ),
        })
    }

    async fn mutate(
        &self,
        path: &str,
        body: Option<Value>,
        what: &str,
    ) -> Result<MutationResponse, OpnSenseError> {
        let mut request = self.request(Method::POST, path);
        request = match body {
            Some(body) => request.json(&body),
            None => request.json(&serde_json::json!({})),
        };
        let response = request.send().await?;
        let result: MutationResponse = Self::decode(response, what).await?;
        if result.is_failed() {
            return Err(OpnSenseError::Validation(format!("{what}: {}", result.validation_summary())));
        }
        Ok(result)
    }

    fn wrap(endpoint: &Endpoint, record: &Row) -> Value {
        let mut body = serde_json::Map::new();
        body.insert(endpoint.wrapper.to_string(), Value::Object(record.clone()));
        Value::Object(body)
    }
}

#[async_trait::async_trait]
impl OpnSenseClientTrait for OpnSenseClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn search(&self, endpoint: &Endpoint) -> Result<Vec<Row>, OpnSenseError> {
        let path = endpoint.search_path();
        debug!("Searching {}", path);

        let response = self
            .request(Method::POST, &path)
            .json(&SearchRequest::default())
            .send()
            .await?;
        let page: SearchResponse = Self::decode(response, &path).await?;
        Ok(page.rows)
    }

    async fn get_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<Row, OpnSenseError> {
        let path = endpoint.get_path(uuid);
        debug!("Fetching {}", path);

        let response = self.request(Method::GET, &path).send().await?;
        let mut body: Row = Self::decode(response, &path).await?;
        match body.remove(endpoint.wrapper) {
            Some(Value::Object(record)) => Ok(record),
            // unknown uuids come back as an empty list
            _ => Err(OpnSenseError::NotFound(format!("{endpoint} {uuid}"))),
        }
    }

    async fn add_item(&self, endpoint: &Endpoint, record: &Row) -> Result<String, OpnSenseError> {
        let path = endpoint.add_path();
        debug!("Creating {} record", endpoint);

        let result = self.mutate(&path, Some(Self::wrap(endpoint, record)), &path).await?;
        result
            .uuid
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| OpnSenseError::Api {
                status: 200,
                message: format!("{path}: response carried no uuid (result={})", result.result),
            })
    }

    async fn set_item(&self, endpoint: &Endpoint, uuid: &str, record: &Row) -> Result<(), OpnSenseError> {
        let path = endpoint.set_path(uuid);
        debug!("Updating {} record {}", endpoint, uuid);

        self.mutate(&path, Some(Self::wrap(endpoint, record)), &path).await?;
        Ok(())
    }

    async fn del_item(&self, endpoint: &Endpoint, uuid: &str) -> Result<(), OpnSenseError> {
        let path = endpoint.del_path(uuid);
        debug!("Deleting {} record {}", endpoint, uuid);

        match self.mutate(&path, None, &path).await {
            Ok(result) if result.is_not_found() => {
                debug!("{} record {} already gone", endpoint, uuid);
                Ok(())
            }
            Ok(_) | Err(OpnSenseError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reload(&self, subsystem: Subsystem) -> Result<(), OpnSenseError> {
        let path = subsystem.reload_path();
        debug!("Reloading {}", subsystem);

        let response = self
            .request(Method::POST, &path)
            .json(&serde_json::json!({}))
            .send()
            .await?;
        let status: ServiceResponse = Self::decode(response, &path).await?;
        if !status.is_ok() {
            return Err(OpnSenseError::Api {
                status: 200,
                message: format!("{path}: reload returned status {:?}", status.status),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_trims_base_url() {
        let client = OpnSenseClient::builder("https://fw.example.com/ ", "k", "s").build().unwrap();
        assert_eq!(client.base_url(), "https://fw.example.com");
    }

    #[test]
    fn test_builder_rejects_empty_url() {
        let err = OpnSenseClient::builder("  ", "k", "s").build().unwrap_err();
        assert!(matches!(err, OpnSenseError::InvalidRequest(_)));
    }

    #[test]
    fn test_wrap_uses_endpoint_wrapper() {
        let mut record = Row::new();
        record.insert("hostname".to_string(), Value::String("www".to_string()));
        let body = OpnSenseClient::wrap(&Endpoint::UNBOUND_HOST_OVERRIDE, &record);
        assert_eq!(body["host"]["hostname"], "www");
    }
}
