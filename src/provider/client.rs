//! HTTP provisioning API client.
//!
//! Resources live under `/resources`. Mutating calls either complete
//! synchronously or answer `202 Accepted` with an operation id, which is
//! polled under `/operations/{id}` until it succeeds, fails or times out.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, header};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::ProviderConfig;
use crate::error::ProviderError;
use crate::model::{Properties, ResourceKind};

use super::{Provisioner, ResourceHandle};

/// Retry-After used when a 429 carries no usable hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

/// Connection settings for [`HttpProvisioner`].
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    /// Base URL of the provisioning API.
    pub endpoint: String,
    /// Bearer token, if the API requires one.
    pub token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
    /// Delay between operation polls.
    pub poll_interval: Duration,
    /// Upper bound on a single long-running operation.
    pub operation_timeout: Duration,
}

impl ProviderSettings {
    /// Builds settings from the declaration's provider section.
    #[must_use]
    pub fn from_config(config: &ProviderConfig, token: Option<String>) -> Self {
        Self {
            endpoint: config.endpoint.clone(),
            token,
            request_timeout: Duration::from_secs(config.timeout_secs),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            operation_timeout: Duration::from_secs(config.operation_timeout_secs),
        }
    }
}

/// Provisioner backed by an HTTP API.
#[derive(Debug, Clone)]
pub struct HttpProvisioner {
    /// HTTP client.
    client: Client,
    /// Connection settings.
    settings: ProviderSettings,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    kind: ResourceKind,
    name: &'a str,
    properties: &'a Properties,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    properties: &'a Properties,
}

#[derive(Debug, Deserialize)]
struct Accepted {
    operation_id: String,
}

#[derive(Debug, Deserialize)]
struct CreatedResource {
    handle: String,
}

#[derive(Debug, Deserialize)]
struct DescribedResource {
    #[serde(default)]
    properties: Properties,
}

#[derive(Debug, Deserialize)]
struct Operation {
    status: OperationStatus,
    #[serde(default)]
    handle: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl HttpProvisioner {
    /// Creates a new client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(settings: ProviderSettings) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, settings })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.settings.endpoint.trim_end_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header(header::ACCEPT, "application/json");

        match &self.settings.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    /// Sends a request and maps non-success statuses to provider errors.
    async fn send(&self, builder: RequestBuilder, target: &str) -> Result<Response, ProviderError> {
        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        Err(error_for_status(response, target).await)
    }

    /// Parses a `202` body and waits for its operation to finish.
    async fn await_accepted(&self, response: Response) -> Result<Operation, ProviderError> {
        let accepted: Accepted = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid_response(format!("Malformed 202 body: {e}")))?;

        self.wait_for_operation(&accepted.operation_id).await
    }

    /// Polls an operation until it reaches a terminal status.
    async fn wait_for_operation(&self, id: &str) -> Result<Operation, ProviderError> {
        let deadline = Instant::now() + self.settings.operation_timeout;
        let path = format!("operations/{id}");

        debug!("Waiting for provider operation {id}");

        loop {
            let polled = self.send(self.request(Method::GET, &path), id).await;

            match polled {
                Ok(response) => {
                    let operation: Operation = response.json().await.map_err(|e| {
                        ProviderError::invalid_response(format!("Malformed operation status: {e}"))
                    })?;
                    trace!("Operation {id} is {:?}", operation.status);

                    match operation.status {
                        OperationStatus::Succeeded => return Ok(operation),
                        OperationStatus::Failed => {
                            return Err(ProviderError::OperationFailed {
                                operation: id.to_string(),
                                message: operation
                                    .error
                                    .unwrap_or_else(|| String::from("no error message")),
                            });
                        }
                        OperationStatus::Pending | OperationStatus::Running => {}
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!("Polling operation {id} failed, will retry: {e}");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() + self.settings.poll_interval > deadline {
                return Err(ProviderError::Timeout {
                    operation: id.to_string(),
                });
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }
}

/// Maps an HTTP error status to a provider error.
async fn error_for_status(response: Response, target: &str) -> ProviderError {
    let status = response.status();

    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok());

    let body = response.text().await.unwrap_or_default();

    match status.as_u16() {
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after.unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        500 | 502 | 503 | 504 => ProviderError::Unavailable {
            status: status.as_u16(),
            message: body,
        },
        401 | 403 => ProviderError::AuthenticationFailed { message: body },
        404 => ProviderError::NotFound {
            handle: target.to_string(),
        },
        code => ProviderError::Rejected {
            status: code,
            message: body,
        },
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn create(
        &self,
        kind: ResourceKind,
        name: &str,
        properties: &Properties,
    ) -> Result<ResourceHandle, ProviderError> {
        debug!("POST /resources ({kind} {name})");

        let body = CreateRequest { kind, name, properties };
        let response = self
            .send(self.request(Method::POST, "resources").json(&body), name)
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            let operation = self.await_accepted(response).await?;
            return operation.handle.map(ResourceHandle::new).ok_or_else(|| {
                ProviderError::invalid_response("Completed create operation carries no handle")
            });
        }

        let created: CreatedResource = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid_response(format!("Malformed create body: {e}")))?;

        Ok(ResourceHandle::new(created.handle))
    }

    async fn update(&self, handle: &ResourceHandle, properties: &Properties) -> Result<(), ProviderError> {
        debug!("PUT /resources/{handle}");

        let path = format!("resources/{handle}");
        let response = self
            .send(
                self.request(Method::PUT, &path).json(&UpdateRequest { properties }),
                handle.as_str(),
            )
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            self.await_accepted(response).await?;
        }
        Ok(())
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<(), ProviderError> {
        debug!("DELETE /resources/{handle}");

        let path = format!("resources/{handle}");
        let response = self
            .send(self.request(Method::DELETE, &path), handle.as_str())
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            self.await_accepted(response).await?;
        }
        Ok(())
    }

    async fn describe(&self, handle: &ResourceHandle) -> Result<Properties, ProviderError> {
        trace!("GET /resources/{handle}");

        let path = format!("resources/{handle}");
        let response = self
            .send(self.request(Method::GET, &path), handle.as_str())
            .await?;

        let described: DescribedResource = response
            .json()
            .await
            .map_err(|e| ProviderError::invalid_response(format!("Malformed resource body: {e}")))?;

        Ok(described.properties)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}
