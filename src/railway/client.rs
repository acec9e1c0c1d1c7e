//! Railway GraphQL client
//!
//! Stateless typed wrapper over the platform's query/mutation API. All calls
//! require the bearer token; a missing token fails fast without network I/O.
//! Transient failures retry up to 3 times with exponential backoff; rate
//! limits get their own retry budget. A shared token bucket enforces the
//! global request budget.

use super::types::{
    Deployment, DeploymentLogLine, GraphQlRequest, GraphQlResponse, ServiceInfo, Variable,
};
use reqwest::StatusCode;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

const ENDPOINT: &str = "https://backboard.railway.com/graphql/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ATTEMPTS: u32 = 3;
const MAX_RATE_LIMIT_ATTEMPTS: u32 = 3;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Railway API token is not configured")]
    NotConfigured,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("request timed out")]
    Timeout,
    #[error("Railway API error: {0}")]
    Api(String),
    #[error("rate limited by Railway")]
    RateLimited,
    #[error("unauthorized: check the API token")]
    Unauthorized,
    #[error("not found: {0}")]
    NotFound(String),
    #[error("service {service} has no instance in environment {environment}")]
    NoInstanceForEnvironment { service: String, environment: String },
    #[error("service {0} has no deployment yet")]
    NoDeployment(String),
    #[error("service {0} has no earlier successful deployment to roll back to")]
    NoRollbackTarget(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl ClientError {
    fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Timeout)
    }
}

/// Exponential backoff for attempt `n` (1-based): `base * 2^(n-1)`.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base * 2u32.saturating_pow(attempt.saturating_sub(1))
}

// ============================================================================
// Rate limiting
// ============================================================================

struct BucketState {
    second_tokens: u32,
    second_window: Instant,
    hour_tokens: u32,
    hour_window: Instant,
}

/// Token bucket covering both the per-second and per-hour budgets.
pub struct RateLimiter {
    per_second: u32,
    per_hour: u32,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(per_second: u32, per_hour: u32) -> Self {
        let now = Instant::now();
        Self {
            per_second,
            per_hour,
            state: Mutex::new(BucketState {
                second_tokens: per_second,
                second_window: now,
                hour_tokens: per_hour,
                hour_window: now,
            }),
        }
    }

    /// Take one token, waiting for window refills as needed.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();
                if now.duration_since(state.second_window) >= Duration::from_secs(1) {
                    state.second_tokens = self.per_second;
                    state.second_window = now;
                }
                if now.duration_since(state.hour_window) >= Duration::from_secs(3600) {
                    state.hour_tokens = self.per_hour;
                    state.hour_window = now;
                }
                if state.second_tokens > 0 && state.hour_tokens > 0 {
                    state.second_tokens -= 1;
                    state.hour_tokens -= 1;
                    None
                } else if state.second_tokens == 0 {
                    Some(
                        Duration::from_secs(1)
                            .saturating_sub(now.duration_since(state.second_window)),
                    )
                } else {
                    Some(
                        Duration::from_secs(3600)
                            .saturating_sub(now.duration_since(state.hour_window)),
                    )
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(10))).await,
            }
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Typed Railway API client
pub struct RailwayClient {
    http: reqwest::Client,
    token: Option<String>,
    endpoint: String,
    limiter: RateLimiter,
}

impl RailwayClient {
    pub fn new(token: Option<String>, rate_per_second: u32, rate_per_hour: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http,
            token,
            endpoint: ENDPOINT.to_string(),
            limiter: RateLimiter::new(rate_per_second, rate_per_hour),
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.token.is_some()
    }

    /// Execute one GraphQL operation with retry and rate limiting.
    async fn execute(
        &self,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let token = self.token.as_ref().ok_or(ClientError::NotConfigured)?;

        let mut attempt = 0u32;
        let mut rate_limit_attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire().await;

            let result = self.send_once(token, query, &variables).await;
            match result {
                Ok(data) => return Ok(data),
                Err(ClientError::RateLimited) => {
                    rate_limit_attempt += 1;
                    if rate_limit_attempt >= MAX_RATE_LIMIT_ATTEMPTS {
                        return Err(ClientError::RateLimited);
                    }
                    let delay = backoff_delay(BACKOFF_BASE, rate_limit_attempt);
                    tracing::warn!(delay_ms = %delay.as_millis(), "Railway rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e);
                    }
                    let delay = backoff_delay(BACKOFF_BASE, attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = %delay.as_millis(),
                        "Railway request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(
        &self,
        token: &str,
        query: &str,
        variables: &serde_json::Value,
    ) -> Result<serde_json::Value, ClientError> {
        let body = GraphQlRequest {
            query: query.to_string(),
            variables: variables.clone(),
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClientError::Timeout
                } else {
                    ClientError::Transport(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ClientError::RateLimited),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ClientError::Unauthorized)
            }
            s if s.is_server_error() => {
                return Err(ClientError::Transport(format!("server error {s}")))
            }
            s if s.is_client_error() => {
                let text = response.text().await.unwrap_or_default();
                return Err(ClientError::Api(format!("{s}: {text}")));
            }
            _ => {}
        }

        let envelope: GraphQlResponse = response
            .json()
            .await
            .map_err(|e| ClientError::Malformed(e.to_string()))?;

        if let Some(errors) = envelope.errors {
            if !errors.is_empty() {
                let joined = errors
                    .into_iter()
                    .map(|e| e.message)
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(ClientError::Api(joined));
            }
        }

        envelope
            .data
            .ok_or_else(|| ClientError::Malformed("response had neither data nor errors".into()))
    }

    // ==================== Queries ====================

    /// Fetch a service with its per-environment instances
    pub async fn service(&self, service_id: &str) -> Result<ServiceInfo, ClientError> {
        let data = self
            .execute(
                r"query service($id: String!) {
                    service(id: $id) {
                        id
                        name
                        serviceInstances {
                            edges { node { environmentId latestDeployment { id status } } }
                        }
                    }
                }",
                json!({ "id": service_id }),
            )
            .await?;

        let node = data
            .pointer("/service")
            .cloned()
            .ok_or_else(|| ClientError::NotFound(format!("service {service_id}")))?;

        let instances = node
            .pointer("/serviceInstances/edges")
            .and_then(|edges| edges.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|edge| serde_json::from_value(edge.pointer("/node")?.clone()).ok())
            .collect();

        Ok(ServiceInfo {
            id: node
                .pointer("/id")
                .and_then(|v| v.as_str())
                .unwrap_or(service_id)
                .to_string(),
            name: node
                .pointer("/name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
            instances,
        })
    }

    /// Recent deployments for a service in an environment, newest first
    pub async fn deployments(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
        limit: u32,
    ) -> Result<Vec<Deployment>, ClientError> {
        let data = self
            .execute(
                r"query deployments($input: DeploymentListInput!, $first: Int!) {
                    deployments(input: $input, first: $first) {
                        edges { node { id status createdAt } }
                    }
                }",
                json!({
                    "input": {
                        "projectId": project_id,
                        "environmentId": environment_id,
                        "serviceId": service_id,
                    },
                    "first": limit,
                }),
            )
            .await?;

        let deployments = data
            .pointer("/deployments/edges")
            .and_then(|edges| edges.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|edge| serde_json::from_value(edge.pointer("/node")?.clone()).ok())
            .collect();
        Ok(deployments)
    }

    /// Recent log lines for a deployment, bounded by `limit`
    pub async fn deployment_logs(
        &self,
        deployment_id: &str,
        limit: u32,
    ) -> Result<Vec<DeploymentLogLine>, ClientError> {
        let data = self
            .execute(
                r"query deploymentLogs($deploymentId: String!, $limit: Int!) {
                    deploymentLogs(deploymentId: $deploymentId, limit: $limit) {
                        timestamp severity message
                    }
                }",
                json!({ "deploymentId": deployment_id, "limit": limit }),
            )
            .await?;

        let lines = data
            .pointer("/deploymentLogs")
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|line| serde_json::from_value(line).ok())
            .collect();
        Ok(lines)
    }

    /// Environment variables for a service
    pub async fn variables(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> Result<Vec<Variable>, ClientError> {
        let data = self
            .execute(
                r"query variables($projectId: String!, $environmentId: String!, $serviceId: String!) {
                    variables(projectId: $projectId, environmentId: $environmentId, serviceId: $serviceId)
                }",
                json!({
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                }),
            )
            .await?;

        let map = data
            .pointer("/variables")
            .and_then(|v| v.as_object().cloned())
            .unwrap_or_default();
        Ok(map
            .into_iter()
            .map(|(name, value)| Variable {
                name,
                value: value.as_str().unwrap_or_default().to_string(),
            })
            .collect())
    }

    /// Resolve the latest deployment id for a service in an environment.
    /// Distinguishes "no instance in that environment" from "instance has
    /// no deployment yet".
    pub async fn latest_deployment_id(
        &self,
        environment_id: &str,
        service_id: &str,
    ) -> Result<String, ClientError> {
        let service = self.service(service_id).await?;
        let instance = service
            .instances
            .iter()
            .find(|i| i.environment_id == environment_id)
            .ok_or_else(|| ClientError::NoInstanceForEnvironment {
                service: service_id.to_string(),
                environment: environment_id.to_string(),
            })?;
        instance
            .latest_deployment
            .as_ref()
            .map(|d| d.id.clone())
            .ok_or_else(|| ClientError::NoDeployment(service_id.to_string()))
    }

    /// Resolve the rollback target: the second-most-recent `SUCCESS`
    /// deployment for the service in the environment.
    pub async fn previous_deployment_id(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
    ) -> Result<String, ClientError> {
        let deployments = self
            .deployments(project_id, environment_id, service_id, 20)
            .await?;
        let mut succeeded = deployments.iter().filter(|d| d.succeeded());
        let _current = succeeded
            .next()
            .ok_or_else(|| ClientError::NoRollbackTarget(service_id.to_string()))?;
        succeeded
            .next()
            .map(|d| d.id.clone())
            .ok_or_else(|| ClientError::NoRollbackTarget(service_id.to_string()))
    }

    // ==================== Mutations ====================

    /// Restart the latest deployment of a service
    pub async fn restart_deployment(&self, deployment_id: &str) -> Result<(), ClientError> {
        self.execute(
            r"mutation deploymentRestart($id: String!) { deploymentRestart(id: $id) }",
            json!({ "id": deployment_id }),
        )
        .await?;
        Ok(())
    }

    /// Redeploy the service instance in an environment
    pub async fn redeploy_service(
        &self,
        environment_id: &str,
        service_id: &str,
    ) -> Result<(), ClientError> {
        self.execute(
            r"mutation serviceInstanceRedeploy($environmentId: String!, $serviceId: String!) {
                serviceInstanceRedeploy(environmentId: $environmentId, serviceId: $serviceId)
            }",
            json!({ "environmentId": environment_id, "serviceId": service_id }),
        )
        .await?;
        Ok(())
    }

    /// Stop a running deployment
    pub async fn stop_deployment(&self, deployment_id: &str) -> Result<(), ClientError> {
        self.execute(
            r"mutation deploymentStop($id: String!) { deploymentStop(id: $id) }",
            json!({ "id": deployment_id }),
        )
        .await?;
        Ok(())
    }

    /// Roll back to an earlier deployment
    pub async fn rollback_deployment(&self, deployment_id: &str) -> Result<(), ClientError> {
        self.execute(
            r"mutation deploymentRollback($id: String!) { deploymentRollback(id: $id) }",
            json!({ "id": deployment_id }),
        )
        .await?;
        Ok(())
    }

    /// Update replica count for a service instance
    pub async fn update_service_instance(
        &self,
        environment_id: &str,
        service_id: &str,
        num_replicas: u32,
    ) -> Result<(), ClientError> {
        self.execute(
            r"mutation serviceInstanceUpdate($environmentId: String!, $serviceId: String!, $input: ServiceInstanceUpdateInput!) {
                serviceInstanceUpdate(environmentId: $environmentId, serviceId: $serviceId, input: $input)
            }",
            json!({
                "environmentId": environment_id,
                "serviceId": service_id,
                "input": { "numReplicas": num_replicas },
            }),
        )
        .await?;
        Ok(())
    }

    /// Update the memory limit for a service instance
    pub async fn update_service_limits(
        &self,
        environment_id: &str,
        service_id: &str,
        memory_mb: u32,
    ) -> Result<(), ClientError> {
        self.execute(
            r"mutation serviceInstanceLimitsUpdate($environmentId: String!, $serviceId: String!, $input: ServiceInstanceLimitsUpdateInput!) {
                serviceInstanceLimitsUpdate(environmentId: $environmentId, serviceId: $serviceId, input: $input)
            }",
            json!({
                "environmentId": environment_id,
                "serviceId": service_id,
                "input": { "memoryMB": memory_mb },
            }),
        )
        .await?;
        Ok(())
    }

    /// Upsert one environment variable
    pub async fn upsert_variable(
        &self,
        project_id: &str,
        environment_id: &str,
        service_id: &str,
        name: &str,
        value: &str,
    ) -> Result<(), ClientError> {
        self.execute(
            r"mutation variableUpsert($input: VariableUpsertInput!) { variableUpsert(input: $input) }",
            json!({
                "input": {
                    "projectId": project_id,
                    "environmentId": environment_id,
                    "serviceId": service_id,
                    "name": name,
                    "value": value,
                },
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(backoff_delay(BACKOFF_BASE, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(BACKOFF_BASE, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(BACKOFF_BASE, 3), Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_token_fails_without_io() {
        let client = RailwayClient::new(None, 50, 10_000)
            .with_endpoint("http://127.0.0.1:1/graphql");
        let err = client.service("svc-1").await.unwrap_err();
        assert!(matches!(err, ClientError::NotConfigured));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_blocks_after_burst() {
        let limiter = RateLimiter::new(2, 100);
        limiter.acquire().await;
        limiter.acquire().await;

        // Third acquire must wait for the next one-second window.
        let before = Instant::now();
        limiter.acquire().await;
        assert!(before.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Timeout.is_transient());
        assert!(ClientError::Transport("boom".into()).is_transient());
        assert!(!ClientError::Api("bad".into()).is_transient());
        assert!(!ClientError::Unauthorized.is_transient());
        assert!(!ClientError::RateLimited.is_transient());
    }
}
