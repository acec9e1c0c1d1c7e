//! Wire and domain types for the Railway GraphQL API

use serde::{Deserialize, Serialize};

/// GraphQL request envelope
#[derive(Debug, Serialize)]
pub struct GraphQlRequest {
    pub query: String,
    pub variables: serde_json::Value,
}

/// GraphQL response envelope
#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
    pub data: Option<serde_json::Value>,
    pub errors: Option<Vec<GraphQlError>>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlError {
    pub message: String,
}

/// A service as the platform reports it
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub instances: Vec<ServiceInstance>,
}

/// One service instance bound to an environment
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceInstance {
    #[serde(rename = "environmentId")]
    pub environment_id: String,
    #[serde(rename = "latestDeployment")]
    pub latest_deployment: Option<DeploymentRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentRef {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
}

/// A deployment row from the deployments query
#[derive(Debug, Clone, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub status: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
}

impl Deployment {
    pub fn succeeded(&self) -> bool {
        self.status.eq_ignore_ascii_case("success")
    }
}

/// One line from the deployment logs query
#[derive(Debug, Clone, Deserialize)]
pub struct DeploymentLogLine {
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    pub message: String,
}

/// An environment variable row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
}
