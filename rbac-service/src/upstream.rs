//! Read-only clients over the user-manager and cluster-manager list APIs.
//!
//! The cache never mutates upstream state; each sync pass pulls one full
//! round of listings through these traits.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::cache::ProjectAssignment;

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: StatusCode },
    #[error("failed to decode response from {url}: {source}")]
    Decode { url: String, source: reqwest::Error },
}

/// One API key listing entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub secret: String,
    pub user: ApiKeyUser,
    pub organization_id: String,
    pub project_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub organization_role: String,
    #[serde(default)]
    pub project_role: String,
    #[serde(default)]
    pub excluded_from_rate_limiting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyUser {
    pub id: String,
    #[serde(default)]
    pub internal_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrganizationUserRecord {
    pub user_id: String,
    #[serde(default)]
    pub internal_user_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub organization_id: String,
    #[serde(default)]
    pub kubernetes_namespace: String,
    #[serde(default)]
    pub assignments: Vec<ProjectAssignment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectUserRecord {
    pub user_id: String,
    pub project_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub role: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClusterRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub registration_key: String,
    pub tenant_id: String,
}

/// Listing API of the user-manager.
#[async_trait]
pub trait UserInfoLister: Send + Sync {
    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, UpstreamError>;
    async fn list_organizations(&self) -> Result<Vec<OrganizationRecord>, UpstreamError>;
    async fn list_organization_users(&self) -> Result<Vec<OrganizationUserRecord>, UpstreamError>;
    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, UpstreamError>;
    async fn list_project_users(&self) -> Result<Vec<ProjectUserRecord>, UpstreamError>;
}

/// Listing API of the cluster-manager.
#[async_trait]
pub trait ClusterInfoLister: Send + Sync {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, UpstreamError>;
}

#[derive(Debug, Deserialize)]
struct ListApiKeysResponse {
    #[serde(default)]
    api_keys: Vec<ApiKeyRecord>,
}

#[derive(Debug, Deserialize)]
struct ListOrganizationsResponse {
    #[serde(default)]
    organizations: Vec<OrganizationRecord>,
}

#[derive(Debug, Deserialize)]
struct ListOrganizationUsersResponse {
    #[serde(default)]
    users: Vec<OrganizationUserRecord>,
}

#[derive(Debug, Deserialize)]
struct ListProjectsResponse {
    #[serde(default)]
    projects: Vec<ProjectRecord>,
}

#[derive(Debug, Deserialize)]
struct ListProjectUsersResponse {
    #[serde(default)]
    users: Vec<ProjectUserRecord>,
}

#[derive(Debug, Deserialize)]
struct ListClustersResponse {
    #[serde(default)]
    clusters: Vec<ClusterRecord>,
}

#[derive(Clone)]
pub struct UserManagerClient {
    client: Client,
    base_url: String,
}

impl UserManagerClient {
    pub fn new(client: Client, addr: &str) -> Self {
        Self {
            client,
            base_url: format!("http://{addr}"),
        }
    }
}

#[async_trait]
impl UserInfoLister for UserManagerClient {
    async fn list_api_keys(&self) -> Result<Vec<ApiKeyRecord>, UpstreamError> {
        let response: ListApiKeysResponse =
            get_json(&self.client, format!("{}/internal/v1/apikeys", self.base_url)).await?;
        Ok(response.api_keys)
    }

    async fn list_organizations(&self) -> Result<Vec<OrganizationRecord>, UpstreamError> {
        let response: ListOrganizationsResponse = get_json(
            &self.client,
            format!("{}/internal/v1/organizations", self.base_url),
        )
        .await?;
        Ok(response.organizations)
    }

    async fn list_organization_users(&self) -> Result<Vec<OrganizationUserRecord>, UpstreamError> {
        let response: ListOrganizationUsersResponse = get_json(
            &self.client,
            format!("{}/internal/v1/organization-users", self.base_url),
        )
        .await?;
        Ok(response.users)
    }

    async fn list_projects(&self) -> Result<Vec<ProjectRecord>, UpstreamError> {
        let response: ListProjectsResponse = get_json(
            &self.client,
            format!("{}/internal/v1/projects", self.base_url),
        )
        .await?;
        Ok(response.projects)
    }

    async fn list_project_users(&self) -> Result<Vec<ProjectUserRecord>, UpstreamError> {
        let response: ListProjectUsersResponse = get_json(
            &self.client,
            format!("{}/internal/v1/project-users", self.base_url),
        )
        .await?;
        Ok(response.users)
    }
}

#[derive(Clone)]
pub struct ClusterManagerClient {
    client: Client,
    base_url: String,
}

impl ClusterManagerClient {
    pub fn new(client: Client, addr: &str) -> Self {
        Self {
            client,
            base_url: format!("http://{addr}"),
        }
    }
}

#[async_trait]
impl ClusterInfoLister for ClusterManagerClient {
    async fn list_clusters(&self) -> Result<Vec<ClusterRecord>, UpstreamError> {
        let response: ListClustersResponse = get_json(
            &self.client,
            format!("{}/internal/v1/clusters", self.base_url),
        )
        .await?;
        Ok(response.clusters)
    }
}

async fn get_json<T>(client: &Client, url: String) -> Result<T, UpstreamError>
where
    T: serde::de::DeserializeOwned,
{
    let response = client.get(&url).send().await.map_err(|source| UpstreamError::Request {
        url: url.clone(),
        source,
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::Status { url, status });
    }
    response
        .json()
        .await
        .map_err(|source| UpstreamError::Decode { url, source })
}
