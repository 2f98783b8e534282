//! In-memory cache of identity data pulled from the user-manager and
//! cluster-manager.
//!
//! All indexes are rebuilt from one full round of listings and swapped in
//! atomically; readers always observe a complete snapshot. A failed pass
//! keeps the previous snapshot in place.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::upstream::{
    ApiKeyRecord, ClusterInfoLister, ClusterRecord, OrganizationRecord, OrganizationUserRecord,
    ProjectRecord, ProjectUserRecord, UpstreamError, UserInfoLister,
};

/// Role of a user (or API key) within an organization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrganizationRole {
    Owner,
    Reader,
    #[default]
    Unspecified,
}

impl OrganizationRole {
    /// Maps the upstream wire string; anything unrecognized is unspecified.
    pub fn parse(value: &str) -> Self {
        match value {
            "OWNER" => Self::Owner,
            "READER" => Self::Reader,
            _ => Self::Unspecified,
        }
    }
}

/// Role of a user (or API key) within a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectRole {
    Owner,
    Member,
    #[default]
    Unspecified,
}

impl ProjectRole {
    /// Maps the upstream wire string; anything unrecognized is unspecified.
    pub fn parse(value: &str) -> Self {
        match value {
            "OWNER" => Self::Owner,
            "MEMBER" => Self::Member,
            _ => Self::Unspecified,
        }
    }
}

/// An API key, keyed in the cache by its secret.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiKey {
    pub key_id: String,
    pub user_id: String,
    pub internal_user_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub tenant_id: String,
    pub organization_role: OrganizationRole,
    pub project_role: ProjectRole,
    pub excluded_from_rate_limiting: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    pub registration_key: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    pub id: String,
    pub title: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrganizationMembership {
    pub user_id: String,
    pub organization_id: String,
    pub role: OrganizationRole,
}

/// An explicit (cluster, namespace) assignment of a project.
///
/// An empty `cluster_id` stands for every cluster of the tenant.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProjectAssignment {
    #[serde(default)]
    pub cluster_id: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Project {
    pub id: String,
    pub title: String,
    pub organization_id: String,
    pub kubernetes_namespace: String,
    pub assignments: Vec<ProjectAssignment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectMembership {
    pub user_id: String,
    pub project_id: String,
    pub organization_id: String,
    pub role: ProjectRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: String,
    pub internal_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    #[error("user {user_id} appears under tenant {existing} and tenant {conflicting}")]
    InconsistentTenant {
        user_id: String,
        existing: String,
        conflicting: String,
    },
}

#[derive(Debug, Default)]
struct Indexes {
    api_keys_by_secret: HashMap<String, ApiKey>,
    clusters_by_registration_key: HashMap<String, Cluster>,
    clusters_by_tenant_id: HashMap<String, Vec<Cluster>>,
    orgs_by_id: HashMap<String, Organization>,
    orgs_by_user_id: HashMap<String, Vec<OrganizationMembership>>,
    projects_by_id: HashMap<String, Project>,
    projects_by_organization_id: HashMap<String, Vec<Project>>,
    projects_by_user_id: HashMap<String, Vec<ProjectMembership>>,
    users_by_id: HashMap<String, User>,
    last_successful_sync: Option<DateTime<Utc>>,
}

/// Read-optimized snapshot of upstream identity data.
pub struct Store {
    user_lister: Arc<dyn UserInfoLister>,
    cluster_lister: Arc<dyn ClusterInfoLister>,
    indexes: RwLock<Indexes>,
    synced_tx: watch::Sender<bool>,
    synced_rx: watch::Receiver<bool>,
}

impl Store {
    pub fn new(
        user_lister: Arc<dyn UserInfoLister>,
        cluster_lister: Arc<dyn ClusterInfoLister>,
    ) -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        Self {
            user_lister,
            cluster_lister,
            indexes: RwLock::new(Indexes::default()),
            synced_tx,
            synced_rx,
        }
    }

    pub fn api_key_by_secret(&self, secret: &str) -> Option<ApiKey> {
        self.read().api_keys_by_secret.get(secret).cloned()
    }

    pub fn cluster_by_registration_key(&self, key: &str) -> Option<Cluster> {
        self.read().clusters_by_registration_key.get(key).cloned()
    }

    pub fn clusters_by_tenant_id(&self, tenant_id: &str) -> Vec<Cluster> {
        self.read()
            .clusters_by_tenant_id
            .get(tenant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn organization_by_id(&self, organization_id: &str) -> Option<Organization> {
        self.read().orgs_by_id.get(organization_id).cloned()
    }

    pub fn organizations_by_user_id(&self, user_id: &str) -> Vec<OrganizationMembership> {
        self.read()
            .orgs_by_user_id
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn project_by_id(&self, project_id: &str) -> Option<Project> {
        self.read().projects_by_id.get(project_id).cloned()
    }

    pub fn projects_by_organization_id(&self, organization_id: &str) -> Vec<Project> {
        self.read()
            .projects_by_organization_id
            .get(organization_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn projects_by_user_id(&self, user_id: &str) -> Vec<ProjectMembership> {
        self.read()
            .projects_by_user_id
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn user_by_id(&self, user_id: &str) -> Option<User> {
        self.read().users_by_id.get(user_id).cloned()
    }

    pub fn last_successful_sync_time(&self) -> Option<DateTime<Utc>> {
        self.read().last_successful_sync
    }

    /// Resolves once at least one sync pass has completed successfully.
    pub async fn wait_for_sync(&self) {
        let mut synced = self.synced_rx.clone();
        // The store owns the sender, so the channel cannot close while a
        // caller still borrows the store.
        let _ = synced.wait_for(|done| *done).await;
    }

    /// Runs the periodic refresh until `shutdown` fires.
    ///
    /// The first pass runs immediately; failures of any pass are logged and
    /// the previous snapshot stays in place so the service never hard-depends
    /// on the upstream managers at startup.
    pub async fn sync(&self, sync_interval: Duration, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.update().await {
            warn!(error = %err, "Failed to update the cache; keeping the previous snapshot");
        }

        let mut ticker = interval(sync_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.update().await {
                        warn!(error = %err, "Failed to update the cache; keeping the previous snapshot");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Cache sync loop stopping");
                    return;
                }
            }
        }
    }

    async fn update(&self) -> Result<(), CacheError> {
        let api_keys = self.user_lister.list_api_keys().await?;
        let organizations = self.user_lister.list_organizations().await?;
        let organization_users = self.user_lister.list_organization_users().await?;
        let projects = self.user_lister.list_projects().await?;
        let project_users = self.user_lister.list_project_users().await?;
        let clusters = self.cluster_lister.list_clusters().await?;

        let next = build_indexes(
            api_keys,
            organizations,
            organization_users,
            projects,
            project_users,
            clusters,
        )?;

        *self.indexes.write().expect("rwlock poisoned") = next;
        let _ = self.synced_tx.send(true);
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Indexes> {
        self.indexes.read().expect("rwlock poisoned")
    }
}

fn build_indexes(
    api_keys: Vec<ApiKeyRecord>,
    organizations: Vec<OrganizationRecord>,
    organization_users: Vec<OrganizationUserRecord>,
    projects: Vec<ProjectRecord>,
    project_users: Vec<ProjectUserRecord>,
    clusters: Vec<ClusterRecord>,
) -> Result<Indexes, CacheError> {
    let mut api_keys_by_secret = HashMap::new();
    for record in api_keys {
        api_keys_by_secret.insert(
            record.secret,
            ApiKey {
                key_id: record.id,
                user_id: record.user.id,
                internal_user_id: record.user.internal_id,
                organization_id: record.organization_id,
                project_id: record.project_id,
                tenant_id: record.tenant_id,
                organization_role: OrganizationRole::parse(&record.organization_role),
                project_role: ProjectRole::parse(&record.project_role),
                excluded_from_rate_limiting: record.excluded_from_rate_limiting,
            },
        );
    }

    let mut clusters_by_registration_key = HashMap::new();
    let mut clusters_by_tenant_id: HashMap<String, Vec<Cluster>> = HashMap::new();
    for record in clusters {
        let cluster = Cluster {
            id: record.id,
            name: record.name,
            registration_key: record.registration_key,
            tenant_id: record.tenant_id,
        };
        clusters_by_tenant_id
            .entry(cluster.tenant_id.clone())
            .or_default()
            .push(cluster.clone());
        clusters_by_registration_key.insert(cluster.registration_key.clone(), cluster);
    }

    let mut orgs_by_id = HashMap::new();
    for record in organizations {
        orgs_by_id.insert(
            record.id.clone(),
            Organization {
                id: record.id,
                title: record.title,
                tenant_id: record.tenant_id,
            },
        );
    }

    let mut orgs_by_user_id: HashMap<String, Vec<OrganizationMembership>> = HashMap::new();
    let mut users_by_id: HashMap<String, User> = HashMap::new();
    for record in organization_users {
        orgs_by_user_id
            .entry(record.user_id.clone())
            .or_default()
            .push(OrganizationMembership {
                user_id: record.user_id.clone(),
                organization_id: record.organization_id.clone(),
                role: OrganizationRole::parse(&record.role),
            });

        let Some(org) = orgs_by_id.get(&record.organization_id) else {
            warn!(
                user_id = %record.user_id,
                organization_id = %record.organization_id,
                "Organization user references an unknown organization; skipping",
            );
            continue;
        };
        match users_by_id.get(&record.user_id) {
            Some(existing) if existing.tenant_id != org.tenant_id => {
                return Err(CacheError::InconsistentTenant {
                    user_id: record.user_id,
                    existing: existing.tenant_id.clone(),
                    conflicting: org.tenant_id.clone(),
                });
            }
            Some(_) => {}
            None => {
                users_by_id.insert(
                    record.user_id.clone(),
                    User {
                        id: record.user_id,
                        internal_id: record.internal_user_id,
                        tenant_id: org.tenant_id.clone(),
                    },
                );
            }
        }
    }

    let mut projects_by_id = HashMap::new();
    let mut projects_by_organization_id: HashMap<String, Vec<Project>> = HashMap::new();
    for record in projects {
        let project = Project {
            id: record.id,
            title: record.title,
            organization_id: record.organization_id,
            kubernetes_namespace: record.kubernetes_namespace,
            assignments: record.assignments,
        };
        projects_by_organization_id
            .entry(project.organization_id.clone())
            .or_default()
            .push(project.clone());
        projects_by_id.insert(project.id.clone(), project);
    }

    let mut projects_by_user_id: HashMap<String, Vec<ProjectMembership>> = HashMap::new();
    for record in project_users {
        projects_by_user_id
            .entry(record.user_id.clone())
            .or_default()
            .push(ProjectMembership {
                user_id: record.user_id,
                project_id: record.project_id,
                organization_id: record.organization_id,
                role: ProjectRole::parse(&record.role),
            });
    }

    Ok(Indexes {
        api_keys_by_secret,
        clusters_by_registration_key,
        clusters_by_tenant_id,
        orgs_by_id,
        orgs_by_user_id,
        projects_by_id,
        projects_by_organization_id,
        projects_by_user_id,
        users_by_id,
        last_successful_sync: Some(Utc::now()),
    })
}
