//! The authorization decision engine behind `Authorize` and
//! `AuthorizeWorker`.
//!
//! A policy-driven denial is a well-formed response with `authorized: false`;
//! only malformed inputs and introspection transport failures become RPC
//! errors.

use std::collections::HashSet;

use common_rbac_api::v1;
use tonic::Status;
use tracing::{debug, warn};

use crate::cache::{
    ApiKey, Cluster, Organization, OrganizationMembership, OrganizationRole, Project,
    ProjectAssignment, ProjectMembership, ProjectRole, Store, User,
};
use crate::policy::{ROLE_ORGANIZATION_OWNER, ROLE_PROJECT_MEMBER, ROLE_PROJECT_OWNER};
use crate::rpc::RbacServer;
use crate::token::TokenError;

/// Resources under this prefix are administrative listing APIs that are not
/// scoped to a single organization; the caller performs its own fine-grained
/// check.
const UNSCOPED_ADMIN_RESOURCE_PREFIX: &str = "api.organizations";

/// Read side of the identity cache used by the decision engine.
pub trait CacheReader: Send + Sync {
    fn api_key_by_secret(&self, secret: &str) -> Option<ApiKey>;
    fn cluster_by_registration_key(&self, key: &str) -> Option<Cluster>;
    fn clusters_by_tenant_id(&self, tenant_id: &str) -> Vec<Cluster>;
    fn organization_by_id(&self, organization_id: &str) -> Option<Organization>;
    fn organizations_by_user_id(&self, user_id: &str) -> Vec<OrganizationMembership>;
    fn project_by_id(&self, project_id: &str) -> Option<Project>;
    fn projects_by_organization_id(&self, organization_id: &str) -> Vec<Project>;
    fn projects_by_user_id(&self, user_id: &str) -> Vec<ProjectMembership>;
    fn user_by_id(&self, user_id: &str) -> Option<User>;
}

impl CacheReader for Store {
    fn api_key_by_secret(&self, secret: &str) -> Option<ApiKey> {
        Store::api_key_by_secret(self, secret)
    }

    fn cluster_by_registration_key(&self, key: &str) -> Option<Cluster> {
        Store::cluster_by_registration_key(self, key)
    }

    fn clusters_by_tenant_id(&self, tenant_id: &str) -> Vec<Cluster> {
        Store::clusters_by_tenant_id(self, tenant_id)
    }

    fn organization_by_id(&self, organization_id: &str) -> Option<Organization> {
        Store::organization_by_id(self, organization_id)
    }

    fn organizations_by_user_id(&self, user_id: &str) -> Vec<OrganizationMembership> {
        Store::organizations_by_user_id(self, user_id)
    }

    fn project_by_id(&self, project_id: &str) -> Option<Project> {
        Store::project_by_id(self, project_id)
    }

    fn projects_by_organization_id(&self, organization_id: &str) -> Vec<Project> {
        Store::projects_by_organization_id(self, organization_id)
    }

    fn projects_by_user_id(&self, user_id: &str) -> Vec<ProjectMembership> {
        Store::projects_by_user_id(self, user_id)
    }

    fn user_by_id(&self, user_id: &str) -> Option<User> {
        Store::user_by_id(self, user_id)
    }
}

struct ProjectAndRoles {
    project: Project,
    org_role: OrganizationRole,
    project_role: ProjectRole,
}

impl RbacServer {
    pub(crate) async fn handle_authorize(
        &self,
        req: v1::AuthorizeRequest,
    ) -> Result<v1::AuthorizeResponse, Status> {
        if req.token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }
        if req.access_resource.is_empty() {
            return Err(Status::invalid_argument("access_resource is required"));
        }
        if req.capability.is_empty() {
            return Err(Status::invalid_argument("capability is required"));
        }

        let scope = format!("{}.{}", req.access_resource, req.capability);

        if let Some(key) = self.cache.api_key_by_secret(&req.token) {
            return Ok(self.authorize_api_key(&key, &scope));
        }

        let introspection = match self.token_introspector.introspect(&req.token).await {
            Ok(introspection) => introspection,
            Err(TokenError::InvalidToken(reason)) => {
                debug!(reason = %reason, "Token failed introspection");
                return Ok(denied());
            }
            Err(err) => {
                return Err(Status::internal(format!("failed to introspect token: {err}")));
            }
        };
        if !introspection.active {
            return Ok(denied());
        }

        let user_id = normalize_user_id(&introspection.email);
        let Some(user) = self.cache.user_by_id(&user_id) else {
            debug!(user_id = %user_id, "No such user in the cache");
            return Ok(denied());
        };

        if req.access_resource.starts_with(UNSCOPED_ADMIN_RESOURCE_PREFIX) {
            return Ok(v1::AuthorizeResponse {
                authorized: true,
                user: Some(v1::User {
                    id: user.id,
                    internal_id: user.internal_id,
                }),
                organization: Some(v1::Organization::default()),
                project: Some(v1::Project::default()),
                tenant_id: user.tenant_id,
                ..Default::default()
            });
        }

        let found = match self.find_associated_project_and_roles(
            &user.id,
            &req.organization_id,
            &req.project_id,
        ) {
            Ok(found) => found,
            Err(reason) => {
                debug!(user_id = %user.id, reason = %reason, "No project associated with the request");
                return Ok(denied());
            }
        };

        let Some(role) = role_from_org_and_project_roles(found.org_role, found.project_role)
        else {
            return Ok(denied());
        };

        let organization_title = self
            .cache
            .organization_by_id(&found.project.organization_id)
            .map(|org| org.title)
            .unwrap_or_default();
        let clusters = self.cache.clusters_by_tenant_id(&user.tenant_id);

        Ok(v1::AuthorizeResponse {
            authorized: self.role_scopes.allows(role, &scope),
            user: Some(v1::User {
                id: user.id,
                internal_id: user.internal_id,
            }),
            organization: Some(v1::Organization {
                id: found.project.organization_id.clone(),
                title: organization_title,
            }),
            project: Some(project_response(&found.project, &clusters)),
            tenant_id: user.tenant_id,
            ..Default::default()
        })
    }

    pub(crate) fn handle_authorize_worker(
        &self,
        req: v1::AuthorizeWorkerRequest,
    ) -> Result<v1::AuthorizeWorkerResponse, Status> {
        if req.token.is_empty() {
            return Err(Status::invalid_argument("token is required"));
        }

        let Some(cluster) = self.cache.cluster_by_registration_key(&req.token) else {
            return Ok(v1::AuthorizeWorkerResponse {
                authorized: false,
                ..Default::default()
            });
        };
        Ok(v1::AuthorizeWorkerResponse {
            authorized: true,
            cluster: Some(v1::Cluster {
                id: cluster.id,
                name: cluster.name,
            }),
            tenant_id: cluster.tenant_id,
        })
    }

    fn authorize_api_key(&self, key: &ApiKey, scope: &str) -> v1::AuthorizeResponse {
        let Some(project) = self.cache.project_by_id(&key.project_id) else {
            warn!(
                api_key_id = %key.key_id,
                project_id = %key.project_id,
                "API key references a project missing from the cache",
            );
            return denied();
        };

        let authorized = role_from_org_and_project_roles(key.organization_role, key.project_role)
            .map(|role| self.role_scopes.allows(role, scope))
            .unwrap_or(false);

        let organization_title = self
            .cache
            .organization_by_id(&key.organization_id)
            .map(|org| org.title)
            .unwrap_or_default();
        let clusters = self.cache.clusters_by_tenant_id(&key.tenant_id);

        v1::AuthorizeResponse {
            authorized,
            user: Some(v1::User {
                id: key.user_id.clone(),
                internal_id: key.internal_user_id.clone(),
            }),
            organization: Some(v1::Organization {
                id: key.organization_id.clone(),
                title: organization_title,
            }),
            project: Some(project_response(&project, &clusters)),
            tenant_id: key.tenant_id.clone(),
            api_key_id: key.key_id.clone(),
            excluded_from_rate_limiting: key.excluded_from_rate_limiting,
        }
    }

    /// Picks the project a request acts on and the caller's roles in it.
    ///
    /// "First" follows the order the cache returns; callers must not depend
    /// on a specific pick when several are valid.
    fn find_associated_project_and_roles(
        &self,
        user_id: &str,
        requested_org_id: &str,
        requested_project_id: &str,
    ) -> Result<ProjectAndRoles, String> {
        let project_memberships = self.cache.projects_by_user_id(user_id);
        let org_memberships = self.cache.organizations_by_user_id(user_id);

        let project = self.choose_project(
            user_id,
            requested_org_id,
            requested_project_id,
            &project_memberships,
            &org_memberships,
        )?;

        let project_role = project_memberships
            .iter()
            .find(|m| m.project_id == project.id)
            .map(|m| m.role)
            .unwrap_or(ProjectRole::Unspecified);
        let org_role = org_memberships
            .iter()
            .find(|m| m.organization_id == project.organization_id)
            .map(|m| m.role)
            .unwrap_or(OrganizationRole::Unspecified);
        if org_role == OrganizationRole::Unspecified {
            return Err(format!(
                "user {user_id} has no role in organization {}",
                project.organization_id
            ));
        }

        Ok(ProjectAndRoles {
            project,
            org_role,
            project_role,
        })
    }

    fn choose_project(
        &self,
        user_id: &str,
        requested_org_id: &str,
        requested_project_id: &str,
        project_memberships: &[ProjectMembership],
        org_memberships: &[OrganizationMembership],
    ) -> Result<Project, String> {
        if !requested_project_id.is_empty() {
            let Some(project) = self.cache.project_by_id(requested_project_id) else {
                return Err(format!("unknown project {requested_project_id}"));
            };
            if !requested_org_id.is_empty() && project.organization_id != requested_org_id {
                return Err(format!(
                    "project {requested_project_id} does not belong to organization {requested_org_id}"
                ));
            }
            return Ok(project);
        }

        if !requested_org_id.is_empty() {
            if self.cache.organization_by_id(requested_org_id).is_none() {
                return Err(format!("unknown organization {requested_org_id}"));
            }
            for membership in project_memberships {
                if membership.organization_id == requested_org_id {
                    if let Some(project) = self.cache.project_by_id(&membership.project_id) {
                        return Ok(project);
                    }
                }
            }
            // The user need not be a member of any project in the requested
            // organization; resolve to the organization's first project so a
            // namespace can still be derived.
            if let Some(project) = self
                .cache
                .projects_by_organization_id(requested_org_id)
                .into_iter()
                .next()
            {
                return Ok(project);
            }
            return Err(format!("organization {requested_org_id} has no projects"));
        }

        for membership in project_memberships {
            if let Some(project) = self.cache.project_by_id(&membership.project_id) {
                return Ok(project);
            }
        }
        for membership in org_memberships {
            if let Some(project) = self
                .cache
                .projects_by_organization_id(&membership.organization_id)
                .into_iter()
                .next()
            {
                return Ok(project);
            }
        }
        Err(format!("no project associated with user {user_id}"))
    }
}

fn denied() -> v1::AuthorizeResponse {
    v1::AuthorizeResponse {
        authorized: false,
        ..Default::default()
    }
}

fn normalize_user_id(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

fn role_from_org_and_project_roles(
    org_role: OrganizationRole,
    project_role: ProjectRole,
) -> Option<&'static str> {
    match (org_role, project_role) {
        (OrganizationRole::Owner, _) => Some(ROLE_ORGANIZATION_OWNER),
        (OrganizationRole::Reader, ProjectRole::Owner) => Some(ROLE_PROJECT_OWNER),
        (OrganizationRole::Reader, ProjectRole::Member) => Some(ROLE_PROJECT_MEMBER),
        _ => None,
    }
}

fn project_response(project: &Project, clusters: &[Cluster]) -> v1::Project {
    v1::Project {
        id: project.id.clone(),
        title: project.title.clone(),
        assigned_kubernetes_envs: assigned_kubernetes_envs(
            &project.kubernetes_namespace,
            &project.assignments,
            clusters,
        ),
    }
}

/// Expands a project's namespace and explicit assignments over the tenant's
/// clusters.
///
/// Without assignments every cluster gets the default namespace. With
/// assignments, a wildcard (empty cluster ID) entry expands over every
/// cluster, entries naming a cluster outside the tenant are dropped, and
/// clusters left unreferenced still get the default namespace.
fn assigned_kubernetes_envs(
    namespace: &str,
    assignments: &[ProjectAssignment],
    clusters: &[Cluster],
) -> Vec<v1::project::AssignedKubernetesEnv> {
    let mut envs = Vec::new();
    if assignments.is_empty() {
        for cluster in clusters {
            envs.push(env(cluster, namespace));
        }
        return envs;
    }

    for assignment in assignments {
        if assignment.cluster_id.is_empty() {
            for cluster in clusters {
                envs.push(env(cluster, &assignment.namespace));
            }
        } else if let Some(cluster) = clusters.iter().find(|c| c.id == assignment.cluster_id) {
            envs.push(env(cluster, &assignment.namespace));
        }
    }

    let referenced: HashSet<String> = envs.iter().map(|e| e.cluster_id.clone()).collect();
    for cluster in clusters {
        if !referenced.contains(&cluster.id) {
            envs.push(env(cluster, namespace));
        }
    }
    envs
}

fn env(cluster: &Cluster, namespace: &str) -> v1::project::AssignedKubernetesEnv {
    v1::project::AssignedKubernetesEnv {
        cluster_id: cluster.id.clone(),
        cluster_name: cluster.name.clone(),
        namespace: namespace.to_string(),
    }
}
