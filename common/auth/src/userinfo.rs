//! Resolved caller identity installed on authorized user requests.

use common_rbac_api::v1::AuthorizeResponse;

/// Identity context of an authorized user request, read by handlers via
/// [`user_info`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub user_id: String,
    pub internal_user_id: String,
    pub organization_id: String,
    pub project_id: String,
    pub assigned_kubernetes_envs: Vec<KubernetesEnv>,
    pub tenant_id: String,
    /// Empty unless the request authenticated with an API key.
    pub api_key_id: String,
    pub excluded_from_rate_limiting: bool,
}

/// A (cluster, namespace) destination the project may run workloads in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KubernetesEnv {
    pub cluster_id: String,
    pub cluster_name: String,
    pub namespace: String,
}

impl From<AuthorizeResponse> for UserInfo {
    fn from(response: AuthorizeResponse) -> Self {
        let user = response.user.unwrap_or_default();
        let organization = response.organization.unwrap_or_default();
        let project = response.project.unwrap_or_default();
        Self {
            user_id: user.id,
            internal_user_id: user.internal_id,
            organization_id: organization.id,
            project_id: project.id,
            assigned_kubernetes_envs: project
                .assigned_kubernetes_envs
                .into_iter()
                .map(|env| KubernetesEnv {
                    cluster_id: env.cluster_id,
                    cluster_name: env.cluster_name,
                    namespace: env.namespace,
                })
                .collect(),
            tenant_id: response.tenant_id,
            api_key_id: response.api_key_id,
            excluded_from_rate_limiting: response.excluded_from_rate_limiting,
        }
    }
}

/// Reads the [`UserInfo`] installed by the auth middleware.
pub fn user_info<T>(request: &tonic::Request<T>) -> Option<&UserInfo> {
    request.extensions().get::<UserInfo>()
}
