//! Resolved worker identity installed on authorized cluster requests.

use common_rbac_api::v1::AuthorizeWorkerResponse;

/// Identity context of an authorized worker request, read by handlers via
/// [`cluster_info`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClusterInfo {
    pub cluster_id: String,
    pub tenant_id: String,
}

impl From<AuthorizeWorkerResponse> for ClusterInfo {
    fn from(response: AuthorizeWorkerResponse) -> Self {
        Self {
            cluster_id: response.cluster.unwrap_or_default().id,
            tenant_id: response.tenant_id,
        }
    }
}

/// Reads the [`ClusterInfo`] installed by the worker auth middleware.
pub fn cluster_info<T>(request: &tonic::Request<T>) -> Option<&ClusterInfo> {
    request.extensions().get::<ClusterInfo>()
}
