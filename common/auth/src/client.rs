//! Thin client over the internal RBAC service.

use async_trait::async_trait;
use common_rbac_api::v1::rbac_internal_service_client::RbacInternalServiceClient;
use common_rbac_api::v1::{
    AuthorizeRequest, AuthorizeResponse, AuthorizeWorkerRequest, AuthorizeWorkerResponse,
};
use tonic::transport::{Channel, Endpoint};
use tonic::Status;

/// Issues `Authorize` calls against the RBAC server.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, Status>;
}

/// Issues `AuthorizeWorker` calls against the RBAC server.
#[async_trait]
pub trait WorkerAuthorizer: Send + Sync {
    async fn authorize_worker(
        &self,
        request: AuthorizeWorkerRequest,
    ) -> Result<AuthorizeWorkerResponse, Status>;
}

/// gRPC client for the RBAC server; the channel connects on first use.
#[derive(Clone)]
pub struct RbacClient {
    client: RbacInternalServiceClient<Channel>,
}

impl RbacClient {
    pub fn new(rbac_server_addr: &str) -> Result<Self, tonic::transport::Error> {
        let channel = Endpoint::from_shared(format!("http://{rbac_server_addr}"))?.connect_lazy();
        Ok(Self {
            client: RbacInternalServiceClient::new(channel),
        })
    }
}

#[async_trait]
impl Authorizer for RbacClient {
    async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeResponse, Status> {
        let mut client = self.client.clone();
        Ok(client.authorize(request).await?.into_inner())
    }
}

#[async_trait]
impl WorkerAuthorizer for RbacClient {
    async fn authorize_worker(
        &self,
        request: AuthorizeWorkerRequest,
    ) -> Result<AuthorizeWorkerResponse, Status> {
        let mut client = self.client.clone();
        Ok(client.authorize_worker(request).await?.into_inner())
    }
}
