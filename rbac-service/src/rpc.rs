//! Internal gRPC surface of the RBAC server.

use std::net::SocketAddr;
use std::sync::Arc;

use common_rbac_api::v1::rbac_internal_service_server::{
    RbacInternalService, RbacInternalServiceServer,
};
use common_rbac_api::v1::{
    AuthorizeRequest, AuthorizeResponse, AuthorizeWorkerRequest, AuthorizeWorkerResponse,
};
use tokio::sync::watch;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use crate::authorization::CacheReader;
use crate::policy::RoleScopesMap;
use crate::token::TokenIntrospector;

/// Serves `Authorize` and `AuthorizeWorker` over the identity cache, the
/// token introspector and the role policy.
pub struct RbacServer {
    pub(crate) cache: Arc<dyn CacheReader>,
    pub(crate) token_introspector: Arc<dyn TokenIntrospector>,
    pub(crate) role_scopes: RoleScopesMap,
}

impl RbacServer {
    pub fn new(
        cache: Arc<dyn CacheReader>,
        token_introspector: Arc<dyn TokenIntrospector>,
        role_scopes: RoleScopesMap,
    ) -> Self {
        Self {
            cache,
            token_introspector,
            role_scopes,
        }
    }

    /// Serves the RBAC and health services until `shutdown` fires, then
    /// drains in-flight calls.
    pub async fn run(
        self,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), tonic::transport::Error> {
        let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
        health_reporter
            .set_serving::<RbacInternalServiceServer<RbacServer>>()
            .await;

        info!(%addr, "Starting internal gRPC server");
        Server::builder()
            .add_service(health_service)
            .add_service(RbacInternalServiceServer::new(self))
            .serve_with_shutdown(addr, async move {
                let _ = shutdown.changed().await;
            })
            .await
    }
}

#[tonic::async_trait]
impl RbacInternalService for RbacServer {
    async fn authorize(
        &self,
        request: Request<AuthorizeRequest>,
    ) -> Result<Response<AuthorizeResponse>, Status> {
        let response = self.handle_authorize(request.into_inner()).await?;
        Ok(Response::new(response))
    }

    async fn authorize_worker(
        &self,
        request: Request<AuthorizeWorkerRequest>,
    ) -> Result<Response<AuthorizeWorkerResponse>, Status> {
        let response = self.handle_authorize_worker(request.into_inner())?;
        Ok(Response::new(response))
    }
}
