//! Auth middleware for gRPC services that accept worker cluster requests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common_rbac_api::v1::AuthorizeWorkerRequest;
use http::Request as HttpRequest;
use http::Response as HttpResponse;
use tonic::body::BoxBody;
use tonic::Status;
use tower::{Layer, Service};
use tracing::debug;

use crate::client::WorkerAuthorizer;
use crate::clusterinfo::ClusterInfo;
use crate::metadata::{bearer_token, status_response};

#[derive(Clone)]
pub struct WorkerAuthLayer {
    authorizer: Arc<dyn WorkerAuthorizer>,
}

impl WorkerAuthLayer {
    pub fn new(authorizer: Arc<dyn WorkerAuthorizer>) -> Self {
        Self { authorizer }
    }
}

impl<S> Layer<S> for WorkerAuthLayer {
    type Service = WorkerAuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        WorkerAuthMiddleware {
            inner,
            authorizer: self.authorizer.clone(),
        }
    }
}

#[derive(Clone)]
pub struct WorkerAuthMiddleware<S> {
    inner: S,
    authorizer: Arc<dyn WorkerAuthorizer>,
}

impl<S, ReqBody> Service<HttpRequest<ReqBody>> for WorkerAuthMiddleware<S>
where
    S: Service<HttpRequest<ReqBody>, Response = HttpResponse<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = HttpResponse<BoxBody>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: HttpRequest<ReqBody>) -> Self::Future {
        let mut inner = self.inner.clone();
        std::mem::swap(&mut self.inner, &mut inner);

        let authorizer = self.authorizer.clone();

        Box::pin(async move {
            let token = match bearer_token(req.headers()) {
                Ok(token) => token,
                Err(status) => return Ok(status_response(status)),
            };

            let response = match authorizer
                .authorize_worker(AuthorizeWorkerRequest { token })
                .await
            {
                Ok(response) => response,
                Err(status) => {
                    return Ok(status_response(Status::internal(format!(
                        "failed to authorize: {status}"
                    ))));
                }
            };
            if !response.authorized {
                debug!(path = %req.uri().path(), "Worker authorization denied");
                return Ok(status_response(Status::permission_denied(
                    "permission denied",
                )));
            }

            req.extensions_mut().insert(ClusterInfo::from(response));
            inner.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use common_rbac_api::v1;
    use tower::ServiceExt;

    use super::*;

    struct FakeWorkerAuthorizer {
        authorized: bool,
    }

    #[async_trait]
    impl WorkerAuthorizer for FakeWorkerAuthorizer {
        async fn authorize_worker(
            &self,
            request: AuthorizeWorkerRequest,
        ) -> Result<v1::AuthorizeWorkerResponse, Status> {
            assert_eq!(request.token, "rkey0");
            Ok(v1::AuthorizeWorkerResponse {
                authorized: self.authorized,
                cluster: Some(v1::Cluster {
                    id: "c0".to_string(),
                    name: "cluster-zero".to_string(),
                }),
                tenant_id: "t0".to_string(),
            })
        }
    }

    async fn ok_handler(
        req: HttpRequest<()>,
    ) -> Result<HttpResponse<BoxBody>, std::convert::Infallible> {
        let info = req.extensions().get::<ClusterInfo>().expect("cluster info");
        assert_eq!(info.cluster_id, "c0");
        assert_eq!(info.tenant_id, "t0");
        Ok(HttpResponse::new(BoxBody::default()))
    }

    fn request() -> HttpRequest<()> {
        HttpRequest::builder()
            .uri("/test.WorkerService/SendStatus")
            .header("authorization", "Bearer rkey0")
            .body(())
            .unwrap()
    }

    #[tokio::test]
    async fn authorized_worker_reaches_the_inner_service() {
        let layer = WorkerAuthLayer::new(Arc::new(FakeWorkerAuthorizer { authorized: true }));
        let service = layer.layer(tower::service_fn(ok_handler));

        let response = service.oneshot(request()).await.unwrap();
        assert!(response.headers().get("grpc-status").is_none());
    }

    #[tokio::test]
    async fn unknown_worker_is_denied() {
        let layer = WorkerAuthLayer::new(Arc::new(FakeWorkerAuthorizer { authorized: false }));
        let service = layer.layer(tower::service_fn(ok_handler));

        let response = service.oneshot(request()).await.unwrap();
        assert_eq!(
            response.headers()["grpc-status"],
            (tonic::Code::PermissionDenied as i32).to_string().as_str()
        );
    }

    #[tokio::test]
    async fn missing_token_is_unauthenticated() {
        let layer = WorkerAuthLayer::new(Arc::new(FakeWorkerAuthorizer { authorized: true }));
        let service = layer.layer(tower::service_fn(ok_handler));

        let request = HttpRequest::builder()
            .uri("/test.WorkerService/SendStatus")
            .body(())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(
            response.headers()["grpc-status"],
            (tonic::Code::Unauthenticated as i32).to_string().as_str()
        );
    }
}
