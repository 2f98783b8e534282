//! Auth middleware for user-facing gRPC services.
//!
//! Each request is authorized against the RBAC server before it reaches the
//! inner service; the resolved [`UserInfo`] lands on the request extensions.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use common_rbac_api::v1::AuthorizeRequest;
use http::Request as HttpRequest;
use http::Response as HttpResponse;
use tonic::body::BoxBody;
use tonic::Status;
use tower::{Layer, Service};
use tracing::debug;

use crate::client::Authorizer;
use crate::metadata::{bearer_token, header_value, status_response, ORG_HEADER, PROJECT_HEADER};
use crate::userinfo::UserInfo;

/// Maps a gRPC method to the access resource evaluated for it.
#[derive(Clone)]
pub enum AccessResource {
    /// One resource for every method of the service.
    Static(String),
    /// Per-method resolution from the full method name
    /// (`/package.Service/Method`).
    PerMethod(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl AccessResource {
    fn resolve(&self, full_method: &str) -> String {
        match self {
            AccessResource::Static(resource) => resource.clone(),
            AccessResource::PerMethod(resolve) => resolve(full_method),
        }
    }
}

/// Capability requested by a gRPC method: `Get*`/`List*` read, everything
/// else writes.
pub fn capability_for_method(full_method: &str) -> &'static str {
    let method = full_method.rsplit('/').next().unwrap_or(full_method);
    if method.starts_with("Get") || method.starts_with("List") {
        "read"
    } else {
        "write"
    }
}

#[derive(Clone)]
pub struct AuthLayer {
    authorizer: Arc<dyn Authorizer>,
    access_resource: AccessResource,
}

impl AuthLayer {
    pub fn new(authorizer: Arc<dyn Authorizer>, access_resource: AccessResource) -> Self {
        Self {
            authorizer,
            access_resource,
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            authorizer: self.authorizer.clone(),
            access_resource: self.access_resource.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    authorizer: Arc<dyn Authorizer>,
    access_resource: AccessResource,
}

impl<S, ReqBody> Service<HttpRequest<ReqBody>> for AuthMiddleware<S>
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
        let access_resource = self.access_resource.clone();

        Box::pin(async move {
            let path = req.uri().path().to_string();
            let token = match bearer_token(req.headers()) {
                Ok(token) => token,
                Err(status) => return Ok(status_response(status)),
            };

            let request = AuthorizeRequest {
                token,
                access_resource: access_resource.resolve(&path),
                capability: capability_for_method(&path).to_string(),
                organization_id: header_value(req.headers(), ORG_HEADER),
                project_id: header_value(req.headers(), PROJECT_HEADER),
            };
            let response = match authorizer.authorize(request).await {
                Ok(response) => response,
                Err(status) => {
                    return Ok(status_response(Status::internal(format!(
                        "failed to authorize: {status}"
                    ))));
                }
            };
            if !response.authorized {
                debug!(path = %path, "Authorization denied");
                return Ok(status_response(Status::permission_denied(
                    "permission denied",
                )));
            }

            req.extensions_mut().insert(UserInfo::from(response));
            inner.call(req).await
        })
    }
}
