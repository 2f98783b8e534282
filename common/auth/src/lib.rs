//! Client-side authorization plumbing shared by llmo services.
//!
//! Services put [`AuthLayer`] (user requests) or [`WorkerAuthLayer`] (worker
//! cluster requests) in front of their gRPC routers; the layers delegate the
//! decision to the RBAC server and install the resolved [`UserInfo`] or
//! [`ClusterInfo`] on the request extensions for downstream handlers. The
//! metadata helpers forward the caller's credentials on fan-out calls.

pub mod client;
pub mod clusterinfo;
pub mod interceptor;
pub mod metadata;
pub mod userinfo;
pub mod worker;
pub mod worker_interceptor;

pub use client::{Authorizer, RbacClient, WorkerAuthorizer};
pub use clusterinfo::{cluster_info, ClusterInfo};
pub use interceptor::{capability_for_method, AccessResource, AuthLayer, AuthMiddleware};
pub use metadata::{carry_metadata, AUTH_HEADER, ORG_HEADER, PROJECT_HEADER};
pub use userinfo::{user_info, KubernetesEnv, UserInfo};
pub use worker::{
    append_worker_authorization, cluster_registration_key, WorkerKeyError, WorkerTokenOptions,
    CLUSTER_REGISTRATION_KEY_ENV,
};
pub use worker_interceptor::{WorkerAuthLayer, WorkerAuthMiddleware};
