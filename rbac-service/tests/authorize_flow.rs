//! End-to-end flow: upstream listings and JWKS served by a mock HTTP server,
//! the cache synced from them, and decisions exercised over real gRPC.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use common_rbac_api::v1::rbac_internal_service_client::RbacInternalServiceClient;
use common_rbac_api::v1::rbac_internal_service_server::RbacInternalServiceServer;
use common_rbac_api::v1::{AuthorizeRequest, AuthorizeWorkerRequest};
use httpmock::prelude::*;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rand_core::OsRng;
use rbac_service::cache::Store;
use rbac_service::policy::RoleScopesMap;
use rbac_service::rpc::RbacServer;
use rbac_service::token::Validator;
use rbac_service::upstream::{ClusterManagerClient, UserManagerClient};
use reqwest::Client;
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Endpoint;
use tonic::Code;

async fn mock_upstreams(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/apikeys");
            then.status(200).json_body(json!({
                "api_keys": [{
                    "id": "id0",
                    "secret": "s0",
                    "user": {"id": "u0", "internal_id": "iu0"},
                    "organization_id": "o0",
                    "project_id": "p0",
                    "tenant_id": "t0",
                    "organization_role": "OWNER",
                    "project_role": "OWNER",
                    "excluded_from_rate_limiting": false
                }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/organizations");
            then.status(200).json_body(json!({
                "organizations": [{"id": "o0", "title": "Org Zero", "tenant_id": "t0"}]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/organization-users");
            then.status(200).json_body(json!({
                "users": [{
                    "user_id": "u0",
                    "internal_user_id": "iu0",
                    "organization_id": "o0",
                    "role": "OWNER"
                }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/projects");
            then.status(200).json_body(json!({
                "projects": [{
                    "id": "p0",
                    "title": "Project Zero",
                    "organization_id": "o0",
                    "kubernetes_namespace": "ns0"
                }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/project-users");
            then.status(200).json_body(json!({
                "users": [{
                    "user_id": "u0",
                    "project_id": "p0",
                    "organization_id": "o0",
                    "role": "OWNER"
                }]
            }));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/internal/v1/clusters");
            then.status(200).json_body(json!({
                "clusters": [{
                    "id": "c0",
                    "name": "cluster-zero",
                    "registration_key": "rkey0",
                    "tenant_id": "t0"
                }]
            }));
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn authorize_flow_over_grpc() -> anyhow::Result<()> {
    let mock = MockServer::start_async().await;
    mock_upstreams(&mock).await;

    // JWKS for the OIDC path, backed by a throwaway RSA key.
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, 2048)?;
    let public_key = private_key.to_public_key();
    let modulus = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
    let exponent = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
    mock.mock_async(|when, then| {
        when.method(GET).path("/keys");
        then.status(200).json_body(json!({
            "keys": [{"kid": "k0", "kty": "RSA", "n": modulus, "e": exponent}]
        }));
    })
    .await;

    let http_client = Client::new();
    let upstream_addr = mock.address().to_string();
    let store = Arc::new(Store::new(
        Arc::new(UserManagerClient::new(http_client.clone(), &upstream_addr)),
        Arc::new(ClusterManagerClient::new(http_client.clone(), &upstream_addr)),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    {
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { store.sync(Duration::from_secs(3600), shutdown).await });
    }
    timeout(Duration::from_secs(10), store.wait_for_sync()).await?;

    let validator = Validator::connect(http_client, mock.url("/keys"), None).await?;

    let role_scopes = RoleScopesMap::new(HashMap::from([(
        "organizationOwner".to_string(),
        vec!["api.object.read".to_string(), "api.object.write".to_string()],
    )]));
    let server = RbacServer::new(store, validator, role_scopes);

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let grpc_addr = listener.local_addr()?;
    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<RbacInternalServiceServer<RbacServer>>()
        .await;
    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(health_service)
            .add_service(RbacInternalServiceServer::new(server))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .expect("grpc server");
    });

    let channel = Endpoint::from_shared(format!("http://{grpc_addr}"))?
        .connect()
        .await?;
    let mut client = RbacInternalServiceClient::new(channel.clone());

    // API-key fast path.
    let resp = client
        .authorize(AuthorizeRequest {
            token: "s0".to_string(),
            access_resource: "api.object".to_string(),
            capability: "read".to_string(),
            ..Default::default()
        })
        .await?
        .into_inner();
    assert!(resp.authorized);
    assert_eq!(resp.api_key_id, "id0");
    assert_eq!(resp.user.unwrap().id, "u0");
    assert_eq!(resp.tenant_id, "t0");
    let project = resp.project.unwrap();
    assert_eq!(project.id, "p0");
    assert_eq!(project.assigned_kubernetes_envs.len(), 1);
    assert_eq!(project.assigned_kubernetes_envs[0].cluster_id, "c0");
    assert_eq!(project.assigned_kubernetes_envs[0].namespace, "ns0");

    // OIDC path: the email claim names the cached user.
    let private_pem = private_key
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)?
        .to_string();
    let jwt = encode(
        &Header::new(Algorithm::RS256),
        &json!({"sub": "subject", "email": "u0", "exp": Utc::now().timestamp() + 3600}),
        &EncodingKey::from_rsa_pem(private_pem.as_bytes())?,
    )?;
    let resp = client
        .authorize(AuthorizeRequest {
            token: jwt,
            access_resource: "api.object".to_string(),
            capability: "write".to_string(),
            ..Default::default()
        })
        .await?
        .into_inner();
    assert!(resp.authorized);
    assert_eq!(resp.project.unwrap().id, "p0");
    assert_eq!(resp.organization.unwrap().title, "Org Zero");
    assert!(resp.api_key_id.is_empty());

    // A token nobody can verify is a denial, not an error.
    let resp = client
        .authorize(AuthorizeRequest {
            token: "garbage".to_string(),
            access_resource: "api.object".to_string(),
            capability: "read".to_string(),
            ..Default::default()
        })
        .await?
        .into_inner();
    assert!(!resp.authorized);

    // Worker registration keys.
    let resp = client
        .authorize_worker(AuthorizeWorkerRequest {
            token: "rkey0".to_string(),
        })
        .await?
        .into_inner();
    assert!(resp.authorized);
    assert_eq!(resp.cluster.unwrap().id, "c0");
    assert_eq!(resp.tenant_id, "t0");

    let resp = client
        .authorize_worker(AuthorizeWorkerRequest {
            token: "bogus".to_string(),
        })
        .await?
        .into_inner();
    assert!(!resp.authorized);

    // Malformed requests surface INVALID_ARGUMENT.
    let err = client
        .authorize(AuthorizeRequest::default())
        .await
        .expect_err("empty request");
    assert_eq!(err.code(), Code::InvalidArgument);

    // The standard health service reports SERVING.
    let mut health = tonic_health::pb::health_client::HealthClient::new(channel);
    let resp = health
        .check(tonic_health::pb::HealthCheckRequest::default())
        .await?
        .into_inner();
    assert_eq!(
        resp.status,
        tonic_health::pb::health_check_response::ServingStatus::Serving as i32
    );

    let _ = shutdown_tx.send(true);
    Ok(())
}
