//! OIDC access-token validation against the issuer's JWKS endpoint.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("failed to fetch JWKS: {0}")]
    JwksFetch(String),
    #[error("failed to parse JWKS response: {0}")]
    JwksDecode(String),
}

/// Result of introspecting a bearer token.
#[derive(Debug, Clone, Default)]
pub struct Introspection {
    pub active: bool,
    /// The `uid` claim when present, the `sub` claim otherwise.
    pub subject: String,
    /// May be empty; cluster controllers carry no email claim.
    pub email: String,
}

/// Verifies bearer tokens and extracts their claims.
///
/// An invalid token is [`TokenError::InvalidToken`]; other errors indicate
/// that the introspection itself could not be carried out.
#[async_trait]
pub trait TokenIntrospector: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<Introspection, TokenError>;
}

/// JWT validator over a periodically refreshed JWKS key set.
pub struct Validator {
    keys: Arc<RwLock<Arc<Vec<DecodingKey>>>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator").finish_non_exhaustive()
    }
}

impl Validator {
    /// Fetches the key set once and, when `refresh` is set, keeps it fresh in
    /// the background. A failing initial fetch is an error so that startup
    /// aborts; later refresh failures keep the stale key set in place.
    pub async fn connect(
        client: Client,
        jwks_url: impl Into<String>,
        refresh: Option<Duration>,
    ) -> Result<Arc<Self>, TokenError> {
        let fetcher = JwksFetcher {
            client,
            url: jwks_url.into(),
        };
        let initial = fetcher.fetch().await?;
        let validator = Arc::new(Self {
            keys: Arc::new(RwLock::new(Arc::new(initial))),
        });
        if let Some(every) = refresh {
            tokio::spawn(refresh_loop(fetcher, Arc::clone(&validator.keys), every));
        }
        Ok(validator)
    }

    /// Builds a validator over a fixed key set; nothing is fetched.
    pub fn with_static_keys(keys: Vec<DecodingKey>) -> Self {
        Self {
            keys: Arc::new(RwLock::new(Arc::new(keys))),
        }
    }

    fn current_keys(&self) -> Arc<Vec<DecodingKey>> {
        Arc::clone(&self.keys.read().expect("rwlock poisoned"))
    }
}

#[async_trait]
impl TokenIntrospector for Validator {
    async fn introspect(&self, token: &str) -> Result<Introspection, TokenError> {
        let keys = self.current_keys();
        let claims = verify_with_any_key(&keys, token)?;
        let subject = subject_claim(&claims)?;
        let email = email_claim(&claims)?;
        Ok(Introspection {
            active: true,
            subject,
            email,
        })
    }
}

async fn refresh_loop(
    fetcher: JwksFetcher,
    keys: Arc<RwLock<Arc<Vec<DecodingKey>>>>,
    every: Duration,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match fetcher.fetch().await {
            Ok(fresh) => {
                debug!(count = fresh.len(), jwks_url = %fetcher.url, "Refreshed JWKS keys");
                *keys.write().expect("rwlock poisoned") = Arc::new(fresh);
            }
            Err(err) => {
                // Introspection keeps using the previously fetched keys.
                warn!(error = %err, jwks_url = %fetcher.url, "Failed to refresh JWKS keys");
            }
        }
    }
}

fn verify_with_any_key(keys: &[DecodingKey], token: &str) -> Result<Value, TokenError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.algorithms = vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512];
    validation.validate_aud = false;
    validation.validate_nbf = true;
    validation.leeway = 30;
    // Cluster controllers present tokens with a minimal claim set; exp and
    // nbf are validated only when the token carries them.
    validation.required_spec_claims.clear();

    for key in keys {
        match decode::<Value>(token, key, &validation) {
            Ok(data) => return Ok(data.claims),
            Err(err) => debug!(error = %err, "Key did not validate the token"),
        }
    }
    Err(TokenError::InvalidToken(
        "no key validates the token".to_string(),
    ))
}

fn subject_claim(claims: &Value) -> Result<String, TokenError> {
    // End-user access tokens carry "uid"; ID tokens only carry "sub".
    let value = claims
        .get("uid")
        .or_else(|| claims.get("sub"))
        .ok_or_else(|| {
            TokenError::InvalidToken("no \"uid\" or \"sub\" claim in the token".to_string())
        })?;
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| TokenError::InvalidToken(format!("non-string user ID claim {value}")))
}

fn email_claim(claims: &Value) -> Result<String, TokenError> {
    match claims.get("email") {
        None => Ok(String::new()),
        Some(value) => value
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| TokenError::InvalidToken(format!("non-string \"email\" claim {value}"))),
    }
}

struct JwksFetcher {
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: Option<String>,
    kty: Option<String>,
    n: Option<String>,
    e: Option<String>,
}

impl JwksFetcher {
    async fn fetch(&self) -> Result<Vec<DecodingKey>, TokenError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| TokenError::JwksFetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(TokenError::JwksFetch(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let body: JwksResponse = response
            .json()
            .await
            .map_err(|err| TokenError::JwksDecode(err.to_string()))?;

        let mut keys = Vec::new();
        for entry in body.keys {
            let kid = entry.kid.unwrap_or_default();
            let kty = entry.kty.unwrap_or_else(|| "RSA".to_string());
            if kty != "RSA" {
                warn!(kid = %kid, kty = %kty, "Skipping non-RSA JWKS entry");
                continue;
            }
            let (Some(n), Some(e)) = (entry.n, entry.e) else {
                warn!(kid = %kid, "Skipping JWKS entry without RSA components");
                continue;
            };
            match DecodingKey::from_rsa_components(&n, &e) {
                Ok(key) => keys.push(key),
                Err(err) => {
                    warn!(kid = %kid, error = %err, "Skipping unparsable JWKS entry");
                }
            }
        }
        if keys.is_empty() {
            return Err(TokenError::JwksDecode(format!(
                "no usable RSA keys at {}",
                self.url
            )));
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use chrono::Utc;
    use httpmock::prelude::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use rand_core::OsRng;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::traits::PublicKeyParts;
    use rsa::RsaPrivateKey;
    use serde_json::json;

    use super::*;

    struct TestKey {
        encoding: EncodingKey,
        decoding: DecodingKey,
        modulus: String,
        exponent: String,
    }

    fn generate_key() -> TestKey {
        let mut rng = OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, 2048).expect("generate RSA key");
        let public_key = private_key.to_public_key();
        let modulus = URL_SAFE_NO_PAD.encode(public_key.n().to_bytes_be());
        let exponent = URL_SAFE_NO_PAD.encode(public_key.e().to_bytes_be());
        let private_pem = private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .expect("encode PEM")
            .to_string();
        TestKey {
            encoding: EncodingKey::from_rsa_pem(private_pem.as_bytes()).expect("encoding key"),
            decoding: DecodingKey::from_rsa_components(&modulus, &exponent)
                .expect("decoding key"),
            modulus,
            exponent,
        }
    }

    fn test_key() -> &'static TestKey {
        static KEY: OnceLock<TestKey> = OnceLock::new();
        KEY.get_or_init(generate_key)
    }

    fn sign(claims: Value) -> String {
        encode(&Header::new(Algorithm::RS256), &claims, &test_key().encoding).expect("sign")
    }

    fn future_exp() -> i64 {
        Utc::now().timestamp() + 3600
    }

    #[tokio::test]
    async fn introspect_prefers_uid_over_sub() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({
            "uid": "u0",
            "sub": "subject",
            "email": "user@example.com",
            "exp": future_exp(),
        }));

        let is = validator.introspect(&token).await.expect("introspect");
        assert!(is.active);
        assert_eq!(is.subject, "u0");
        assert_eq!(is.email, "user@example.com");
    }

    #[tokio::test]
    async fn introspect_falls_back_to_sub_and_empty_email() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({"sub": "subject", "exp": future_exp()}));

        let is = validator.introspect(&token).await.expect("introspect");
        assert_eq!(is.subject, "subject");
        assert_eq!(is.email, "");
    }

    #[tokio::test]
    async fn introspect_rejects_token_without_subject() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({"email": "user@example.com", "exp": future_exp()}));

        let err = validator.introspect(&token).await.expect_err("no subject");
        assert!(matches!(err, TokenError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn introspect_accepts_token_without_exp() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({"sub": "controller-0"}));

        let is = validator.introspect(&token).await.expect("introspect");
        assert!(is.active);
        assert_eq!(is.subject, "controller-0");
        assert_eq!(is.email, "");
    }

    #[tokio::test]
    async fn introspect_rejects_token_before_nbf() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({
            "sub": "subject",
            "nbf": Utc::now().timestamp() + 3600,
        }));

        let err = validator.introspect(&token).await.expect_err("not yet valid");
        assert!(matches!(err, TokenError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn introspect_rejects_expired_token() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let token = sign(json!({
            "sub": "subject",
            "exp": Utc::now().timestamp() - 3600,
        }));

        let err = validator.introspect(&token).await.expect_err("expired");
        assert!(matches!(err, TokenError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn introspect_rejects_token_from_unknown_key() {
        let other = generate_key();
        let validator = Validator::with_static_keys(vec![other.decoding]);
        let token = sign(json!({"sub": "subject", "exp": future_exp()}));

        let err = validator.introspect(&token).await.expect_err("wrong key");
        assert!(matches!(err, TokenError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn introspect_rejects_garbage() {
        let validator = Validator::with_static_keys(vec![test_key().decoding.clone()]);
        let err = validator
            .introspect("not-a-jwt")
            .await
            .expect_err("garbage");
        assert!(matches!(err, TokenError::InvalidToken(_)));
    }

    #[tokio::test]
    async fn connect_fetches_keys_and_skips_non_rsa_entries() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/keys");
                then.status(200).json_body(json!({
                    "keys": [
                        {"kid": "ec-key", "kty": "EC", "crv": "P-256"},
                        {
                            "kid": "rsa-key",
                            "kty": "RSA",
                            "n": test_key().modulus,
                            "e": test_key().exponent,
                        },
                    ]
                }));
            })
            .await;

        let validator = Validator::connect(Client::new(), server.url("/keys"), None)
            .await
            .expect("connect");
        let token = sign(json!({"sub": "subject", "exp": future_exp()}));
        let is = validator.introspect(&token).await.expect("introspect");
        assert_eq!(is.subject, "subject");
    }

    #[tokio::test]
    async fn connect_fails_when_jwks_is_unreachable() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/keys");
                then.status(503);
            })
            .await;

        let err = Validator::connect(Client::new(), server.url("/keys"), None)
            .await
            .expect_err("should fail");
        assert!(matches!(err, TokenError::JwksFetch(_)));
    }
}
