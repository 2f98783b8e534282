//! Worker-side credential helper for outbound calls to the control plane.

use std::env;

use thiserror::Error;
use tonic::metadata::MetadataValue;
use tonic::Request;

/// Environment variable carrying the cluster registration key.
pub const CLUSTER_REGISTRATION_KEY_ENV: &str = "LLMO_CLUSTER_REGISTRATION_KEY";

const KEY_PREFIX: &str = "clusterkey-";

/// Registration key shipped with very old cluster installations. Accepted
/// only when [`WorkerTokenOptions::allow_legacy_default`] is set.
const LEGACY_DEFAULT_KEY: &str = "default-cluster-registration-key-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerKeyError {
    #[error("{CLUSTER_REGISTRATION_KEY_ENV} is not set")]
    Missing,
    #[error("cluster registration key does not start with \"{KEY_PREFIX}\"")]
    InvalidPrefix,
    #[error("cluster registration key contains characters not allowed in a header")]
    InvalidValue,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerTokenOptions {
    /// Accept the legacy well-known default registration key. Leave off
    /// unless the deployment still runs pre-keyed clusters.
    pub allow_legacy_default: bool,
}

/// Reads and validates the registration key from the environment.
pub fn cluster_registration_key(opts: WorkerTokenOptions) -> Result<String, WorkerKeyError> {
    let key = env::var(CLUSTER_REGISTRATION_KEY_ENV).unwrap_or_default();
    validate_key(&key, opts)?;
    Ok(key)
}

/// Adds the worker's registration key as a bearer token on an outgoing
/// request.
pub fn append_worker_authorization<T>(
    request: &mut Request<T>,
    opts: WorkerTokenOptions,
) -> Result<(), WorkerKeyError> {
    let key = cluster_registration_key(opts)?;
    let value: MetadataValue<_> = format!("Bearer {key}")
        .parse()
        .map_err(|_| WorkerKeyError::InvalidValue)?;
    request.metadata_mut().insert("authorization", value);
    Ok(())
}

fn validate_key(key: &str, opts: WorkerTokenOptions) -> Result<(), WorkerKeyError> {
    if key.is_empty() {
        return Err(WorkerKeyError::Missing);
    }
    if opts.allow_legacy_default && key == LEGACY_DEFAULT_KEY {
        return Ok(());
    }
    if !key.starts_with(KEY_PREFIX) {
        return Err(WorkerKeyError::InvalidPrefix);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_key_checks_the_prefix() {
        let cases = [
            ("clusterkey-1234567890", false),
            ("default-cluster-registration-key-secret", true),
            ("bogus", true),
            ("", true),
        ];
        for (key, want_err) in cases {
            let got = validate_key(key, WorkerTokenOptions::default());
            assert_eq!(got.is_err(), want_err, "key {key:?}");
        }
    }

    #[test]
    fn legacy_default_key_needs_the_opt_in() {
        let opts = WorkerTokenOptions {
            allow_legacy_default: true,
        };
        assert_eq!(validate_key(LEGACY_DEFAULT_KEY, opts), Ok(()));
        assert_eq!(
            validate_key(LEGACY_DEFAULT_KEY, WorkerTokenOptions::default()),
            Err(WorkerKeyError::InvalidPrefix)
        );
        // The opt-in does not loosen the prefix rule for other keys.
        assert_eq!(validate_key("bogus", opts), Err(WorkerKeyError::InvalidPrefix));
        assert_eq!(validate_key("clusterkey-abc", opts), Ok(()));
    }
}
