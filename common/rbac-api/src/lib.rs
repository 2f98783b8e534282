//! Protocol definitions for the llmo internal RBAC service.
//!
//! The prost/tonic code under [`v1`] is committed so that builds do not need
//! `protoc`. Regenerate from `proto/llmo/rbac/v1/rbac_service.proto` when the
//! contract changes.

#[allow(clippy::all)]
pub mod v1;
