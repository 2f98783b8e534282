pub mod authorization;
pub mod cache;
pub mod config;
pub mod metrics;
pub mod policy;
pub mod rpc;
pub mod token;
pub mod upstream;

pub use rpc::RbacServer;
