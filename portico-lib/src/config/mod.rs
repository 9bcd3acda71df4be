mod acl;
mod backend;
mod build;
mod listener;
mod loader;
mod root;
mod service;

pub use acl::{AclConfig, AclRefConfig};
pub use backend::{BackendConfig, ResolveModeConfig};
pub use build::build_core;
pub use listener::{ListenerConfig, ListenerTlsConfig};
pub use loader::load_from_path;
pub use root::{ControlConfig, LogLevelConfig, ResolverConfig, RootConfig};
pub use service::{
    CondConfig, NamedValueConfig, RewriteConfig, RewriteOpConfig, ServiceConfig, SessionConfig,
};
