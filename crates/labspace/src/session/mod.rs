//! Session orchestration: per-app container specs, the session lifecycle and
//! the registry of live sessions.

pub mod agent;
pub mod apps;
mod error;
mod models;
pub mod readiness;
mod registry;
mod session;
mod settings;

pub use agent::{AgentParseError, CommandOutput, extract_json_object};
pub use apps::{AppCatalog, AppSettings, BuilderContext, ConfigError, SessionConfigBuilder};
pub use error::{SessionError, SessionResult};
pub use models::{
    AppType, DeleteStatus, MountMode, SessionDescriptor, SessionStatus, UserIdentity,
    VolumeMount, VolumeRequest,
};
pub use readiness::{HttpSessionReadiness, ReadinessSettings, SessionReadiness};
pub use registry::SessionRegistry;
pub use session::{Session, SessionContext};
pub use settings::{AddressMode, SessionSettings};

#[cfg(test)]
mod tests;
