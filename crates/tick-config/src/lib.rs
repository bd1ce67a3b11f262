pub mod alert;
pub mod engine;
pub mod env_override;
pub mod logging;
pub mod overrides;
pub mod server;
pub mod storage;
pub mod types;
pub mod udf;
pub mod upstream;
pub mod validate;

pub use alert::AlertConfig;
pub use engine::EngineConfig;
pub use env_override::apply_env_overrides;
pub use logging::{LogFormat, LoggingConfig};
pub use overrides::ConfigOverrides;
pub use server::ServerConfig;
pub use storage::StorageConfig;
pub use types::HumanDuration;
pub use udf::{UdfConfig, UdfFunction};
pub use upstream::UpstreamConfig;
