pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod driver;
pub mod error;
pub mod host;
pub mod storage;
pub mod supervisor;
pub mod telemetry;
pub mod testing;
pub mod ui;

pub use config::Config;
pub use error::{BridgeError, BridgeResult};
pub use host::{BridgeHost, HostEvent};
pub use supervisor::{Input, Phase, Supervisor, SupervisorStatus};
