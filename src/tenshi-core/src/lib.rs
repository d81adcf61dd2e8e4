pub mod config;
pub mod logging;
pub mod paths;
pub mod runtime;
pub mod storage;

pub use config::{
    AdaptersConfig, Config, ConfigError, LogLevel, LoggingConfig, StorageConfig, ValidationError,
};
pub use logging::{init_logging, LoggingError, LoggingGuard};
pub use paths::{AppDirs, DirsError};
pub use runtime::{
    Dispatcher, ImmediateDispatcher, MainLoop, MainLoopHandle, Task, TaskPool, POOL_SHUTDOWN_GRACE,
};
pub use storage::{JsonFileStorage, PersistentStorage, StorageError, StorageResult};

pub const APP_NAME: &str = "tenshi";
pub const APP_AUTHOR: &str = "shadow578";
pub const APP_QUALIFIER: &str = "io.github";
