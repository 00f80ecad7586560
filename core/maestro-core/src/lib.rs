//! Maestro session coordination.
//!
//! The master process elects itself through [`world`], builds the session
//! [`arena`], and routes every shell request through the
//! [`coordinator`] over the channel-addressed [`bus`]. The
//! [`supervisor`] launches the shell processes and tears the session down
//! when the status bar exits.

pub mod arena;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod process;
pub mod registry;
pub mod service;
pub mod supervisor;
pub mod world;

pub use arena::{Arena, SessionState, ARENA_NAME};
pub use bus::{AttachmentId, Delivered, MessageBus, Subscriber};
pub use config::{load_config, runtime_dir, MaestroConfig, ShellPaths};
pub use coordinator::{Registration, SessionCoordinator};
pub use error::{MaestroError, Result};
pub use pool::MemoryPool;
pub use registry::{AppRecord, AppRegistry, PopulationWatch};
pub use service::SessionService;
pub use supervisor::{ExitClass, ProcessSupervisor, Shell, ShutdownSignal};
pub use world::{World, WorldRole};
