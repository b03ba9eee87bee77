// Catalyst - Infrastructure Automation Engine
//
// Runs an ordered plan of idempotent tasks against an inventory of hosts
// over SSH, with pooled sessions, bounded retries and live result events.

pub mod config;
pub mod executor;
pub mod inventory;
pub mod loader;
pub mod modules;
pub mod output;
pub mod plan;

pub use config::EngineConfig;
pub use executor::{EngineContext, Scheduler};
pub use inventory::{Host, HostSelector, Inventory};
pub use output::{EngineError, ExecutionResult, RunReport};
pub use plan::{PlanBuilder, TaskPlan, TaskSpec};

/// Version of the Catalyst tool
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::executor::{
        AutoConnector, Connector, EngineContext, RetryPolicy, Scheduler, Session, SshConnector,
    };
    pub use crate::inventory::{CredentialsRef, Host, HostSelector, Inventory};
    pub use crate::modules::{Module, ModuleOutcome, ModuleRegistry, Params};
    pub use crate::output::{
        EngineError, ErrorKind, ExecutionResult, HostState, ResultStatus, RunReport,
    };
    pub use crate::plan::{PlanBuilder, TaskPlan, TaskSpec};
}
