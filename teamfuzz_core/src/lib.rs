pub mod arborescence;
pub mod balancer;
pub mod callgraph;
pub mod config;
pub mod corpus;
pub mod coverage;
pub mod executor;
pub mod fleet;
pub mod index;
pub mod layout;
pub mod partition;
pub mod profiler;
pub mod pruner;
pub mod scheduler;
pub mod state;

pub use callgraph::{CallGraph, GraphError};
pub use config::{CampaignConfig, ConfigError};
pub use executor::{ProcessLauncher, Worker, WorkerError, WorkerLauncher, WorkerSpec};
pub use partition::{PartitionError, PartitionPlan, ScoreCap, Strategy};
pub use profiler::{CommandProfiler, ProfilingBackend};
pub use scheduler::{
    CampaignError, CampaignInputs, CampaignScheduler, CampaignSummary, Pacer, PreflightReport,
    SleepPacer, preflight,
};
pub use state::{CampaignState, Phase};
