//! Host-side control core of the xenhost hypervisor agent
//!
//! Resolves per-release behavior for a connected host, runs commands
//! against it through release-layered handlers, and tracks VM placement
//! per cluster.

pub mod capability;
pub mod cluster_vm_cache;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod gpu_capacity;
pub mod hypervisor;
pub mod migration;
pub mod remote;
pub mod session;
pub mod task_waiter;
pub mod types;

pub use capability::{standard_chain, CapabilityAxis, CapabilityChain, ResolvedBehavior};
pub use cluster_vm_cache::{ClusterVmStateCache, VmPlacement};
pub use config::{AgentConfig, AgentConfigBuilder, HostProfile};
pub use credentials::{CredentialProvider, RotatingCredentials};
pub use dispatcher::{standard_dispatcher, Answer, AnswerPayload, Command, CommandDispatcher, CommandKind};
pub use error::{XenhostError, XenhostResult};
pub use gpu_capacity::{GpuCapacityAggregator, GpuCapacitySnapshot};
pub use hypervisor::{HypervisorApi, HypervisorRegistry, SimulatedHypervisor};
pub use migration::{MigrationOrchestrator, MigrationRequest};
pub use remote::{RemoteExecutor, SshExecutor};
pub use session::{HostConnector, HostContext};
pub use task_waiter::{CancellationFlag, TaskWaiter};
