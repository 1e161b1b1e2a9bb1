//! Agent execution engine: scheduling, approvals, tool-call ledger and the
//! sandbox seam.

pub mod error;
pub mod ledger;
pub mod permission;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod tools;

pub use error::{EngineError, LedgerError, PermissionError, SandboxError, SubmitError};
pub use ledger::ToolCallLedger;
pub use permission::{GateConfig, PermissionGate};
pub use runtime::{AgentRuntime, DirectRuntime, RunContext};
pub use sandbox::{ExecOutput, HttpSandbox, Sandbox};
pub use scheduler::{AgentScheduler, SchedulerConfig, SchedulerStats, ShutdownReport, TaskTicket};
pub use tools::{ToolContext, ToolInvoker, ToolRequest};
