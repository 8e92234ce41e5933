//! Download daemon integration: the RPC client and the process supervisor.

#[cfg(test)]
pub(crate) mod mock;
pub mod rpc;
pub mod supervisor;

pub use rpc::{Aria2Client, RpcEndpoint, RpcError, TransferOptions, TransferState, TransferStatus};
pub use supervisor::{DaemonHandle, DaemonState, DaemonSupervisor, SupervisorError};
