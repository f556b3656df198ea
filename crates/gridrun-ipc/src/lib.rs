//! GridRun task-host protocol.
//!
//! Master tasks that cannot share the manager process run inside a separate
//! host process. The two sides exchange length-prefixed JSON frames:
//!
//! - [`HostClient`] is the manager side. It multiplexes concurrent requests
//!   by id and reports a lost connection through a watch channel.
//! - [`serve`] is the host side. It answers pings immediately and runs task
//!   callbacks one at a time on a worker task.
//! - [`RemoteMaster`] exposes a hosted master behind the regular
//!   [`gridrun_core::MasterTask`] interface.

mod client;
mod error;
mod protocol;
mod remote;
mod server;

pub use client::HostClient;
pub use error::IpcError;
pub use protocol::{Envelope, HostRequest, HostResponse};
pub use remote::RemoteMaster;
pub use server::serve;
