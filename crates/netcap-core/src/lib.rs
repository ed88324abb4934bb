//! netcap-core — the capture-control pipeline.
//!
//! A message-driven set of actors on OS threads: the manager owns the task
//! table and decides which requests become captures; workers drive per-
//! capture pcap sessions; filter/writers run the protocol VM and the
//! rotating output; cleanup batches archives; the sampler watches `/proc`
//! metrics; the reload actor watches config and writes detected endians
//! back into PDEF sources. The HTTP front-end lives in the binary crate and
//! talks to the manager through paired request/reply messages.

pub mod bus;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod manager;
pub mod messages;
pub mod packet;
pub mod resolver;
pub mod sampler;
pub mod storage;
pub mod task;
pub mod task_table;
pub mod worker;
pub mod writer;
pub mod reload;

pub use bus::{mailbox, Address, SendError};
pub use config::{CaptureConfigSnapshot, ServerConfig, StrategyConfig};
pub use error::{CaptureErrorCode, ConfigError};
pub use manager::Manager;
pub use messages::{
    CaptureRequest, CleanupMsg, HttpReply, ManagerMsg, ReloadMsg, SamplerMsg, WorkerMsg,
};
pub use task::{ArchiveInfo, CaptureMode, CaptureTask, CapturedFile, TaskStats, TaskStatus};
pub use task_table::TaskTable;
