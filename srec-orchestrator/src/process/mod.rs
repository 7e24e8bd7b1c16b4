//! External process supervision: command building, spawning, output capture,
//! failure classification and retry.

pub mod classify;
pub mod command;
pub mod output;
pub mod retry;
pub mod supervisor;

pub use classify::{Classification, Classifier, FailureClass};
pub use command::{Arg, CaptureCommandBuilder, CaptureToolOptions, CommandSpec};
pub use retry::{RetryPolicy, RetryableKind};
pub use supervisor::{
    ProcessExit, ProcessHandle, ProcessRunner, ProcessSupervisor, SupervisorConfig, Termination,
};
