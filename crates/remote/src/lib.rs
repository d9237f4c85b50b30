pub mod database;
pub mod exec;
pub mod ssh;

pub use database::{CliDatabase, DatabaseAdapter};
pub use exec::{run_checked, CommandOutput, ExecError, Executor, LocalExecutor, ShellCommand};
pub use ssh::{Connector, ShellConnector, SshExecutor, SshOptions};
