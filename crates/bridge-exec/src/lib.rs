//! Validated subprocess execution.
//!
//! The executor validates a command, its arguments, environment, and
//! working directory *before* any process is spawned, then runs the child
//! with framed stdin/stdout, a capped stdout reader, a stderr-to-log pump,
//! and a timeout that escalates from SIGTERM to SIGKILL.
//!
//! The validation rules are shared with the plugin manager, which applies
//! the same argument and environment sanitization before spawning plugin
//! executables.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod config;
mod error;
mod executor;
mod validate;

pub use config::{DEFAULT_MAX_OUTPUT_SIZE, DEFAULT_TIMEOUT_MS, ExecutorConfig};
pub use error::{ExecError, ExecResult};
pub use executor::{ExecOutput, SubprocessExecutor};
pub use validate::{
    is_shell_command, parse_env_entry, validate_arg, validate_command, validate_env_pair,
    validate_work_dir,
};
