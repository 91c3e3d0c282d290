//! SafeShell - a local policy daemon that interposes on shell commands
//! issued by AI coding assistants (and, optionally, humans), deciding
//! allow / deny / require-approval / redirect per command before it runs.
//!
//! The daemon (`daemon::server`) evaluates commands against a declarative
//! rule set (`rules`) built from the command's context (`context`), can
//! pause a command pending interactive approval (`approval`), and
//! broadcasts what it's doing to observers over a second socket
//! (`events`, `daemon::protocol`'s monitor frames). Two thin clients talk
//! to it: the shell-replacing `wrapper` that actually runs commands, and
//! the `hook_adapter` that bridges an assistant's own hook protocol.

pub mod approval;
pub mod config;
pub mod context;
pub mod daemon;
pub mod error;
pub mod events;
pub mod hook_adapter;
pub mod logging;
pub mod monitor_client;
pub mod paths;
pub mod rules;
pub mod wrapper;

pub use error::{Result, SafeShellError};
