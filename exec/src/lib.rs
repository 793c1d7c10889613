//! Vessel supervisory core.
//!
//! Launches a container entry point, tracks every process that descends from
//! it through kernel process notifications, and turns process and host signal
//! events into tasks on a single-threaded cooperative scheduler.
//!
//! The pieces, leaves first:
//!
//! - [`mux::Multiplexer`] owns the kernel event queue and routes drained
//!   events to [`registry::EventFactory`] implementations.
//! - [`monitor::ProcessGroupMonitor`] keeps each launch as a flat set of
//!   live pids and reports when the whole tree has exited.
//! - [`control::ControlPipe`] is the private channel shared with a child.
//! - [`exec::Launcher`] forks, sets up the child and hands async launches to
//!   the monitor.
//! - [`signals::SignalRelay`] relays host signals with a snapshot of every
//!   tracked group.
//! - [`Supervisor`] wires them together around one [`supervisor::Context`].

pub mod child;
pub mod config;
pub mod control;
pub mod driver;
pub mod error;
pub mod exec;
pub mod kevent;
#[cfg(target_os = "freebsd")]
pub mod kqueue;
pub mod monitor;
pub mod mux;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod signals;
pub mod supervisor;
pub mod terminal;

pub use config::SupervisorConfig;
pub use control::{ControlChannel, ControlPipe};
pub use error::{Error, Result};
pub use exec::{ExecMode, ExecRequest, LaunchHandle, Redirects, StdStream};
pub use kevent::{EventQueue, EventSpec, KernelEvent, ManualQueue, Token};
pub use monitor::{GroupHandle, GroupSnapshot, ProcessGroupMonitor, Reaper, WaitReaper};
pub use process::ExitStatus;
pub use signals::SignalNotification;
pub use supervisor::Supervisor;
