//! Cumo overlay shell: a small desktop host that keeps one backend worker
//! process alive on a loopback port and toggles a single overlay window from a
//! global shortcut.

pub mod backend;
pub mod config;
#[cfg(feature = "desktop")]
pub mod desktop;
pub mod error;
pub mod logging;
pub mod port;
pub mod shell;
pub mod window;

pub use backend::{BackendStatus, BackendSupervisor, WorkerHandle};
pub use config::ShellConfig;
pub use error::ShellError;
pub use shell::Shell;
pub use window::{OverlayWindow, ShortcutRegistrar, WindowController};
