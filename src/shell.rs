//! Host lifecycle: start the backend and bring up the overlay at launch, tear
//! both down at quit. Holds no state machine of its own.

use crate::backend::{BackendSupervisor, WorkerHandle};
use crate::config::ShellConfig;
use crate::window::{OverlayWindow, ShortcutRegistrar, WindowController, FIRST_SHOW_FOCUS_DELAY};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

pub struct Shell<R: ShortcutRegistrar> {
    config: ShellConfig,
    backend: Arc<BackendSupervisor>,
    windows: Arc<WindowController>,
    registrar: R,
    runtime: Handle,
}

impl<R: ShortcutRegistrar> Shell<R> {
    pub fn new(config: ShellConfig, registrar: R, runtime: Handle) -> Self {
        Self {
            backend: BackendSupervisor::new(config.backend.clone()),
            windows: WindowController::new(runtime.clone()),
            config,
            registrar,
            runtime,
        }
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<BackendSupervisor> {
        &self.backend
    }

    pub fn windows(&self) -> &Arc<WindowController> {
        &self.windows
    }

    pub fn registrar(&self) -> &R {
        &self.registrar
    }

    /// Kick off the worker without blocking window creation.
    pub fn start_backend(&self) -> JoinHandle<Option<WorkerHandle>> {
        let backend = Arc::clone(&self.backend);
        self.runtime.spawn(async move {
            let handle = backend.start().await;
            if handle.is_none() {
                tracing::warn!("[main] Continuing without backend");
            }
            handle
        })
    }

    /// Hook auto-hide onto a freshly created overlay window; on first launch
    /// also show it once, outside the toggle path.
    pub fn install_window<W: OverlayWindow>(&self, window: &W, first_launch: bool) {
        self.windows.attach_auto_hide(window);
        if !first_launch {
            return;
        }

        tracing::info!("[main] Auto-showing window on first launch");
        window.center();
        self.windows.mark_shown(window);
        window.show();

        let window = window.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(FIRST_SHOW_FOCUS_DELAY).await;
            if !window.is_destroyed() {
                window.focus();
            }
        });
    }

    /// Bind the configured accelerator to toggling whatever window `resolve`
    /// yields at press time.
    pub fn register_toggle<W, F>(&self, resolve: F) -> bool
    where
        W: OverlayWindow,
        F: Fn() -> Option<W> + Send + Sync + 'static,
    {
        let windows = Arc::clone(&self.windows);
        let accelerator = self.config.window.accelerator.clone();

        let registered = self.windows.register_shortcut(
            &self.registrar,
            &accelerator,
            Box::new(move || {
                tracing::info!("[main] Global shortcut triggered");
                match resolve() {
                    Some(window) => windows.toggle(&window),
                    None => tracing::warn!("[main] No overlay window to toggle"),
                }
            }),
        );

        if registered {
            tracing::info!("[main] Global shortcut registered: {}", accelerator);
        } else {
            tracing::error!("[main] Failed to register global shortcut {}", accelerator);
        }
        registered
    }

    pub fn active_port(&self) -> Option<u16> {
        self.backend.active_port()
    }

    pub async fn shutdown(&self) {
        tracing::info!("[main] Shutting down");
        self.backend.shutdown().await;
        self.windows.unregister_shortcuts(&self.registrar);
    }
}
