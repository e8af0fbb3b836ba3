//! Tauri host: binds the toolkit-agnostic shell to real webview windows and
//! the global-shortcut plugin, and exposes the UI bridge commands.

use crate::backend::BackendStatus;
use crate::config::{HostPaths, ShellConfig, WindowConfig};
use crate::error::{Result, ShellError};
use crate::shell::Shell;
use crate::window::{OverlayWindow, ShortcutCallback, ShortcutRegistrar};
use std::sync::Arc;
use tauri::webview::PageLoadEvent;
use tauri::{AppHandle, Manager, RunEvent, State, WebviewUrl, WebviewWindow, WebviewWindowBuilder, WindowEvent};
use tauri_plugin_global_shortcut::{GlobalShortcutExt, ShortcutState};

type DesktopShell = Shell<GlobalShortcuts>;

impl OverlayWindow for WebviewWindow {
    fn id(&self) -> String {
        self.label().to_string()
    }

    fn is_destroyed(&self) -> bool {
        self.app_handle().get_webview_window(self.label()).is_none()
    }

    fn is_visible(&self) -> bool {
        WebviewWindow::is_visible(self).unwrap_or(false)
    }

    fn show(&self) {
        if let Err(e) = WebviewWindow::show(self) {
            tracing::warn!("[window] show failed: {}", e);
        }
    }

    fn hide(&self) {
        if let Err(e) = WebviewWindow::hide(self) {
            tracing::warn!("[window] hide failed: {}", e);
        }
    }

    fn focus(&self) {
        if let Err(e) = self.set_focus() {
            tracing::warn!("[window] focus failed: {}", e);
        }
    }

    fn center(&self) {
        if let Err(e) = WebviewWindow::center(self) {
            tracing::warn!("[window] center failed: {}", e);
        }
    }

    fn pin_to_all_workspaces(&self) {
        #[cfg(target_os = "macos")]
        if let Err(e) = self.set_visible_on_all_workspaces(true) {
            tracing::warn!("[window] set_visible_on_all_workspaces failed: {}", e);
        }
    }

    fn set_topmost(&self, on: bool) {
        if let Err(e) = self.set_always_on_top(on) {
            tracing::warn!("[window] set_always_on_top({}) failed: {}", on, e);
        }
    }

    fn on_focus_lost<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_window_event(move |event| {
            if let WindowEvent::Focused(false) = event {
                handler();
            }
        });
    }
}

pub struct GlobalShortcuts {
    app: AppHandle,
}

impl GlobalShortcuts {
    pub fn new(app: AppHandle) -> Self {
        Self { app }
    }
}

impl ShortcutRegistrar for GlobalShortcuts {
    fn register(&self, accelerator: &str, callback: ShortcutCallback) -> Result<()> {
        self.app
            .global_shortcut()
            .on_shortcut(accelerator, move |_app, _shortcut, event| {
                if event.state == ShortcutState::Pressed {
                    callback();
                }
            })
            .map_err(|e| ShellError::Shortcut {
                accelerator: accelerator.to_string(),
                reason: e.to_string(),
            })
    }

    fn unregister_all(&self) -> Result<()> {
        self.app
            .global_shortcut()
            .unregister_all()
            .map_err(|e| ShellError::Shortcut {
                accelerator: "*".to_string(),
                reason: e.to_string(),
            })
    }
}

fn host_paths(app: &AppHandle) -> HostPaths {
    let mut paths = HostPaths::detect();
    if let Ok(dir) = app.path().resource_dir() {
        paths.resource_dir = dir;
    }
    if let Ok(dir) = app.path().app_data_dir() {
        paths.data_dir = dir;
    }
    paths
}

fn create_overlay_window(app: &AppHandle, config: &WindowConfig) -> tauri::Result<WebviewWindow> {
    let window = WebviewWindowBuilder::new(app, &config.label, WebviewUrl::App("index.html".into()))
        .title("Cumo")
        .inner_size(config.width, config.height)
        .decorations(false)
        .transparent(true)
        .always_on_top(true)
        .skip_taskbar(false)
        .resizable(false)
        .visible(false)
        .on_page_load(|window, payload| {
            let line = page_load_message(window.label(), payload.event(), payload.url().as_str());
            match payload.event() {
                PageLoadEvent::Started => tracing::debug!("[main] {}", line),
                PageLoadEvent::Finished => tracing::info!("[main] {}", line),
            }
        })
        .build()?;

    // keep the overlay above fullscreen apps
    #[cfg(target_os = "macos")]
    if let Err(e) = window.set_visible_on_all_workspaces(true) {
        tracing::warn!("[main] set_visible_on_all_workspaces failed: {}", e);
    }

    Ok(window)
}

fn page_load_message(label: &str, event: PageLoadEvent, url: &str) -> String {
    match event {
        PageLoadEvent::Started => format!("Window {} loading {}", label, url),
        PageLoadEvent::Finished => format!("Window {} finished loading {}", label, url),
    }
}

fn watch_destroyed(shell: &DesktopShell, window: &WebviewWindow) {
    let windows = Arc::clone(shell.windows());
    let target = window.clone();
    window.on_window_event(move |event| {
        if let WindowEvent::Destroyed = event {
            tracing::info!("[main] Window {} destroyed", target.label());
            windows.forget(&target);
        }
    });
}

/// The live overlay window, recreated if it was destroyed.
fn overlay_window(app: &AppHandle) -> Option<WebviewWindow> {
    let shell = app.try_state::<DesktopShell>()?;
    let config = &shell.config().window;
    if let Some(window) = app.get_webview_window(&config.label) {
        return Some(window);
    }

    tracing::info!("[main] Window is gone, creating a new one");
    match create_overlay_window(app, config) {
        Ok(window) => {
            watch_destroyed(&shell, &window);
            shell.install_window(&window, false);
            Some(window)
        }
        Err(e) => {
            tracing::error!("[main] Failed to create window: {}", e);
            None
        }
    }
}

#[tauri::command]
fn get_backend_port(shell: State<'_, DesktopShell>) -> Option<u16> {
    shell.active_port()
}

#[tauri::command]
fn get_backend_status(shell: State<'_, DesktopShell>) -> BackendStatus {
    shell.backend().status()
}

#[tauri::command]
fn toggle_window(app: AppHandle, shell: State<'_, DesktopShell>) {
    if let Some(window) = overlay_window(&app) {
        shell.windows().toggle(&window);
    }
}

#[tauri::command]
fn hide_window(app: AppHandle, shell: State<'_, DesktopShell>) {
    if let Some(window) = app.get_webview_window(&shell.config().window.label) {
        shell.windows().hide(&window);
    }
}

#[tauri::command]
fn debug_log(message: String) {
    tracing::info!("[frontend] {}", message);
}

pub fn run() -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cumo-runtime")
        .build()?;
    tauri::async_runtime::set(runtime.handle().clone());
    let handle = runtime.handle().clone();

    let app = tauri::Builder::default()
        .plugin(tauri_plugin_global_shortcut::Builder::new().build())
        .invoke_handler(tauri::generate_handler![
            get_backend_port,
            get_backend_status,
            toggle_window,
            hide_window,
            debug_log,
        ])
        .setup(move |app| {
            // menu bar app: no dock icon
            #[cfg(target_os = "macos")]
            app.set_activation_policy(tauri::ActivationPolicy::Accessory);

            let config = ShellConfig::from_env(&host_paths(app.handle()));
            tracing::info!(
                "[main] Starting ({:?} mode, backend dir {})",
                config.backend.mode,
                config.backend.backend_dir.display()
            );

            let shell = Shell::new(config, GlobalShortcuts::new(app.handle().clone()), handle.clone());
            shell.start_backend();

            let window = create_overlay_window(app.handle(), &shell.config().window)?;
            watch_destroyed(&shell, &window);
            shell.install_window(&window, true);

            let app_handle = app.handle().clone();
            shell.register_toggle(move || overlay_window(&app_handle));

            app.manage(shell);
            Ok(())
        })
        .build(tauri::generate_context!())?;

    app.run(|app_handle, event| match event {
        // closing the overlay should not quit a menu bar app on macOS
        RunEvent::ExitRequested { api, code: None, .. } if cfg!(target_os = "macos") => {
            api.prevent_exit();
        }
        #[cfg(target_os = "macos")]
        RunEvent::Reopen { .. } => {
            if let (Some(shell), Some(window)) = (app_handle.try_state::<DesktopShell>(), overlay_window(app_handle)) {
                shell.windows().toggle(&window);
            }
        }
        RunEvent::Exit => {
            if let Some(shell) = app_handle.try_state::<DesktopShell>() {
                tauri::async_runtime::block_on(shell.shutdown());
            }
        }
        _ => {}
    });

    drop(runtime);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_load_messages() {
        assert_eq!(
            page_load_message("main", PageLoadEvent::Finished, "tauri://localhost/index.html"),
            "Window main finished loading tauri://localhost/index.html"
        );
        assert_eq!(
            page_load_message("main", PageLoadEvent::Started, "http://localhost:1420/"),
            "Window main loading http://localhost:1420/"
        );
    }
}
