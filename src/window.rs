//! Window Visibility Controller
//!
//! Show/hide transitions for the overlay window, the blur-to-hide guard, and
//! bookkeeping for the global shortcut. The controller never owns a window: it
//! keeps a last-shown timestamp per window id and drops it on hide.
//!
//! Deferred work (focus, visibility re-check, blur re-check) runs as tasks on
//! the shared runtime and always re-reads the timestamp when it wakes, so a
//! newer show or hide wins over a stale check.

use crate::error::{Result, ShellError};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::{sleep, Instant};

/// Focus loss this soon after a show is treated as spurious.
pub const BLUR_GRACE: Duration = Duration::from_millis(500);
pub const BLUR_RECHECK_DELAY: Duration = Duration::from_millis(100);
pub const FOCUS_DELAY: Duration = Duration::from_millis(100);
/// Measured from the deferred focus, not from the show.
pub const VERIFY_DELAY: Duration = Duration::from_millis(100);
pub const FIRST_SHOW_FOCUS_DELAY: Duration = Duration::from_millis(50);

/// The toolkit window the controller drives. Implementations swallow and log
/// their own toolkit errors.
pub trait OverlayWindow: Clone + Send + Sync + 'static {
    fn id(&self) -> String;
    fn is_destroyed(&self) -> bool;
    fn is_visible(&self) -> bool;
    fn show(&self);
    fn hide(&self);
    fn focus(&self);
    fn center(&self);

    /// Keep the window reachable from every virtual desktop, where supported.
    fn pin_to_all_workspaces(&self) {}

    /// Toggle the window's always-on-top level.
    fn set_topmost(&self, _on: bool) {}

    fn on_focus_lost<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static;
}

pub type ShortcutCallback = Box<dyn Fn() + Send + Sync + 'static>;

/// Process-wide accelerator bindings.
pub trait ShortcutRegistrar: Send + Sync {
    fn register(&self, accelerator: &str, callback: ShortcutCallback) -> Result<()>;
    fn unregister_all(&self) -> Result<()>;
}

pub struct WindowController {
    shown_at: Mutex<HashMap<String, Instant>>,
    shortcuts: Mutex<HashSet<String>>,
    // macOS does not re-order a window whose level is already topmost
    reorder_on_show: AtomicBool,
    runtime: Handle,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl WindowController {
    pub fn new(runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            shown_at: Mutex::new(HashMap::new()),
            shortcuts: Mutex::new(HashSet::new()),
            reorder_on_show: AtomicBool::new(cfg!(target_os = "macos")),
            runtime,
        })
    }

    /// Cycle the topmost level after every show so the window manager moves
    /// the window to the front again.
    pub fn set_reorder_on_show(&self, enabled: bool) {
        self.reorder_on_show.store(enabled, Ordering::Relaxed);
    }

    pub fn last_shown<W: OverlayWindow>(&self, window: &W) -> Option<Instant> {
        lock(&self.shown_at).get(&window.id()).copied()
    }

    /// `None` reads as "infinitely long ago".
    fn since_shown<W: OverlayWindow>(&self, window: &W) -> Option<Duration> {
        self.last_shown(window).map(|at| at.elapsed())
    }

    /// Record a show without going through `toggle`. Used for the first-launch
    /// auto-show.
    pub fn mark_shown<W: OverlayWindow>(&self, window: &W) -> Instant {
        let now = Instant::now();
        lock(&self.shown_at).insert(window.id(), now);
        tracing::debug!(
            "[window] Marked {} shown at {}",
            window.id(),
            chrono::Local::now().format("%H:%M:%S%.3f")
        );
        now
    }

    /// Drop tracking for a destroyed window.
    pub fn forget<W: OverlayWindow>(&self, window: &W) {
        lock(&self.shown_at).remove(&window.id());
    }

    fn is_current_show<W: OverlayWindow>(&self, window: &W, stamp: Instant) -> bool {
        !window.is_destroyed() && self.last_shown(window) == Some(stamp)
    }

    pub fn toggle<W: OverlayWindow>(self: &Arc<Self>, window: &W) {
        if window.is_destroyed() {
            tracing::info!("[window] Toggle: window {} is destroyed", window.id());
            return;
        }

        let visible = window.is_visible();
        tracing::info!("[window] Toggle: isVisible={}", visible);
        if visible {
            self.hide(window);
        } else {
            self.show(window);
        }
    }

    pub fn hide<W: OverlayWindow>(&self, window: &W) {
        tracing::info!("[window] Hiding window");
        window.hide();
        lock(&self.shown_at).remove(&window.id());
    }

    fn show<W: OverlayWindow>(self: &Arc<Self>, window: &W) {
        window.pin_to_all_workspaces();
        window.center();

        // stamp first: the show below may emit a blur synchronously
        let stamp = self.mark_shown(window);
        window.show();
        if self.reorder_on_show.load(Ordering::Relaxed) {
            window.set_topmost(false);
            window.set_topmost(true);
        }

        let this = Arc::downgrade(self);
        let window = window.clone();
        self.runtime.spawn(async move {
            sleep(FOCUS_DELAY).await;
            if !still_current(&this, &window, stamp) {
                return;
            }
            window.focus();

            sleep(VERIFY_DELAY).await;
            if !still_current(&this, &window, stamp) {
                return;
            }
            if !window.is_visible() {
                tracing::warn!("[window] Window not visible after show, showing again");
                window.show();
            }
        });
    }

    pub fn attach_auto_hide<W: OverlayWindow>(self: &Arc<Self>, window: &W) {
        let this = Arc::downgrade(self);
        let target = window.clone();
        window.on_focus_lost(move || {
            if let Some(controller) = this.upgrade() {
                controller.handle_focus_lost(&target);
            }
        });
    }

    pub fn handle_focus_lost<W: OverlayWindow>(self: &Arc<Self>, window: &W) {
        if window.is_destroyed() {
            return;
        }

        let elapsed = self.since_shown(window);
        if let Some(elapsed) = elapsed.filter(|e| *e < BLUR_GRACE) {
            tracing::info!(
                "[window] Ignoring blur (too soon: {}ms < {}ms)",
                elapsed.as_millis(),
                BLUR_GRACE.as_millis()
            );
            return;
        }

        let this = Arc::downgrade(self);
        let window = window.clone();
        self.runtime.spawn(async move {
            sleep(BLUR_RECHECK_DELAY).await;
            let Some(controller) = this.upgrade() else {
                return;
            };
            if window.is_destroyed() {
                return;
            }

            match controller.since_shown(&window) {
                Some(elapsed) if elapsed < BLUR_GRACE => tracing::info!(
                    "[window] Not hiding (shown again {}ms ago)",
                    elapsed.as_millis()
                ),
                _ => {
                    tracing::info!("[window] Hiding window due to blur");
                    controller.hide(&window);
                }
            }
        });
    }

    /// Bind `accelerator` once. A second registration of the same accelerator
    /// fails instead of stacking.
    pub fn register_shortcut<R: ShortcutRegistrar + ?Sized>(
        &self,
        registrar: &R,
        accelerator: &str,
        callback: ShortcutCallback,
    ) -> bool {
        let mut active = lock(&self.shortcuts);
        let result = if active.contains(accelerator) {
            Err(ShellError::ShortcutTaken(accelerator.to_string()))
        } else {
            registrar.register(accelerator, callback)
        };

        match result {
            Ok(()) => {
                active.insert(accelerator.to_string());
                true
            }
            Err(e) => {
                tracing::warn!("[window] {}", e);
                false
            }
        }
    }

    pub fn unregister_shortcuts<R: ShortcutRegistrar + ?Sized>(&self, registrar: &R) {
        let mut active = lock(&self.shortcuts);
        if let Err(e) = registrar.unregister_all() {
            tracing::warn!("[window] Failed to unregister shortcuts: {}", e);
        }
        active.clear();
    }

    pub fn has_shortcut(&self, accelerator: &str) -> bool {
        lock(&self.shortcuts).contains(accelerator)
    }
}

fn still_current<W: OverlayWindow>(controller: &Weak<WindowController>, window: &W, stamp: Instant) -> bool {
    controller
        .upgrade()
        .is_some_and(|controller| controller.is_current_show(window, stamp))
}
