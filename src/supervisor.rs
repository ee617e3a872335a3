//! Wires the engine to the outside world: connectivity and focus events,
//! and the four-step startup sequence that makes reload recovery automatic.
//!
//! Grounded on the teacher's `storage/service.rs` (a long-lived service
//! object that owns its lifecycle and is constructed once per app) and
//! `util/subscribe.rs` for the monitor traits' shape. Unlike the teacher's
//! `component::ComponentContainer` registry that `service.rs` is pulled out
//! of, `Supervisor` takes its dependencies directly as constructor
//! arguments — there is no global lookup here.

use std::sync::Arc;

use crate::engine::{self, EngineContext};
use crate::error::UploadResult;
use crate::logger::Logger;
use crate::model::UploadStatus;
use crate::util::Unsubscribe;

/// Reports connectivity transitions. Native has no portable OS-level
/// online/offline signal, so `ManualConnectivityMonitor` exposes a setter a
/// caller (or test) drives directly; the `wasm-web` implementation listens
/// to the browser's `online`/`offline` window events.
///
/// Split the same way as `BlobStore`/`KvStore`: native callbacks must be
/// `Send + Sync` to cross into tokio tasks; `wasm-web` callbacks may close
/// over non-`Send` `web-sys` handles, so the bound is dropped there.
#[cfg(not(target_arch = "wasm32"))]
pub trait ConnectivityMonitor: Send + Sync {
    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>) -> Unsubscribe;
    fn is_offline(&self) -> bool;
}

#[cfg(target_arch = "wasm32")]
pub trait ConnectivityMonitor {
    fn subscribe(&self, listener: Box<dyn Fn(bool)>) -> Unsubscribe;
    fn is_offline(&self) -> bool;
}

/// Reports window/tab focus transitions, used to trigger an opportunistic
/// status refresh when the user returns to the page.
#[cfg(not(target_arch = "wasm32"))]
pub trait FocusMonitor: Send + Sync {
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Unsubscribe;
}

#[cfg(target_arch = "wasm32")]
pub trait FocusMonitor {
    fn subscribe(&self, listener: Box<dyn Fn()>) -> Unsubscribe;
}

#[cfg(not(target_arch = "wasm32"))]
struct ManualState {
    offline: std::sync::Mutex<bool>,
    listeners: std::sync::Mutex<Vec<Arc<dyn Fn(bool) + Send + Sync>>>,
}

/// A connectivity monitor with no ambient signal to listen to: `set_offline`
/// is the only way its state changes, intended for native hosts and tests.
/// Native-only: `wasm-web` hosts use `WindowConnectivityMonitor` instead,
/// since the trait's callback type differs by target (see above).
#[cfg(not(target_arch = "wasm32"))]
pub struct ManualConnectivityMonitor {
    state: Arc<ManualState>,
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for ManualConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ManualConnectivityMonitor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ManualState {
                offline: std::sync::Mutex::new(false),
                listeners: std::sync::Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_offline(&self, offline: bool) {
        *self.state.offline.lock().expect("mutex poisoned") = offline;
        for listener in self.state.listeners.lock().expect("mutex poisoned").iter() {
            listener(offline);
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>) -> Unsubscribe {
        let listener: Arc<dyn Fn(bool) + Send + Sync> = Arc::from(listener);
        self.state.listeners.lock().expect("mutex poisoned").push(Arc::clone(&listener));
        let state = Arc::clone(&self.state);
        Box::new(move || {
            state
                .listeners
                .lock()
                .expect("mutex poisoned")
                .retain(|l| !Arc::ptr_eq(l, &listener));
        })
    }

    fn is_offline(&self) -> bool {
        *self.state.offline.lock().expect("mutex poisoned")
    }
}

/// A focus monitor with no events of its own; `trigger` is called by a host
/// that owns the real signal (or by a test). Native-only, for the same
/// reason as `ManualConnectivityMonitor`.
#[cfg(not(target_arch = "wasm32"))]
pub struct ManualFocusMonitor {
    listeners: Arc<std::sync::Mutex<Vec<Arc<dyn Fn() + Send + Sync>>>>,
}

#[cfg(not(target_arch = "wasm32"))]
impl Default for ManualFocusMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl ManualFocusMonitor {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn trigger(&self) {
        for listener in self.listeners.lock().expect("mutex poisoned").iter() {
            listener();
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl FocusMonitor for ManualFocusMonitor {
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Unsubscribe {
        let listener: Arc<dyn Fn() + Send + Sync> = Arc::from(listener);
        self.listeners.lock().expect("mutex poisoned").push(Arc::clone(&listener));
        let listeners = Arc::clone(&self.listeners);
        Box::new(move || {
            listeners
                .lock()
                .expect("mutex poisoned")
                .retain(|l| !Arc::ptr_eq(l, &listener));
        })
    }
}

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
pub struct WindowConnectivityMonitor;

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
impl ConnectivityMonitor for WindowConnectivityMonitor {
    fn subscribe(&self, listener: Box<dyn Fn(bool) + Send + Sync>) -> Unsubscribe {
        use wasm_bindgen::closure::Closure;
        use wasm_bindgen::JsCast;

        let Some(window) = web_sys::window() else {
            return Box::new(|| {});
        };
        let online_listener = Arc::new(listener);
        let offline_listener = Arc::clone(&online_listener);

        let on_online = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            online_listener(false);
        }) as Box<dyn FnMut(_)>);
        let on_offline = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            offline_listener(true);
        }) as Box<dyn FnMut(_)>);

        let _ = window.add_event_listener_with_callback("online", on_online.as_ref().unchecked_ref());
        let _ = window.add_event_listener_with_callback("offline", on_offline.as_ref().unchecked_ref());
        on_online.forget();
        on_offline.forget();
        Box::new(|| {})
    }

    fn is_offline(&self) -> bool {
        web_sys::window()
            .map(|w| !w.navigator().on_line())
            .unwrap_or(false)
    }
}

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
pub struct WindowFocusMonitor;

#[cfg(all(feature = "wasm-web", target_arch = "wasm32"))]
impl FocusMonitor for WindowFocusMonitor {
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Unsubscribe {
        use wasm_bindgen::closure::Closure;
        use wasm_bindgen::JsCast;

        let Some(window) = web_sys::window() else {
            return Box::new(|| {});
        };
        let on_focus = Closure::wrap(Box::new(move |_event: web_sys::Event| {
            listener();
        }) as Box<dyn FnMut(_)>);
        let _ = window.add_event_listener_with_callback("focus", on_focus.as_ref().unchecked_ref());
        on_focus.forget();
        Box::new(|| {})
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SupervisorOptions {
    pub auto_resume_on_reload: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            auto_resume_on_reload: true,
        }
    }
}

/// Ties the engine to connectivity/focus signals and drives the startup
/// sequence. Owns its monitors so their listeners don't outlive it
/// unexpectedly.
pub struct Supervisor {
    ctx: EngineContext,
    connectivity: Arc<dyn ConnectivityMonitor>,
    focus: Arc<dyn FocusMonitor>,
    logger: Logger,
}

impl Supervisor {
    /// Runs the full startup sequence: (1) subscribe to connectivity so
    /// offline/online toggles the shared UI flag, (2) rehydrate the engine
    /// context, (3) reconcile + restore + optionally auto-resume every
    /// non-terminal record found on disk, (4) subscribe to focus so
    /// returning to the tab refreshes in-flight uploads' server status.
    pub async fn start(
        ctx: EngineContext,
        connectivity: Arc<dyn ConnectivityMonitor>,
        focus: Arc<dyn FocusMonitor>,
        options: SupervisorOptions,
    ) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            ctx,
            connectivity,
            focus,
            logger: Logger::new("supervisor"),
        });

        supervisor.wire_connectivity();
        supervisor.init_after_rehydrate(options).await;
        supervisor.wire_focus();
        supervisor
    }

    /// Subscribes to connectivity transitions: offline pauses every
    /// in-flight upload (so the chunk loop stops retrying into a dead
    /// network), online resumes every paused one.
    fn wire_connectivity(self: &Arc<Self>) {
        self.ctx.meta.set_offline(self.connectivity.is_offline());

        let supervisor = Arc::clone(self);
        // The Unsubscribe is intentionally dropped: the Supervisor lives for
        // the life of the process, so there is no point at which this
        // subscription needs to be torn down early.
        let _unsub = self.connectivity.subscribe(Box::new(move |offline| {
            supervisor.ctx.meta.set_offline(offline);
            let supervisor = Arc::clone(&supervisor);
            crate::platform::runtime::spawn_detached(async move {
                if offline {
                    supervisor.pause_uploading_records().await;
                } else {
                    supervisor.resume_paused_records().await;
                }
            });
        }));
    }

    async fn pause_uploading_records(&self) {
        for record in self.ctx.meta.get_active_uploads() {
            if record.status != UploadStatus::Uploading {
                continue;
            }
            let _ = self.ctx.meta.record_error(&record.upload_id, "offline", chrono::Utc::now()).await;
            if let Err(err) = self.ctx.meta.set_status(&record.upload_id, UploadStatus::Paused).await {
                self.logger.warn(format!("failed to pause {} on offline: {err}", record.upload_id));
            }
        }
    }

    async fn resume_paused_records(&self) {
        for record in self.ctx.meta.get_active_uploads() {
            if record.status != UploadStatus::Paused {
                continue;
            }
            if let Err(err) = engine::resume_upload(&self.ctx, &record.upload_id).await {
                self.logger.warn(format!("resume failed for {} on reconnect: {err}", record.upload_id));
            }
        }
    }

    fn wire_focus(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let _unsub = self.focus.subscribe(Box::new(move || {
            let supervisor = Arc::clone(&supervisor);
            crate::platform::runtime::spawn_detached(async move {
                supervisor.refresh_active_uploads().await;
            });
        }));
    }

    /// Reconciles every non-terminal persisted record against server
    /// status, restores any upload whose file is still available, and
    /// (if enabled) resumes transmission automatically.
    async fn init_after_rehydrate(self: &Arc<Self>, options: SupervisorOptions) {
        for record in self.ctx.meta.get_active_uploads() {
            if let Err(err) = self.reconcile_one(&record.upload_id, options).await {
                self.logger
                    .warn(format!("failed to reconcile upload {}: {err}", record.upload_id));
            }
        }
    }

    async fn reconcile_one(&self, id: &str, options: SupervisorOptions) -> UploadResult<()> {
        // Server truth wins: even if the local record thinks it's
        // Uploading, a server-reported Paused status is honored.
        if engine::refresh_status(&self.ctx, id).await.is_err() {
            self.logger.warn(format!("status refresh failed for {id} during reconcile"));
        }

        let Some(record) = self.ctx.meta.get_upload(id) else {
            return Ok(());
        };
        if record.status.is_terminal() {
            return Ok(());
        }

        if engine::ensure_file_available(&self.ctx, id).await.is_err() {
            return Ok(());
        }

        if options.auto_resume_on_reload {
            engine::resume_upload(&self.ctx, id).await?;
        }
        Ok(())
    }

    /// On tab focus: refresh each active record's server status, then (if
    /// online and the refresh didn't just complete it) resume it.
    async fn refresh_active_uploads(&self) {
        for record in self.ctx.meta.get_active_uploads() {
            let _ = engine::refresh_status(&self.ctx, &record.upload_id).await;
            if self.ctx.meta.ui_state().is_offline {
                continue;
            }
            let Some(updated) = self.ctx.meta.get_upload(&record.upload_id) else {
                continue;
            };
            if updated.status.is_terminal() {
                continue;
            }
            if let Err(err) = engine::resume_upload(&self.ctx, &record.upload_id).await {
                self.logger.warn(format!("resume failed for {} on focus: {err}", record.upload_id));
            }
        }
    }
}
