//! Shutdown coordinator: registers cleanup callbacks in LIFO order and runs
//! them once, from whichever caller notices shutdown first — a SIGINT/SIGTERM
//! trap via `ctrlc`, or the launcher's `shutdown` marker file.
//!
//! Mirrors the reference's `Arc<AtomicBool>` interrupt-flag pattern (set from
//! a `ctrlc::set_handler` closure, polled from the run loop) but adds the
//! LIFO handler stack and an injectable exit function so tests can observe
//! cleanup order without the process actually exiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

type Handler = Box<dyn FnMut() + Send>;

/// Coordinates a single shutdown across however many components register an
/// interest in running cleanup before the process exits.
pub struct ShutdownCoordinator {
    handlers: Mutex<Vec<Handler>>,
    requested: AtomicBool,
    draining: AtomicBool,
    exit_fn: Box<dyn Fn(i32) + Send + Sync>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_exit_fn(|code| std::process::exit(code))
    }

    /// Builds a coordinator with a caller-supplied exit function, so tests
    /// can assert on drain order instead of terminating the test process.
    pub fn with_exit_fn(exit_fn: impl Fn(i32) + Send + Sync + 'static) -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            requested: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            exit_fn: Box::new(exit_fn),
        }
    }

    /// Registers a cleanup callback. Handlers run in reverse registration
    /// order (LIFO) when shutdown drains.
    pub fn register(&self, handler: impl FnMut() + Send + 'static) {
        self.handlers.lock().expect("handler stack poisoned").push(Box::new(handler));
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Runs `on_requested` (to break long-running loops immediately), then
    /// every registered handler LIFO, each wrapped so one panic-turned-catch
    /// doesn't skip the rest, then calls the exit function. Idempotent: a
    /// second call while draining is a no-op.
    pub fn drain(&self, on_requested: impl FnOnce(), exit_code: i32) {
        if self.draining.swap(true, Ordering::SeqCst) {
            return;
        }
        self.requested.store(true, Ordering::SeqCst);
        on_requested();

        let mut handlers = self.handlers.lock().expect("handler stack poisoned");
        while let Some(mut handler) = handlers.pop() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler()));
            if let Err(err) = result {
                tracing::warn!(?err, "shutdown handler panicked, continuing drain");
            }
        }
        drop(handlers);

        (self.exit_fn)(exit_code);
    }

    /// Marks shutdown requested without draining handlers or exiting —
    /// for callers (the orchestrator's own poll loop) that only need the
    /// flag, and will drive their own cleanup through the normal return
    /// path instead of this coordinator's drain.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    /// Installs a SIGINT/SIGTERM trap that marks shutdown requested and runs
    /// `on_requested` (typically: flip the shared shutdown `watch` to true).
    /// Deliberately does *not* call [`ShutdownCoordinator::drain`] here: drain
    /// runs registered handlers and then the exit function synchronously, on
    /// the signal-handling thread, which would terminate the process before
    /// the async runtime ever polls the orchestrator to let it observe the
    /// flag and persist `status: idle`. Exit happens naturally once the
    /// orchestrator's run loop returns and the binary's `main` unwinds.
    /// `self` must be `'static` (wrap in `Arc` at the call site).
    pub fn install_signal_handler(
        self: &std::sync::Arc<Self>,
        on_requested: impl Fn() + Send + Sync + 'static,
    ) -> Result<(), ctrlc::Error> {
        let coordinator = self.clone();
        ctrlc::set_handler(move || {
            coordinator.request();
            on_requested();
        })
    }
}
