use depot_runtime::yield_now;
use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
struct GateState {
    readers: Cell<usize>,
    writer: Cell<bool>,
    writers_waiting: Cell<usize>,
}

/// Cooperative reader/writer gate between storage operations.
///
/// Moves (withdraw, deposit) hold it shared; rebuild and consolidation hold
/// it exclusively, so a scan never observes a move whose index delta has
/// not been applied yet. A waiting writer blocks new readers.
#[derive(Debug, Clone, Default)]
pub struct OperationGate {
    state: Rc<GateState>,
}

impl OperationGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_shared(&self) -> Option<SharedGuard> {
        let s = &self.state;
        if s.writer.get() || s.writers_waiting.get() > 0 {
            return None;
        }
        s.readers.set(s.readers.get() + 1);
        Some(SharedGuard {
            state: Rc::clone(&self.state),
        })
    }

    pub fn try_exclusive(&self) -> Option<ExclusiveGuard> {
        let s = &self.state;
        if s.writer.get() || s.readers.get() > 0 {
            return None;
        }
        s.writer.set(true);
        Some(ExclusiveGuard {
            state: Rc::clone(&self.state),
        })
    }

    pub async fn shared(&self) -> SharedGuard {
        loop {
            if let Some(guard) = self.try_shared() {
                return guard;
            }
            yield_now().await;
        }
    }

    pub async fn exclusive(&self) -> ExclusiveGuard {
        let _ticket = WaitTicket::new(&self.state);
        loop {
            let s = &self.state;
            if !s.writer.get() && s.readers.get() == 0 {
                s.writer.set(true);
                return ExclusiveGuard {
                    state: Rc::clone(&self.state),
                };
            }
            yield_now().await;
        }
    }

    pub fn readers(&self) -> usize {
        self.state.readers.get()
    }

    pub fn is_exclusive(&self) -> bool {
        self.state.writer.get()
    }
}

struct WaitTicket(Rc<GateState>);

impl WaitTicket {
    fn new(state: &Rc<GateState>) -> Self {
        state.writers_waiting.set(state.writers_waiting.get() + 1);
        Self(Rc::clone(state))
    }
}

impl Drop for WaitTicket {
    fn drop(&mut self) {
        self.0.writers_waiting.set(self.0.writers_waiting.get() - 1);
    }
}

#[derive(Debug)]
pub struct SharedGuard {
    state: Rc<GateState>,
}

impl Drop for SharedGuard {
    fn drop(&mut self) {
        self.state.readers.set(self.state.readers.get() - 1);
    }
}

#[derive(Debug)]
pub struct ExclusiveGuard {
    state: Rc<GateState>,
}

impl Drop for ExclusiveGuard {
    fn drop(&mut self) {
        self.state.writer.set(false);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// First Ctrl-C requests a graceful stop; the second exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, letting running tasks finish...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
