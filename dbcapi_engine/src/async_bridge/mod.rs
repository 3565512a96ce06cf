use crate::error::{DbError, Result};
use crate::observability::global_metrics;
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::runtime::{Builder, Runtime};

static RUNTIME: OnceLock<std::result::Result<Runtime, String>> = OnceLock::new();

/// Pool shared by every dispatcher in the process. The first caller picks
/// its size.
fn get_runtime(worker_threads: usize) -> Result<&'static Runtime> {
    let runtime = RUNTIME.get_or_init(|| {
        let threads = worker_threads.max(1);
        Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(threads)
            .thread_name("dbcapi-worker")
            .build()
            .map_err(|e| format!("Failed to create worker pool: {}", e))
    });

    match runtime {
        Ok(rt) => Ok(rt),
        Err(msg) => Err(DbError::Internal(msg.clone())),
    }
}

/// A blocking unit of work. Runs on a pool thread (or inline) and only
/// produces plain data; converting that into caller-facing values is the
/// after phase, which stays on the controlling thread.
pub trait Work: Send + 'static {
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    fn run(self) -> Result<Self::Output>;
}

/// Adapts a closure into a [`Work`] item.
pub struct FnWork<F> {
    name: &'static str,
    f: F,
}

impl<F> FnWork<F> {
    pub fn new(name: &'static str, f: F) -> Self {
        Self { name, f }
    }
}

impl<T, F> Work for FnWork<F>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    type Output = T;

    fn name(&self) -> &'static str {
        self.name
    }

    fn run(self) -> Result<T> {
        (self.f)()
    }
}

type Payload = Box<dyn Any + Send>;
type Finisher = Box<dyn FnOnce(Payload)>;
type FatalHandler = Box<dyn Fn(Payload)>;

struct Completion {
    ticket: u64,
    payload: Payload,
    success: bool,
    elapsed: Duration,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs the work, turning a panic into an error for the caller.
fn run_guarded<W: Work>(work: W) -> Result<W::Output> {
    let name = work.name();
    match panic::catch_unwind(AssertUnwindSafe(move || work.run())) {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload.as_ref());
            log::error!("{} panicked: {}", name, msg);
            Err(DbError::Internal(format!("{} panicked: {}", name, msg)))
        }
    }
}

fn default_fatal(payload: Payload) {
    log::error!(
        "uncaught error in completion callback: {}",
        panic_message(payload.as_ref())
    );
    panic::resume_unwind(payload);
}

/// Hands blocking work to the worker pool and brings results back to the
/// thread that owns the dispatcher.
///
/// Without a callback, work and after phase run inline and the result is
/// returned. With one, the work runs on the pool; the after phase and the
/// callback run on the owning thread during [`run_pending`] or
/// [`wait_idle`]. The dispatcher imposes no ordering between work items;
/// callers that need mutual exclusion take their own locks inside `run`.
///
/// [`run_pending`]: WorkDispatcher::run_pending
/// [`wait_idle`]: WorkDispatcher::wait_idle
pub struct WorkDispatcher {
    worker_threads: usize,
    next_ticket: Cell<u64>,
    pending: RefCell<HashMap<u64, Finisher>>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    fatal: RefCell<FatalHandler>,
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<WorkDispatcher>>> = const { RefCell::new(None) };
}

impl WorkDispatcher {
    pub fn new(worker_threads: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            worker_threads,
            next_ticket: Cell::new(1),
            pending: RefCell::new(HashMap::new()),
            tx,
            rx,
            fatal: RefCell::new(Box::new(default_fatal)),
        }
    }

    /// Dispatcher owned by the calling thread, created on first use.
    pub fn current(worker_threads: usize) -> Rc<WorkDispatcher> {
        CURRENT.with(|slot| {
            slot.borrow_mut()
                .get_or_insert_with(|| Rc::new(WorkDispatcher::new(worker_threads)))
                .clone()
        })
    }

    /// Replaces what happens when a completion callback panics. The
    /// default logs and re-raises the panic on the controlling thread.
    pub fn set_fatal_handler(&self, handler: impl Fn(Box<dyn Any + Send>) + 'static) {
        *self.fatal.borrow_mut() = Box::new(handler);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn submit<W, A, U, C>(&self, work: W, after: A, callback: Option<C>) -> Result<Option<U>>
    where
        W: Work,
        A: FnOnce(W::Output) -> Result<U> + 'static,
        U: 'static,
        C: FnOnce(Result<U>) + 'static,
    {
        let metrics = global_metrics();
        let Some(callback) = callback else {
            metrics.record_submit(false);
            let started = Instant::now();
            let result = run_guarded(work).and_then(after);
            metrics.record_completion(result.is_ok(), started.elapsed());
            return result.map(Some);
        };

        let runtime = get_runtime(self.worker_threads)?;
        let ticket = self.next_ticket.get();
        self.next_ticket.set(ticket + 1);

        let finisher: Finisher = Box::new(move |payload: Payload| {
            let result = match payload.downcast::<Result<W::Output>>() {
                Ok(result) => (*result).and_then(after),
                Err(_) => Err(DbError::Internal("mismatched completion".to_string())),
            };
            callback(result);
        });
        self.pending.borrow_mut().insert(ticket, finisher);

        let tx = self.tx.clone();
        let name = work.name();
        metrics.record_submit(true);
        runtime.spawn_blocking(move || {
            let started = Instant::now();
            let result = run_guarded(work);
            let completion = Completion {
                ticket,
                success: result.is_ok(),
                payload: Box::new(result),
                elapsed: started.elapsed(),
            };
            if tx.send(completion).is_err() {
                log::warn!("{} finished after its dispatcher went away", name);
            }
        });
        log::debug!("submitted {} as ticket {}", name, ticket);
        Ok(None)
    }

    fn complete(&self, completion: Completion) {
        global_metrics().record_completion(completion.success, completion.elapsed);
        let Some(finisher) = self.pending.borrow_mut().remove(&completion.ticket) else {
            log::warn!("completion for unknown ticket {}", completion.ticket);
            return;
        };
        let payload = completion.payload;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(move || finisher(payload))) {
            let handler = self.fatal.borrow();
            (*handler)(panic);
        }
    }

    /// Delivers every completion that has already arrived. Returns how
    /// many callbacks ran.
    pub fn run_pending(&self) -> usize {
        let mut delivered = 0;
        while let Ok(completion) = self.rx.try_recv() {
            self.complete(completion);
            delivered += 1;
        }
        delivered
    }

    /// Blocks until every submitted work item has been delivered.
    pub fn wait_idle(&self) {
        while self.pending_count() > 0 {
            match self.rx.recv() {
                Ok(completion) => self.complete(completion),
                Err(_) => return,
            }
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    /// Returns whether everything was delivered.
    pub fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending_count() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(completion) => self.complete(completion),
                Err(_) => return self.pending_count() == 0,
            }
        }
        true
    }
}
