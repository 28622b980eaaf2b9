//! Chrome trace collector for job spans.
//!
//! Each thread records spans into a thread-local buffer; nothing is shared
//! until a thread calls [`collect_local_trace`]. Recording is off until
//! [`set_enabled`] turns it on, and a disabled [`ProfileScope`] does not read
//! the clock. Export produces a JSON array loadable by chrome://tracing or
//! ui.perfetto.dev.

use parking_lot::Mutex;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// One complete ("ph": "X") event.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub ph: &'static str,
    pub ts: u64,
    pub dur: u64,
    pub pid: u32,
    pub tid: usize,
}

static ENABLED: AtomicBool = AtomicBool::new(false);

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<TraceEvent>> = const { RefCell::new(Vec::new()) };
    static THREAD_ID: Cell<usize> = const { Cell::new(0) };
}

lazy_static::lazy_static! {
    static ref GLOBAL_START: Instant = Instant::now();
    static ref ALL_BUFFERS: Mutex<Vec<Vec<TraceEvent>>> = Mutex::new(Vec::new());
}

pub fn set_enabled(enabled: bool) {
    // Pin the time origin before the first span.
    lazy_static::initialize(&GLOBAL_START);
    ENABLED.store(enabled, Ordering::Release);
}

pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// Sets the `tid` reported for spans recorded on the current thread.
/// Workers use their index plus one; `0` is any non-worker thread.
pub fn set_thread_id(tid: usize) {
    THREAD_ID.with(|id| id.set(tid));
}

pub fn record_span(name: &'static str, start: Instant) {
    let ts = start.saturating_duration_since(*GLOBAL_START).as_micros() as u64;
    let dur = start.elapsed().as_micros() as u64;
    let tid = THREAD_ID.with(Cell::get);
    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(TraceEvent {
            name,
            ph: "X",
            ts,
            dur,
            pid: 1,
            tid,
        });
    });
}

/// Moves the current thread's events into the global list.
pub fn collect_local_trace() {
    TRACE_BUFFER.with(|buf| {
        let mut local = buf.borrow_mut();
        if !local.is_empty() {
            ALL_BUFFERS.lock().push(std::mem::take(&mut *local));
        }
    });
}

/// Takes every collected event, leaving the global list empty.
pub fn take_collected() -> Vec<TraceEvent> {
    let buffers = std::mem::take(&mut *ALL_BUFFERS.lock());
    let mut events: Vec<TraceEvent> = buffers.into_iter().flatten().collect();
    events.sort_by_key(|event| (event.ts, event.tid));
    events
}

/// Collects the calling thread's events and writes everything collected so
/// far to `path`.
pub fn export_chrome_trace(path: impl AsRef<Path>) -> io::Result<usize> {
    collect_local_trace();
    let events = take_collected();
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer(writer, &events).map_err(io::Error::from)?;
    Ok(events.len())
}

/// RAII span. Records on drop when profiling was enabled at creation.
pub struct ProfileScope {
    name: &'static str,
    start: Option<Instant>,
}

impl ProfileScope {
    pub fn new(name: &'static str) -> Self {
        let start = is_enabled().then(Instant::now);
        ProfileScope { name, start }
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            record_span(self.name, start);
        }
    }
}
