//! Optional process-wide trace buffer
//!
//! A ring of labelled spans recorded by runtime internals when tracing
//! is on. Explicit [`init`]/[`finish`] pair; when disabled the cost per
//! call site is one relaxed atomic load.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

/// One recorded span
#[derive(Clone, Debug)]
pub struct TraceEvent {
    /// Call-site label
    pub label: &'static str,
    /// Span duration in microseconds
    pub micros: u128,
}

struct TraceBuf {
    events: Mutex<Vec<TraceEvent>>,
    capacity: usize,
}

static ENABLED: AtomicBool = AtomicBool::new(false);
static BUF: OnceLock<TraceBuf> = OnceLock::new();

/// Enable tracing with a bounded event buffer
pub fn init(capacity: usize) {
    let _ = BUF.set(TraceBuf {
        events: Mutex::new(Vec::with_capacity(capacity.min(1 << 20))),
        capacity,
    });
    ENABLED.store(true, Ordering::Release);
}

/// Stop recording and drain the captured events
pub fn finish() -> Vec<TraceEvent> {
    ENABLED.store(false, Ordering::Release);
    BUF.get()
        .map(|b| std::mem::take(&mut *b.events.lock()))
        .unwrap_or_default()
}

/// True when spans are being recorded
#[inline]
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

/// RAII span: records on drop when tracing is enabled
pub struct TraceSpan {
    label: &'static str,
    start: Option<Instant>,
}

impl TraceSpan {
    /// Open a span with the given label
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            start: enabled().then(Instant::now),
        }
    }
}

impl Drop for TraceSpan {
    fn drop(&mut self) {
        let Some(start) = self.start else { return };
        let micros = start.elapsed().as_micros();
        log::trace!("{}: {} us", self.label, micros);
        if let Some(buf) = BUF.get() {
            let mut events = buf.events.lock();
            if events.len() < buf.capacity {
                events.push(TraceEvent {
                    label: self.label,
                    micros,
                });
            }
        }
    }
}
