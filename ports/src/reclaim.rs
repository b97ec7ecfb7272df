//! Deferred reclamation: the two-generation epoch scheme that lets the
//! payload fast path in [`crate::dispatch`] dereference a just-destroyed
//! port's pointer without racing a concurrent free.
//!
//! Based on the generation/color bookkeeping in `port-deref-deferred.c`:
//! a thread belongs to the "old" generation until it passes through a
//! quiescent point, at which point it flips to "young". Once every old
//! thread has flipped, every object queued for deferred reclaim is safe to
//! drop, because no thread that could have been mid-dereference of one of
//! them is still running with stale state.

use spin::Mutex as SpinMutex;

use crate::port::Port;

/// One action postponed until every thread that could still be
/// mid-dereference of a stale payload pointer has quiesced.
pub enum Deferred {
    /// The port is already fully dereferenced (`hard` is zero); once safe,
    /// just drop this handle to free the backing allocation.
    Release(Port),
    /// The port is not necessarily dead yet; once safe, run a real
    /// `Runtime::port_deref` on it. Mirrors `_ports_port_deref_deferred`
    /// being resolved to an actual `ports_port_deref` call by
    /// `_ports_thread_quiescent`.
    Deref(Port),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    Black,
    White,
}

impl Color {
    fn flip(self) -> Color {
        match self {
            Color::Black => Color::White,
            Color::White => Color::Black,
        }
    }
}

struct Inner {
    color: Color,
    old_threads: usize,
    old_objects: Vec<Deferred>,
    young_threads: usize,
    young_objects: Vec<Deferred>,
}

/// Per-bucket epoch tracker. Guarded by a spinlock: critical sections are a
/// handful of field writes, never worth blocking a thread for.
pub struct Threadpool {
    inner: SpinMutex<Inner>,
}

impl Default for Threadpool {
    fn default() -> Self {
        Threadpool {
            inner: SpinMutex::new(Inner {
                color: Color::Black,
                old_threads: 0,
                old_objects: Vec::new(),
                young_threads: 0,
                young_objects: Vec::new(),
            }),
        }
    }
}

/// A worker's generation membership; flips each time the worker quiesces.
#[derive(Debug, Clone, Copy)]
pub struct ThreadColor(Color);

impl Threadpool {
    pub fn new() -> Self {
        Self::default()
    }

    fn flip_generations(inner: &mut Inner) -> Vec<Deferred> {
        debug_assert_eq!(inner.old_threads, 0);
        inner.old_threads = inner.young_threads;
        let freed = std::mem::take(&mut inner.old_objects);
        inner.old_objects = std::mem::take(&mut inner.young_objects);
        inner.young_threads = 0;
        inner.color = inner.color.flip();
        freed
    }

    /// A worker joins the pool; always starts in the young generation.
    pub fn thread_online(&self) -> ThreadColor {
        let mut inner = self.inner.lock();
        let color = inner.color.flip();
        inner.young_threads += 1;
        ThreadColor(color)
    }

    /// A worker enters its quiescent point between messages. Returns the
    /// actions that may now run (caller must run them with no lock held).
    pub fn thread_quiescent(&self, thread: &mut ThreadColor) -> Vec<Deferred> {
        let mut inner = self.inner.lock();
        if thread.0 == inner.color {
            inner.old_threads -= 1;
            inner.young_threads += 1;
            thread.0 = thread.0.flip();
            if inner.old_threads == 0 {
                return Self::flip_generations(&mut inner);
            }
        }
        Vec::new()
    }

    /// A worker is leaving the pool permanently; must quiesce first.
    pub fn thread_offline(&self, thread: ThreadColor) -> Vec<Deferred> {
        let mut thread = thread;
        let mut freed = self.thread_quiescent(&mut thread);
        // thread_quiescent only flips once; loop until this thread is
        // no longer the color the pool expects old threads to hold, same
        // as the retry loop in _ports_thread_offline.
        loop {
            let mut inner = self.inner.lock();
            if thread.0 == inner.color {
                drop(inner);
                freed.extend(self.thread_quiescent(&mut thread));
                continue;
            }
            inner.young_threads -= 1;
            break;
        }
        freed
    }

    /// Schedule `port` for a deferred final release once the current old
    /// generation quiesces. `port`'s `hard` count has already reached zero.
    pub fn defer(&self, port: Port) {
        self.push(Deferred::Release(port));
    }

    /// Schedule a deferred `port_deref` call on `port` once the current old
    /// generation quiesces. Used when the library is releasing a reference
    /// it held implicitly (e.g. `destroy_right` on a port with outstanding
    /// send rights) rather than one already known to be the last.
    pub fn defer_deref(&self, port: Port) {
        self.push(Deferred::Deref(port));
    }

    fn push(&self, action: Deferred) {
        let mut inner = self.inner.lock();
        inner.young_objects.push(action);
        if inner.old_threads == 0 {
            debug_assert!(inner.old_objects.is_empty());
            let freed = Self::flip_generations(&mut inner);
            debug_assert!(freed.is_empty());
        }
    }
}
