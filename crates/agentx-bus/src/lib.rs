// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process typed pub/sub.
//!
//! One bus per runtime.  Handlers for an event run in strictly descending
//! priority order (ties in subscription order) and a panicking handler never
//! prevents later handlers from firing.  `emit` is synchronous relative to
//! the emitter — fan-out completes before it returns — but never re-enters
//! itself: events emitted from inside a handler are queued and drained FIFO
//! after the current fan-out, which keeps re-injection deterministic and
//! breaks reentrancy loops.
//!
//! The emit path is lock-free over the subscriber list: subscriptions are
//! kept in a copy-on-write snapshot that emitters clone out of a short-lived
//! read lock.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{error, trace};

use agentx_types::Event;

pub type Handler = Box<dyn Fn(&Event) + Send + Sync>;
pub type Filter = Box<dyn Fn(&Event) -> bool + Send + Sync>;

/// Identifies one subscription for `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Options for [`EventBus::on`].
#[derive(Default)]
pub struct SubscribeOpts {
    /// Predicate applied before the handler; `false` skips this handler only.
    pub filter: Option<Filter>,
    /// Higher runs earlier.  Re-injection handlers use positive priorities so
    /// analytics observers (priority 0) always see a consistent view.
    pub priority: i32,
    /// Drop the subscription after the first delivery.
    pub once: bool,
}

impl SubscribeOpts {
    pub fn priority(priority: i32) -> Self {
        Self { priority, ..Default::default() }
    }
}

struct Subscription {
    id: u64,
    seq: u64,
    priority: i32,
    /// `None` subscribes to every kind (`on_any`).
    kinds: Option<Vec<String>>,
    filter: Option<Filter>,
    once: bool,
    fired: AtomicBool,
    handler: Handler,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.iter().any(|k| k == event.kind()),
            None => true,
        }
    }
}

struct BusInner {
    /// Copy-on-write subscriber snapshot, sorted by (priority desc, seq asc).
    subs: RwLock<Arc<Vec<Arc<Subscription>>>>,
    queue: Mutex<VecDeque<Event>>,
    draining: AtomicBool,
    destroyed: AtomicBool,
    next_id: AtomicU64,
}

/// The bus.  Cheap to clone; all clones share one subscriber list.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subs: RwLock::new(Arc::new(Vec::new())),
                queue: Mutex::new(VecDeque::new()),
                draining: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Subscription ──────────────────────────────────────────────────────────

    /// Subscribe a handler to one or more event kinds.
    pub fn on<I, S>(
        &self,
        kinds: I,
        handler: impl Fn(&Event) + Send + Sync + 'static,
        opts: SubscribeOpts,
    ) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe(Some(kinds.into_iter().map(Into::into).collect()), Box::new(handler), opts)
    }

    /// Subscribe to every event regardless of kind.
    pub fn on_any(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(None, Box::new(handler), SubscribeOpts::default())
    }

    /// One-shot subscription to a single kind.
    pub fn once(
        &self,
        kind: impl Into<String>,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(
            Some(vec![kind.into()]),
            Box::new(handler),
            SubscribeOpts { once: true, ..Default::default() },
        )
    }

    fn subscribe(&self, kinds: Option<Vec<String>>, handler: Handler, opts: SubscribeOpts) -> SubscriptionId {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let sub = Arc::new(Subscription {
            id,
            seq: id,
            priority: opts.priority,
            kinds,
            filter: opts.filter,
            once: opts.once,
            fired: AtomicBool::new(false),
            handler,
        });

        let mut guard = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
        let mut next: Vec<Arc<Subscription>> = guard.iter().cloned().collect();
        // Insert keeping (priority desc, seq asc) so emit never sorts.
        let pos = next
            .iter()
            .position(|s| (s.priority, std::cmp::Reverse(s.seq)) < (sub.priority, std::cmp::Reverse(sub.seq)))
            .unwrap_or(next.len());
        next.insert(pos, sub);
        *guard = Arc::new(next);
        SubscriptionId(id)
    }

    /// Remove one subscription.  Unknown ids are ignored.
    pub fn off(&self, id: SubscriptionId) {
        let mut guard = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
        let next: Vec<Arc<Subscription>> = guard.iter().filter(|s| s.id != id.0).cloned().collect();
        *guard = Arc::new(next);
    }

    /// Drop all subscriptions and turn subsequent emits into no-ops.
    pub fn destroy(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        let mut guard = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
        *guard = Arc::new(Vec::new());
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    // ── Emission ──────────────────────────────────────────────────────────────

    /// Publish one event.  Fan-out for this event (and any events handlers
    /// re-emit) completes before this returns, unless another thread is
    /// already draining — then the event is handed to that drain.
    pub fn emit(&self, event: Event) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        self.inner.queue.lock().unwrap_or_else(|e| e.into_inner()).push_back(event);
        self.drain();
    }

    /// Publish several events preserving their order.
    pub fn emit_batch(&self, events: impl IntoIterator<Item = Event>) {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
            queue.extend(events);
        }
        self.drain();
    }

    fn drain(&self) {
        loop {
            if self.inner.draining.swap(true, Ordering::Acquire) {
                // Another thread owns the drain; it will pick our event up.
                return;
            }
            loop {
                let event = {
                    let mut queue = self.inner.queue.lock().unwrap_or_else(|e| e.into_inner());
                    queue.pop_front()
                };
                match event {
                    Some(ev) => self.dispatch(&ev),
                    None => break,
                }
            }
            self.inner.draining.store(false, Ordering::Release);
            // An emit may have enqueued between our final pop and the flag
            // release; loop to claim the drain again in that case.
            if self.inner.queue.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                return;
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        let snapshot = {
            let guard = self.inner.subs.read().unwrap_or_else(|e| e.into_inner());
            Arc::clone(&guard)
        };

        trace!(kind = event.kind(), subscribers = snapshot.len(), "dispatch");

        let mut prune = false;
        for sub in snapshot.iter() {
            if !sub.matches(event) {
                continue;
            }
            if let Some(filter) = &sub.filter {
                if !filter(event) {
                    continue;
                }
            }
            if sub.once && sub.fired.swap(true, Ordering::SeqCst) {
                continue;
            }
            if sub.once {
                prune = true;
            }
            let result = catch_unwind(AssertUnwindSafe(|| (sub.handler)(event)));
            if result.is_err() {
                error!(kind = event.kind(), subscription = sub.id, "event handler panicked");
            }
        }

        if prune {
            let mut guard = self.inner.subs.write().unwrap_or_else(|e| e.into_inner());
            let next: Vec<Arc<Subscription>> = guard
                .iter()
                .filter(|s| !(s.once && s.fired.load(Ordering::SeqCst)))
                .cloned()
                .collect();
            *guard = Arc::new(next);
        }
    }

    /// Number of live subscriptions (diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.inner.subs.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
