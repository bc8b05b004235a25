// LabWired - Firmware Simulation Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Synchronous publish/subscribe bus for simulation events.
//!
//! Dispatch takes a snapshot of the matching hooks before calling any of
//! them, so hooks may subscribe or unsubscribe freely; the change applies
//! from the next emit on. A hook that re-emits the signal currently being
//! dispatched (same source and kind) is ignored rather than recursing.

use crate::device::DeviceId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalSource {
    Core,
    Interrupts,
    Scheduler,
    Device(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SignalKind {
    // Core
    Step,
    Sleep,
    Wake,
    Break,
    Reset,
    Fault,
    // Interrupts
    Raised,
    Cancelled,
    Acknowledged,
    Returned,
    // Scheduler
    DeviceAdvanced,
    Stopped,
    // Devices
    ConsoleLine,
    Custom(u16),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalData {
    None,
    Vector(u8),
    Step { pc: u32, opcode: u16, cycles: u32 },
    Value(u32),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub source: SignalSource,
    pub kind: SignalKind,
    pub cycle: u64,
    pub data: SignalData,
}

/// Something that wants to hear about signals.
pub trait SignalHook: Send + Sync {
    fn on_signal(&self, signal: &Signal);
}

impl<F> SignalHook for F
where
    F: Fn(&Signal) + Send + Sync,
{
    fn on_signal(&self, signal: &Signal) {
        self(signal)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which signals a subscription receives. `None` matches anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub source: Option<SignalSource>,
    pub kind: Option<SignalKind>,
}

impl SignalFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn new(source: SignalSource, kind: SignalKind) -> Self {
        Self {
            source: Some(source),
            kind: Some(kind),
        }
    }

    pub fn source(source: SignalSource) -> Self {
        Self {
            source: Some(source),
            kind: None,
        }
    }

    pub fn kind(kind: SignalKind) -> Self {
        Self {
            source: None,
            kind: Some(kind),
        }
    }

    fn matches(&self, signal: &Signal) -> bool {
        self.source.map_or(true, |s| s == signal.source)
            && self.kind.map_or(true, |k| k == signal.kind)
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: SignalFilter,
    hook: Arc<dyn SignalHook>,
}

#[derive(Default)]
struct BusState {
    next_id: u64,
    subscribers: Vec<Subscriber>,
    busy: HashSet<(SignalSource, SignalKind)>,
}

#[derive(Default)]
pub struct SignalBus {
    state: Mutex<BusState>,
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SignalBus")
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, filter: SignalFilter, hook: Arc<dyn SignalHook>) -> SubscriptionId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = SubscriptionId(state.next_id);
        state.subscribers.push(Subscriber { id, filter, hook });
        id
    }

    pub fn subscribe_fn<F>(&self, filter: SignalFilter, f: F) -> SubscriptionId
    where
        F: Fn(&Signal) + Send + Sync + 'static,
    {
        self.subscribe(filter, Arc::new(f))
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut state = self.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Delivers `signal` to every matching hook, in subscription order.
    pub fn emit(&self, signal: Signal) {
        let key = (signal.source, signal.kind);
        let hooks: Vec<Arc<dyn SignalHook>> = {
            let mut state = self.lock();
            if state.subscribers.is_empty() {
                return;
            }
            if !state.busy.insert(key) {
                tracing::trace!("Dropping nested {:?} from {:?}", signal.kind, signal.source);
                return;
            }
            state
                .subscribers
                .iter()
                .filter(|s| s.filter.matches(&signal))
                .map(|s| s.hook.clone())
                .collect()
        };

        for hook in &hooks {
            hook.on_signal(&signal);
        }

        self.lock().busy.remove(&key);
    }
}
