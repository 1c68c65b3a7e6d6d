//! Causal automaton: owns a peer's vector clock and drives it through
//! tick/send/receive transitions.
//!
//! Every transition records facts in a [`CausalSink`]. Sink failures are
//! logged and swallowed; the clock never depends on the sink.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::time::current_time_ms;
use crate::types::clock::VectorClock;
use crate::types::ids::PeerId;

/// Fact predicates written by the automaton
pub mod predicates {
    pub const VECTOR_CLOCK: &str = "vector-clock";
    pub const RECEIVED_CLOCK: &str = "received-clock";
    pub const RECEIVE_EVENT: &str = "receive-event";
    pub const SEND_EVENT: &str = "send-event";
}

/// Argument used for the target of a broadcast send
pub const BROADCAST_TARGET: &str = "*";

/// A `{predicate, args}` fact for the external fact store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub predicate: String,
    pub args: Vec<Value>,
}

impl Fact {
    pub fn new(predicate: &str, args: Vec<Value>) -> Self {
        Self {
            predicate: predicate.to_string(),
            args,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("fact store unavailable: {0}")]
    Unavailable(String),
    #[error("fact store rejected facts: {0}")]
    Rejected(String),
}

/// Append-only store for causal facts
pub trait CausalSink: Send {
    fn add_facts(&mut self, facts: Vec<Fact>) -> Result<(), SinkError>;
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl CausalSink for NullSink {
    fn add_facts(&mut self, _facts: Vec<Fact>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// In-memory sink; clones share the same fact list
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    facts: Arc<Mutex<Vec<Fact>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all facts recorded so far
    pub fn facts(&self) -> Vec<Fact> {
        self.facts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Facts with the given predicate
    pub fn facts_with(&self, predicate: &str) -> Vec<Fact> {
        self.facts()
            .into_iter()
            .filter(|f| f.predicate == predicate)
            .collect()
    }
}

impl CausalSink for MemorySink {
    fn add_facts(&mut self, facts: Vec<Fact>) -> Result<(), SinkError> {
        let mut guard = self
            .facts
            .lock()
            .map_err(|e| SinkError::Unavailable(e.to_string()))?;
        guard.extend(facts);
        Ok(())
    }
}

/// Stamp applied to outbound messages
#[derive(Debug, Clone, PartialEq)]
pub struct CausalStamp {
    pub peer_id: PeerId,
    pub vector_clock: VectorClock,
    pub timestamp: u64,
}

/// A message that can carry a vector clock
pub trait CausalMessage {
    fn vector_clock(&self) -> Option<&VectorClock>;
    fn stamp(&mut self, stamp: CausalStamp);
}

/// Type-specific side effects run after each transition
pub trait AutomatonHooks: Send {
    fn on_tick(&mut self, _peer: &PeerId, _tick: u64, _context: &str) {}
    fn on_receive(&mut self, _from: &PeerId, _clock: &VectorClock) {}
    fn on_send(&mut self, _to: Option<&PeerId>, _stamp: &CausalStamp) {}
}

/// Hooks that do nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl AutomatonHooks for NoHooks {}

/// Vector-clock state machine for one peer
pub struct CausalAutomaton {
    peer_id: PeerId,
    clock: VectorClock,
    /// Observability only; never gates transitions
    running: bool,
    sink: Box<dyn CausalSink>,
    hooks: Box<dyn AutomatonHooks>,
    /// Last time (ms) each remote peer was heard from
    last_seen: BTreeMap<PeerId, u64>,
}

impl CausalAutomaton {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            clock: VectorClock::new(peer_id.clone()),
            peer_id,
            running: false,
            sink: Box::new(NullSink),
            hooks: Box::new(NoHooks),
            last_seen: BTreeMap::new(),
        }
    }

    pub fn with_sink(mut self, sink: impl CausalSink + 'static) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn with_hooks(mut self, hooks: impl AutomatonHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Copy of the current clock
    pub fn snapshot(&self) -> VectorClock {
        self.clock.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn start(&mut self) {
        self.running = true;
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Advance the local entry
    pub fn tick(&mut self, context: &str) -> u64 {
        let tick = self.clock.tick();
        debug!(peer = %self.peer_id, tick, context, "tick");

        self.persist(vec![Fact::new(
            predicates::VECTOR_CLOCK,
            vec![json!(self.peer_id), json!(tick), json!(context)],
        )]);
        self.hooks.on_tick(&self.peer_id, tick, context);
        tick
    }

    /// Merge the clock carried by an inbound message
    pub fn receive<M: CausalMessage>(&mut self, from: &PeerId, message: &M) {
        self.receive_at(from, message, current_time_ms());
    }

    pub fn receive_at<M: CausalMessage>(&mut self, from: &PeerId, message: &M, now_ms: u64) {
        self.observe(from, message.vector_clock(), now_ms);
    }

    /// Record contact with `from`, merging `clock` when there is one.
    ///
    /// Callers that hold an operation back pass `None` so the local clock
    /// never covers something not yet integrated.
    pub fn observe(&mut self, from: &PeerId, clock: Option<&VectorClock>, now_ms: u64) {
        self.last_seen.insert(from.clone(), now_ms);

        let mut facts = Vec::new();
        if let Some(remote) = clock {
            self.clock = self.clock.merge(remote);
            for (peer, tick) in remote.entries() {
                facts.push(Fact::new(
                    predicates::RECEIVED_CLOCK,
                    vec![json!(self.peer_id), json!(from), json!(peer), json!(tick)],
                ));
            }
        }
        facts.push(Fact::new(
            predicates::RECEIVE_EVENT,
            vec![json!(self.peer_id), json!(from), json!(now_ms)],
        ));
        self.persist(facts);

        self.hooks.on_receive(from, &self.clock);
    }

    /// Stamp an outbound message; `to = None` means broadcast
    pub fn send<M: CausalMessage>(&mut self, to: Option<&PeerId>, message: &mut M) {
        let stamp = CausalStamp {
            peer_id: self.peer_id.clone(),
            vector_clock: self.clock.clone(),
            timestamp: current_time_ms(),
        };

        let target = to.map_or_else(|| json!(BROADCAST_TARGET), |p| json!(p));
        self.persist(vec![Fact::new(
            predicates::SEND_EVENT,
            vec![json!(self.peer_id), target, json!(stamp.timestamp)],
        )]);

        self.hooks.on_send(to, &stamp);
        message.stamp(stamp);
    }

    /// Drop clock entries for peers silent longer than `retention_ms`
    pub fn prune_absent(&mut self, now_ms: u64, retention_ms: u64) -> Vec<PeerId> {
        let stale: BTreeSet<PeerId> = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| now_ms.saturating_sub(seen) > retention_ms)
            .map(|(peer, _)| peer.clone())
            .collect();
        if stale.is_empty() {
            return Vec::new();
        }

        self.clock = self.clock.without_peers(&stale);
        for peer in &stale {
            self.last_seen.remove(peer);
        }
        debug!(peer = %self.peer_id, pruned = stale.len(), "pruned clock entries");
        stale.into_iter().collect()
    }

    fn persist(&mut self, facts: Vec<Fact>) {
        if let Err(e) = self.sink.add_facts(facts) {
            warn!(peer = %self.peer_id, error = %e, "failed to record causal facts");
        }
    }
}
