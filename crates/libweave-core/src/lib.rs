pub mod types;
pub mod hash;
pub mod projection;
pub mod automaton;
pub mod resolver;
pub mod bridge;
pub mod presence;
pub mod config;
pub mod error;
pub mod time;

pub use error::SyncError;
pub use types::{NodeId, PeerId, VectorClock};
pub use types::operation::{NodeData, Operation, OperationKind, OperationPayload, Position, Version};
pub use types::node::{NodeRecord, NodeState, StateSnapshot, Tombstone};
pub use automaton::{CausalAutomaton, CausalMessage, CausalSink, CausalStamp, AutomatonHooks, Fact, MemorySink, NullSink};
pub use resolver::{ConflictResolver, Delivery, Integration, Strategy};
pub use bridge::{BridgeOutcome, ContentView, PositionalView, RepresentationBridge, SyncEntry, ViewSource};
pub use presence::{PresenceEntry, PresenceTracker};
pub use config::{PresenceConfig, SyncConfig, load_config, save_config};
