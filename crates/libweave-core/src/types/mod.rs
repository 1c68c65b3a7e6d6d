pub mod ids;
pub mod clock;
pub mod operation;
pub mod node;

pub use ids::{NodeId, PeerId, IdParseError};
pub use ids::{generate_node_id, generate_peer_id};
pub use clock::VectorClock;
pub use operation::{NodeData, Operation, OperationKey, OperationKind, OperationPayload, Position, Version};
pub use node::{NodeRecord, NodeState, StateSnapshot, Tombstone};
