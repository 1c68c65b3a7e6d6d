use crate::error::SyncError;
use crate::types::node::{NodeRecord, NodeState};
use crate::types::operation::{Operation, OperationPayload};

impl NodeState {
    /// Apply an operation to this node map.
    ///
    /// Returns whether the map changed. Operations that target a missing node
    /// (other than Create) are no-ops.
    pub fn apply(&mut self, op: &Operation) -> Result<bool, SyncError> {
        op.validate()?;
        let version = op.version();

        match &op.payload {
            OperationPayload::Create { data, position } => {
                // Insert (replaces any previous record)
                let mut record = NodeRecord::new(data.clone(), *position, version);
                if let Some(existing) = self.get(&op.node_id) {
                    record.touch(existing.last_modified.clone());
                    if existing == &record {
                        return Ok(false);
                    }
                }
                self.insert(op.node_id.clone(), record);
                Ok(true)
            }

            OperationPayload::Update { fields } => {
                // Shallow merge, payload fields overwrite
                let Some(record) = self.get_mut(&op.node_id) else {
                    return Ok(false);
                };
                let before = record.clone();
                for (key, value) in fields {
                    record.data.insert(key.clone(), value.clone());
                }
                record.touch(version);
                Ok(*record != before)
            }

            OperationPayload::Delete => Ok(self.remove(&op.node_id).is_some()),

            OperationPayload::Move { position } => {
                // Position only
                let Some(record) = self.get_mut(&op.node_id) else {
                    return Ok(false);
                };
                let before = record.clone();
                record.position = Some(*position);
                record.touch(version);
                Ok(*record != before)
            }
        }
    }

    /// Apply an operation that may have been invalidated by a transform
    pub fn apply_resolved(&mut self, op: Option<&Operation>) -> Result<bool, SyncError> {
        match op {
            Some(op) => self.apply(op),
            None => Ok(false),
        }
    }
}
