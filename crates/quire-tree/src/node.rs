use serde::{Deserialize, Serialize};

use quire_types::FileRecord;

use crate::error::{TreeError, TreeResult};

/// One metadata feed entry: a path set to a record, or deleted (`None`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    pub path: String,
    pub value: Option<FileRecord>,
}

impl TreeNode {
    pub fn put(path: impl Into<String>, record: FileRecord) -> Self {
        Self {
            path: path.into(),
            value: Some(record),
        }
    }

    pub fn del(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            value: None,
        }
    }

    pub fn is_deletion(&self) -> bool {
        self.value.is_none()
    }

    pub fn encode(&self) -> TreeResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TreeError::Serialization(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> TreeResult<Self> {
        bincode::deserialize(data).map_err(|e| TreeError::Serialization(e.to_string()))
    }
}
