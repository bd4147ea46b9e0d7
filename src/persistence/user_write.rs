//! Journal of pending user writes, keyed by decimal write id so a crashed
//! session can replay unacknowledged mutations in order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DatabaseResult;
use crate::path::Path;
use crate::persistence::storage::{StorageAdapter, USER_WRITE_STORE};
use crate::snapshot::Node;
use crate::tree::SparseTree;
use crate::write_tree::{UserWriteRecord, WriteId, WritePayload};

pub struct UserWriteStore {
    adapter: Arc<dyn StorageAdapter>,
}

/// Wire form of one journal entry: exactly one of `overwrite` / `merge` set.
#[derive(Serialize, Deserialize)]
struct PersistedUserWrite {
    id: WriteId,
    path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    overwrite: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    merge: Option<Map<String, Value>>,
}

impl UserWriteStore {
    pub fn new(adapter: Arc<dyn StorageAdapter>) -> Self {
        Self { adapter }
    }

    fn save(&self, record: PersistedUserWrite) -> DatabaseResult<()> {
        let key = record.id.to_string();
        let value = serde_json::to_value(record).expect("user write serializes");
        self.adapter.set(USER_WRITE_STORE, &key, Some(value))
    }

    pub fn save_overwrite(&self, path: &Path, node: &Node, write_id: WriteId) -> DatabaseResult<()> {
        self.save(PersistedUserWrite {
            id: write_id,
            path: path.slash_string(),
            overwrite: Some(node.export_json()),
            merge: None,
        })
    }

    pub fn save_merge(
        &self,
        path: &Path,
        children: &SparseTree<Node>,
        write_id: WriteId,
    ) -> DatabaseResult<()> {
        let mut merge = Map::new();
        children.for_each(&mut |relative, node| {
            merge.insert(relative.segments().join("/"), node.export_json());
        });
        self.save(PersistedUserWrite {
            id: write_id,
            path: path.slash_string(),
            overwrite: None,
            merge: Some(merge),
        })
    }

    pub fn remove(&self, write_id: WriteId) -> DatabaseResult<()> {
        self.adapter.set(USER_WRITE_STORE, &write_id.to_string(), None)
    }

    /// Every persisted write, sorted by id ascending.
    pub fn load_all(&self) -> DatabaseResult<Vec<UserWriteRecord>> {
        let mut records: Vec<UserWriteRecord> = self
            .adapter
            .get_all(USER_WRITE_STORE, None)?
            .into_iter()
            .filter_map(|(_, value)| decode_record(&value))
            .collect();
        records.sort_by_key(|record| record.write_id);
        Ok(records)
    }

    pub fn clear(&self) -> DatabaseResult<()> {
        self.adapter.clear(USER_WRITE_STORE)
    }

    pub fn close(&self) -> DatabaseResult<()> {
        self.adapter.close(USER_WRITE_STORE)
    }
}

fn decode_record(value: &Value) -> Option<UserWriteRecord> {
    let record: PersistedUserWrite = serde_json::from_value(value.clone()).ok()?;
    let path = Path::parse(&record.path).ok()?;
    if let Some(overwrite) = record.overwrite {
        return Some(UserWriteRecord {
            write_id: record.id,
            path,
            payload: WritePayload::Overwrite(Node::from_json(&overwrite)),
            visible: true,
        });
    }
    let merge = record.merge?;
    let mut children = SparseTree::new();
    for (relative, child) in &merge {
        let relative = Path::parse(relative).ok()?;
        children.set(&relative, Node::from_json(child));
    }
    Some(UserWriteRecord {
        write_id: record.id,
        path,
        payload: WritePayload::Merge(children),
        visible: true,
    })
}
