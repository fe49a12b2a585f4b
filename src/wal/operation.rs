//! Operation log entries

use crate::error::{Error, Result};
use crate::model::TreeKind;
use crate::schema::operation_log;
use crate::store::TreeNode;
use diesel::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
    Move,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Update => "update",
            OperationType::Delete => "delete",
            OperationType::Move => "move",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "create" => Ok(OperationType::Create),
            "update" => Ok(OperationType::Update),
            "delete" => Ok(OperationType::Delete),
            "move" => Ok(OperationType::Move),
            other => Err(format!("unknown operation type '{}'", other)),
        }
    }
}

/// Opaque snapshots carried by an operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

impl Payload {
    pub fn before_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode(self.before.as_ref())
    }

    pub fn after_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode(self.after.as_ref())
    }

    pub fn extra_as<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        decode(self.extra.as_ref())
    }
}

fn decode<T: DeserializeOwned>(value: Option<&Value>) -> Result<Option<T>> {
    value
        .map(|v| serde_json::from_value(v.clone()))
        .transpose()
        .map_err(Error::from)
}

/// A logged mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: i64,
    pub operation_type: OperationType,
    pub entity_type: TreeKind,
    pub entity_id: String,
    pub payload: Payload,
    pub applied: bool,
    pub is_undone: bool,
    /// When the operation was last undone; cleared by redo
    pub undone_at: Option<String>,
    pub undo_group_id: Option<String>,
    pub created_at: String,
}

/// A mutation about to be appended; the log assigns id and timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    pub operation_type: OperationType,
    pub entity_type: TreeKind,
    pub entity_id: String,
    pub payload: Payload,
    pub undo_group_id: Option<String>,
}

impl NewOperation {
    pub fn new(operation_type: OperationType, entity_type: TreeKind, entity_id: impl Into<String>) -> Self {
        Self {
            operation_type,
            entity_type,
            entity_id: entity_id.into(),
            payload: Payload::default(),
            undo_group_id: None,
        }
    }

    pub fn created<N: TreeNode>(node: &N) -> Result<Self> {
        let mut op = Self::new(OperationType::Create, N::KIND, node.id());
        op.payload.after = Some(serde_json::to_value(node)?);
        Ok(op)
    }

    /// Attribute or topology change, depending on `operation_type`
    pub fn changed<N: TreeNode>(operation_type: OperationType, before: &N, after: &N) -> Result<Self> {
        let mut op = Self::new(operation_type, N::KIND, after.id());
        op.payload.before = Some(serde_json::to_value(before)?);
        op.payload.after = Some(serde_json::to_value(after)?);
        Ok(op)
    }

    /// Soft delete; `extra` records what the cascade touched
    pub fn deleted<N: TreeNode, E: Serialize>(before: &N, extra: &E) -> Result<Self> {
        let mut op = Self::new(OperationType::Delete, N::KIND, before.id());
        op.payload.before = Some(serde_json::to_value(before)?);
        op.payload.extra = Some(serde_json::to_value(extra)?);
        Ok(op)
    }

    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.undo_group_id = Some(group.into());
        self
    }
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(Queryable, QueryableByName, Selectable, Debug)]
#[diesel(table_name = operation_log)]
pub(crate) struct OperationRow {
    pub id: i64,
    pub operation_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: String,
    pub applied: bool,
    pub is_undone: bool,
    pub undone_at: Option<String>,
    pub undo_group_id: Option<String>,
    pub created_at: String,
}

impl TryFrom<OperationRow> for Operation {
    type Error = Error;

    fn try_from(row: OperationRow) -> Result<Self> {
        let operation_type = row
            .operation_type
            .parse::<OperationType>()
            .map_err(|e| Error::IntegrityViolation(format!("operation {}: {}", row.id, e)))?;
        let entity_type = row
            .entity_type
            .parse::<TreeKind>()
            .map_err(|e| Error::IntegrityViolation(format!("operation {}: {}", row.id, e)))?;
        Ok(Operation {
            id: row.id,
            operation_type,
            entity_type,
            entity_id: row.entity_id,
            payload: serde_json::from_str(&row.payload)?,
            applied: row.applied,
            is_undone: row.is_undone,
            undone_at: row.undone_at,
            undo_group_id: row.undo_group_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = operation_log)]
pub(crate) struct NewOperationRow<'a> {
    pub operation_type: &'a str,
    pub entity_type: &'a str,
    pub entity_id: &'a str,
    pub payload: &'a str,
    pub applied: bool,
    pub is_undone: bool,
    pub undo_group_id: Option<&'a str>,
    pub created_at: &'a str,
}
