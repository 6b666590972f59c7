//! Node model shared by the source and destination sides.
//!
//! Source nodes ([`SourceNode`]) are what the legacy store hands out: row-id
//! keyed, with ACLs and timestamps still encoded as properties. Destination
//! nodes ([`Node`]) are what the new store persists: UUID keyed, with those
//! properties lifted into structural fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use url::Url;
use uuid::Uuid;

pub const PROP_CONTENT_ENCODING: &str = "ivo://ivoa.net/vospace/core#contentencoding";
pub const PROP_CONTENT_LENGTH: &str = "ivo://ivoa.net/vospace/core#length";
pub const PROP_CONTENT_MD5: &str = "ivo://ivoa.net/vospace/core#MD5";
pub const PROP_TYPE: &str = "ivo://ivoa.net/vospace/core#type";
pub const PROP_CREATION_DATE: &str = "ivo://ivoa.net/vospace/core#ctime";
pub const PROP_CREATOR: &str = "ivo://ivoa.net/vospace/core#creator";
pub const PROP_DATE: &str = "ivo://ivoa.net/vospace/core#date";
pub const PROP_FORMAT: &str = "ivo://ivoa.net/vospace/core#format";
pub const PROP_GROUPMASK: &str = "ivo://ivoa.net/vospace/core#groupmask";
pub const PROP_GROUPREAD: &str = "ivo://ivoa.net/vospace/core#groupread";
pub const PROP_GROUPWRITE: &str = "ivo://ivoa.net/vospace/core#groupwrite";
pub const PROP_ISLOCKED: &str = "ivo://cadc.nrc.ca/vospace/core#islocked";
pub const PROP_ISPUBLIC: &str = "ivo://ivoa.net/vospace/core#ispublic";
pub const PROP_READABLE: &str = "ivo://ivoa.net/vospace/core#readable";
pub const PROP_WRITABLE: &str = "ivo://ivoa.net/vospace/core#writable";
pub const PROP_AVAILABLE_SPACE: &str = "ivo://ivoa.net/vospace/core#availableSpace";
pub const PROP_QUOTA: &str = "ivo://ivoa.net/vospace/core#quota";

/// Derive the destination identifier for a source row id.
///
/// The row id occupies the low 64 bits; the high bits are zero. Repeated runs
/// over the same source therefore always produce the same identifier.
pub fn node_id(row_id: i64) -> Uuid {
    Uuid::from_u128(row_id as u64 as u128)
}

/// The three node variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Container,
    Data,
    Link,
}

impl NodeType {
    /// Single-character code used by both stores' `type` columns.
    pub fn code(self) -> char {
        match self {
            NodeType::Container => 'C',
            NodeType::Data => 'D',
            NodeType::Link => 'L',
        }
    }

    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'C' => Some(NodeType::Container),
            'D' => Some(NodeType::Data),
            'L' => Some(NodeType::Link),
            _ => None,
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Container => "ContainerNode",
            NodeType::Data => "DataNode",
            NodeType::Link => "LinkNode",
        };
        f.write_str(name)
    }
}

/// Raw key/value pair attached to a source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceProperty {
    pub key: String,
    pub value: String,
}

impl SourceProperty {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Variant-specific part of a source node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    Container,
    Data {
        storage_id: String,
        content_length: Option<i64>,
    },
    Link {
        target: String,
    },
    /// A type tag the legacy store knows but this tool does not.
    Other(String),
}

/// A node as read from the source store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceNode {
    /// Internal numeric row id in the source.
    pub row_id: i64,
    /// Row id of the parent; `None` for children of the namespace root.
    pub parent_row_id: Option<i64>,
    pub name: String,
    /// Full path below the source root, used for logging only.
    pub path: String,
    pub owner: Option<String>,
    pub is_public: bool,
    pub is_locked: bool,
    pub kind: SourceKind,
    pub properties: Vec<SourceProperty>,
}

impl SourceNode {
    pub fn is_container(&self) -> bool {
        matches!(self.kind, SourceKind::Container)
    }

    pub fn kind_name(&self) -> &str {
        match &self.kind {
            SourceKind::Container => "ContainerNode",
            SourceKind::Data { .. } => "DataNode",
            SourceKind::Link { .. } => "LinkNode",
            SourceKind::Other(tag) => tag,
        }
    }

    /// First value recorded for `key`, if any.
    pub fn property_value(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.value.as_str())
    }

    /// Handle for listing this node's children.
    pub fn as_container(&self) -> ContainerRef {
        ContainerRef {
            row_id: Some(self.row_id),
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }
}

/// Lightweight handle to a container whose children can be listed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    /// `None` for the namespace root, which has no row of its own.
    pub row_id: Option<i64>,
    pub name: String,
    pub path: String,
}

impl ContainerRef {
    pub fn root(path: impl Into<String>) -> Self {
        Self {
            row_id: None,
            name: String::new(),
            path: path.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.row_id.is_none()
    }

    /// Path of a child named `name` below this container.
    pub fn child_path(&self, name: &str) -> String {
        if self.path.ends_with('/') {
            format!("{}{}", self.path, name)
        } else {
            format!("{}/{}", self.path, name)
        }
    }
}

/// Group identifier in canonical `ivo://authority/path?name` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupUri(String);

impl GroupUri {
    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let url = Url::parse(raw).map_err(|e| format!("invalid group URI '{}': {}", raw, e))?;
        if url.scheme() != "ivo" {
            return Err(format!("invalid group URI '{}': scheme must be ivo", raw));
        }
        if url.host_str().map_or(true, str::is_empty) {
            return Err(format!("invalid group URI '{}': missing authority", raw));
        }
        match url.query() {
            Some(q) if !q.is_empty() => {}
            _ => return Err(format!("invalid group URI '{}': missing group name", raw)),
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The group name (query component).
    pub fn name(&self) -> &str {
        self.0.split_once('?').map(|(_, n)| n).unwrap_or_default()
    }
}

impl fmt::Display for GroupUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Custom metadata carried over to the destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeProperty {
    pub key: String,
    pub value: String,
}

/// Variant-specific part of a destination node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Container {
        inherit_permissions: bool,
    },
    Data {
        storage_id: String,
        bytes_used: Option<i64>,
        busy: bool,
    },
    Link {
        target: String,
    },
}

/// A node in destination shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub name: String,
    pub parent_id: Uuid,
    pub owner_id: Option<String>,
    pub is_public: bool,
    /// Only set when the source node was locked.
    pub is_locked: Option<bool>,
    pub read_only_groups: BTreeSet<GroupUri>,
    pub read_write_groups: BTreeSet<GroupUri>,
    pub properties: Vec<NodeProperty>,
    pub last_modified: Option<DateTime<Utc>>,
    pub kind: NodeKind,
}

impl Node {
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Container { .. } => NodeType::Container,
            NodeKind::Data { .. } => NodeType::Data,
            NodeKind::Link { .. } => NodeType::Link,
        }
    }
}

/// One entry of the source's append-only deletion log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletedNodeEvent {
    pub id: Uuid,
    pub node_type: NodeType,
    pub last_modified: DateTime<Utc>,
}

impl DeletedNodeEvent {
    /// Ordering key used for replay positioning.
    pub fn position(&self) -> (DateTime<Utc>, Uuid) {
        (self.last_modified, self.id)
    }
}
