use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::MeshError;
use crate::peer::Peer;

/// Unique server identity of a node
pub type NodeId = Uuid;

/// Object categories a container can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    /// A single named column of values
    Leaf,
    /// A set of leaf columns sharing one row index
    Table,
}

impl ObjectKind {
    pub fn tag(self) -> &'static str {
        match self {
            ObjectKind::Leaf => "leaf",
            ObjectKind::Table => "table",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "leaf" => Some(ObjectKind::Leaf),
            "table" => Some(ObjectKind::Table),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Content identifier of the form `<content-hash>:<kind>`.
///
/// Two objects with equal identifiers have equal content, so an identifier
/// never needs versioning.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identifier {
    hash: String,
    kind: ObjectKind,
}

impl Identifier {
    pub fn new(hash: impl Into<String>, kind: ObjectKind) -> Self {
        Self {
            hash: hash.into(),
            kind,
        }
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

impl FromStr for Identifier {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hash, tag) = s
            .rsplit_once(':')
            .ok_or_else(|| MeshError::Protocol(format!("identifier without kind: '{s}'")))?;
        if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(MeshError::Protocol(format!("malformed content hash in '{s}'")));
        }
        let kind = ObjectKind::from_tag(tag)
            .ok_or_else(|| MeshError::Protocol(format!("unknown object kind '{tag}'")))?;
        Ok(Self::new(hash, kind))
    }
}

impl TryFrom<String> for Identifier {
    type Error = MeshError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Identifier> for String {
    fn from(id: Identifier) -> Self {
        id.to_string()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.hash, self.kind)
    }
}

/// Peer identities already consulted during one resolution chain.
///
/// Entries are only ever appended, so the list grows monotonically as it
/// travels from hop to hop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SkipList(Vec<NodeId>);

impl SkipList {
    pub fn starting_with(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.0.contains(id)
    }

    /// Append `id` unless already present. Returns whether it was added.
    pub fn insert(&mut self, id: NodeId) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.0.push(id);
        true
    }

    /// Adopt the list a peer handed back, keeping any local entry the peer
    /// dropped so that nothing is ever removed.
    pub fn adopt(&mut self, returned: SkipList) {
        let mut merged = returned;
        for id in &self.0 {
            merged.insert(*id);
        }
        *self = merged;
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }

    /// Encoding used for the `skip` query parameter (a JSON array).
    pub fn to_query_param(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "[]".into())
    }

    pub fn from_query_param(raw: &str) -> Result<Self, MeshError> {
        let ids: Vec<NodeId> = serde_json::from_str(raw)
            .map_err(|e| MeshError::Protocol(format!("malformed skip list: {e}")))?;
        let mut list = SkipList::default();
        for id in ids {
            list.insert(id);
        }
        Ok(list)
    }
}

/// Query string of `GET /resolve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveQuery {
    pub id: Option<String>,
    pub skip: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveStatus {
    Found,
    NotFound,
}

/// Answer of `GET /resolve`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveResponse {
    pub status: ResolveStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub skip: SkipList,
}

impl ResolveResponse {
    pub fn found(url: String, skip: SkipList) -> Self {
        Self {
            status: ResolveStatus::Found,
            url: Some(url),
            skip,
        }
    }

    pub fn not_found(skip: SkipList) -> Self {
        Self {
            status: ResolveStatus::NotFound,
            url: None,
            skip,
        }
    }
}

/// Node status summary served at `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatus {
    pub uuid: NodeId,
    pub base_url: Option<String>,
    pub objects: usize,
    /// Location queries answered since the node was created
    pub resolve_queries: u64,
    pub peers: Vec<Peer>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_parse_and_display() {
        let id: Identifier = "h1:leaf".parse().unwrap();
        assert_eq!(id.hash(), "h1");
        assert_eq!(id.kind(), ObjectKind::Leaf);
        assert_eq!(id.to_string(), "h1:leaf");

        assert!("h1".parse::<Identifier>().is_err());
        assert!(":leaf".parse::<Identifier>().is_err());
        assert!("h1:chart".parse::<Identifier>().is_err());
        assert!("../etc:leaf".parse::<Identifier>().is_err());
    }

    #[test]
    fn test_identifier_serde_as_string() {
        let id = Identifier::new("abc123", ObjectKind::Table);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123:table\"");
        let back: Identifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_skip_list_never_shrinks() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();

        let mut local = SkipList::starting_with(a);
        assert!(local.insert(b));
        assert!(!local.insert(b));

        // A peer that forgot `b` must not make us forget it too.
        let mut returned = SkipList::starting_with(a);
        returned.insert(c);
        local.adopt(returned);

        assert_eq!(local.len(), 3);
        assert!(local.contains(&a) && local.contains(&b) && local.contains(&c));
        let order: Vec<_> = local.iter().copied().collect();
        assert_eq!(order, vec![a, c, b]);
    }

    #[test]
    fn test_skip_list_query_param() {
        let a = Uuid::new_v4();
        let list = SkipList::starting_with(a);
        let raw = list.to_query_param();
        assert_eq!(SkipList::from_query_param(&raw).unwrap(), list);
        assert!(SkipList::from_query_param("not json").is_err());
        assert!(SkipList::from_query_param("[\"nope\"]").is_err());
    }
}
