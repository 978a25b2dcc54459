//! Container codec
//!
//! A container is one file holding a root object plus every object it
//! references, each stored under an internal path. The store only needs the
//! [`ContainerCodec`] trait; [`JsonContainerCodec`] is the format nodes
//! exchange over `/fetch`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MeshError, Result};
use crate::object::{DataObject, LeafObject, TableObject};
use crate::types::{Identifier, ObjectKind};

pub const CONTAINER_FORMAT: &str = "kmesh-container/1";

/// File suffix of staged and cached containers
pub const CONTAINER_SUFFIX: &str = ".kmc";

/// Content type served for container downloads
pub const CONTAINER_MIME: &str = "application/x-kmesh-container";

/// One object inside a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEntry {
    pub id: Identifier,
    pub internal_path: String,
}

pub trait ContainerCodec: Send + Sync {
    /// Encode a sealed object together with the objects it references.
    fn encode(&self, object: &DataObject) -> Result<Vec<u8>>;

    /// Decode the root object of a container.
    fn decode(&self, bytes: &[u8]) -> Result<DataObject>;

    /// Decode the object stored at `internal_path`.
    fn decode_entry(&self, bytes: &[u8], internal_path: &str) -> Result<DataObject>;

    fn list_entries(&self, bytes: &[u8]) -> Result<Vec<ContainerEntry>>;

    fn list_identifiers(&self, bytes: &[u8]) -> Result<Vec<Identifier>> {
        Ok(self.list_entries(bytes)?.into_iter().map(|e| e.id).collect())
    }
}

/// Internal path an object is stored under
pub fn internal_path(id: &Identifier) -> String {
    format!("/results/result_{}", id.hash())
}

#[derive(Debug, Serialize, Deserialize)]
struct TableRecord {
    id: Identifier,
    longname: String,
    shortname: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    /// Internal paths of the columns, in column order
    columns: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Record {
    Leaf(LeafObject),
    Table(TableRecord),
}

impl Record {
    fn kind(&self) -> ObjectKind {
        match self {
            Record::Leaf(_) => ObjectKind::Leaf,
            Record::Table(_) => ObjectKind::Table,
        }
    }

    fn id(&self) -> Option<&Identifier> {
        match self {
            Record::Leaf(leaf) => leaf.id.as_ref(),
            Record::Table(table) => Some(&table.id),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    format: String,
    root: Identifier,
    results: BTreeMap<String, Record>,
}

type DecodeFn = fn(&Document, &str) -> Result<DataObject>;

/// Decoder for each object kind, looked up by the record's kind tag
fn decoder_for(kind: ObjectKind) -> DecodeFn {
    match kind {
        ObjectKind::Leaf => decode_leaf,
        ObjectKind::Table => decode_table,
    }
}

fn record<'a>(doc: &'a Document, path: &str) -> Result<&'a Record> {
    doc.results
        .get(path)
        .ok_or_else(|| MeshError::Codec(format!("no entry at '{path}'")))
}

fn leaf_record<'a>(doc: &'a Document, path: &str) -> Result<&'a LeafObject> {
    match record(doc, path)? {
        Record::Leaf(leaf) => Ok(leaf),
        other => Err(MeshError::Codec(format!(
            "expected leaf at '{path}', found {}",
            other.kind()
        ))),
    }
}

fn decode_leaf(doc: &Document, path: &str) -> Result<DataObject> {
    Ok(DataObject::Leaf(leaf_record(doc, path)?.clone()))
}

fn decode_table(doc: &Document, path: &str) -> Result<DataObject> {
    let table = match record(doc, path)? {
        Record::Table(table) => table,
        other => {
            return Err(MeshError::Codec(format!(
                "expected table at '{path}', found {}",
                other.kind()
            )))
        }
    };
    let mut columns = Vec::with_capacity(table.columns.len());
    for column_path in &table.columns {
        let column = leaf_record(doc, column_path)?;
        column.verified_id()?;
        columns.push(column.clone());
    }
    Ok(DataObject::Table(TableObject {
        id: Some(table.id.clone()),
        longname: table.longname.clone(),
        shortname: table.shortname.clone(),
        attributes: table.attributes.clone(),
        columns,
    }))
}

/// JSON container format
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContainerCodec;

impl JsonContainerCodec {
    fn parse(&self, bytes: &[u8]) -> Result<Document> {
        let doc: Document = serde_json::from_slice(bytes)
            .map_err(|e| MeshError::Codec(format!("unreadable container: {e}")))?;
        if doc.format != CONTAINER_FORMAT {
            return Err(MeshError::Codec(format!(
                "unsupported container format '{}'",
                doc.format
            )));
        }
        Ok(doc)
    }

    fn insert_leaf(results: &mut BTreeMap<String, Record>, leaf: &LeafObject) -> Result<String> {
        let id = DataObject::Leaf(leaf.clone()).verified_id()?.clone();
        let path = internal_path(&id);
        results.entry(path.clone()).or_insert_with(|| Record::Leaf(leaf.clone()));
        Ok(path)
    }
}

impl ContainerCodec for JsonContainerCodec {
    fn encode(&self, object: &DataObject) -> Result<Vec<u8>> {
        let root = object.verified_id()?.clone();
        let mut results = BTreeMap::new();
        match object {
            DataObject::Leaf(leaf) => {
                Self::insert_leaf(&mut results, leaf)?;
            }
            DataObject::Table(table) => {
                let mut columns = Vec::with_capacity(table.columns.len());
                for column in &table.columns {
                    columns.push(Self::insert_leaf(&mut results, column)?);
                }
                results.insert(
                    internal_path(&root),
                    Record::Table(TableRecord {
                        id: root.clone(),
                        longname: table.longname.clone(),
                        shortname: table.shortname.clone(),
                        attributes: table.attributes.clone(),
                        columns,
                    }),
                );
            }
        }
        let doc = Document {
            format: CONTAINER_FORMAT.to_string(),
            root,
            results,
        };
        Ok(serde_json::to_vec(&doc)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DataObject> {
        let doc = self.parse(bytes)?;
        let path = internal_path(&doc.root);
        decoder_for(doc.root.kind())(&doc, &path)
    }

    fn decode_entry(&self, bytes: &[u8], internal_path: &str) -> Result<DataObject> {
        let doc = self.parse(bytes)?;
        let kind = record(&doc, internal_path)?.kind();
        decoder_for(kind)(&doc, internal_path)
    }

    fn list_entries(&self, bytes: &[u8]) -> Result<Vec<ContainerEntry>> {
        let doc = self.parse(bytes)?;
        let mut entries = Vec::with_capacity(doc.results.len());
        for (path, record) in &doc.results {
            let id = record
                .id()
                .ok_or_else(|| MeshError::Codec(format!("entry '{path}' has no identifier")))?;
            entries.push(ContainerEntry {
                id: id.clone(),
                internal_path: path.clone(),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> DataObject {
        let t = LeafObject::new("temperature", "T", "K", vec![280.0, 290.0]);
        let p = LeafObject::new("pressure", "p", "Pa", vec![1.0e5, 1.1e5]).with_error(vec![10.0, 10.0]);
        DataObject::from(TableObject::new("run 7", "r7", vec![t, p]).seal())
    }

    #[test]
    fn test_decoded_object_keeps_identifier() {
        let codec = JsonContainerCodec;
        let table = sample_table();
        let bytes = codec.encode(&table).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.compute_id(), *table.id().unwrap());
    }

    #[test]
    fn test_container_lists_parent_and_children() {
        let codec = JsonContainerCodec;
        let table = sample_table();
        let bytes = codec.encode(&table).unwrap();

        let ids = codec.list_identifiers(&bytes).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(table.id().unwrap()));

        let DataObject::Table(inner) = &table else { panic!("expected table") };
        let column_id = inner.columns[1].id.clone().unwrap();
        let column = codec.decode_entry(&bytes, &internal_path(&column_id)).unwrap();
        assert_eq!(column.kind(), ObjectKind::Leaf);
        assert_eq!(column.longname(), "pressure");
    }

    #[test]
    fn test_non_finite_values_round_trip() {
        let codec = JsonContainerCodec;
        let leaf = DataObject::from(
            LeafObject::new("flux", "F", "W", vec![f64::NAN, f64::INFINITY, f64::NEG_INFINITY, 2.0])
                .seal(),
        );
        let bytes = codec.encode(&leaf).unwrap();
        let decoded = codec.decode(&bytes).unwrap();
        assert_eq!(decoded.verified_id().unwrap(), leaf.id().unwrap());

        let DataObject::Leaf(decoded) = decoded else { panic!("expected leaf") };
        assert!(decoded.data[0].is_nan());
        assert_eq!(&decoded.data[1..], &[f64::INFINITY, f64::NEG_INFINITY, 2.0]);
    }

    #[test]
    fn test_table_with_forged_column_is_rejected() {
        let codec = JsonContainerCodec;
        let victim = LeafObject::new("victim", "v", "", vec![1.0]).seal();
        let table = sample_table();
        let DataObject::Table(inner) = &table else { panic!("expected table") };
        let column_path = internal_path(inner.columns[0].id.as_ref().unwrap());

        let mut doc: serde_json::Value =
            serde_json::from_slice(&codec.encode(&table).unwrap()).unwrap();
        doc["results"][column_path.as_str()]["id"] =
            serde_json::Value::String(victim.id.unwrap().to_string());
        let bytes = serde_json::to_vec(&doc).unwrap();

        assert!(matches!(codec.decode(&bytes), Err(MeshError::Integrity { .. })));
    }

    #[test]
    fn test_encode_requires_sealed_object() {
        let codec = JsonContainerCodec;
        let leaf = DataObject::from(LeafObject::new("x", "x", "", vec![1.0]));
        assert!(codec.encode(&leaf).is_err());
    }

    #[test]
    fn test_rejects_foreign_payloads() {
        let codec = JsonContainerCodec;
        assert!(matches!(codec.decode(b"<html>"), Err(MeshError::Codec(_))));
        let other = br#"{"format":"other/9","root":"ab:leaf","results":{}}"#;
        assert!(matches!(codec.decode(other), Err(MeshError::Codec(_))));
    }
}
