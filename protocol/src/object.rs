//! Content-addressed data objects
//!
//! An object's identifier is the SHA-256 of a canonical encoding of its
//! content followed by its kind tag. Sealing computes and stores it; the
//! object store and the resolver recompute it to check integrity.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::{MeshError, Result};
use crate::types::{Identifier, ObjectKind};

/// A single named column of values with an optional error column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Identifier>,
    pub longname: String,
    pub shortname: String,
    #[serde(default)]
    pub unit: String,
    #[serde(with = "float_values")]
    pub data: Vec<f64>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "float_values::optional"
    )]
    pub error: Option<Vec<f64>>,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// A tabular object bundling leaf columns
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableObject {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Identifier>,
    pub longname: String,
    pub shortname: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    pub columns: Vec<LeafObject>,
}

#[derive(Serialize)]
struct LeafDigest<'a> {
    kind: &'static str,
    longname: &'a str,
    shortname: &'a str,
    unit: &'a str,
    data: Vec<u64>,
    error: Option<Vec<u64>>,
    attributes: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct TableDigest<'a> {
    kind: &'static str,
    longname: &'a str,
    shortname: &'a str,
    attributes: &'a BTreeMap<String, String>,
    columns: Vec<String>,
}

/// Bit patterns of `values`, with every NaN collapsed to one canonical NaN.
fn canonical_bits(values: &[f64]) -> Vec<u64> {
    values
        .iter()
        .map(|v| if v.is_nan() { f64::NAN.to_bits() } else { v.to_bits() })
        .collect()
}

/// JSON has no NaN or infinity, so those travel as strings.
mod float_values {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum Wire {
        Number(f64),
        Special(String),
    }

    const NAN: &str = "NaN";
    const INFINITY: &str = "Infinity";
    const NEG_INFINITY: &str = "-Infinity";

    fn to_wire(value: f64) -> Wire {
        if value.is_nan() {
            Wire::Special(NAN.into())
        } else if value == f64::INFINITY {
            Wire::Special(INFINITY.into())
        } else if value == f64::NEG_INFINITY {
            Wire::Special(NEG_INFINITY.into())
        } else {
            Wire::Number(value)
        }
    }

    fn from_wire<E: serde::de::Error>(wire: Wire) -> Result<f64, E> {
        match wire {
            Wire::Number(value) => Ok(value),
            Wire::Special(tag) => match tag.as_str() {
                NAN => Ok(f64::NAN),
                INFINITY => Ok(f64::INFINITY),
                NEG_INFINITY => Ok(f64::NEG_INFINITY),
                other => Err(E::custom(format!("not a number: '{other}'"))),
            },
        }
    }

    struct Values<'a>(&'a [f64]);

    impl Serialize for Values<'_> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            serializer.collect_seq(self.0.iter().map(|v| to_wire(*v)))
        }
    }

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        Values(values).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        Vec::<Wire>::deserialize(deserializer)?
            .into_iter()
            .map(from_wire)
            .collect()
    }

    pub mod optional {
        use super::*;

        pub fn serialize<S: Serializer>(
            values: &Option<Vec<f64>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match values {
                Some(values) => serializer.serialize_some(&Values(values)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Vec<f64>>, D::Error> {
            Option::<Vec<Wire>>::deserialize(deserializer)?
                .map(|values| values.into_iter().map(from_wire).collect())
                .transpose()
        }
    }
}

fn content_hash<T: Serialize>(digest: &T) -> String {
    // Serializing plain structs of strings, floats and a BTreeMap cannot fail.
    let bytes = serde_json::to_vec(digest).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

impl LeafObject {
    pub fn new(
        longname: impl Into<String>,
        shortname: impl Into<String>,
        unit: impl Into<String>,
        data: Vec<f64>,
    ) -> Self {
        Self {
            id: None,
            longname: longname.into(),
            shortname: shortname.into(),
            unit: unit.into(),
            data,
            error: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_error(mut self, error: Vec<f64>) -> Self {
        self.error = Some(error);
        self.id = None;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self.id = None;
        self
    }

    pub fn compute_id(&self) -> Identifier {
        let hash = content_hash(&LeafDigest {
            kind: ObjectKind::Leaf.tag(),
            longname: &self.longname,
            shortname: &self.shortname,
            unit: &self.unit,
            data: canonical_bits(&self.data),
            error: self.error.as_deref().map(canonical_bits),
            attributes: &self.attributes,
        });
        Identifier::new(hash, ObjectKind::Leaf)
    }

    pub fn seal(mut self) -> Self {
        self.id = Some(self.compute_id());
        self
    }

    /// The declared identifier, provided it matches the content.
    pub fn verified_id(&self) -> Result<&Identifier> {
        let declared = self
            .id
            .as_ref()
            .ok_or_else(|| MeshError::Codec(format!("column '{}' is not sealed", self.longname)))?;
        let actual = self.compute_id();
        if *declared != actual {
            return Err(MeshError::integrity(declared, &actual));
        }
        Ok(declared)
    }
}

impl TableObject {
    pub fn new(
        longname: impl Into<String>,
        shortname: impl Into<String>,
        columns: Vec<LeafObject>,
    ) -> Self {
        Self {
            id: None,
            longname: longname.into(),
            shortname: shortname.into(),
            attributes: BTreeMap::new(),
            columns,
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self.id = None;
        self
    }

    /// Hashes the column identifiers, not the column payloads.
    pub fn compute_id(&self) -> Identifier {
        let hash = content_hash(&TableDigest {
            kind: ObjectKind::Table.tag(),
            longname: &self.longname,
            shortname: &self.shortname,
            attributes: &self.attributes,
            columns: self
                .columns
                .iter()
                .map(|c| c.compute_id().to_string())
                .collect(),
        });
        Identifier::new(hash, ObjectKind::Table)
    }

    pub fn seal(mut self) -> Self {
        self.columns = self.columns.into_iter().map(LeafObject::seal).collect();
        self.id = Some(self.compute_id());
        self
    }
}

/// Any object the mesh can exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataObject {
    Leaf(LeafObject),
    Table(TableObject),
}

impl DataObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            DataObject::Leaf(_) => ObjectKind::Leaf,
            DataObject::Table(_) => ObjectKind::Table,
        }
    }

    /// The identifier stored on the object, if it has been sealed
    pub fn id(&self) -> Option<&Identifier> {
        match self {
            DataObject::Leaf(leaf) => leaf.id.as_ref(),
            DataObject::Table(table) => table.id.as_ref(),
        }
    }

    pub fn longname(&self) -> &str {
        match self {
            DataObject::Leaf(leaf) => &leaf.longname,
            DataObject::Table(table) => &table.longname,
        }
    }

    pub fn compute_id(&self) -> Identifier {
        match self {
            DataObject::Leaf(leaf) => leaf.compute_id(),
            DataObject::Table(table) => table.compute_id(),
        }
    }

    pub fn seal(self) -> Self {
        match self {
            DataObject::Leaf(leaf) => DataObject::Leaf(leaf.seal()),
            DataObject::Table(table) => DataObject::Table(table.seal()),
        }
    }

    /// Check that the object carries an identifier and that it matches the
    /// content. Returns the identifier on success.
    pub fn verified_id(&self) -> Result<&Identifier> {
        let declared = self
            .id()
            .ok_or_else(|| MeshError::Codec(format!("object '{}' is not sealed", self.longname())))?;
        let actual = self.compute_id();
        if *declared != actual {
            return Err(MeshError::integrity(declared, &actual));
        }
        if let DataObject::Table(table) = self {
            for column in &table.columns {
                column.verified_id()?;
            }
        }
        Ok(declared)
    }
}

impl From<LeafObject> for DataObject {
    fn from(leaf: LeafObject) -> Self {
        DataObject::Leaf(leaf)
    }
}

impl From<TableObject> for DataObject {
    fn from(table: TableObject) -> Self {
        DataObject::Table(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temperature() -> LeafObject {
        LeafObject::new("temperature", "T", "K", vec![273.15, 293.15, 373.15])
    }

    #[test]
    fn test_seal_is_deterministic() {
        let a = temperature().seal();
        let b = temperature().seal();
        assert_eq!(a.id, b.id);
        let id = a.id.unwrap();
        assert_eq!(id.kind(), ObjectKind::Leaf);
        assert_eq!(id.hash().len(), 64);
    }

    #[test]
    fn test_content_changes_identifier() {
        let a = temperature().seal();
        let b = temperature().with_attribute("sensor", "probe-2").seal();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_table_seals_columns() {
        let table = TableObject::new("run 7", "r7", vec![temperature()]).seal();
        assert!(table.columns[0].id.is_some());
        assert_eq!(table.id.as_ref().unwrap().kind(), ObjectKind::Table);
    }

    #[test]
    fn test_verified_id_detects_tampering() {
        let mut leaf = temperature().seal();
        let object = DataObject::from(leaf.clone());
        assert!(object.verified_id().is_ok());

        leaf.data.push(0.0);
        let tampered = DataObject::from(leaf);
        assert!(matches!(
            tampered.verified_id(),
            Err(MeshError::Integrity { .. })
        ));

        let unsealed = DataObject::from(temperature());
        assert!(matches!(unsealed.verified_id(), Err(MeshError::Codec(_))));
    }

    #[test]
    fn test_non_finite_values_get_distinct_identifiers() {
        let nan = LeafObject::new("x", "x", "", vec![f64::NAN]).seal();
        let inf = LeafObject::new("x", "x", "", vec![f64::INFINITY]).seal();
        let neg = LeafObject::new("x", "x", "", vec![f64::NEG_INFINITY]).seal();
        assert_ne!(nan.id, inf.id);
        assert_ne!(inf.id, neg.id);
        assert_ne!(nan.id, neg.id);

        // Every NaN is the same value as far as identity goes.
        let other_nan = LeafObject::new("x", "x", "", vec![-f64::NAN]).seal();
        assert_eq!(nan.id, other_nan.id);
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let leaf = LeafObject::new("x", "x", "", vec![f64::NAN, f64::INFINITY, -0.0, 1.5])
            .with_error(vec![f64::NEG_INFINITY])
            .seal();
        let json = serde_json::to_string(&leaf).unwrap();
        assert!(json.contains("\"NaN\""));

        let back: LeafObject = serde_json::from_str(&json).unwrap();
        assert!(back.data[0].is_nan());
        assert_eq!(back.data[1], f64::INFINITY);
        assert!(back.data[2] == 0.0 && back.data[2].is_sign_negative());
        assert_eq!(back.error, Some(vec![f64::NEG_INFINITY]));
        assert_eq!(back.compute_id(), *leaf.id.as_ref().unwrap());
    }

    #[test]
    fn test_unknown_special_value_is_rejected() {
        let json = r#"{"longname":"x","shortname":"x","data":["lots"]}"#;
        assert!(serde_json::from_str::<LeafObject>(json).is_err());
    }

    #[test]
    fn test_forged_column_identifier_fails_verification() {
        let victim = LeafObject::new("victim", "v", "", vec![1.0]).seal();
        let mut table = TableObject::new("t", "t", vec![LeafObject::new("evil", "e", "", vec![6.66])])
            .seal();
        table.columns[0].id = victim.id.clone();
        // The table hash covers recomputed column ids, so it stays consistent.
        table.id = Some(table.compute_id());

        let err = DataObject::from(table).verified_id().unwrap_err();
        assert!(matches!(err, MeshError::Integrity { .. }));
    }
}
