// ==============================================================================
// models.rs - Variant Ingestion Data Models
// ==============================================================================
// Description: In-memory study entries and the persisted variant document shape
// Author: Matt Barham
// Created: 2026-09-28
// Modified: 2026-10-14
// Version: 1.2.0
// ==============================================================================
// Persisted shape (field names are part of the stored format):
//   { studyId, files: [{ fileId, alternates?, attributes?, origin? }],
//     genotypes?, stats? }
// ==============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-sample field table: sample name -> (format field -> value)
pub type SampleTable = BTreeMap<String, BTreeMap<String, String>>;

/// One file's contribution to one study at one variant position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyEntry {
    /// File identifier. `None` when a decoded entry merges several files.
    pub file_id: Option<String>,

    /// Study identifier (numeric id when encoding, resolved name after decoding)
    pub study_id: String,

    /// Alternate alleles beyond the primary one, in positional order
    pub secondary_alternates: Vec<String>,

    /// Open attribute bag (INFO fields, QUAL, FILTER, `src`, `ori`, ...)
    pub attributes: BTreeMap<String, String>,

    /// Per-sample genotype table
    pub samples: SampleTable,

    /// Genotype statistics, present only when computed or stored
    pub stats: Option<VariantStats>,
}

impl StudyEntry {
    pub fn new(file_id: impl Into<String>, study_id: impl Into<String>) -> Self {
        Self {
            file_id: Some(file_id.into()),
            study_id: study_id.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_sample(mut self, sample: impl Into<String>, genotype: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("GT".to_string(), genotype.into());
        self.samples.insert(sample.into(), fields);
        self
    }
}

/// A parsed variant observation for one file/study, produced by a source
#[derive(Debug, Clone, PartialEq)]
pub struct VariantRecord {
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub reference: String,
    pub alternate: String,
    pub entry: StudyEntry,
}

impl VariantRecord {
    /// Stable variant key ("chromosome:start:reference:alternate")
    pub fn variant_id(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.chromosome, self.start, self.reference, self.alternate
        )
    }
}

/// Typed attribute value stored in a file sub-document
///
/// Serialized untagged: numbers stay numbers, binary payloads use the
/// `{"$binary": "<base64>"}` form. Variant order matters for deserialization:
/// the narrowest numeric type that accepts the value wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int(i32),
    Long(i64),
    Double(f64),
    Binary(BinaryValue),
    Text(String),
}

impl AttributeValue {
    /// String form of a scalar value. Binary payloads have none.
    pub fn to_text(&self) -> Option<String> {
        match self {
            AttributeValue::Int(v) => Some(v.to_string()),
            AttributeValue::Long(v) => Some(v.to_string()),
            AttributeValue::Double(v) => Some(v.to_string()),
            AttributeValue::Text(v) => Some(v.clone()),
            AttributeValue::Binary(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryValue {
    #[serde(rename = "$binary", with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// Structured origin marker ("<partition>:<lineIndex>")
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    #[serde(rename = "s")]
    pub partition: String,
    #[serde(rename = "i")]
    pub line_index: i64,
}

/// File sub-document inside an encoded study document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    #[serde(rename = "fileId")]
    pub file_id: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternates: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<BTreeMap<String, AttributeValue>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

/// Compact persisted form of the study entries sharing one (variant, study)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedDocument {
    #[serde(rename = "studyId")]
    pub study_id: i32,

    #[serde(default)]
    pub files: Vec<FileDocument>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub genotypes: Option<serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<VariantStats>,
}

impl EncodedDocument {
    /// Fold another document for the same study into this one.
    ///
    /// File sub-documents are appended (an existing file id is replaced),
    /// genotype payloads are deep-merged and the newer stats win.
    pub fn merge(&mut self, other: EncodedDocument) {
        for file in other.files {
            match self.files.iter_mut().find(|f| f.file_id == file.file_id) {
                Some(existing) => *existing = file,
                None => self.files.push(file),
            }
        }

        self.genotypes = match (self.genotypes.take(), other.genotypes) {
            (Some(mut current), Some(incoming)) => {
                merge_json(&mut current, incoming);
                Some(current)
            }
            (current, incoming) => current.or(incoming),
        };

        if other.stats.is_some() {
            self.stats = other.stats;
        }
    }
}

/// Objects merge key-wise, arrays union in order, scalars are replaced
fn merge_json(target: &mut serde_json::Value, incoming: serde_json::Value) {
    use serde_json::Value;

    match (target, incoming) {
        (Value::Object(current), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match current.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        current.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(current), Value::Array(incoming)) => {
            for value in incoming {
                if !current.contains(&value) {
                    current.push(value);
                }
            }
        }
        (target, incoming) => *target = incoming,
    }
}

/// Document as handed to a store: variant coordinates plus the study document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDocument {
    pub id: String,
    pub chromosome: String,
    pub start: u64,
    pub end: u64,
    pub reference: String,
    pub alternate: String,
    pub study: EncodedDocument,
}

impl VariantDocument {
    /// Storage key: one document per (variant, study)
    pub fn key(&self) -> (String, i32) {
        (self.id.clone(), self.study.study_id)
    }
}

/// Genotype statistics for one variant in one study
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantStats {
    pub ref_allele_count: u32,
    pub alt_allele_count: u32,
    pub missing_alleles: u32,
    pub missing_genotypes: u32,
    pub genotype_counts: BTreeMap<String, u32>,
    /// Minor allele frequency
    pub maf: f64,
    /// Minor genotype frequency
    pub mgf: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mgf_genotype: Option<String>,
}
