// ==============================================================================
// codec/samples.rs - Genotype Sample Codec
// ==============================================================================
// Description: Encodes the per-sample genotype table stored under `genotypes`
// Author: Matt Barham
// Created: 2026-09-30
// Modified: 2026-10-11
// Version: 1.1.0
// ==============================================================================
// Payload forms:
//   uncompressed: { "<sample>": { "GT": "0|1", "DS": "0.98" } }
//   compressed:   { "<genotype>": ["<sample>", ...] }   (default genotype omitted)
// Decoding accepts either form regardless of configuration.
// ==============================================================================

use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

use super::keys::{escape_key, unescape_key};
use super::MalformedRecordError;
use crate::models::{EncodedDocument, SampleTable};

const GENOTYPE_FIELD: &str = "GT";

/// Sample-level encoding collaborator used by the study entry codec
pub trait SampleCodec: Send + Sync {
    fn encode_genotypes(
        &self,
        samples: &SampleTable,
        study_id: i32,
    ) -> Result<Value, MalformedRecordError>;

    fn decode_genotypes(
        &self,
        document: &EncodedDocument,
        study_id: i32,
    ) -> Result<SampleTable, MalformedRecordError>;
}

/// Groups samples by genotype, leaving out the default genotype
#[derive(Debug, Clone)]
pub struct GroupedGenotypeCodec {
    default_genotype: String,
    compress: bool,
    /// Known sample names per study, used to restore omitted defaults
    study_samples: HashMap<i32, Vec<String>>,
}

impl GroupedGenotypeCodec {
    pub fn new(default_genotype: impl Into<String>, compress: bool) -> Self {
        Self {
            default_genotype: default_genotype.into(),
            compress,
            study_samples: HashMap::new(),
        }
    }

    pub fn with_study_samples(mut self, study_id: i32, samples: Vec<String>) -> Self {
        self.study_samples.insert(study_id, samples);
        self
    }

    fn encode_grouped(&self, samples: &SampleTable) -> Value {
        let mut groups: BTreeMap<String, Vec<Value>> = BTreeMap::new();

        for (sample, fields) in samples {
            let genotype = match fields.get(GENOTYPE_FIELD) {
                Some(gt) => gt,
                None => continue,
            };
            if *genotype == self.default_genotype {
                continue;
            }
            groups
                .entry(escape_key(genotype).into_owned())
                .or_default()
                .push(Value::String(sample.clone()));
        }

        Value::Object(
            groups
                .into_iter()
                .map(|(gt, names)| (gt, Value::Array(names)))
                .collect(),
        )
    }

    fn encode_verbatim(&self, samples: &SampleTable) -> Value {
        let mut out = Map::new();
        for (sample, fields) in samples {
            let fields: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (escape_key(k).into_owned(), Value::String(v.clone())))
                .collect();
            out.insert(escape_key(sample).into_owned(), Value::Object(fields));
        }
        Value::Object(out)
    }
}

impl SampleCodec for GroupedGenotypeCodec {
    fn encode_genotypes(
        &self,
        samples: &SampleTable,
        _study_id: i32,
    ) -> Result<Value, MalformedRecordError> {
        Ok(if self.compress {
            self.encode_grouped(samples)
        } else {
            self.encode_verbatim(samples)
        })
    }

    fn decode_genotypes(
        &self,
        document: &EncodedDocument,
        study_id: i32,
    ) -> Result<SampleTable, MalformedRecordError> {
        let mut table = SampleTable::new();

        let payload = match &document.genotypes {
            Some(Value::Object(payload)) => payload,
            Some(other) => {
                return Err(MalformedRecordError::InvalidGenotypes(format!(
                    "expected an object, found {}",
                    other
                )))
            }
            None => return Ok(table),
        };

        let mut grouped = false;
        for (key, value) in payload {
            let key = unescape_key(key).into_owned();
            match value {
                Value::Array(names) => {
                    grouped = true;
                    for name in names {
                        let name = name.as_str().ok_or_else(|| {
                            MalformedRecordError::InvalidGenotypes(format!(
                                "sample name is not a string: {}",
                                name
                            ))
                        })?;
                        let mut fields = BTreeMap::new();
                        fields.insert(GENOTYPE_FIELD.to_string(), key.clone());
                        table.insert(name.to_string(), fields);
                    }
                }
                Value::Object(fields) => {
                    let mut decoded = BTreeMap::new();
                    for (field, v) in fields {
                        let v = match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        decoded.insert(unescape_key(field).into_owned(), v);
                    }
                    table.insert(key, decoded);
                }
                other => {
                    return Err(MalformedRecordError::InvalidGenotypes(format!(
                        "unexpected value for '{}': {}",
                        key, other
                    )))
                }
            }
        }

        if grouped || payload.is_empty() {
            if let Some(known) = self.study_samples.get(&study_id) {
                for sample in known {
                    table.entry(sample.clone()).or_insert_with(|| {
                        let mut fields = BTreeMap::new();
                        fields.insert(GENOTYPE_FIELD.to_string(), self.default_genotype.clone());
                        fields
                    });
                }
            }
        }

        Ok(table)
    }
}
