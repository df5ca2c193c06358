// ==============================================================================
// codec/study_entry.rs - Study Entry Codec
// ==============================================================================
// Description: Encodes per-file study entries into study documents and back
// Author: Matt Barham
// Created: 2026-09-30
// Modified: 2026-10-15
// Version: 1.2.0
// ==============================================================================
// One codec instance per sink worker: the study name cache is the only state.
// ==============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use super::attributes::{
    coerce_value, decode_source_line, encode_source_line, format_origin, parse_origin,
    ORIGIN_KEY, SOURCE_LINE_KEY,
};
use super::keys::{escape_key, unescape_key};
use super::samples::SampleCodec;
use super::stats::compute_stats;
use super::MalformedRecordError;
use crate::config::{LoadConfig, SrcInclusionPolicy};
use crate::models::{EncodedDocument, FileDocument, StudyEntry, VariantDocument, VariantRecord};
use crate::resolver::{StudyNameCache, StudyResolver};

/// Encoding switches taken from the load configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    pub src_inclusion: SrcInclusionPolicy,
    pub include_genotypes: bool,
    pub include_stats: bool,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            src_inclusion: SrcInclusionPolicy::None,
            include_genotypes: true,
            include_stats: false,
        }
    }
}

impl From<&LoadConfig> for CodecOptions {
    fn from(config: &LoadConfig) -> Self {
        Self {
            src_inclusion: config.src_inclusion,
            include_genotypes: config.include_genotypes,
            include_stats: config.include_stats,
        }
    }
}

pub struct StudyEntryCodec {
    options: CodecOptions,
    studies: StudyNameCache,
    samples: Arc<dyn SampleCodec>,
}

impl StudyEntryCodec {
    pub fn new(
        options: CodecOptions,
        resolver: Arc<dyn StudyResolver>,
        samples: Arc<dyn SampleCodec>,
    ) -> Self {
        Self {
            options,
            studies: StudyNameCache::new(resolver),
            samples,
        }
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Encode a full record: variant coordinates plus its study document
    pub fn encode_record(&self, record: &VariantRecord) -> Result<VariantDocument, MalformedRecordError> {
        Ok(VariantDocument {
            id: record.variant_id(),
            chromosome: record.chromosome.clone(),
            start: record.start,
            end: record.end,
            reference: record.reference.clone(),
            alternate: record.alternate.clone(),
            study: self.encode(&record.entry)?,
        })
    }

    /// Encode one study entry into a single-file study document
    pub fn encode(&self, entry: &StudyEntry) -> Result<EncodedDocument, MalformedRecordError> {
        let study_id = parse_identifier("study", &entry.study_id)?;
        let file = self.encode_file(entry)?;

        let genotypes = if self.options.include_genotypes && !entry.samples.is_empty() {
            Some(self.samples.encode_genotypes(&entry.samples, study_id)?)
        } else {
            None
        };

        let stats = if self.options.include_stats {
            entry.stats.clone().or_else(|| compute_stats(&entry.samples))
        } else {
            None
        };

        Ok(EncodedDocument {
            study_id,
            files: vec![file],
            genotypes,
            stats,
        })
    }

    /// Encode the file sub-document of a study entry
    pub fn encode_file(&self, entry: &StudyEntry) -> Result<FileDocument, MalformedRecordError> {
        let file_id = parse_identifier("file", entry.file_id.as_deref().unwrap_or_default())?;

        let mut attributes = BTreeMap::new();
        let mut origin = None;

        for (key, value) in &entry.attributes {
            match key.as_str() {
                ORIGIN_KEY => origin = Some(parse_origin(value)?),
                SOURCE_LINE_KEY => {
                    if let Some(line) = encode_source_line(value, self.options.src_inclusion)? {
                        attributes.insert(SOURCE_LINE_KEY.to_string(), line);
                    }
                }
                _ => {
                    attributes.insert(escape_key(key).into_owned(), coerce_value(value));
                }
            }
        }

        Ok(FileDocument {
            file_id,
            alternates: (!entry.secondary_alternates.is_empty())
                .then(|| entry.secondary_alternates.clone()),
            attributes: (!attributes.is_empty()).then_some(attributes),
            origin,
        })
    }

    /// Decode a study document into one entry
    ///
    /// With more than one matching file, attributes are merged into one map
    /// with keys prefixed by "<fileId>_" and the entry has no file id.
    /// Alternates come from the first matching file.
    pub fn decode(
        &mut self,
        document: &EncodedDocument,
        file_filter: Option<&[i32]>,
    ) -> Result<StudyEntry, MalformedRecordError> {
        let matched = matching_files(document, file_filter);
        let mut entry = self.decode_study(document)?;

        let prefixed = matched.len() > 1;
        if let [only] = matched.as_slice() {
            entry.file_id = Some(only.file_id.to_string());
        }
        if let Some(first) = matched.first() {
            entry.secondary_alternates = first.alternates.clone().unwrap_or_default();
        }

        for file in matched {
            for (key, value) in self.decode_attributes(file)? {
                let key = if prefixed {
                    format!("{}_{}", file.file_id, key)
                } else {
                    key
                };
                entry.attributes.insert(key, value);
            }
        }

        Ok(entry)
    }

    /// Decode a study document into one entry per matching file
    pub fn decode_per_file(
        &mut self,
        document: &EncodedDocument,
        file_filter: Option<&[i32]>,
    ) -> Result<Vec<StudyEntry>, MalformedRecordError> {
        let shared = self.decode_study(document)?;

        matching_files(document, file_filter)
            .into_iter()
            .map(|file| {
                let mut entry = shared.clone();
                entry.file_id = Some(file.file_id.to_string());
                entry.secondary_alternates = file.alternates.clone().unwrap_or_default();
                entry.attributes = self.decode_attributes(file)?;
                Ok(entry)
            })
            .collect()
    }

    /// Study-level part of an entry: resolved name, samples, stats
    fn decode_study(&mut self, document: &EncodedDocument) -> Result<StudyEntry, MalformedRecordError> {
        let study_name = self.studies.resolve(document.study_id).to_string();

        let samples = if self.options.include_genotypes && document.genotypes.is_some() {
            self.samples.decode_genotypes(document, document.study_id)?
        } else {
            Default::default()
        };

        Ok(StudyEntry {
            file_id: None,
            study_id: study_name,
            secondary_alternates: Vec::new(),
            attributes: BTreeMap::new(),
            samples,
            stats: document.stats.clone(),
        })
    }

    fn decode_attributes(
        &self,
        file: &FileDocument,
    ) -> Result<BTreeMap<String, String>, MalformedRecordError> {
        let mut decoded = BTreeMap::new();

        if let Some(attributes) = &file.attributes {
            for (key, value) in attributes {
                let key = unescape_key(key).into_owned();
                let value = if key == SOURCE_LINE_KEY {
                    decode_source_line(value, self.options.src_inclusion)?
                } else {
                    value.to_text()
                };
                if let Some(value) = value {
                    decoded.insert(key, value);
                }
            }
        }

        if let Some(origin) = &file.origin {
            decoded.insert(ORIGIN_KEY.to_string(), format_origin(origin));
        }

        Ok(decoded)
    }
}

fn matching_files<'a>(document: &'a EncodedDocument, filter: Option<&[i32]>) -> Vec<&'a FileDocument> {
    document
        .files
        .iter()
        .filter(|file| filter.map_or(true, |ids| ids.contains(&file.file_id)))
        .collect()
}

fn parse_identifier(field: &'static str, value: &str) -> Result<i32, MalformedRecordError> {
    value
        .trim()
        .parse::<i32>()
        .map_err(|_| MalformedRecordError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::GroupedGenotypeCodec;
    use crate::models::AttributeValue;
    use crate::resolver::StaticStudyResolver;

    const LINE: &str = "20\t14370\trs6054257\tG\tA,T\t29\tPASS\tNS=3;DP=14\tGT\t0|0\t1|0\t2/2";

    fn codec(options: CodecOptions) -> StudyEntryCodec {
        let samples = GroupedGenotypeCodec::new("0|0", true).with_study_samples(
            3,
            vec!["NA00001".to_string(), "NA00002".to_string(), "NA00003".to_string()],
        );
        StudyEntryCodec::new(
            options,
            Arc::new(StaticStudyResolver::new()),
            Arc::new(samples),
        )
    }

    fn entry() -> StudyEntry {
        let mut entry = StudyEntry::new("7", "3")
            .with_attribute("NS", "3")
            .with_attribute("DP", "14")
            .with_attribute("FILTER", "PASS")
            .with_attribute("CSQ.gene", "BRCA2")
            .with_attribute("ori", "chr20.vcf:112")
            .with_attribute("src", LINE)
            .with_sample("NA00001", "0|0")
            .with_sample("NA00002", "1|0")
            .with_sample("NA00003", "2/2");
        entry.secondary_alternates = vec!["T".to_string()];
        entry
    }

    fn full_src() -> CodecOptions {
        CodecOptions {
            src_inclusion: SrcInclusionPolicy::Full,
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip() {
        let mut codec = codec(full_src());
        let original = entry();

        let document = codec.encode(&original).unwrap();
        let decoded = codec.decode(&document, Some(&[7])).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_encoded_shape() {
        let codec = codec(full_src());
        let document = codec.encode(&entry()).unwrap();

        assert_eq!(document.study_id, 3);
        assert_eq!(document.files.len(), 1);

        let file = &document.files[0];
        assert_eq!(file.file_id, 7);
        assert_eq!(file.alternates, Some(vec!["T".to_string()]));
        assert_eq!(file.origin.as_ref().unwrap().partition, "chr20.vcf");
        assert_eq!(file.origin.as_ref().unwrap().line_index, 112);

        let attributes = file.attributes.as_ref().unwrap();
        assert_eq!(attributes.get("NS"), Some(&AttributeValue::Int(3)));
        assert_eq!(
            attributes.get("CSQ&#46;gene"),
            Some(&AttributeValue::Text("BRCA2".to_string()))
        );
        assert!(!attributes.contains_key("ori"));
        assert!(matches!(attributes.get("src"), Some(AttributeValue::Binary(_))));

        // Default genotype omitted from the grouped payload
        assert_eq!(
            document.genotypes,
            Some(serde_json::json!({"1|0": ["NA00002"], "2/2": ["NA00003"]}))
        );
    }

    #[test]
    fn test_empty_attributes_and_alternates_are_omitted() {
        let codec = codec(CodecOptions::default());
        let entry = StudyEntry::new("1", "3").with_attribute("src", LINE);

        let document = codec.encode(&entry).unwrap();
        let file = &document.files[0];

        assert!(file.attributes.is_none());
        assert!(file.alternates.is_none());
        assert!(file.origin.is_none());
        assert!(document.genotypes.is_none());

        let json = serde_json::to_value(&document).unwrap();
        assert_eq!(json, serde_json::json!({"studyId": 3, "files": [{"fileId": 1}]}));
    }

    #[test]
    fn test_src_not_restored_under_none() {
        let mut encoder = codec(full_src());
        let document = encoder.encode(&entry()).unwrap();

        let mut decoder = codec(CodecOptions::default());
        let decoded = decoder.decode(&document, None).unwrap();
        assert!(!decoded.attributes.contains_key("src"));

        let decoded = encoder.decode(&document, None).unwrap();
        assert_eq!(decoded.attributes.get("src").map(String::as_str), Some(LINE));
    }

    #[test]
    fn test_invalid_identifiers() {
        let codec = codec(CodecOptions::default());

        let bad_study = StudyEntry::new("1", "study-x");
        assert!(matches!(
            codec.encode(&bad_study),
            Err(MalformedRecordError::InvalidIdentifier { field: "study", .. })
        ));

        let bad_file = StudyEntry::new("file-x", "3");
        assert!(matches!(
            codec.encode(&bad_file),
            Err(MalformedRecordError::InvalidIdentifier { field: "file", .. })
        ));

        let mut no_file = StudyEntry::new("1", "3");
        no_file.file_id = None;
        assert!(codec.encode(&no_file).is_err());
    }

    #[test]
    fn test_malformed_origin_fails_encode() {
        let codec = codec(CodecOptions::default());
        let entry = StudyEntry::new("1", "3").with_attribute("ori", "missing-colon");

        assert!(matches!(
            codec.encode(&entry),
            Err(MalformedRecordError::MalformedOrigin(_))
        ));
    }

    #[test]
    fn test_study_name_resolution() {
        let samples = GroupedGenotypeCodec::new("0/0", true);
        let mut named = StudyEntryCodec::new(
            CodecOptions::default(),
            Arc::new(StaticStudyResolver::new().with_study(3, "1000genomes")),
            Arc::new(samples),
        );

        let document = named.encode(&StudyEntry::new("1", "3")).unwrap();
        assert_eq!(named.decode(&document, None).unwrap().study_id, "1000genomes");
    }

    fn merged_document(codec: &StudyEntryCodec) -> EncodedDocument {
        let mut first = StudyEntry::new("7", "3")
            .with_attribute("DP", "14")
            .with_attribute("ori", "a.vcf:1");
        first.secondary_alternates = vec!["T".to_string()];
        let mut second = StudyEntry::new("8", "3")
            .with_attribute("DP", "20")
            .with_attribute("ori", "b.vcf:9");
        second.secondary_alternates = vec!["C".to_string()];

        let mut document = codec.encode(&first).unwrap();
        document.merge(codec.encode(&second).unwrap());
        document
    }

    #[test]
    fn test_multi_file_decode_prefixes_attributes() {
        let mut codec = codec(CodecOptions::default());
        let document = merged_document(&codec);

        let decoded = codec.decode(&document, None).unwrap();

        assert_eq!(decoded.file_id, None);
        assert_eq!(decoded.secondary_alternates, vec!["T".to_string()]);
        assert_eq!(decoded.attributes.get("7_DP").map(String::as_str), Some("14"));
        assert_eq!(decoded.attributes.get("8_DP").map(String::as_str), Some("20"));
        assert_eq!(decoded.attributes.get("8_ori").map(String::as_str), Some("b.vcf:9"));
        assert!(!decoded.attributes.contains_key("DP"));
    }

    #[test]
    fn test_file_filter() {
        let mut codec = codec(CodecOptions::default());
        let document = merged_document(&codec);

        let decoded = codec.decode(&document, Some(&[8])).unwrap();
        assert_eq!(decoded.file_id.as_deref(), Some("8"));
        assert_eq!(decoded.secondary_alternates, vec!["C".to_string()]);
        assert_eq!(decoded.attributes.get("DP").map(String::as_str), Some("20"));

        let decoded = codec.decode(&document, Some(&[99])).unwrap();
        assert_eq!(decoded.file_id, None);
        assert!(decoded.attributes.is_empty());
    }

    #[test]
    fn test_decode_per_file() {
        let mut codec = codec(CodecOptions::default());
        let document = merged_document(&codec);

        let entries = codec.decode_per_file(&document, None).unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_id.as_deref(), Some("7"));
        assert_eq!(entries[0].attributes.get("DP").map(String::as_str), Some("14"));
        assert_eq!(entries[1].file_id.as_deref(), Some("8"));
        assert_eq!(entries[1].secondary_alternates, vec!["C".to_string()]);
        assert_eq!(entries[1].attributes.get("ori").map(String::as_str), Some("b.vcf:9"));
    }

    #[test]
    fn test_stats_included_on_request() {
        let codec = codec(CodecOptions {
            include_stats: true,
            ..Default::default()
        });

        let document = codec.encode(&entry()).unwrap();
        let stats = document.stats.unwrap();

        assert_eq!(stats.ref_allele_count, 3);
        assert_eq!(stats.alt_allele_count, 3);
    }

    #[test]
    fn test_genotypes_excluded() {
        let mut codec = codec(CodecOptions {
            include_genotypes: false,
            ..Default::default()
        });

        let document = codec.encode(&entry()).unwrap();
        assert!(document.genotypes.is_none());
        assert!(codec.decode(&document, None).unwrap().samples.is_empty());
    }
}
