// ==============================================================================
// codec/attributes.rs - Attribute Value Encoding
// ==============================================================================
// Description: Numeric coercion, origin markers and the raw source line policy
// Author: Matt Barham
// Created: 2026-09-29
// Modified: 2026-10-09
// Version: 1.1.0
// ==============================================================================
// Coercion is lossy: "042" is stored as 42 and decodes as "42".
// ==============================================================================

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use super::MalformedRecordError;
use crate::config::SrcInclusionPolicy;
use crate::models::{AttributeValue, BinaryValue, Origin};

/// Raw original source line
pub const SOURCE_LINE_KEY: &str = "src";

/// "<partition>:<lineIndex>" pointer back into the input
pub const ORIGIN_KEY: &str = "ori";

/// Narrowest of int, long, double; otherwise the original string
pub fn coerce_value(value: &str) -> AttributeValue {
    if let Ok(v) = value.parse::<i32>() {
        return AttributeValue::Int(v);
    }
    if let Ok(v) = value.parse::<i64>() {
        return AttributeValue::Long(v);
    }
    match value.parse::<f64>() {
        // NaN and infinities have no JSON form
        Ok(v) if v.is_finite() => AttributeValue::Double(v),
        _ => AttributeValue::Text(value.to_string()),
    }
}

/// Split an origin marker on its last ':'
pub fn parse_origin(value: &str) -> Result<Origin, MalformedRecordError> {
    let (partition, index) = value
        .rsplit_once(':')
        .ok_or_else(|| MalformedRecordError::MalformedOrigin(value.to_string()))?;

    let line_index = index
        .trim()
        .parse::<i64>()
        .map_err(|_| MalformedRecordError::MalformedOrigin(value.to_string()))?;

    Ok(Origin {
        partition: partition.to_string(),
        line_index,
    })
}

pub fn format_origin(origin: &Origin) -> String {
    format!("{}:{}", origin.partition, origin.line_index)
}

/// Apply the inclusion policy to a raw source line
///
/// Returns `None` when the policy drops the line.
pub fn encode_source_line(
    line: &str,
    policy: SrcInclusionPolicy,
) -> Result<Option<AttributeValue>, MalformedRecordError> {
    let kept = match policy {
        SrcInclusionPolicy::None => return Ok(None),
        SrcInclusionPolicy::First8Columns => first_columns(line, 8),
        SrcInclusionPolicy::Full => line.to_string(),
    };

    Ok(Some(AttributeValue::Binary(BinaryValue {
        bytes: gzip(kept.as_bytes())?,
    })))
}

/// Restore a stored source line; nothing is restored under `NONE`
pub fn decode_source_line(
    value: &AttributeValue,
    policy: SrcInclusionPolicy,
) -> Result<Option<String>, MalformedRecordError> {
    if policy == SrcInclusionPolicy::None {
        return Ok(None);
    }

    match value {
        AttributeValue::Binary(binary) => {
            let bytes = gunzip(&binary.bytes)?;
            let line = String::from_utf8(bytes)
                .map_err(|e| MalformedRecordError::CorruptSourceLine(e.to_string()))?;
            Ok(Some(line))
        }
        // Uncompressed lines written by older loads
        other => Ok(other.to_text()),
    }
}

fn first_columns(line: &str, columns: usize) -> String {
    line.split('\t').take(columns).collect::<Vec<_>>().join("\t")
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, MalformedRecordError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, MalformedRecordError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| MalformedRecordError::CorruptSourceLine(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = "1\t10177\trs367896724\tA\tAC\t100\tPASS\tAC=2130;AF=0.425\tGT\t1|0\t0|1";

    #[test]
    fn test_coercion_picks_narrowest_type() {
        assert_eq!(coerce_value("42"), AttributeValue::Int(42));
        assert_eq!(coerce_value("-7"), AttributeValue::Int(-7));
        assert_eq!(coerce_value("3000000000"), AttributeValue::Long(3_000_000_000));
        assert_eq!(coerce_value("0.425"), AttributeValue::Double(0.425));
        assert_eq!(coerce_value("abc"), AttributeValue::Text("abc".to_string()));
        assert_eq!(coerce_value("PASS"), AttributeValue::Text("PASS".to_string()));
    }

    #[test]
    fn test_coercion_keeps_non_finite_as_text() {
        assert_eq!(coerce_value("NaN"), AttributeValue::Text("NaN".to_string()));
        assert_eq!(coerce_value("inf"), AttributeValue::Text("inf".to_string()));
    }

    #[test]
    fn test_coercion_is_lossy_for_numeric_strings() {
        // Leading zeros do not survive
        assert_eq!(coerce_value("042").to_text().unwrap(), "42");
    }

    #[test]
    fn test_origin_split_on_last_colon() {
        let origin = parse_origin("s3://bucket/chr1.vcf:1532").unwrap();
        assert_eq!(origin.partition, "s3://bucket/chr1.vcf");
        assert_eq!(origin.line_index, 1532);
        assert_eq!(format_origin(&origin), "s3://bucket/chr1.vcf:1532");
    }

    #[test]
    fn test_malformed_origin() {
        assert!(matches!(
            parse_origin("no-colon-here"),
            Err(MalformedRecordError::MalformedOrigin(_))
        ));
        assert!(matches!(
            parse_origin("part:abc"),
            Err(MalformedRecordError::MalformedOrigin(_))
        ));
    }

    #[test]
    fn test_src_policy_none_drops_line() {
        assert!(encode_source_line(LINE, SrcInclusionPolicy::None).unwrap().is_none());
    }

    #[test]
    fn test_src_policy_first_8_columns() {
        let encoded = encode_source_line(LINE, SrcInclusionPolicy::First8Columns)
            .unwrap()
            .unwrap();
        assert!(matches!(encoded, AttributeValue::Binary(_)));

        let decoded = decode_source_line(&encoded, SrcInclusionPolicy::First8Columns)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.split('\t').count(), 8);
        assert_eq!(decoded, "1\t10177\trs367896724\tA\tAC\t100\tPASS\tAC=2130;AF=0.425");
    }

    #[test]
    fn test_src_policy_first_8_columns_short_line() {
        let encoded = encode_source_line("1\t100\t.", SrcInclusionPolicy::First8Columns)
            .unwrap()
            .unwrap();
        let decoded = decode_source_line(&encoded, SrcInclusionPolicy::First8Columns)
            .unwrap()
            .unwrap();
        assert_eq!(decoded, "1\t100\t.");
    }

    #[test]
    fn test_src_policy_full_round_trip() {
        let encoded = encode_source_line(LINE, SrcInclusionPolicy::Full).unwrap().unwrap();
        let decoded = decode_source_line(&encoded, SrcInclusionPolicy::Full).unwrap().unwrap();
        assert_eq!(decoded, LINE);
    }

    #[test]
    fn test_decode_skipped_under_none() {
        let encoded = encode_source_line(LINE, SrcInclusionPolicy::Full).unwrap().unwrap();
        assert!(decode_source_line(&encoded, SrcInclusionPolicy::None).unwrap().is_none());
    }

    #[test]
    fn test_corrupt_source_line() {
        let value = AttributeValue::Binary(BinaryValue { bytes: vec![0, 1, 2, 3] });
        assert!(matches!(
            decode_source_line(&value, SrcInclusionPolicy::Full),
            Err(MalformedRecordError::CorruptSourceLine(_))
        ));
    }
}
