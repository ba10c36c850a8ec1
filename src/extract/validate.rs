//! Typed validation of LLM extractor output.
//!
//! The extractor returns loosely-typed JSON. Everything passes through
//! these parsers before touching the graph; a failed parse produces the
//! error list that is fed back to the model on its single retry.

use crate::graph::types::{ClaimType, FragmentType, Granularity, HeadingLevel};
use serde::Deserialize;

/// Errors found while validating one batch of LLM output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors {
    pub errors: Vec<String>,
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.errors.join("; "))
    }
}

/// A validated fragment from the extractor, pre-persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFragment {
    pub fragment_type: FragmentType,
    pub text: String,
    pub heading_hierarchy: Vec<HeadingLevel>,
}

/// A validated claim from the extractor, pre-persistence.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClaim {
    pub text: String,
    pub claim_type: ClaimType,
    pub granularity: Granularity,
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
struct FragmentEnvelope {
    fragments: Vec<LooseFragment>,
}

#[derive(Debug, Deserialize)]
struct LooseFragment {
    #[serde(default, rename = "type")]
    fragment_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    headings: Vec<LooseHeading>,
}

#[derive(Debug, Deserialize)]
struct LooseHeading {
    #[serde(default)]
    level: Option<u8>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimEnvelope {
    claims: Vec<LooseClaim>,
}

#[derive(Debug, Deserialize)]
struct LooseClaim {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "type")]
    claim_type: Option<String>,
    #[serde(default)]
    granularity: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse and validate a fragment batch. Accepts `{"fragments": [...]}` or a
/// bare array.
pub fn parse_fragments(json: &str) -> Result<Vec<RawFragment>, ValidationErrors> {
    let loose: Vec<LooseFragment> = parse_envelope(json, "fragments")
        .map_err(|e| ValidationErrors { errors: vec![e] })?;

    let mut errors = Vec::new();
    let mut fragments = Vec::new();
    for (i, fragment) in loose.into_iter().enumerate() {
        let text = match fragment.text {
            Some(t) if !t.trim().is_empty() => t,
            _ => {
                errors.push(format!("fragments[{}].text: missing or empty", i));
                continue;
            }
        };
        let fragment_type = match fragment.fragment_type.as_deref() {
            Some(raw) => match FragmentType::parse(raw) {
                Some(t) => t,
                None => {
                    errors.push(format!("fragments[{}].type: unknown '{}'", i, raw));
                    continue;
                }
            },
            None => FragmentType::Paragraph,
        };
        let heading_hierarchy = fragment
            .headings
            .into_iter()
            .filter_map(|h| {
                h.text.map(|text| HeadingLevel {
                    level: h.level.unwrap_or(1),
                    text,
                })
            })
            .collect();
        fragments.push(RawFragment {
            fragment_type,
            text,
            heading_hierarchy,
        });
    }

    if !errors.is_empty() {
        return Err(ValidationErrors { errors });
    }
    Ok(fragments)
}

/// Parse and validate a claim batch. Accepts `{"claims": [...]}` or a bare
/// array.
pub fn parse_claims(json: &str) -> Result<Vec<RawClaim>, ValidationErrors> {
    let loose: Vec<LooseClaim> =
        parse_envelope(json, "claims").map_err(|e| ValidationErrors { errors: vec![e] })?;

    let mut errors = Vec::new();
    let mut claims = Vec::new();
    for (i, claim) in loose.into_iter().enumerate() {
        let text = match claim.text {
            Some(t) if !t.trim().is_empty() => t,
            _ => {
                errors.push(format!("claims[{}].text: missing or empty", i));
                continue;
            }
        };
        let claim_type = match claim.claim_type.as_deref() {
            Some(raw) => match ClaimType::parse(raw) {
                Some(t) => t,
                None => {
                    errors.push(format!("claims[{}].type: unknown '{}'", i, raw));
                    continue;
                }
            },
            None => ClaimType::Factual,
        };
        let granularity = match claim.granularity.as_deref() {
            Some(raw) => match Granularity::parse(raw) {
                Some(g) => g,
                None => {
                    errors.push(format!("claims[{}].granularity: unknown '{}'", i, raw));
                    continue;
                }
            },
            None => Granularity::Atomic,
        };
        let confidence = claim.confidence.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&confidence) {
            errors.push(format!(
                "claims[{}].confidence: {} outside [0, 1]",
                i, confidence
            ));
            continue;
        }
        claims.push(RawClaim {
            text,
            claim_type,
            granularity,
            confidence,
        });
    }

    if !errors.is_empty() {
        return Err(ValidationErrors { errors });
    }
    Ok(claims)
}

fn parse_envelope<T: serde::de::DeserializeOwned>(
    json: &str,
    key: &str,
) -> Result<Vec<T>, String> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| format!("invalid JSON: {}", e))?;
    let array = match &value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => match map.get(key) {
            Some(serde_json::Value::Array(items)) => items.clone(),
            _ => return Err(format!("expected top-level array or '{}' key", key)),
        },
        _ => return Err(format!("expected top-level array or '{}' key", key)),
    };
    array
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(|e| format!("bad item: {}", e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_fragments_envelope() {
        let json = r#"{"fragments": [
            {"type": "heading", "text": "Results", "headings": []},
            {"type": "paragraph", "text": "HbA1c fell by 0.8%.",
             "headings": [{"level": 2, "text": "Results"}]}
        ]}"#;
        let fragments = parse_fragments(json).unwrap();
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].fragment_type, FragmentType::Heading);
        assert_eq!(fragments[1].heading_hierarchy.len(), 1);
    }

    #[test]
    fn test_parse_fragments_bare_array() {
        let json = r#"[{"text": "plain"}]"#;
        let fragments = parse_fragments(json).unwrap();
        assert_eq!(fragments[0].fragment_type, FragmentType::Paragraph);
    }

    #[test]
    fn test_parse_claims_ok() {
        let json = r#"{"claims": [
            {"text": "DPP-4 inhibitors reduce HbA1c", "type": "causal",
             "granularity": "atomic", "confidence": 0.85}
        ]}"#;
        let claims = parse_claims(json).unwrap();
        assert_eq!(claims[0].claim_type, ClaimType::Causal);
        assert_eq!(claims[0].confidence, 0.85);
    }

    #[test]
    fn test_invalid_json_reports_error() {
        let err = parse_claims("{not json").unwrap_err();
        assert!(err.errors[0].contains("invalid JSON"));
    }

    #[test]
    fn test_bad_fields_collected_with_paths() {
        let json = r#"{"claims": [
            {"text": "", "type": "causal"},
            {"text": "ok", "type": "mystery"},
            {"text": "ok", "confidence": 1.5}
        ]}"#;
        let err = parse_claims(json).unwrap_err();
        assert_eq!(err.errors.len(), 3);
        assert!(err.errors[0].contains("claims[0].text"));
        assert!(err.errors[1].contains("claims[1].type"));
        assert!(err.errors[2].contains("claims[2].confidence"));
    }

    #[test]
    fn test_wrong_envelope_key() {
        let err = parse_fragments(r#"{"items": []}"#).unwrap_err();
        assert!(err.errors[0].contains("fragments"));
    }
}
