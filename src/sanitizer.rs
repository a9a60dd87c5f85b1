//! Rule-based sanitization of sensitive fields before non-production writes.
//!
//! Rules are declarative and versioned. A rule targets a field by exact name,
//! by a field-name pattern, or by sensitivity category; the most specific
//! match wins. Every declared sensitive field of the target schema must be
//! covered, otherwise the whole job fails closed.
//!
//! Hashed values carry a tag keyed by the sanitizer's hash key, so only values
//! this hub hashed are recognized and left alone on a second pass.

use crate::connectors::Record;
use crate::error::{HubError, Result};
use crate::target_schema::{Sensitivity, TargetSchema};
use chrono::{DateTime, Utc};
use rand::RngCore;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const HASH_PREFIX: &str = "sha256:";
const HASH_TAG_BYTES: usize = 8;
const MASK_CHAR: char = '*';
const DEFAULT_MASK_VISIBLE: usize = 4;
const DEFAULT_TRUNCATE_LEN: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Replace all but the last `keep` characters with `*`.
    Mask,
    NullOut,
    /// `sha256:<hex>.<tag>` keyed digest of the value.
    Hash,
    /// Keep the first `keep` characters.
    Truncate,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mask => "mask",
            Self::NullOut => "null-out",
            Self::Hash => "hash",
            Self::Truncate => "truncate",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizationRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Regex matched against field names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Sensitivity>,
    pub strategy: Strategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SanitizationRuleSet {
    pub version: String,
    pub rules: Vec<SanitizationRule>,
}

impl SanitizationRuleSet {
    /// Rules used when no rule document is configured.
    pub fn builtin() -> Self {
        let by_category = |category, strategy| SanitizationRule {
            field: None,
            pattern: None,
            category: Some(category),
            strategy,
            keep: None,
        };
        Self {
            version: "builtin-1".to_string(),
            rules: vec![
                SanitizationRule {
                    field: Some("owner_tax_id".to_string()),
                    pattern: None,
                    category: None,
                    strategy: Strategy::Hash,
                    keep: None,
                },
                by_category(Sensitivity::PersonalIdentifier, Strategy::Mask),
                by_category(Sensitivity::Financial, Strategy::Mask),
                by_category(Sensitivity::Credential, Strategy::NullOut),
            ],
        }
    }
}

/// One applied sanitization action. Never carries the original value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub job_id: String,
    pub field: String,
    pub strategy: String,
    pub rule_version: String,
    pub applied_at: DateTime<Utc>,
}

struct CompiledRule {
    rule: SanitizationRule,
    pattern: Option<Regex>,
}

/// A rule set with its field-name patterns compiled.
pub struct Sanitizer {
    version: String,
    rules: Vec<CompiledRule>,
    hash_key: Vec<u8>,
}

impl Sanitizer {
    /// Compile a rule set. Rules with an invalid pattern are skipped with a warning.
    pub fn compile(rule_set: &SanitizationRuleSet) -> Self {
        let mut rules = Vec::new();
        for rule in &rule_set.rules {
            let pattern = match &rule.pattern {
                Some(p) => match Regex::new(p) {
                    Ok(re) => Some(re),
                    Err(e) => {
                        warn!("Skipping sanitization rule with invalid pattern '{}': {}", p, e);
                        continue;
                    }
                },
                None => None,
            };
            if rule.field.is_none() && pattern.is_none() && rule.category.is_none() {
                warn!("Skipping sanitization rule with no field, pattern or category");
                continue;
            }
            rules.push(CompiledRule {
                rule: rule.clone(),
                pattern,
            });
        }
        debug!("Compiled {} sanitization rule(s), version {}", rules.len(), rule_set.version);
        let mut hash_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut hash_key);
        Self {
            version: rule_set.version.clone(),
            rules,
            hash_key,
        }
    }

    /// Use a fixed hash key so hashed values stay stable across restarts.
    pub fn with_hash_key(mut self, key: &[u8]) -> Self {
        self.hash_key = key.to_vec();
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    fn rule_for(&self, field: &str, category: Option<Sensitivity>) -> Option<&SanitizationRule> {
        let exact = self
            .rules
            .iter()
            .find(|r| r.rule.field.as_deref() == Some(field));
        let patterned = || {
            self.rules
                .iter()
                .find(|r| r.pattern.as_ref().map(|p| p.is_match(field)).unwrap_or(false))
        };
        let categorized = || {
            category.and_then(|c| self.rules.iter().find(|r| r.rule.category == Some(c)))
        };
        exact.or_else(patterned).or_else(categorized).map(|r| &r.rule)
    }

    /// Fail unless every declared sensitive field has a rule.
    pub fn check_coverage(&self, schema: &TargetSchema) -> Result<()> {
        let uncovered: Vec<&str> = schema
            .sensitive_fields()
            .filter(|f| self.rule_for(f.name, f.sensitivity).is_none())
            .map(|f| f.name)
            .collect();
        if uncovered.is_empty() {
            Ok(())
        } else {
            Err(HubError::Sanitization(format!(
                "no rule in set {} for sensitive field(s): {}",
                self.version,
                uncovered.join(", ")
            )))
        }
    }

    /// Sanitize one target-shaped record. Re-sanitizing the output is a no-op.
    pub fn sanitize(
        &self,
        record: &Record,
        schema: &TargetSchema,
        job_id: &str,
    ) -> Result<(Record, Vec<AuditEntry>)> {
        self.check_coverage(schema)?;

        let mut out = record.clone();
        let mut audit = Vec::new();
        for (field, value) in out.iter_mut() {
            let category = schema.field(field).and_then(|f| f.sensitivity);
            let Some(rule) = self.rule_for(field, category) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            *value = self.apply_strategy(rule, value);
            audit.push(AuditEntry {
                job_id: job_id.to_string(),
                field: field.clone(),
                strategy: rule.strategy.as_str().to_string(),
                rule_version: self.version.clone(),
                applied_at: Utc::now(),
            });
        }
        Ok((out, audit))
    }

    fn apply_strategy(&self, rule: &SanitizationRule, value: &Value) -> Value {
        match rule.strategy {
            Strategy::NullOut => Value::Null,
            Strategy::Mask => {
                let text = as_text(value);
                let keep = rule.keep.unwrap_or(DEFAULT_MASK_VISIBLE);
                let len = text.chars().count();
                let masked: String = if len <= keep {
                    std::iter::repeat(MASK_CHAR).take(len).collect()
                } else {
                    text.chars()
                        .enumerate()
                        .map(|(i, c)| if i < len - keep { MASK_CHAR } else { c })
                        .collect()
                };
                Value::String(masked)
            }
            Strategy::Hash => {
                let text = as_text(value);
                if self.is_hashed(&text) {
                    return Value::String(text);
                }
                let digest = hex(&self.keyed_digest(0, text.as_bytes()));
                let tag = hex(&self.keyed_digest(1, digest.as_bytes())[..HASH_TAG_BYTES]);
                Value::String(format!("{}{}.{}", HASH_PREFIX, digest, tag))
            }
            Strategy::Truncate => {
                let keep = rule.keep.unwrap_or(DEFAULT_TRUNCATE_LEN);
                Value::String(as_text(value).chars().take(keep).collect())
            }
        }
    }

    fn keyed_digest(&self, domain: u8, data: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.hash_key);
        hasher.update([domain]);
        hasher.update(data);
        hasher.finalize().to_vec()
    }

    /// Whether `text` is a digest produced with this sanitizer's key.
    fn is_hashed(&self, text: &str) -> bool {
        let Some((digest, tag)) = text
            .strip_prefix(HASH_PREFIX)
            .and_then(|rest| rest.split_once('.'))
        else {
            return false;
        };
        digest.len() == 64
            && tag == hex(&self.keyed_digest(1, digest.as_bytes())[..HASH_TAG_BYTES])
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DataType;
    use crate::target_schema::schema_for;
    use proptest::prelude::{any, Just};
    use proptest::strategy::Strategy as PropStrategy;
    use proptest::{prop_assert_eq, prop_oneof, proptest};

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_builtin_rules_cover_every_schema() {
        let sanitizer = Sanitizer::compile(&SanitizationRuleSet::builtin());
        for dt in DataType::ALL {
            assert!(sanitizer.check_coverage(schema_for(dt)).is_ok(), "{:?}", dt);
        }
    }

    #[test]
    fn test_strategies_and_audit() {
        let sanitizer = Sanitizer::compile(&SanitizationRuleSet::builtin());
        let schema = schema_for(DataType::Property);
        let input = record(&[
            ("parcel_id", Value::from("P-100")),
            ("owner_name", Value::from("Jane Q Public")),
            ("owner_tax_id", Value::from("123-45-6789")),
        ]);

        let (out, audit) = sanitizer.sanitize(&input, schema, "job_1").unwrap();
        assert_eq!(out["parcel_id"], Value::from("P-100"));
        assert_eq!(out["owner_name"], Value::from("*********blic"));
        assert!(out["owner_tax_id"].as_str().unwrap().starts_with(HASH_PREFIX));

        assert_eq!(audit.len(), 2);
        assert!(audit.iter().all(|a| a.job_id == "job_1" && a.rule_version == "builtin-1"));
        let rendered = serde_json::to_string(&audit).unwrap();
        assert!(!rendered.contains("Jane"));
        assert!(!rendered.contains("6789"));
    }

    #[test]
    fn test_missing_rule_fails_closed() {
        let rules = SanitizationRuleSet {
            version: "partial".into(),
            rules: vec![SanitizationRule {
                field: None,
                pattern: None,
                category: Some(Sensitivity::PersonalIdentifier),
                strategy: Strategy::Mask,
                keep: None,
            }],
        };
        let sanitizer = Sanitizer::compile(&rules);
        let schema = schema_for(DataType::Tax);
        let err = sanitizer
            .sanitize(&record(&[("tax_bill_id", Value::from("B1"))]), schema, "job")
            .unwrap_err();
        match err {
            HubError::Sanitization(msg) => {
                assert!(msg.contains("payment_account"));
                assert!(msg.contains("portal_pin"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pattern_rule_and_invalid_pattern_skipped() {
        let mut rules = SanitizationRuleSet::builtin();
        rules.rules.push(SanitizationRule {
            field: None,
            pattern: Some("(?i)address".into()),
            category: None,
            strategy: Strategy::Truncate,
            keep: Some(3),
        });
        rules.rules.push(SanitizationRule {
            field: None,
            pattern: Some("([".into()),
            category: None,
            strategy: Strategy::NullOut,
            keep: None,
        });
        let sanitizer = Sanitizer::compile(&rules);
        assert_eq!(sanitizer.rules.len(), 5);

        let (out, _) = sanitizer
            .sanitize(
                &record(&[("situs_address", Value::from("12 Elm St"))]),
                schema_for(DataType::Property),
                "job",
            )
            .unwrap();
        assert_eq!(out["situs_address"], Value::from("12 "));
    }

    #[test]
    fn test_hash_ignores_lookalike_raw_values() {
        let sanitizer = Sanitizer::compile(&SanitizationRuleSet::builtin());
        let schema = schema_for(DataType::Property);
        let lookalike = format!("{}{}", HASH_PREFIX, "ab".repeat(32));

        let (once, _) = sanitizer
            .sanitize(&record(&[("owner_tax_id", Value::from(lookalike.clone()))]), schema, "j")
            .unwrap();
        let hashed = once["owner_tax_id"].as_str().unwrap().to_string();
        assert_ne!(hashed, lookalike);
        assert!(hashed.starts_with(HASH_PREFIX));

        let (twice, audit) = sanitizer.sanitize(&once, schema, "j").unwrap();
        assert_eq!(twice["owner_tax_id"], Value::from(hashed.clone()));
        assert_eq!(audit.len(), 1);

        // A hash from another key is treated as raw input.
        let other = Sanitizer::compile(&SanitizationRuleSet::builtin());
        let (rehashed, _) = other.sanitize(&once, schema, "j").unwrap();
        assert_ne!(rehashed["owner_tax_id"], Value::from(hashed));
    }

    #[test]
    fn test_fixed_hash_key_is_stable() {
        let input = record(&[("owner_tax_id", Value::from("123-45-6789"))]);
        let schema = schema_for(DataType::Property);
        let a = Sanitizer::compile(&SanitizationRuleSet::builtin()).with_hash_key(b"county-key");
        let b = Sanitizer::compile(&SanitizationRuleSet::builtin()).with_hash_key(b"county-key");
        assert_eq!(
            a.sanitize(&input, schema, "j").unwrap().0,
            b.sanitize(&input, schema, "j").unwrap().0
        );
    }

    fn arb_value() -> impl PropStrategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            "[a-zA-Z0-9 *:-]{0,24}".prop_map(Value::String),
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::Bool),
        ]
    }

    proptest! {
        #[test]
        fn prop_sanitize_is_idempotent(
            owner in arb_value(),
            tax_id in arb_value(),
            address in arb_value(),
            payer in arb_value(),
            pin in arb_value(),
        ) {
            let mut rules = SanitizationRuleSet::builtin();
            rules.rules.push(SanitizationRule {
                field: Some("situs_address".into()),
                pattern: None,
                category: None,
                strategy: Strategy::Truncate,
                keep: Some(5),
            });
            let sanitizer = Sanitizer::compile(&rules);

            for (schema, input) in [
                (
                    schema_for(DataType::Property),
                    record(&[("owner_name", owner), ("owner_tax_id", tax_id), ("situs_address", address)]),
                ),
                (
                    schema_for(DataType::Tax),
                    record(&[("payer_name", payer), ("portal_pin", pin)]),
                ),
            ] {
                let (once, _) = sanitizer.sanitize(&input, schema, "j").unwrap();
                let (twice, _) = sanitizer.sanitize(&once, schema, "j").unwrap();
                prop_assert_eq!(once, twice);
            }
        }
    }
}
