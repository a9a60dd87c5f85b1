//! Fixed, versioned target schemas per logical data type.
//!
//! Separate from `models.rs` since these are compiled-in definitions rather than
//! administrator-managed records: mappings may only point at fields listed here.

use crate::models::DataType;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;

pub const SCHEMA_VERSION: &str = "2024.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Text,
    Number,
    Integer,
    Date,
    Timestamp,
    Boolean,
}

/// Category of sensitive data. Fields carrying one must be covered by a
/// sanitization rule before they are written to a non-production target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Sensitivity {
    PersonalIdentifier,
    Credential,
    Financial,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetField {
    pub name: &'static str,
    pub field_type: FieldType,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<Sensitivity>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSchema {
    pub data_type: DataType,
    pub version: &'static str,
    /// Natural key used to match source and target records.
    pub key_field: &'static str,
    /// Last-modified field used for conflict resolution.
    pub timestamp_field: &'static str,
    pub fields: &'static [TargetField],
}

impl TargetSchema {
    pub fn field(&self, name: &str) -> Option<&TargetField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &TargetField> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn sensitive_fields(&self) -> impl Iterator<Item = &TargetField> {
        self.fields.iter().filter(|f| f.sensitivity.is_some())
    }
}

const fn field(name: &'static str, field_type: FieldType, required: bool) -> TargetField {
    TargetField {
        name,
        field_type,
        required,
        sensitivity: None,
    }
}

const fn sensitive(name: &'static str, category: Sensitivity) -> TargetField {
    TargetField {
        name,
        field_type: FieldType::Text,
        required: false,
        sensitivity: Some(category),
    }
}

static PROPERTY_FIELDS: [TargetField; 15] = [
    field("parcel_id", FieldType::Text, true),
    field("situs_address", FieldType::Text, true),
    field("city", FieldType::Text, false),
    field("state", FieldType::Text, false),
    field("zip_code", FieldType::Text, false),
    sensitive("owner_name", Sensitivity::PersonalIdentifier),
    sensitive("owner_tax_id", Sensitivity::PersonalIdentifier),
    field("property_class", FieldType::Text, false),
    field("assessed_value", FieldType::Number, true),
    field("land_value", FieldType::Number, false),
    field("improvement_value", FieldType::Number, false),
    field("year_built", FieldType::Integer, false),
    field("latitude", FieldType::Number, false),
    field("longitude", FieldType::Number, false),
    field("last_modified", FieldType::Timestamp, true),
];

static SALES_FIELDS: [TargetField; 10] = [
    field("sale_id", FieldType::Text, true),
    field("parcel_id", FieldType::Text, true),
    field("sale_date", FieldType::Date, true),
    field("sale_price", FieldType::Number, true),
    field("deed_type", FieldType::Text, false),
    field("qualified_sale", FieldType::Boolean, false),
    sensitive("buyer_name", Sensitivity::PersonalIdentifier),
    sensitive("seller_name", Sensitivity::PersonalIdentifier),
    sensitive("financing_account", Sensitivity::Financial),
    field("last_modified", FieldType::Timestamp, true),
];

static VALUATION_FIELDS: [TargetField; 9] = [
    field("valuation_id", FieldType::Text, true),
    field("parcel_id", FieldType::Text, true),
    field("tax_year", FieldType::Integer, true),
    field("market_value", FieldType::Number, true),
    field("assessed_value", FieldType::Number, false),
    field("valuation_method", FieldType::Text, false),
    field("appraiser_id", FieldType::Text, false),
    field("valuation_date", FieldType::Date, false),
    field("last_modified", FieldType::Timestamp, true),
];

static TAX_FIELDS: [TargetField; 10] = [
    field("tax_bill_id", FieldType::Text, true),
    field("parcel_id", FieldType::Text, true),
    field("tax_year", FieldType::Integer, true),
    field("amount_due", FieldType::Number, true),
    field("amount_paid", FieldType::Number, false),
    field("due_date", FieldType::Date, false),
    sensitive("payer_name", Sensitivity::PersonalIdentifier),
    sensitive("payment_account", Sensitivity::Financial),
    sensitive("portal_pin", Sensitivity::Credential),
    field("last_modified", FieldType::Timestamp, true),
];

static PROPERTY: TargetSchema = TargetSchema {
    data_type: DataType::Property,
    version: SCHEMA_VERSION,
    key_field: "parcel_id",
    timestamp_field: "last_modified",
    fields: &PROPERTY_FIELDS,
};

static SALES: TargetSchema = TargetSchema {
    data_type: DataType::Sales,
    version: SCHEMA_VERSION,
    key_field: "sale_id",
    timestamp_field: "last_modified",
    fields: &SALES_FIELDS,
};

static VALUATION: TargetSchema = TargetSchema {
    data_type: DataType::Valuation,
    version: SCHEMA_VERSION,
    key_field: "valuation_id",
    timestamp_field: "last_modified",
    fields: &VALUATION_FIELDS,
};

static TAX: TargetSchema = TargetSchema {
    data_type: DataType::Tax,
    version: SCHEMA_VERSION,
    key_field: "tax_bill_id",
    timestamp_field: "last_modified",
    fields: &TAX_FIELDS,
};

/// The fixed target schema for a data type.
pub fn schema_for(data_type: DataType) -> &'static TargetSchema {
    match data_type {
        DataType::Property => &PROPERTY,
        DataType::Sales => &SALES,
        DataType::Valuation => &VALUATION,
        DataType::Tax => &TAX,
    }
}

// ============================================================================
// Type conformance
// ============================================================================

impl FieldType {
    /// Check that a non-null value conforms to this type.
    pub fn check(&self, value: &Value) -> Result<(), String> {
        let ok = match self {
            Self::Text => value.is_string() || value.is_number() || value.is_boolean(),
            Self::Number => match value {
                Value::Number(_) => true,
                Value::String(s) => s.trim().parse::<f64>().is_ok(),
                _ => false,
            },
            Self::Integer => match value {
                Value::Number(n) => n.is_i64() || n.is_u64(),
                Value::String(s) => s.trim().parse::<i64>().is_ok(),
                _ => false,
            },
            Self::Date => value
                .as_str()
                .map(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").is_ok())
                .unwrap_or(false),
            Self::Timestamp => parse_timestamp(value).is_some(),
            Self::Boolean => match value {
                Value::Bool(_) => true,
                Value::Number(n) => matches!(n.as_i64(), Some(0) | Some(1)),
                Value::String(s) => matches!(
                    s.trim().to_lowercase().as_str(),
                    "true" | "false" | "yes" | "no" | "0" | "1"
                ),
                _ => false,
            },
        };

        if ok {
            Ok(())
        } else {
            Err(format!("expected {:?}, got {}", self, describe(value)))
        }
    }
}

/// Parse an RFC 3339 or `YYYY-MM-DD HH:MM:SS` timestamp (naive values are UTC).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn describe(value: &Value) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 40 {
        format!("{}...", rendered.chars().take(40).collect::<String>())
    } else {
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_every_schema_has_key_and_timestamp() {
        for data_type in DataType::ALL {
            let schema = schema_for(data_type);
            assert!(schema.field(schema.key_field).unwrap().required);
            assert_eq!(
                schema.field(schema.timestamp_field).unwrap().field_type,
                FieldType::Timestamp
            );
        }
    }

    #[test]
    fn test_number_accepts_numeric_strings() {
        assert!(FieldType::Number.check(&json!(12.5)).is_ok());
        assert!(FieldType::Number.check(&json!(" 1200 ")).is_ok());
        assert!(FieldType::Number.check(&json!("twelve")).is_err());
    }

    #[test]
    fn test_integer_rejects_fractions() {
        assert!(FieldType::Integer.check(&json!(1999)).is_ok());
        assert!(FieldType::Integer.check(&json!(19.5)).is_err());
    }

    #[test]
    fn test_timestamp_formats() {
        assert!(parse_timestamp(&json!("2024-03-01T10:00:00Z")).is_some());
        assert!(parse_timestamp(&json!("2024-03-01 10:00:00")).is_some());
        assert!(parse_timestamp(&json!("03/01/2024")).is_none());
    }

    #[test]
    fn test_sensitive_fields_declared() {
        let tax = schema_for(DataType::Tax);
        let names: Vec<_> = tax.sensitive_fields().map(|f| f.name).collect();
        assert_eq!(names, vec!["payer_name", "payment_account", "portal_pin"]);
    }
}
