//! Field mapping store and the Transform step that applies mappings.

use crate::connectors::Record;
use crate::error::{HubError, Result};
use crate::models::{DataType, FieldMapping, FieldPair};
use crate::store::HubStore;
use crate::target_schema::schema_for;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

type MappingKey = (DataType, String);

/// Create/update body. The name comes from the path on update.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingRequest {
    #[serde(default)]
    pub mapping_name: Option<String>,
    pub fields: Vec<FieldPair>,
}

/// Mappings keyed by (data type, name). Writes to one key are serialized;
/// reads and writes to other keys proceed concurrently.
pub struct MappingStore {
    store: HubStore,
    mappings: RwLock<HashMap<MappingKey, FieldMapping>>,
    write_locks: Mutex<HashMap<MappingKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MappingStore {
    pub fn new(store: HubStore) -> Self {
        Self {
            store,
            mappings: RwLock::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(store: HubStore) -> Result<Self> {
        let persisted = store.list_mappings().await?;
        let this = Self::new(store);
        {
            let mut mappings = this.mappings.write().expect("mapping lock poisoned");
            for m in persisted {
                mappings.insert((m.data_type, m.mapping_name.clone()), m);
            }
            info!("Loaded {} field mapping(s)", mappings.len());
        }
        Ok(this)
    }

    fn write_lock(&self, key: &MappingKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock().expect("mapping write-lock table poisoned");
        locks.entry(key.clone()).or_default().clone()
    }

    /// Drop the key's lock entry unless another writer is waiting on it.
    fn forget_write_lock(&self, key: &MappingKey, lock: &Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.write_locks.lock().expect("mapping write-lock table poisoned");
        // One reference in the table, one held by the caller.
        if Arc::strong_count(lock) == 2 {
            locks.remove(key);
        }
    }

    pub async fn create(
        &self,
        data_type: DataType,
        mapping_name: &str,
        fields: Vec<FieldPair>,
    ) -> Result<FieldMapping> {
        let name = mapping_name.trim().to_string();
        validate_mapping(data_type, &name, &fields)?;
        let key = (data_type, name.clone());
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        if self.contains(&key) {
            return Err(HubError::DuplicateMapping(format!("{}/{}", data_type.as_str(), name)));
        }

        let now = Utc::now();
        let mapping = FieldMapping {
            data_type,
            mapping_name: name,
            fields,
            created_at: now,
            updated_at: now,
        };
        self.store.put_mapping(&mapping).await?;
        self.mappings
            .write()
            .expect("mapping lock poisoned")
            .insert(key, mapping.clone());
        info!(
            "Created mapping {}/{} ({} fields)",
            data_type.as_str(),
            mapping.mapping_name,
            mapping.fields.len()
        );
        Ok(mapping)
    }

    pub async fn update(
        &self,
        data_type: DataType,
        mapping_name: &str,
        fields: Vec<FieldPair>,
    ) -> Result<FieldMapping> {
        let name = mapping_name.trim();
        validate_mapping(data_type, name, &fields)?;
        let key = (data_type, name.to_string());
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        let mut mapping = match self.get(data_type, name) {
            Ok(mapping) => mapping,
            Err(e) => {
                self.forget_write_lock(&key, &lock);
                return Err(e);
            }
        };
        mapping.fields = fields;
        mapping.updated_at = Utc::now();
        self.store.put_mapping(&mapping).await?;
        self.mappings
            .write()
            .expect("mapping lock poisoned")
            .insert(key, mapping.clone());
        debug!("Updated mapping {}/{}", data_type.as_str(), name);
        Ok(mapping)
    }

    pub async fn delete(&self, data_type: DataType, mapping_name: &str) -> Result<()> {
        let name = mapping_name.trim();
        let key = (data_type, name.to_string());
        let lock = self.write_lock(&key);
        let _guard = lock.lock().await;

        if !self.contains(&key) {
            self.forget_write_lock(&key, &lock);
            return Err(not_found(data_type, name));
        }
        self.store.delete_mapping(data_type.as_str(), name).await?;
        self.mappings.write().expect("mapping lock poisoned").remove(&key);
        self.forget_write_lock(&key, &lock);
        info!("Deleted mapping {}/{}", data_type.as_str(), name);
        Ok(())
    }

    pub fn get(&self, data_type: DataType, mapping_name: &str) -> Result<FieldMapping> {
        let name = mapping_name.trim();
        self.mappings
            .read()
            .expect("mapping lock poisoned")
            .get(&(data_type, name.to_string()))
            .cloned()
            .ok_or_else(|| not_found(data_type, name))
    }

    pub fn list(&self, data_type: DataType) -> Vec<FieldMapping> {
        let mappings = self.mappings.read().expect("mapping lock poisoned");
        let mut list: Vec<FieldMapping> = mappings
            .values()
            .filter(|m| m.data_type == data_type)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.mapping_name.cmp(&b.mapping_name));
        list
    }

    fn contains(&self, key: &MappingKey) -> bool {
        self.mappings.read().expect("mapping lock poisoned").contains_key(key)
    }
}

fn not_found(data_type: DataType, name: &str) -> HubError {
    HubError::MappingNotFound(format!("{}/{}", data_type.as_str(), name))
}

/// Mapping invariants: non-empty, target fields from the schema, each once.
pub fn validate_mapping(data_type: DataType, name: &str, fields: &[FieldPair]) -> Result<()> {
    if name.trim().is_empty() {
        return Err(HubError::InvalidMapping("mappingName must not be empty".into()));
    }
    if fields.is_empty() {
        return Err(HubError::InvalidMapping("a mapping needs at least one field".into()));
    }

    let schema = schema_for(data_type);
    let mut seen = HashSet::new();
    for pair in fields {
        if !schema.contains(&pair.target_field) {
            return Err(HubError::InvalidMapping(format!(
                "'{}' is not a {} target field",
                pair.target_field,
                data_type.as_str()
            )));
        }
        if !seen.insert(pair.target_field.as_str()) {
            return Err(HubError::InvalidMapping(format!(
                "target field '{}' is mapped more than once",
                pair.target_field
            )));
        }
        if pair.source_field.trim().is_empty() {
            return Err(HubError::InvalidMapping(format!(
                "target field '{}' has an empty source field",
                pair.target_field
            )));
        }
    }
    Ok(())
}

/// Copy `source[sourceField]` into `targetField` for every pair.
/// Missing source fields become null; no other keys are produced.
pub fn apply_mapping(mapping: &FieldMapping, source: &Record) -> Record {
    mapping
        .fields
        .iter()
        .map(|pair| {
            let value = source.get(&pair.source_field).cloned().unwrap_or(Value::Null);
            (pair.target_field.clone(), value)
        })
        .collect()
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// Propose pairs by case, space and underscore-insensitive name match.
pub fn suggest_mapping(data_type: DataType, source_columns: &[String]) -> Vec<FieldPair> {
    let by_name: HashMap<String, &String> = source_columns
        .iter()
        .map(|c| (normalize(c), c))
        .collect();

    schema_for(data_type)
        .fields
        .iter()
        .filter_map(|field| {
            by_name.get(&normalize(field.name)).map(|column| FieldPair {
                target_field: field.name.to_string(),
                source_field: (*column).clone(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn pair(target: &str, source: &str) -> FieldPair {
        FieldPair {
            target_field: target.into(),
            source_field: source.into(),
        }
    }

    fn store() -> MappingStore {
        MappingStore::new(HubStore::open_in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_create_get_list_delete() {
        let store = store();
        store
            .create(DataType::Property, "cama", vec![pair("parcel_id", "PIN"), pair("city", "CITY")])
            .await
            .unwrap();

        let got = store.get(DataType::Property, "cama").unwrap();
        assert_eq!(got.fields[0], pair("parcel_id", "PIN"));
        assert_eq!(store.list(DataType::Property).len(), 1);
        assert!(store.list(DataType::Sales).is_empty());

        store.delete(DataType::Property, "cama").await.unwrap();
        assert!(matches!(
            store.get(DataType::Property, "cama"),
            Err(HubError::MappingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_and_missing() {
        let store = store();
        let fields = vec![pair("parcel_id", "PIN")];
        store.create(DataType::Property, "cama", fields.clone()).await.unwrap();
        assert!(matches!(
            store.create(DataType::Property, "cama", fields.clone()).await,
            Err(HubError::DuplicateMapping(_))
        ));
        assert!(matches!(
            store.update(DataType::Sales, "cama", vec![pair("sale_id", "ID")]).await,
            Err(HubError::MappingNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_created_at() {
        let store = store();
        let created = store
            .create(DataType::Tax, "t", vec![pair("tax_bill_id", "BILL")])
            .await
            .unwrap();
        let updated = store
            .update(DataType::Tax, "t", vec![pair("tax_bill_id", "BILL_NO")])
            .await
            .unwrap();
        assert_eq!(updated.created_at, created.created_at);
        assert_eq!(updated.fields[0].source_field, "BILL_NO");
    }

    #[tokio::test]
    async fn test_padded_names_address_the_same_mapping() {
        let store = store();
        store
            .create(DataType::Property, " cama ", vec![pair("parcel_id", "PIN")])
            .await
            .unwrap();
        let updated = store
            .update(DataType::Property, "cama  ", vec![pair("parcel_id", "PARCEL")])
            .await
            .unwrap();
        assert_eq!(updated.mapping_name, "cama");
        assert_eq!(store.get(DataType::Property, " cama").unwrap().fields[0].source_field, "PARCEL");

        store.delete(DataType::Property, "\tcama").await.unwrap();
        assert!(store.list(DataType::Property).is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_write_lock_entry() {
        let store = store();
        for i in 0..20 {
            let name = format!("m{}", i);
            store
                .create(DataType::Sales, &name, vec![pair("sale_id", "ID")])
                .await
                .unwrap();
            store.delete(DataType::Sales, &name).await.unwrap();
        }
        assert!(store.delete(DataType::Sales, "never").await.is_err());
        assert!(store.update(DataType::Sales, "never", vec![pair("sale_id", "ID")]).await.is_err());
        assert!(store.write_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mappings_survive_reload() {
        let hub = HubStore::open_in_memory().unwrap();
        MappingStore::new(hub.clone())
            .create(DataType::Sales, "deeds", vec![pair("sale_id", "DEED_NO")])
            .await
            .unwrap();
        let reloaded = MappingStore::load(hub).await.unwrap();
        assert_eq!(reloaded.get(DataType::Sales, "deeds").unwrap().fields.len(), 1);
    }

    #[test]
    fn test_validation_rules() {
        assert!(validate_mapping(DataType::Property, "m", &[]).is_err());
        assert!(validate_mapping(DataType::Property, "m", &[pair("not_a_field", "x")]).is_err());
        assert!(validate_mapping(
            DataType::Property,
            "m",
            &[pair("parcel_id", "a"), pair("parcel_id", "b")]
        )
        .is_err());
        assert!(validate_mapping(DataType::Property, "", &[pair("parcel_id", "a")]).is_err());
        assert!(validate_mapping(DataType::Property, "m", &[pair("parcel_id", " ")]).is_err());
        assert!(validate_mapping(DataType::Property, "m", &[pair("parcel_id", "PIN")]).is_ok());
    }

    #[test]
    fn test_apply_missing_source_is_null() {
        let now = Utc::now();
        let mapping = FieldMapping {
            data_type: DataType::Property,
            mapping_name: "m".into(),
            fields: vec![pair("parcel_id", "PIN"), pair("city", "TOWN")],
            created_at: now,
            updated_at: now,
        };
        let mut source = Record::new();
        source.insert("PIN".into(), Value::String("P-1".into()));
        source.insert("EXTRA".into(), Value::from(7));

        let out = apply_mapping(&mapping, &source);
        assert_eq!(out.len(), 2);
        assert_eq!(out["parcel_id"], Value::String("P-1".into()));
        assert_eq!(out["city"], Value::Null);
    }

    #[test]
    fn test_suggest_matches_normalized_names() {
        let columns = vec!["Parcel ID".to_string(), "CITY".to_string(), "Misc".to_string()];
        let suggested = suggest_mapping(DataType::Property, &columns);
        assert_eq!(
            suggested,
            vec![pair("parcel_id", "Parcel ID"), pair("city", "CITY")]
        );
    }

    proptest! {
        #[test]
        fn prop_apply_produces_exactly_target_fields(
            picks in prop::collection::btree_set(0usize..15, 1..10),
            source_keys in prop::collection::vec("[A-Z_]{1,8}", 0..12),
        ) {
            let schema = schema_for(DataType::Property);
            let now = Utc::now();
            let fields: Vec<FieldPair> = picks
                .iter()
                .enumerate()
                .map(|(i, idx)| pair(schema.fields[*idx].name, &format!("COL_{}", i)))
                .collect();
            let mapping = FieldMapping {
                data_type: DataType::Property,
                mapping_name: "p".into(),
                fields: fields.clone(),
                created_at: now,
                updated_at: now,
            };
            let mut source = Record::new();
            for (i, k) in source_keys.iter().enumerate() {
                source.insert(k.clone(), Value::from(i));
            }
            source.insert("COL_0".into(), Value::from("x"));

            let out = apply_mapping(&mapping, &source);
            let keys: HashSet<&str> = out.keys().map(String::as_str).collect();
            let expected: HashSet<&str> = fields.iter().map(|p| p.target_field.as_str()).collect();
            prop_assert_eq!(keys, expected);
        }
    }
}
