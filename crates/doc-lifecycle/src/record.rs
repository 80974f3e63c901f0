//! Document metadata records and the legacy/newer storage format merge.
//!
//! Metadata for one document lives in two places of the shared structure:
//! - the legacy ordered `pages` list entry (title, dates, trash, tags)
//! - the newer per-document property map (primary mode, template flag,
//!   journal date, user-defined properties)
//!
//! Reads merge both as `{...upgrade(legacy), ...omit_nullish(newer)}`.

use crate::DocId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Raw field map as stored in the shared structure.
pub type RawFields = serde_json::Map<String, Value>;

pub type TagId = String;

pub const FIELD_ID: &str = "id";
pub const FIELD_TITLE: &str = "title";
pub const FIELD_CREATE_DATE: &str = "createDate";
pub const FIELD_UPDATED_DATE: &str = "updatedDate";
pub const FIELD_TRASH: &str = "trash";
pub const FIELD_TRASH_DATE: &str = "trashDate";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_PRIMARY_MODE: &str = "primaryMode";
pub const FIELD_IS_TEMPLATE: &str = "isTemplate";
pub const FIELD_JOURNAL: &str = "journal";
/// Pre-`primaryMode` name of the mode field.
const LEGACY_FIELD_MODE: &str = "mode";

/// Fields that belong to the legacy list entry.
pub const LEGACY_FIELDS: &[&str] = &[
    FIELD_ID,
    FIELD_TITLE,
    FIELD_CREATE_DATE,
    FIELD_UPDATED_DATE,
    FIELD_TRASH,
    FIELD_TRASH_DATE,
    FIELD_TAGS,
];

/// Properties that identify a document and are never copied onto another.
pub const IDENTITY_PROPERTIES: &[&str] = &[FIELD_ID, FIELD_IS_TEMPLATE, FIELD_JOURNAL];

/// Default editing surface of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryMode {
    #[default]
    Page,
    Edgeless,
}

impl PrimaryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrimaryMode::Page => "page",
            PrimaryMode::Edgeless => "edgeless",
        }
    }
}

impl Display for PrimaryMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrimaryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(PrimaryMode::Page),
            "edgeless" => Ok(PrimaryMode::Edgeless),
            other => Err(format!("unknown primary mode: {other}")),
        }
    }
}

/// Merged view of one document's metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentMetadataRecord {
    pub id: DocId,
    pub title: String,
    /// Milliseconds since Unix epoch.
    pub create_date: i64,
    pub updated_date: Option<i64>,
    pub trash: bool,
    pub trash_date: Option<i64>,
    pub tags: BTreeSet<TagId>,
    pub primary_mode: PrimaryMode,
    /// Every merged field that is not a core field, including `isTemplate`
    /// and `journal`.
    pub custom_properties: BTreeMap<String, Value>,
}

impl DocumentMetadataRecord {
    /// A record with all defaults, as seen for an entry still being created.
    pub fn empty(id: DocId) -> Self {
        Self {
            id,
            title: String::new(),
            create_date: 0,
            updated_date: None,
            trash: false,
            trash_date: None,
            tags: BTreeSet::new(),
            primary_mode: PrimaryMode::default(),
            custom_properties: BTreeMap::new(),
        }
    }

    /// Build from merged raw fields. Missing or malformed optional fields
    /// fall back to defaults.
    pub fn from_fields(id: DocId, fields: &RawFields) -> Self {
        let mut record = Self::empty(id);
        if let Some(title) = fields.get(FIELD_TITLE).and_then(Value::as_str) {
            record.title = title.to_string();
        }
        if let Some(date) = fields.get(FIELD_CREATE_DATE).and_then(as_millis) {
            record.create_date = date;
        }
        record.updated_date = fields.get(FIELD_UPDATED_DATE).and_then(as_millis);
        record.trash = fields
            .get(FIELD_TRASH)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        record.trash_date = fields.get(FIELD_TRASH_DATE).and_then(as_millis);
        if let Some(tags) = fields.get(FIELD_TAGS).and_then(Value::as_array) {
            record.tags = tags
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        if let Some(mode) = fields
            .get(FIELD_PRIMARY_MODE)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
        {
            record.primary_mode = mode;
        }
        for (key, value) in fields {
            if !is_core_field(key) {
                record.custom_properties.insert(key.clone(), value.clone());
            }
        }
        record
    }

    pub fn is_template(&self) -> bool {
        self.custom_properties
            .get(FIELD_IS_TEMPLATE)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn journal(&self) -> Option<&str> {
        self.custom_properties
            .get(FIELD_JOURNAL)
            .and_then(Value::as_str)
    }

    /// Fields to write into the legacy list entry.
    pub fn legacy_fields(&self) -> RawFields {
        let mut fields = RawFields::new();
        fields.insert(FIELD_ID.into(), Value::String(self.id.to_string()));
        fields.insert(FIELD_TITLE.into(), Value::String(self.title.clone()));
        fields.insert(FIELD_CREATE_DATE.into(), Value::from(self.create_date));
        if let Some(date) = self.updated_date {
            fields.insert(FIELD_UPDATED_DATE.into(), Value::from(date));
        }
        fields.insert(FIELD_TRASH.into(), Value::Bool(self.trash));
        if let Some(date) = self.trash_date {
            fields.insert(FIELD_TRASH_DATE.into(), Value::from(date));
        }
        fields.insert(FIELD_TAGS.into(), tags_value(&self.tags));
        fields
    }

    /// Fields to write into the newer property map.
    pub fn property_fields(&self) -> RawFields {
        let mut fields = RawFields::new();
        fields.insert(FIELD_ID.into(), Value::String(self.id.to_string()));
        fields.insert(
            FIELD_PRIMARY_MODE.into(),
            Value::String(self.primary_mode.as_str().into()),
        );
        for (key, value) in &self.custom_properties {
            fields.insert(key.clone(), value.clone());
        }
        fields
    }
}

pub fn tags_value(tags: &BTreeSet<TagId>) -> Value {
    Value::Array(tags.iter().cloned().map(Value::String).collect())
}

fn is_core_field(key: &str) -> bool {
    LEGACY_FIELDS.contains(&key) || key == FIELD_PRIMARY_MODE
}

/// Timestamps written by other clients may be floats.
fn as_millis(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    web_time::SystemTime::now()
        .duration_since(web_time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Bring a legacy entry up to the current field names.
pub fn upgrade_legacy(legacy: &RawFields) -> RawFields {
    let mut upgraded = legacy.clone();
    if let Some(mode) = upgraded.remove(LEGACY_FIELD_MODE) {
        upgraded.entry(FIELD_PRIMARY_MODE).or_insert(mode);
    }
    upgraded
}

/// Merge both storage formats: newer wins, but nullish newer values never
/// blank out legacy ones.
pub fn merge_formats(legacy: Option<&RawFields>, newer: Option<&RawFields>) -> RawFields {
    let mut merged = legacy.map(upgrade_legacy).unwrap_or_default();
    if let Some(newer) = newer {
        for (key, value) in newer {
            if !value.is_null() {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
