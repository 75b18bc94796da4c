use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RecordId);
typed_id!(UserId);

/// Explicit timestamp unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }
}

// --- Schema ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown field: {0}")]
pub struct UnknownField(pub String);

/// Canonical field names of a repair ticket, declared in display order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldName {
    ReceiptDate,
    ShipDate,
    Company,
    PartNo,
    PartName,
    Spec,
    Symptom,
    Diagnosis,
    Status,
    Repairer,
    Contact,
    CompleteDate,
    Cost,
    Note,
    Special,
}

impl FieldName {
    pub const ALL: [FieldName; 15] = [
        FieldName::ReceiptDate,
        FieldName::ShipDate,
        FieldName::Company,
        FieldName::PartNo,
        FieldName::PartName,
        FieldName::Spec,
        FieldName::Symptom,
        FieldName::Diagnosis,
        FieldName::Status,
        FieldName::Repairer,
        FieldName::Contact,
        FieldName::CompleteDate,
        FieldName::Cost,
        FieldName::Note,
        FieldName::Special,
    ];

    /// Free-text fields edited as one batch inside the detail panel.
    pub const DETAIL: [FieldName; 3] = [FieldName::Symptom, FieldName::Diagnosis, FieldName::Special];

    pub const fn key(self) -> &'static str {
        match self {
            Self::ReceiptDate => "receiptDate",
            Self::ShipDate => "shipDate",
            Self::Company => "company",
            Self::PartNo => "partNo",
            Self::PartName => "partName",
            Self::Spec => "spec",
            Self::Symptom => "symptom",
            Self::Diagnosis => "diagnosis",
            Self::Status => "status",
            Self::Repairer => "repairer",
            Self::Contact => "contact",
            Self::CompleteDate => "completeDate",
            Self::Cost => "cost",
            Self::Note => "note",
            Self::Special => "special",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.key() == key)
    }

    pub const fn is_detail(self) -> bool {
        matches!(self, Self::Symptom | Self::Diagnosis | Self::Special)
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FieldName {
    type Err = UnknownField;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_key(s).ok_or_else(|| UnknownField(s.to_string()))
    }
}

/// Ordered mapping of canonical field name to its string value.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields(BTreeMap<FieldName, String>);

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every schema field present with an empty value.
    pub fn blank() -> Self {
        FieldName::ALL.into_iter().map(|f| (f, String::new())).collect()
    }

    pub fn get(&self, field: FieldName) -> Option<&str> {
        self.0.get(&field).map(String::as_str)
    }

    /// Value of `field`, empty when absent.
    pub fn value(&self, field: FieldName) -> &str {
        self.get(field).unwrap_or_default()
    }

    pub fn set(&mut self, field: FieldName, value: impl Into<String>) {
        self.0.insert(field, value.into());
    }

    pub fn with(mut self, field: FieldName, value: impl Into<String>) -> Self {
        self.set(field, value);
        self
    }

    pub fn contains(&self, field: FieldName) -> bool {
        self.0.contains_key(&field)
    }

    /// Full replace of every field present in `other`; others are left untouched.
    pub fn merge(&mut self, other: &Fields) {
        for (field, value) in &other.0 {
            self.0.insert(*field, value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (FieldName, &str)> {
        self.0.iter().map(|(f, v)| (*f, v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(FieldName, String)> for Fields {
    fn from_iter<I: IntoIterator<Item = (FieldName, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// --- Photo ---

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid photo reference: {0}")]
pub struct InvalidPhotoRef(pub &'static str);

/// Don't store image bytes. Store a URL or storage path.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhotoRef(String);

impl PhotoRef {
    const MAX_LENGTH: usize = 2048;

    pub fn new(reference: impl Into<String>) -> Result<Self, InvalidPhotoRef> {
        let reference = reference.into().trim().to_string();
        if reference.is_empty() {
            return Err(InvalidPhotoRef("empty"));
        }
        if reference.len() > Self::MAX_LENGTH {
            return Err(InvalidPhotoRef("too long"));
        }
        if reference.chars().any(char::is_control) {
            return Err(InvalidPhotoRef("contains control characters"));
        }
        Ok(Self(reference))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parsed form when the reference is an absolute URL rather than a bare path.
    pub fn as_url(&self) -> Option<Url> {
        Url::parse(&self.0).ok()
    }
}

impl fmt::Display for PhotoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a payload touches the photo reference. It has its own lifecycle,
/// independent of `fields`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PhotoChange {
    #[default]
    Untouched,
    Set(PhotoRef),
    Clear,
}

impl PhotoChange {
    pub fn is_untouched(&self) -> bool {
        matches!(self, Self::Untouched)
    }

    /// Reads a raw `photoUrl` value: empty means clear.
    pub fn from_raw(raw: &str) -> Self {
        match PhotoRef::new(raw) {
            Ok(photo) => Self::Set(photo),
            Err(_) => Self::Clear,
        }
    }
}

// --- Status ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RepairStatus {
    Received,
    Repairing,
    FreeRepairDone,
    PaidRepairDone,
}

impl RepairStatus {
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim() {
            "접수완료" => Some(Self::Received),
            "수리중" | "수리 중" => Some(Self::Repairing),
            "무상수리완료" => Some(Self::FreeRepairDone),
            "유상수리완료" => Some(Self::PaidRepairDone),
            _ => None,
        }
    }

    pub const fn label(self) -> &'static str {
        match self {
            Self::Received => "접수완료",
            Self::Repairing => "수리중",
            Self::FreeRepairDone => "무상수리완료",
            Self::PaidRepairDone => "유상수리완료",
        }
    }

    pub const fn style_class(self) -> &'static str {
        match self {
            Self::Received => "row-status-received",
            Self::Repairing => "row-status-repairing",
            Self::FreeRepairDone => "row-status-free",
            Self::PaidRepairDone => "row-status-paid",
        }
    }
}

// --- Record ---

/// One repair ticket. Only the `RecordStore` constructs and mutates these.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub(crate) id: RecordId,
    pub(crate) fields: Fields,
    pub(crate) photo_ref: Option<PhotoRef>,
    pub(crate) first_seen_index: u64,
    /// Store revision of the last notification that set each field.
    pub(crate) field_revisions: BTreeMap<FieldName, u64>,
    pub(crate) photo_revision: u64,
}

impl Record {
    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, field: FieldName) -> &str {
        self.fields.value(field)
    }

    pub fn photo_ref(&self) -> Option<&PhotoRef> {
        self.photo_ref.as_ref()
    }

    pub fn first_seen_index(&self) -> u64 {
        self.first_seen_index
    }

    pub fn status(&self) -> Option<RepairStatus> {
        RepairStatus::from_label(self.field(FieldName::Status))
    }
}

/// Field values and photo change carried by a notification.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordPayload {
    pub fields: Fields,
    pub photo: PhotoChange,
}

impl RecordPayload {
    pub const PHOTO_KEY: &'static str = "photoUrl";

    pub fn new(fields: Fields) -> Self {
        Self {
            fields,
            photo: PhotoChange::Untouched,
        }
    }

    pub fn with_photo(mut self, photo: PhotoChange) -> Self {
        self.photo = photo;
        self
    }

    /// Decodes a raw document. Known schema keys become string values,
    /// metadata and unknown keys are ignored.
    pub fn from_document(document: &Map<String, Value>) -> Self {
        let fields = document
            .iter()
            .filter_map(|(key, value)| FieldName::from_key(key).map(|f| (f, stringify(value))))
            .collect();

        let photo = match document.get(Self::PHOTO_KEY) {
            Some(value) => PhotoChange::from_raw(&stringify(value)),
            None => PhotoChange::Untouched,
        };

        Self { fields, photo }
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// --- Sorting ---

/// The date-valued fields a table can be sorted by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    ReceiptDate,
    ShipDate,
    CompleteDate,
}

impl SortField {
    pub const fn field(self) -> FieldName {
        match self {
            Self::ReceiptDate => FieldName::ReceiptDate,
            Self::ShipDate => FieldName::ShipDate,
            Self::CompleteDate => FieldName::CompleteDate,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

impl SortDirection {
    pub const fn flip(self) -> Self {
        match self {
            Self::Ascending => Self::Descending,
            Self::Descending => Self::Ascending,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: SortField,
    pub direction: SortDirection,
}

impl SortSpec {
    pub fn ascending(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: SortField) -> Self {
        Self {
            field,
            direction: SortDirection::Descending,
        }
    }
}

// --- Remote changes and writes ---

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub id: RecordId,
    pub payload: RecordPayload,
}

impl RemoteChange {
    pub fn added(id: RecordId, payload: RecordPayload) -> Self {
        Self {
            kind: ChangeKind::Added,
            id,
            payload,
        }
    }

    pub fn modified(id: RecordId, payload: RecordPayload) -> Self {
        Self {
            kind: ChangeKind::Modified,
            id,
            payload,
        }
    }

    pub fn removed(id: RecordId) -> Self {
        Self {
            kind: ChangeKind::Removed,
            id,
            payload: RecordPayload::default(),
        }
    }
}

/// A single atomic remote update: changed fields, optional photo change, and
/// the modification marker every persistence call carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub fields: Fields,
    pub photo: PhotoChange,
    pub last_modified: UnixTimeMs,
}

impl DocumentPatch {
    pub const UPDATED_AT_KEY: &'static str = "updatedAt";

    pub fn fields(fields: Fields, now: UnixTimeMs) -> Self {
        Self {
            fields,
            photo: PhotoChange::Untouched,
            last_modified: now,
        }
    }

    pub fn photo(photo: PhotoChange, now: UnixTimeMs) -> Self {
        Self {
            fields: Fields::new(),
            photo,
            last_modified: now,
        }
    }

    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc: Map<String, Value> = self
            .fields
            .iter()
            .map(|(f, v)| (f.key().to_string(), Value::String(v.to_string())))
            .collect();
        match &self.photo {
            PhotoChange::Untouched => {}
            PhotoChange::Set(photo) => {
                doc.insert(RecordPayload::PHOTO_KEY.into(), Value::String(photo.to_string()));
            }
            PhotoChange::Clear => {
                doc.insert(RecordPayload::PHOTO_KEY.into(), Value::String(String::new()));
            }
        }
        doc.insert(Self::UPDATED_AT_KEY.into(), Value::from(self.last_modified.0));
        doc
    }
}

/// Document sent to `create`. The id is assigned remotely.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRecord {
    pub fields: Fields,
    pub author: Option<UserId>,
    pub created_at: UnixTimeMs,
}

impl NewRecord {
    /// Every schema field is present; prefilled values override the blanks.
    pub fn from_prefill(prefill: &Fields, author: Option<UserId>, now: UnixTimeMs) -> Self {
        let mut fields = Fields::blank();
        fields.merge(prefill);
        Self {
            fields,
            author,
            created_at: now,
        }
    }

    pub fn to_document(&self) -> Map<String, Value> {
        let mut doc: Map<String, Value> = self
            .fields
            .iter()
            .map(|(f, v)| (f.key().to_string(), Value::String(v.to_string())))
            .collect();
        doc.entry(RecordPayload::PHOTO_KEY)
            .or_insert_with(|| Value::String(String::new()));
        doc.insert("createdAt".into(), Value::from(self.created_at.0));
        doc.insert(DocumentPatch::UPDATED_AT_KEY.into(), Value::from(self.created_at.0));
        doc.insert(
            "authorUid".into(),
            self.author
                .as_ref()
                .map_or(Value::Null, |a| Value::String(a.to_string())),
        );
        doc
    }
}
