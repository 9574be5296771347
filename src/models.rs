//! Entity models shared by the persistence layer, cryptography engine, and KV store.
//!
//! Enum wire strings and table field names are stable; they are what gets
//! persisted and what audit consumers parse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, StoreError};

/// ID of the singleton system parameter entry
pub const SYSTEM_PARAMS_ENTRY_ID: &str = "system-parameters";

// ============================================================================
// Encryption keys
// ============================================================================

/// Lifecycle state of a data encryption key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EncryptionKeyState {
    /// Key may encrypt new data and decrypt existing data
    #[serde(rename = "ACTIVE")]
    Active,
    /// Key is parked; it can neither encrypt nor decrypt until reactivated
    #[serde(rename = "INACTIVE")]
    Inactive,
}

impl EncryptionKeyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionKeyState::Active => "ACTIVE",
            EncryptionKeyState::Inactive => "INACTIVE",
        }
    }
}

impl fmt::Display for EncryptionKeyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionKeyState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ACTIVE" => Ok(EncryptionKeyState::Active),
            "INACTIVE" => Ok(EncryptionKeyState::Inactive),
            _ => Err(StoreError::Validation(format!(
                "unknown encryption key state '{s}'"
            ))),
        }
    }
}

/// A symmetric data encryption key entry.
///
/// Only the KEK-wrapped key material is ever persisted; the plaintext key
/// lives exclusively inside the cryptography engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKey {
    /// Key ID
    pub id: String,
    /// KEK-wrapped symmetric key material
    pub enc_key_material: Vec<u8>,
    /// Key lifecycle state
    pub state: EncryptionKeyState,
    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
    /// Entry update timestamp
    pub updated_at: DateTime<Utc>,
}

impl EncryptionKey {
    /// Verify the key may transition to the new state.
    ///
    /// ACTIVE and INACTIVE are mutually reachable; self-transitions are
    /// permitted here and short-circuited by the persistence layer.
    pub fn validate_next_state(&self, new_state: EncryptionKeyState) -> Result<()> {
        use EncryptionKeyState::*;
        let allowed = match self.state {
            Active => matches!(new_state, Active | Inactive),
            Inactive => matches!(new_state, Inactive | Active),
        };
        if allowed {
            Ok(())
        } else {
            Err(StoreError::StateViolation(format!(
                "encryption key can't transition from '{}' to '{}'",
                self.state, new_state
            )))
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        validate_uuid(&self.id, "encryption key id")?;
        if self.enc_key_material.is_empty() {
            return Err(StoreError::Validation(
                "encryption key material must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Records and record versions
// ============================================================================

/// A key-value record: a named container for an ordered history of versions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Record ID
    pub id: String,
    /// Record name / key
    pub name: String,
    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
    /// Entry update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Record {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_uuid(&self.id, "record id")?;
        if self.name.is_empty() {
            return Err(StoreError::Validation("record name must not be empty".into()));
        }
        Ok(())
    }
}

/// One immutable version of a record value.
///
/// The value is stored as AEAD ciphertext together with the nonce used to
/// seal it; `enc_key_id` names the data encryption key that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Record version ID (time-sortable)
    pub id: String,
    /// The parent record
    pub record_id: String,
    /// The symmetric encryption key which encrypted this version
    pub enc_key_id: String,
    /// The symmetrically encrypted record value
    pub enc_value: Vec<u8>,
    /// The encryption nonce used
    pub enc_nonce: Vec<u8>,
    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
    /// Entry update timestamp
    pub updated_at: DateTime<Utc>,
}

impl RecordVersion {
    pub(crate) fn validate(&self) -> Result<()> {
        validate_uuid(&self.id, "record version id")?;
        validate_uuid(&self.record_id, "record id")?;
        validate_uuid(&self.enc_key_id, "encryption key id")?;
        if self.enc_value.is_empty() {
            return Err(StoreError::Validation(
                "record version value must not be empty".into(),
            ));
        }
        if self.enc_nonce.is_empty() {
            return Err(StoreError::Validation(
                "record version nonce must not be empty".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// System state
// ============================================================================

/// System operating state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemState {
    /// First time system start
    #[serde(rename = "PRE_INITIALIZATION")]
    PreInitialization,
    /// System performing first time initialization
    #[serde(rename = "INITIALIZING")]
    Initializing,
    /// System running normally
    #[serde(rename = "RUNNING")]
    Running,
}

impl SystemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemState::PreInitialization => "PRE_INITIALIZATION",
            SystemState::Initializing => "INITIALIZING",
            SystemState::Running => "RUNNING",
        }
    }
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PRE_INITIALIZATION" => Ok(SystemState::PreInitialization),
            "INITIALIZING" => Ok(SystemState::Initializing),
            "RUNNING" => Ok(SystemState::Running),
            _ => Err(StoreError::Validation(format!("unknown system state '{s}'"))),
        }
    }
}

/// The singleton system operating parameters entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemParams {
    /// Param entry ID. Always [`SYSTEM_PARAMS_ENTRY_ID`]
    pub id: String,
    /// System operating state
    pub state: SystemState,
    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
    /// Entry update timestamp
    pub updated_at: DateTime<Utc>,
}

impl SystemParams {
    /// Verify the system may transition to the new state.
    ///
    /// The state machine only moves forward:
    /// PRE_INITIALIZATION → INITIALIZING → RUNNING, with self-loops.
    pub fn validate_next_state(&self, new_state: SystemState) -> Result<()> {
        use SystemState::*;
        let allowed = match self.state {
            PreInitialization => matches!(new_state, PreInitialization | Initializing),
            Initializing => matches!(new_state, Initializing | Running),
            Running => matches!(new_state, Running),
        };
        if allowed {
            Ok(())
        } else {
            Err(StoreError::StateViolation(format!(
                "system can't transition from '{}' to '{}'",
                self.state, new_state
            )))
        }
    }
}

// ============================================================================
// System audit events
// ============================================================================

/// Type of a system-level audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SystemEventType {
    /// System is being initialized
    #[serde(rename = "SYSTEM_INITIALIZING")]
    SystemInitializing,
    /// System is initialized
    #[serde(rename = "SYSTEM_INITIALIZED")]
    SystemInitialized,
    /// New encryption key is being added
    #[serde(rename = "ADD_NEW_ENCRYPTION_KEY")]
    AddNewEncryptionKey,
    /// Encryption key is being activated
    #[serde(rename = "ACTIVATE_ENCRYPTION_KEY")]
    ActivateEncryptionKey,
    /// Encryption key is being deactivated
    #[serde(rename = "DEACTIVATE_ENCRYPTION_KEY")]
    DeactivateEncryptionKey,
    /// Encryption key is deleted
    #[serde(rename = "DELETE_ENCRYPTION_KEY")]
    DeleteEncryptionKey,
    /// New data record is being added
    #[serde(rename = "ADD_NEW_RECORD")]
    AddNewRecord,
    /// Data record is deleted
    #[serde(rename = "DELETE_RECORD")]
    DeleteRecord,
}

impl SystemEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemEventType::SystemInitializing => "SYSTEM_INITIALIZING",
            SystemEventType::SystemInitialized => "SYSTEM_INITIALIZED",
            SystemEventType::AddNewEncryptionKey => "ADD_NEW_ENCRYPTION_KEY",
            SystemEventType::ActivateEncryptionKey => "ACTIVATE_ENCRYPTION_KEY",
            SystemEventType::DeactivateEncryptionKey => "DEACTIVATE_ENCRYPTION_KEY",
            SystemEventType::DeleteEncryptionKey => "DELETE_ENCRYPTION_KEY",
            SystemEventType::AddNewRecord => "ADD_NEW_RECORD",
            SystemEventType::DeleteRecord => "DELETE_RECORD",
        }
    }
}

impl fmt::Display for SystemEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SystemEventType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SYSTEM_INITIALIZING" => Ok(SystemEventType::SystemInitializing),
            "SYSTEM_INITIALIZED" => Ok(SystemEventType::SystemInitialized),
            "ADD_NEW_ENCRYPTION_KEY" => Ok(SystemEventType::AddNewEncryptionKey),
            "ACTIVATE_ENCRYPTION_KEY" => Ok(SystemEventType::ActivateEncryptionKey),
            "DEACTIVATE_ENCRYPTION_KEY" => Ok(SystemEventType::DeactivateEncryptionKey),
            "DELETE_ENCRYPTION_KEY" => Ok(SystemEventType::DeleteEncryptionKey),
            "ADD_NEW_RECORD" => Ok(SystemEventType::AddNewRecord),
            "DELETE_RECORD" => Ok(SystemEventType::DeleteRecord),
            _ => Err(StoreError::Validation(format!(
                "unknown system event type '{s}'"
            ))),
        }
    }
}

/// Audit event metadata related to an encryption key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionKeyEventMetadata {
    /// The encryption key the event refers to
    pub key_id: String,
}

/// Audit event metadata related to a data record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEventMetadata {
    /// The data record ID
    pub record_id: String,
    /// The data record name
    pub record_name: String,
}

/// Typed view over an audit event's metadata JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemEventMetadata {
    EncryptionKey(EncryptionKeyEventMetadata),
    Record(RecordEventMetadata),
}

/// An append-only recording of an event occurring at the system level
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemEventAudit {
    /// Audit entry ID (time-sortable)
    pub id: String,
    /// System event type
    #[serde(rename = "type")]
    pub event_type: SystemEventType,
    /// Metadata relating to the event; its schema depends on the type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Entry creation timestamp
    pub created_at: DateTime<Utc>,
    /// Entry update timestamp
    pub updated_at: DateTime<Utc>,
}

impl SystemEventAudit {
    /// Parse the metadata based on the event type.
    ///
    /// System-state events carry no metadata and return `None`.
    pub fn parse_metadata(&self) -> Result<Option<SystemEventMetadata>> {
        use SystemEventType::*;
        let raw = match &self.metadata {
            Some(raw) => raw,
            None => return Ok(None),
        };
        match self.event_type {
            AddNewEncryptionKey | ActivateEncryptionKey | DeactivateEncryptionKey
            | DeleteEncryptionKey => {
                let parsed: EncryptionKeyEventMetadata = serde_json::from_value(raw.clone())?;
                validate_uuid(&parsed.key_id, "event key id")?;
                Ok(Some(SystemEventMetadata::EncryptionKey(parsed)))
            }
            AddNewRecord | DeleteRecord => {
                let parsed: RecordEventMetadata = serde_json::from_value(raw.clone())?;
                validate_uuid(&parsed.record_id, "event record id")?;
                if parsed.record_name.is_empty() {
                    return Err(StoreError::Validation(
                        "event record name must not be empty".into(),
                    ));
                }
                Ok(Some(SystemEventMetadata::Record(parsed)))
            }
            SystemInitializing | SystemInitialized => Ok(None),
        }
    }
}

// ============================================================================
// Validation helpers
// ============================================================================

pub(crate) fn validate_uuid(value: &str, field: &str) -> Result<()> {
    Uuid::parse_str(value)
        .map(|_| ())
        .map_err(|_| StoreError::Validation(format!("{field} '{value}' is not a valid UUID")))
}
