//! Persistent property store.
//!
//! Built-in About/Config fields live in a fixed table with per-field flags.
//! Any other name is a script property, persisted JSON-encoded. Both go
//! through a [`Storage`] collaborator; [`FileStorage`] keeps everything in one
//! MessagePack file and writes through on every change.

use crate::error::{BridgeError, Result, ScriptError};
use crate::value::ScriptValue;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Field flags
pub mod field_flags {
    /// Cannot be changed through Config or `AJ.store`
    pub const READONLY: u8 = 0x01;
    /// Included in About announcements
    pub const ANNOUNCE: u8 = 0x02;
    /// Value may differ per language
    pub const LOCALIZED: u8 = 0x04;
    /// Never reported
    pub const PRIVATE: u8 = 0x08;
}

use field_flags::{ANNOUNCE, LOCALIZED, PRIVATE, READONLY};

/// Definition of a built-in field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    /// Key name as it appears in About and Config data
    pub name: &'static str,
    /// [`field_flags`] bits
    pub flags: u8,
    /// Initial value, `None` when computed at first start
    pub default: Option<&'static str>,
}

/// Built-in fields
pub const FIELDS: [FieldDef; 16] = [
    FieldDef { name: "DeviceId", flags: READONLY | ANNOUNCE, default: None },
    FieldDef { name: "AppId", flags: READONLY | ANNOUNCE, default: None },
    FieldDef { name: "DeviceName", flags: ANNOUNCE | LOCALIZED, default: None },
    FieldDef { name: "DefaultLanguage", flags: ANNOUNCE, default: Some("en") },
    FieldDef { name: "Passcode", flags: PRIVATE, default: Some("303030303030") },
    FieldDef { name: "RealmName", flags: PRIVATE, default: None },
    FieldDef { name: "AppName", flags: ANNOUNCE, default: Some("AllJoyn.js") },
    FieldDef { name: "Description", flags: LOCALIZED, default: Some("AllJoyn.js") },
    FieldDef { name: "Manufacturer", flags: ANNOUNCE | LOCALIZED, default: Some("AllSeen Alliance") },
    FieldDef { name: "ModelNumber", flags: ANNOUNCE, default: Some("0.0.1") },
    FieldDef { name: "DateOfManufacture", flags: READONLY, default: Some("2014-09-03") },
    FieldDef { name: "SoftwareVersion", flags: READONLY, default: Some("0.0.1") },
    FieldDef { name: "AJSoftwareVersion", flags: READONLY, default: None },
    FieldDef { name: "MaxLength", flags: READONLY | ANNOUNCE, default: None },
    FieldDef { name: "HardwareVersion", flags: READONLY, default: Some("0.0.1") },
    FieldDef { name: "SupportUrl", flags: LOCALIZED, default: Some("www.allseenalliance.org") },
];

/// Longest value accepted for a built-in field
pub const MAX_PROP_LENGTH: usize = 32;

const DEVICE_NAME_PREFIX: &str = "AllJoyn.js.";
const FIELD_KEY: &str = "prop:";
const SCRIPT_PROP_KEY: &str = "js:";
const SCRIPT_KEY: &str = "script:";

/// Index of a built-in field
pub fn field_index(name: &str) -> Option<usize> {
    FIELDS.iter().position(|f| f.name == name)
}

/// Which fields [`PropertyStore::read_all`] reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFilter {
    /// Every non-private field
    About,
    /// Writable fields
    Config,
    /// Fields carried in announcements
    Announce,
}

impl ReadFilter {
    fn accepts(self, flags: u8) -> bool {
        if flags & PRIVATE != 0 {
            return false;
        }
        match self {
            ReadFilter::About => true,
            ReadFilter::Config => flags & READONLY == 0,
            ReadFilter::Announce => flags & ANNOUNCE != 0,
        }
    }
}

/// Key-value persistence
pub trait Storage {
    /// Read a value
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write a value
    fn write(&mut self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value
    fn remove(&mut self, key: &str) -> Result<()>;

    /// Remove every value
    fn clear(&mut self) -> Result<()>;

    /// Stored keys
    fn keys(&self) -> Vec<String>;
}

/// Volatile storage
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MemoryStorage {
    /// Create empty storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Storage kept in a single MessagePack file
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    entries: BTreeMap<String, Vec<u8>>,
}

impl FileStorage {
    /// Open the file at `path`, starting empty when it does not exist
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => rmp_serde::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), "Opened property storage");
        Ok(Self { path, entries })
    }

    fn flush(&self) -> Result<()> {
        let bytes = rmp_serde::to_vec(&self.entries)?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn write(&mut self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        self.flush()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.flush()?;
        }
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.flush()
    }

    fn keys(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Built-in fields and script properties over a [`Storage`]
pub struct PropertyStore {
    storage: Box<dyn Storage + Send>,
    values: Vec<Option<String>>,
    device_name: Option<String>,
    changed: bool,
}

impl PropertyStore {
    /// Open the store, initializing fields that were never set
    pub fn open(storage: Box<dyn Storage + Send>, device_name: Option<&str>) -> Result<Self> {
        let mut store = Self {
            storage,
            values: vec![None; FIELDS.len()],
            device_name: device_name.map(str::to_string),
            changed: false,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&mut self) -> Result<()> {
        let guid = uuid::Uuid::new_v4();
        let guid_hex = hex::encode(guid.as_bytes());
        for (idx, field) in FIELDS.iter().enumerate() {
            let key = format!("{}{}", FIELD_KEY, field.name);
            if let Some(bytes) = self.storage.read(&key)? {
                self.values[idx] = Some(String::from_utf8_lossy(&bytes).into_owned());
                continue;
            }
            let initial = match field.name {
                "DeviceId" | "AppId" => Some(guid_hex.clone()),
                "DeviceName" => Some(
                    self.device_name
                        .clone()
                        .unwrap_or_else(|| format!("{}{}", DEVICE_NAME_PREFIX, &guid_hex[..7])),
                ),
                "AJSoftwareVersion" => Some(crate::VERSION.to_string()),
                "MaxLength" => Some(MAX_PROP_LENGTH.to_string()),
                _ => field.default.map(str::to_string),
            };
            if let Some(value) = &initial {
                self.storage.write(&key, value.as_bytes())?;
            }
            self.values[idx] = initial;
        }
        tracing::info!(
            device_id = self.get("DeviceId").unwrap_or_default(),
            device_name = self.get("DeviceName").unwrap_or_default(),
            "Property store ready"
        );
        Ok(())
    }

    /// Value of a built-in field
    pub fn get(&self, name: &str) -> Option<&str> {
        field_index(name).and_then(|idx| self.values[idx].as_deref())
    }

    /// Whether `name` is a built-in field
    pub fn is_built_in(name: &str) -> bool {
        field_index(name).is_some()
    }

    /// Whether a built-in field is read-only; private fields count as
    /// read-only
    pub fn is_read_only(name: &str) -> bool {
        field_index(name)
            .map(|idx| FIELDS[idx].flags & (READONLY | PRIVATE) != 0)
            .unwrap_or(false)
    }

    /// Set a built-in field, regardless of its flags
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let idx = field_index(name)
            .ok_or_else(|| BridgeError::InvalidState(format!("unknown field '{}'", name)))?;
        self.storage
            .write(&format!("{}{}", FIELD_KEY, name), value.as_bytes())?;
        self.values[idx] = Some(value.to_string());
        self.changed = true;
        Ok(())
    }

    /// Restore a writable built-in field to its initial value
    ///
    /// Returns false when the field is unknown or read-only.
    pub fn reset(&mut self, name: &str) -> Result<bool> {
        let Some(idx) = field_index(name) else {
            return Ok(false);
        };
        if Self::is_read_only(name) {
            return Ok(false);
        }
        let initial = match name {
            "DeviceName" => self.device_name.clone(),
            _ => FIELDS[idx].default.map(str::to_string),
        };
        let key = format!("{}{}", FIELD_KEY, name);
        match &initial {
            Some(value) => self.storage.write(&key, value.as_bytes())?,
            None => self.storage.remove(&key)?,
        }
        self.values[idx] = initial;
        self.changed = true;
        Ok(true)
    }

    /// Wipe all storage and initialize fresh fields with a new GUID
    pub fn factory_reset(&mut self) -> Result<()> {
        tracing::warn!("Factory reset of property store");
        self.storage.clear()?;
        self.values = vec![None; FIELDS.len()];
        self.init()?;
        self.changed = true;
        Ok(())
    }

    /// Store a new passcode, hex-encoded
    pub fn set_passcode(&mut self, passcode: &[u8]) -> Result<()> {
        self.set("Passcode", &hex::encode(passcode))
    }

    /// `AJ.load(name)`: built-in fields are returned as strings, other names
    /// are decoded from their stored JSON; missing values are undefined
    pub fn load(&self, name: &str) -> Result<ScriptValue> {
        if Self::is_built_in(name) {
            return Ok(self.get(name).map(ScriptValue::from).unwrap_or_default());
        }
        match self.storage.read(&format!("{}{}", SCRIPT_PROP_KEY, name))? {
            Some(bytes) => {
                let json: serde_json::Value = serde_json::from_slice(&bytes)?;
                Ok(ScriptValue::from_json(&json))
            }
            None => Ok(ScriptValue::Undefined),
        }
    }

    /// `AJ.store(name, value)`: writes to read-only built-ins are ignored
    pub fn store(&mut self, name: &str, value: &ScriptValue) -> Result<()> {
        if Self::is_built_in(name) {
            if Self::is_read_only(name) {
                tracing::debug!(name, "Ignoring store to read-only property");
                return Ok(());
            }
            let text = value
                .as_str()
                .ok_or_else(|| ScriptError::type_error("value must be a string"))?;
            return self.set(name, text);
        }
        let json = value
            .to_json()
            .ok_or_else(|| ScriptError::type_error(format!("cannot store {:?} value", value.kind())))?;
        let bytes = serde_json::to_vec(&json)?;
        self.storage
            .write(&format!("{}{}", SCRIPT_PROP_KEY, name), &bytes)?;
        Ok(())
    }

    /// Non-private built-in fields selected by `filter`, in table order
    pub fn read_all(&self, filter: ReadFilter) -> Vec<(&'static str, &str)> {
        FIELDS
            .iter()
            .zip(&self.values)
            .filter(|(field, _)| filter.accepts(field.flags))
            .filter_map(|(field, value)| value.as_deref().map(|v| (field.name, v)))
            .collect()
    }

    /// Persist an installed script
    pub fn install_script(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        tracing::info!(name, len = bytes.len(), "Installing script");
        self.storage.write(&format!("{}{}", SCRIPT_KEY, name), bytes)
    }

    /// Installed script by name
    pub fn script(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.storage.read(&format!("{}{}", SCRIPT_KEY, name))
    }

    /// Names of installed scripts
    pub fn script_names(&self) -> Vec<String> {
        self.storage
            .keys()
            .into_iter()
            .filter_map(|k| k.strip_prefix(SCRIPT_KEY).map(str::to_string))
            .collect()
    }

    /// Whether a field changed since the last call; announcements are
    /// refreshed when this is set
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyStore")
            .field("device_id", &self.get("DeviceId"))
            .field("device_name", &self.get("DeviceName"))
            .finish()
    }
}
