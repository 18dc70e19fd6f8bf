//! Field registry
//!
//! Fields are declared with descriptor strings such as
//! `field:malware.family;db:malware.family;kind:termfield;friendly:Family`.
//! Each distinct `field:` name gets a one-byte ID, handed out sequentially
//! from 0. The registry also keeps the two client export layouts up to date
//! so that `/fields` never has to rebuild them per request.

use bytes::{BufMut, Bytes, BytesMut};
use md5::{Digest, Md5};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use wise_common::{Clock, SystemClock};

/// Field IDs travel as a single byte
pub const MAX_FIELDS: usize = 256;

/// Registry errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Descriptor without a `field:` key
    #[error("malformed field descriptor: {0:?}")]
    MalformedDescriptor(String),

    /// No IDs left
    #[error("field registry full ({MAX_FIELDS} fields)")]
    RegistryFull,

    /// A source with this name is already registered
    #[error("duplicate source: {0}")]
    DuplicateSource(String),
}

/// Parsed field descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    /// `field:` value, the registry key
    pub name: String,
    /// `db:` value
    pub db: Option<String>,
    /// `kind:` value
    pub kind: Option<String>,
    /// `friendly:` value
    pub friendly: Option<String>,
    /// `help:` value
    pub help: Option<String>,
    /// `shortcut:` value
    pub shortcut: Option<String>,
    /// Descriptor exactly as registered, which is what clients receive
    pub descriptor: String,
}

impl FieldDef {
    /// Parse `key:value;key:value` pairs. Only `field:` is required.
    pub fn parse(descriptor: &str) -> Result<Self, RegistryError> {
        let mut attrs: HashMap<&str, &str> = HashMap::new();
        for part in descriptor.split(';') {
            if let Some((key, value)) = part.split_once(':') {
                attrs.entry(key.trim()).or_insert(value);
            }
        }

        let name = match attrs.get("field") {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => return Err(RegistryError::MalformedDescriptor(descriptor.to_string())),
        };
        let get = |key: &str| attrs.get(key).map(|v| v.to_string());

        Ok(Self {
            name,
            db: get("db"),
            kind: get("kind"),
            friendly: get("friendly"),
            help: get("help"),
            shortcut: get("shortcut"),
            descriptor: descriptor.to_string(),
        })
    }
}

#[derive(Default)]
struct FieldTable {
    by_name: HashMap<String, u8>,
    defs: Vec<FieldDef>,
    version: u32,
    export_v0: Option<Bytes>,
    export_v1: Bytes,
    md5_hex: String,
}

impl FieldTable {
    fn bump_version(&mut self, now: u64) {
        let now = now.min(u32::MAX as u64) as u32;
        if now <= self.version {
            self.version = self.version.wrapping_add(1);
        } else {
            self.version = now;
        }
    }

    fn rebuild_exports(&mut self) {
        let body_len: usize = self.defs.iter().map(|d| d.descriptor.len() + 3).sum();

        if self.defs.len() < MAX_FIELDS {
            let mut buf = BytesMut::with_capacity(9 + body_len);
            buf.put_u32(self.version);
            buf.put_u32(0);
            buf.put_u8(self.defs.len() as u8);
            put_descriptors(&mut buf, &self.defs);
            self.export_v0 = Some(buf.freeze());
        } else {
            self.export_v0 = None;
        }

        let mut buf = BytesMut::with_capacity(10 + body_len);
        buf.put_u32(self.version);
        buf.put_u32(1);
        buf.put_u16(self.defs.len() as u16);
        put_descriptors(&mut buf, &self.defs);
        self.md5_hex = hex::encode(Md5::digest(&buf[8..]));
        self.export_v1 = buf.freeze();
    }
}

fn put_descriptors(buf: &mut BytesMut, defs: &[FieldDef]) {
    for def in defs {
        let raw = def.descriptor.as_bytes();
        buf.put_u16(raw.len() as u16 + 1);
        buf.put_slice(raw);
        buf.put_u8(0);
    }
}

/// Append-only field table shared by every source
pub struct FieldRegistry {
    table: RwLock<FieldTable>,
    clock: Arc<dyn Clock>,
}

impl FieldRegistry {
    /// Create an empty registry on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty registry with an explicit clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let mut table = FieldTable::default();
        table.rebuild_exports();
        Self {
            table: RwLock::new(table),
            clock,
        }
    }

    /// Register a descriptor, returning the existing ID if the name is known
    pub fn register(&self, descriptor: &str) -> Result<u8, RegistryError> {
        let def = FieldDef::parse(descriptor)?;

        if let Some(&id) = self.table.read().by_name.get(&def.name) {
            return Ok(id);
        }

        let mut table = self.table.write();
        // Lost a race with another registration of the same name
        if let Some(&id) = table.by_name.get(&def.name) {
            return Ok(id);
        }
        if table.defs.len() >= MAX_FIELDS {
            return Err(RegistryError::RegistryFull);
        }

        let id = table.defs.len() as u8;
        debug!(
            "Adding field {} id:{} db:{:?} friendly:{:?}",
            def.name, id, def.db, def.friendly
        );
        table.by_name.insert(def.name.clone(), id);
        table.defs.push(def);
        table.bump_version(self.clock.now_secs());
        table.rebuild_exports();
        Ok(id)
    }

    /// ID of a registered field name
    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.table.read().by_name.get(name).copied()
    }

    /// Name of a registered field ID
    pub fn name_of(&self, id: u8) -> Option<String> {
        self.table.read().defs.get(id as usize).map(|d| d.name.clone())
    }

    /// Registered definition for an ID
    pub fn def(&self, id: u8) -> Option<FieldDef> {
        self.table.read().defs.get(id as usize).cloned()
    }

    /// Number of registered fields
    pub fn len(&self) -> usize {
        self.table.read().defs.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registry version, bumped on every new field
    pub fn version(&self) -> u32 {
        self.table.read().version
    }

    /// One-byte-count export, `None` once 256 fields exist
    pub fn export_v0(&self) -> Option<Bytes> {
        self.table.read().export_v0.clone()
    }

    /// Two-byte-count export
    pub fn export_v1(&self) -> Bytes {
        self.table.read().export_v1.clone()
    }

    /// MD5 hex of the version-1 export without its 8-byte header
    pub fn md5_hex(&self) -> String {
        self.table.read().md5_hex.clone()
    }

    /// Version-1 export and its digest, read together
    pub fn export_v1_with_md5(&self) -> (Bytes, String) {
        let table = self.table.read();
        (table.export_v1.clone(), table.md5_hex.clone())
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::new()
    }
}
