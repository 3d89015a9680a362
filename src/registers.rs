use crate::cache::ValueCache;
use crate::device::Device;
use crate::error::{Result, Sun2000Error};
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Raw register encoding of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int16,
    Uint16,
    Int32,
    Uint32,
    /// ASCII text packed two characters per register.
    String(u16),
}

impl DataType {
    /// Width in registers.
    pub const fn len(&self) -> u16 {
        match self {
            DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 => 2,
            DataType::String(len) => *len,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Number,
    String,
    Boolean,
}

/// Schema of a stored value, declared once to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Meta {
    pub name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    pub role: &'static str,
    #[serde(rename = "type")]
    pub kind: ValueKind,
}

impl Meta {
    pub const fn number(name: &'static str, unit: &'static str, role: &'static str) -> Self {
        Self {
            name,
            unit: if unit.is_empty() { None } else { Some(unit) },
            role,
            kind: ValueKind::Number,
        }
    }

    pub const fn text(name: &'static str, role: &'static str) -> Self {
        Self {
            name,
            unit: None,
            role,
            kind: ValueKind::String,
        }
    }

    pub const fn boolean(name: &'static str, role: &'static str) -> Self {
        Self {
            name,
            unit: None,
            role,
            kind: ValueKind::Boolean,
        }
    }
}

/// Where a field's raw value lives and how to turn it into a `Value`.
#[derive(Debug, Clone, Copy)]
pub struct Source {
    pub address: u16,
    pub data_type: DataType,
    pub gain: Option<u32>,
    pub mapper: Option<fn(f64) -> Value>,
}

impl Source {
    pub fn decode(&self, block_address: u16, words: &[u16]) -> std::result::Result<Value, String> {
        let start = self
            .address
            .checked_sub(block_address)
            .ok_or_else(|| format!("register {} before block {}", self.address, block_address))?
            as usize;
        let end = start + self.data_type.len() as usize;
        let words = words.get(start..end).ok_or_else(|| {
            format!(
                "register {} needs words {}..{}, block has {}",
                self.address,
                start,
                end,
                words.len()
            )
        })?;

        let mut data = vec![0u8; words.len() * 2];
        BigEndian::write_u16_into(words, &mut data);

        let raw = match self.data_type {
            DataType::Int16 => BigEndian::read_i16(&data) as f64,
            DataType::Uint16 => BigEndian::read_u16(&data) as f64,
            DataType::Int32 => BigEndian::read_i32(&data) as f64,
            DataType::Uint32 => BigEndian::read_u32(&data) as f64,
            DataType::String(_) => {
                let text = String::from_utf8_lossy(&data);
                return Ok(Value::Text(
                    text.trim_matches(|c: char| c == '\0' || c.is_whitespace())
                        .to_string(),
                ));
            }
        };

        let scaled = match self.gain {
            Some(gain) if gain > 1 => raw / f64::from(gain),
            _ => raw,
        };
        Ok(match self.mapper {
            Some(mapper) => mapper(scaled),
            None => Value::Number(scaled),
        })
    }
}

/// One value produced by a register block: decoded from the block when it
/// has a `source`, otherwise written by the block's post hook.
#[derive(Debug, Clone)]
pub struct Field {
    pub key: Cow<'static, str>,
    pub meta: Meta,
    pub source: Option<Source>,
    /// Re-persist on every write even when the value did not change.
    pub force_persist: bool,
}

impl Field {
    pub fn register(
        key: impl Into<Cow<'static, str>>,
        meta: Meta,
        address: u16,
        data_type: DataType,
    ) -> Self {
        Self {
            key: key.into(),
            meta,
            source: Some(Source {
                address,
                data_type,
                gain: None,
                mapper: None,
            }),
            force_persist: false,
        }
    }

    pub fn derived(key: impl Into<Cow<'static, str>>, meta: Meta) -> Self {
        Self {
            key: key.into(),
            meta,
            source: None,
            force_persist: false,
        }
    }

    pub fn gain(mut self, gain: u32) -> Self {
        if let Some(source) = self.source.as_mut() {
            source.gain = Some(gain);
        }
        self
    }

    pub fn mapper(mut self, mapper: fn(f64) -> Value) -> Self {
        if let Some(source) = self.source.as_mut() {
            source.mapper = Some(mapper);
        }
        self
    }

    pub fn force_persist(mut self) -> Self {
        self.force_persist = true;
        self
    }

    /// Decode this field out of a block read. Derived fields yield `None`.
    pub fn decode(&self, block_address: u16, words: &[u16]) -> Result<Option<Value>> {
        let Some(source) = &self.source else {
            return Ok(None);
        };
        source
            .decode(block_address, words)
            .map(Some)
            .map_err(|reason| Sun2000Error::Decode {
                key: self.key.to_string(),
                reason,
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshTier {
    High,
    Low,
}

impl RefreshTier {
    /// Whether a pass of this tier considers a block refreshed at `block`.
    /// A high pass reads only high blocks; a low pass considers everything,
    /// including static (`None`) blocks.
    pub fn covers(self, block: Option<RefreshTier>) -> bool {
        match self {
            RefreshTier::High => block == Some(RefreshTier::High),
            RefreshTier::Low => true,
        }
    }
}

impl fmt::Display for RefreshTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshTier::High => write!(f, "high"),
            RefreshTier::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Inverter,
    Battery,
    /// Grid meter; only attached to the first device and stored at the root.
    Meter,
}

/// Variable number of repeated fields, generated from a count read earlier.
#[derive(Debug, Clone, Copy)]
pub struct Expansion {
    /// Device-relative key of the count.
    pub count_key: &'static str,
    pub expand: fn(usize) -> Vec<Field>,
}

pub type PostHook = fn(&mut Device, &mut ValueCache, DateTime<Local>);

/// One contiguous block read plus the fields decoded from it.
#[derive(Clone)]
pub struct RegisterBlock {
    pub address: u16,
    pub length: u16,
    pub info: &'static str,
    /// `None` marks static information read once per device.
    pub refresh: Option<RefreshTier>,
    pub class: DeviceClass,
    pub fields: Vec<Field>,
    pub expansion: Option<Expansion>,
    pub post_hook: Option<PostHook>,
}

impl fmt::Debug for RegisterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterBlock")
            .field("address", &self.address)
            .field("length", &self.length)
            .field("info", &self.info)
            .field("refresh", &self.refresh)
            .field("class", &self.class)
            .field("fields", &self.fields.len())
            .finish_non_exhaustive()
    }
}

impl RegisterBlock {
    pub fn new(
        address: u16,
        length: u16,
        info: &'static str,
        refresh: Option<RefreshTier>,
        class: DeviceClass,
    ) -> Self {
        Self {
            address,
            length,
            info,
            refresh,
            class,
            fields: Vec::new(),
            expansion: None,
            post_hook: None,
        }
    }

    pub fn fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    pub fn expansion(mut self, count_key: &'static str, expand: fn(usize) -> Vec<Field>) -> Self {
        self.expansion = Some(Expansion { count_key, expand });
        self
    }

    pub fn post_hook(mut self, hook: PostHook) -> Self {
        self.post_hook = Some(hook);
        self
    }

    pub fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.length)
    }

    /// Check that every field lies inside `[address, address + length)`.
    pub fn check_fields<'a>(&self, fields: impl IntoIterator<Item = &'a Field>) -> Result<()> {
        for field in fields {
            let Some(source) = &field.source else {
                continue;
            };
            let start = u32::from(source.address);
            let end = start + u32::from(source.data_type.len());
            if source.address < self.address || end > self.end() {
                return Err(Sun2000Error::Config(format!(
                    "{} at {} outside block {}..{} ({})",
                    field.key,
                    source.address,
                    self.address,
                    self.end(),
                    self.info
                )));
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.check_fields(&self.fields)
    }
}
