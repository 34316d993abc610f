//! Opcode catalog consumed by the frame decoder.
//!
//! A [`Schema`] maps each message opcode to a [`Layout`] describing its body, plus
//! the handful of opcodes that alter decoder state. Catalogs are plain data and can
//! be loaded from JSON or built in code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Little-endian integer widths recognised by byte-level layouts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum IntWidth {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
}

impl IntWidth {
    pub fn size(self) -> usize {
        match self {
            IntWidth::U8 | IntWidth::I8 => 1,
            IntWidth::U16 | IntWidth::I16 => 2,
            IntWidth::U32 | IntWidth::I32 => 4,
        }
    }

    pub fn read(self, bytes: &[u8]) -> i64 {
        match self {
            IntWidth::U8 => bytes[0] as i64,
            IntWidth::I8 => bytes[0] as i8 as i64,
            IntWidth::U16 => u16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            IntWidth::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as i64,
            IntWidth::U32 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            IntWidth::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
        }
    }
}

/// Predicate applied to a previously decoded named value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Condition {
    NonZero,
    Equals(i64),
    MaskSet(u64),
}

impl Condition {
    pub fn holds(self, value: i64) -> bool {
        match self {
            Condition::NonZero => value != 0,
            Condition::Equals(expected) => value == expected,
            Condition::MaskSet(mask) => (value as u64) & mask != 0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SwitchCase {
    pub value: i64,
    pub layout: Layout,
}

/// Byte-level body layout.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Layout {
    Empty,
    Bytes {
        len: usize,
    },
    Cstring,
    Int {
        #[serde(default)]
        name: Option<String>,
        width: IntWidth,
    },
    /// Byte string preceded by its own length.
    Prefixed {
        width: IntWidth,
    },
    Sequence {
        fields: Vec<Layout>,
    },
    /// Reads a discriminant of `width` and continues with the matching case.
    Switch {
        width: IntWidth,
        #[serde(default)]
        name: Option<String>,
        cases: Vec<SwitchCase>,
        #[serde(default)]
        default: Option<Box<Layout>>,
    },
    If {
        field: String,
        condition: Condition,
        then: Box<Layout>,
        #[serde(default)]
        otherwise: Option<Box<Layout>>,
    },
    Repeat {
        count: String,
        body: Box<Layout>,
    },
    /// Bit-packed region, least significant bit first, realigned to a byte at its end.
    Bits {
        fields: Vec<BitField>,
    },
}

/// Width of a bit-packed integer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BitWidth {
    Fixed(u32),
    /// Width taken from an earlier named value times `scale`.
    Field { name: String, scale: u32 },
}

/// A field inside a [`Layout::Bits`] region.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum BitField {
    Uint {
        #[serde(default)]
        name: Option<String>,
        bits: BitWidth,
    },
    /// Eight-bit characters up to and including a zero character.
    Cstring,
    Bytes {
        len: usize,
    },
    If {
        field: String,
        condition: Condition,
        then: Vec<BitField>,
        #[serde(default)]
        otherwise: Vec<BitField>,
    },
    Repeat {
        count: String,
        body: Vec<BitField>,
    },
    /// Repeats `body` until `field` reads zero after an iteration.
    RepeatWhile {
        field: String,
        body: Vec<BitField>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct MessageLayout {
    pub opcode: u8,
    pub name: String,
    pub layout: Layout,
}

/// Rules for game-defined messages that sit outside the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct CustomMessageRules {
    /// Any opcode byte above this value is a custom message id.
    pub threshold: u8,
    /// Opcode whose records register a custom message id and its size.
    pub register_opcode: u8,
    pub id_field: String,
    pub size_field: String,
    /// Declared size meaning "the size follows inline as one byte".
    pub inline_size_sentinel: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
struct SchemaFile {
    messages: Vec<MessageLayout>,
    #[serde(default)]
    custom_messages: Option<CustomMessageRules>,
    #[serde(default)]
    terminal_opcode: Option<u8>,
}

/// Opcode-to-layout catalog plus the special rules the decoder honours.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(from = "SchemaFile", into = "SchemaFile")]
pub struct Schema {
    messages: BTreeMap<u8, MessageLayout>,
    custom_messages: Option<CustomMessageRules>,
    terminal_opcode: Option<u8>,
}

impl From<SchemaFile> for Schema {
    fn from(file: SchemaFile) -> Self {
        let mut schema = Schema::new(file.custom_messages, file.terminal_opcode);
        for message in file.messages {
            schema.insert(message);
        }
        schema
    }
}

impl From<Schema> for SchemaFile {
    fn from(schema: Schema) -> Self {
        SchemaFile {
            messages: schema.messages.into_values().collect(),
            custom_messages: schema.custom_messages,
            terminal_opcode: schema.terminal_opcode,
        }
    }
}

impl Schema {
    pub fn new(custom_messages: Option<CustomMessageRules>, terminal_opcode: Option<u8>) -> Self {
        Self {
            messages: BTreeMap::new(),
            custom_messages,
            terminal_opcode,
        }
    }

    /// Adds or replaces the layout for an opcode.
    pub fn insert(&mut self, message: MessageLayout) {
        self.messages.insert(message.opcode, message);
    }

    pub fn with_message(mut self, opcode: u8, name: &str, layout: Layout) -> Self {
        self.insert(MessageLayout {
            opcode,
            name: name.to_string(),
            layout,
        });
        self
    }

    pub fn get(&self, opcode: u8) -> Option<&MessageLayout> {
        self.messages.get(&opcode)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn custom_messages(&self) -> Option<&CustomMessageRules> {
        self.custom_messages.as_ref()
    }

    pub fn terminal_opcode(&self) -> Option<u8> {
        self.terminal_opcode
    }

    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read schema file at {:?}: {}", path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse schema JSON from {:?}: {}", path, e))
    }
}
