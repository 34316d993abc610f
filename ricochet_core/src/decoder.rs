use crate::schema::{BitField, BitWidth, Layout, Schema};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;

/// Errors that abort decoding of the current payload.
///
/// Connection-level decoder state (custom message sizes, the terminal flag) is left
/// intact, so the next payload decodes normally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown opcode {opcode:#04x} at byte {offset}")]
    UnknownOpcode { opcode: u8, offset: usize },
    #[error("Record needs {needed} bytes at byte {offset} but only {available} remain")]
    Truncated {
        needed: usize,
        offset: usize,
        available: usize,
    },
    #[error("Layout refers to undecoded field '{0}'")]
    MissingField(String),
    #[error("No switch case for discriminant {0}")]
    UnmatchedCase(i64),
    #[error("Invalid length {0}")]
    InvalidLength(i64),
    #[error("Bit field of {0} bits exceeds 64")]
    InvalidBitWidth(u64),
    #[error("Custom message {0:#04x} was never registered")]
    UnregisteredCustomMessage(u8),
    #[error("Custom message {id:#04x} registered with invalid size {size}")]
    InvalidCustomSize { id: i64, size: i64 },
}

/// One decoded server message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub opcode: u8,
    pub name: String,
    /// Raw body bytes, excluding the opcode.
    pub body: Vec<u8>,
    /// Named integers picked up while walking the layout; later values win.
    pub values: BTreeMap<String, i64>,
}

impl DecodedRecord {
    pub fn value(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomSize {
    Fixed(usize),
    /// Size is carried in the byte after the id.
    Inline,
}

/// Sizes of custom messages registered on one connection.
#[derive(Debug, Default, Clone)]
pub struct CustomMessageRegistry {
    sizes: HashMap<u8, CustomSize>,
}

impl CustomMessageRegistry {
    pub fn get(&self, id: u8) -> Option<CustomSize> {
        self.sizes.get(&id).copied()
    }

    pub fn insert(&mut self, id: u8, size: CustomSize) {
        self.sizes.insert(id, size);
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or(DecodeError::Truncated {
                needed: len,
                offset: self.pos,
                available: self.data.len() - self.pos,
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn take_cstring(&mut self) -> Result<&'a [u8], DecodeError> {
        let rest = &self.data[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Truncated {
                needed: rest.len() + 1,
                offset: self.pos,
                available: rest.len(),
            })?;
        self.take(nul + 1)
    }
}

/// Least-significant-bit-first reader over a byte slice.
struct BitReader<'a> {
    data: &'a [u8],
    bit: usize,
}

impl BitReader<'_> {
    fn read(&mut self, bits: u64) -> Result<u64, DecodeError> {
        if bits > 64 {
            return Err(DecodeError::InvalidBitWidth(bits));
        }
        let bits = bits as usize;
        let available = self.data.len() * 8 - self.bit;
        if bits > available {
            return Err(DecodeError::Truncated {
                needed: bits.div_ceil(8),
                offset: self.bit / 8,
                available: available / 8,
            });
        }
        let mut value = 0u64;
        for i in 0..bits {
            let byte = self.data[self.bit / 8];
            value |= (((byte >> (self.bit % 8)) & 1) as u64) << i;
            self.bit += 1;
        }
        Ok(value)
    }

    fn byte_position(&self) -> usize {
        self.bit.div_ceil(8)
    }
}

type Values = BTreeMap<String, i64>;

fn lookup(values: &Values, field: &str) -> Result<i64, DecodeError> {
    values
        .get(field)
        .copied()
        .ok_or_else(|| DecodeError::MissingField(field.to_string()))
}

fn count_of(values: &Values, field: &str) -> Result<usize, DecodeError> {
    let count = lookup(values, field)?;
    usize::try_from(count).map_err(|_| DecodeError::InvalidLength(count))
}

fn record(values: &mut Values, name: &Option<String>, value: i64) {
    if let Some(name) = name {
        values.insert(name.clone(), value);
    }
}

fn decode_layout(
    layout: &Layout,
    cursor: &mut Cursor,
    values: &mut Values,
) -> Result<(), DecodeError> {
    match layout {
        Layout::Empty => {}
        Layout::Bytes { len } => {
            cursor.take(*len)?;
        }
        Layout::Cstring => {
            cursor.take_cstring()?;
        }
        Layout::Int { name, width } => {
            let value = width.read(cursor.take(width.size())?);
            record(values, name, value);
        }
        Layout::Prefixed { width } => {
            let len = width.read(cursor.take(width.size())?);
            let len = usize::try_from(len).map_err(|_| DecodeError::InvalidLength(len))?;
            cursor.take(len)?;
        }
        Layout::Sequence { fields } => {
            for field in fields {
                decode_layout(field, cursor, values)?;
            }
        }
        Layout::Switch {
            width,
            name,
            cases,
            default,
        } => {
            let discriminant = width.read(cursor.take(width.size())?);
            record(values, name, discriminant);
            let branch = cases
                .iter()
                .find(|case| case.value == discriminant)
                .map(|case| &case.layout)
                .or(default.as_deref())
                .ok_or(DecodeError::UnmatchedCase(discriminant))?;
            decode_layout(branch, cursor, values)?;
        }
        Layout::If {
            field,
            condition,
            then,
            otherwise,
        } => {
            if condition.holds(lookup(values, field)?) {
                decode_layout(then, cursor, values)?;
            } else if let Some(otherwise) = otherwise {
                decode_layout(otherwise, cursor, values)?;
            }
        }
        Layout::Repeat { count, body } => {
            for _ in 0..count_of(values, count)? {
                let before = cursor.pos;
                decode_layout(body, cursor, values)?;
                if cursor.pos == before {
                    break;
                }
            }
        }
        Layout::Bits { fields } => {
            let mut reader = BitReader {
                data: &cursor.data[cursor.pos..],
                bit: 0,
            };
            decode_bits(fields, &mut reader, values)?;
            cursor.pos += reader.byte_position();
        }
    }
    Ok(())
}

fn decode_bits(
    fields: &[BitField],
    reader: &mut BitReader,
    values: &mut Values,
) -> Result<(), DecodeError> {
    for field in fields {
        match field {
            BitField::Uint { name, bits } => {
                let width = match bits {
                    BitWidth::Fixed(bits) => *bits as u64,
                    BitWidth::Field { name, scale } => (count_of(values, name)? as u64)
                        .checked_mul(*scale as u64)
                        .ok_or(DecodeError::InvalidBitWidth(u64::MAX))?,
                };
                let value = reader.read(width)?;
                record(values, name, value as i64);
            }
            BitField::Cstring => while reader.read(8)? != 0 {},
            BitField::Bytes { len } => {
                for _ in 0..*len {
                    reader.read(8)?;
                }
            }
            BitField::If {
                field,
                condition,
                then,
                otherwise,
            } => {
                if condition.holds(lookup(values, field)?) {
                    decode_bits(then, reader, values)?;
                } else {
                    decode_bits(otherwise, reader, values)?;
                }
            }
            BitField::Repeat { count, body } => {
                for _ in 0..count_of(values, count)? {
                    let before = reader.bit;
                    decode_bits(body, reader, values)?;
                    if reader.bit == before {
                        break;
                    }
                }
            }
            BitField::RepeatWhile { field, body } => loop {
                let before = reader.bit;
                decode_bits(body, reader, values)?;
                if lookup(values, field)? == 0 || reader.bit == before {
                    break;
                }
            },
        }
    }
    Ok(())
}

/// Incremental per-connection decoder for reassembled server payloads.
///
/// Decoded records are queued in arrival order. Once the schema's terminal opcode is
/// seen the decoder halts for the rest of the connection.
#[derive(Debug)]
pub struct FrameDecoder {
    schema: Arc<Schema>,
    registry: CustomMessageRegistry,
    halted: bool,
    queue: VecDeque<DecodedRecord>,
}

impl FrameDecoder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            registry: CustomMessageRegistry::default(),
            halted: false,
            queue: VecDeque::new(),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn registry(&self) -> &CustomMessageRegistry {
        &self.registry
    }

    pub fn pop(&mut self) -> Option<DecodedRecord> {
        self.queue.pop_front()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Decodes every record in `payload`, returning how many were queued.
    ///
    /// On error, records completed before the failing one stay queued and the rest
    /// of the payload is dropped.
    pub fn decode(&mut self, payload: &[u8]) -> Result<usize, DecodeError> {
        if self.halted {
            return Ok(0);
        }
        let schema = Arc::clone(&self.schema);
        let mut cursor = Cursor {
            data: payload,
            pos: 0,
        };
        let mut queued = 0;

        while cursor.pos < payload.len() {
            let offset = cursor.pos;
            let opcode = payload[offset];

            if let Some(rules) = schema.custom_messages() {
                if opcode > rules.threshold {
                    cursor.take(1)?;
                    let len = match self
                        .registry
                        .get(opcode)
                        .ok_or(DecodeError::UnregisteredCustomMessage(opcode))?
                    {
                        CustomSize::Fixed(len) => len,
                        CustomSize::Inline => cursor.take(1)?[0] as usize,
                    };
                    cursor.take(len)?;
                    continue;
                }
            }

            let message = schema
                .get(opcode)
                .ok_or(DecodeError::UnknownOpcode { opcode, offset })?;
            cursor.take(1)?;
            let body_start = cursor.pos;
            let mut values = Values::new();
            decode_layout(&message.layout, &mut cursor, &mut values)?;

            if schema.terminal_opcode() == Some(opcode) {
                self.halted = true;
                break;
            }

            let record = DecodedRecord {
                opcode,
                name: message.name.clone(),
                body: payload[body_start..cursor.pos].to_vec(),
                values,
            };
            if let Some(rules) = schema.custom_messages() {
                if opcode == rules.register_opcode {
                    let id = lookup(&record.values, &rules.id_field)?;
                    let size = lookup(&record.values, &rules.size_field)?;
                    let invalid = DecodeError::InvalidCustomSize { id, size };
                    let custom_size = if size == rules.inline_size_sentinel {
                        CustomSize::Inline
                    } else {
                        usize::try_from(size)
                            .map(CustomSize::Fixed)
                            .map_err(|_| invalid.clone())?
                    };
                    let id = u8::try_from(id).map_err(|_| invalid)?;
                    self.registry.insert(id, custom_size);
                }
            }
            self.queue.push_back(record);
            queued += 1;
        }
        Ok(queued)
    }
}
