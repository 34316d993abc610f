use rand::Rng;
use serde::{Deserialize, Serialize};

/// Probability that a length-prefixed field carries a prefix unrelated to its body.
const LENGTH_MISMATCH_PROBABILITY: f64 = 0.1;
/// Default upper bound for randomly sized string bodies.
const DEFAULT_CSTRING_MAX_LEN: usize = 256;
/// Default upper bound for randomly sized length-prefixed bodies.
const DEFAULT_PREFIXED_MAX_LEN: usize = 1024;

fn default_cstring_max_len() -> usize {
    DEFAULT_CSTRING_MAX_LEN
}

fn default_prefixed_max_len() -> usize {
    DEFAULT_PREFIXED_MAX_LEN
}

/// Width of a little-endian length prefix in a message template.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PrefixWidth {
    U8,
    U16,
}

/// One field of a client message body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum FieldTemplate {
    U8,
    U16,
    U32,
    #[serde(rename_all = "kebab-case")]
    Cstring {
        #[serde(default = "default_cstring_max_len")]
        max_len: usize,
    },
    #[serde(rename_all = "kebab-case")]
    Prefixed {
        width: PrefixWidth,
        #[serde(default = "default_prefixed_max_len")]
        max_len: usize,
    },
    Bytes {
        len: usize,
    },
}

/// A client message shape: the outer discriminator plus the fields that follow it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MessageTemplate {
    pub name: String,
    pub opcode: u8,
    #[serde(default)]
    pub fields: Vec<FieldTemplate>,
}

impl MessageTemplate {
    pub fn new(name: impl Into<String>, opcode: u8, fields: Vec<FieldTemplate>) -> Self {
        Self {
            name: name.into(),
            opcode,
            fields,
        }
    }
}

/// Produces a fuzzed body for a message template.
///
/// Implementations must not emit the opcode byte; the sequence codec prepends it.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait TemplateMutator<R: Rng + ?Sized> {
    fn instantiate(&mut self, template: &MessageTemplate, rng: &mut R) -> Vec<u8>;
}

/// Fills every field of a template with a random value on each instantiation.
///
/// Integers are uniform over their range, strings get random non-NUL bytes and a
/// terminator, and length-prefixed fields usually carry an honest prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomFieldMutator;

impl RandomFieldMutator {
    pub fn new() -> Self {
        RandomFieldMutator
    }

    fn fill_field<R: Rng + ?Sized>(&self, field: &FieldTemplate, rng: &mut R, out: &mut Vec<u8>) {
        match field {
            FieldTemplate::U8 => out.push(rng.random()),
            FieldTemplate::U16 => out.extend_from_slice(&rng.random::<u16>().to_le_bytes()),
            FieldTemplate::U32 => out.extend_from_slice(&rng.random::<u32>().to_le_bytes()),
            FieldTemplate::Cstring { max_len } => {
                let len = rng.random_range(0..=*max_len);
                out.extend((0..len).map(|_| rng.random_range(1u8..=255u8)));
                out.push(0);
            }
            FieldTemplate::Prefixed { width, max_len } => {
                let limit = match width {
                    PrefixWidth::U8 => (*max_len).min(u8::MAX as usize),
                    PrefixWidth::U16 => (*max_len).min(u16::MAX as usize),
                };
                let len = rng.random_range(0..=limit);
                let declared = if rng.random_bool(LENGTH_MISMATCH_PROBABILITY) {
                    rng.random_range(0..=u16::MAX as usize)
                } else {
                    len
                };
                match width {
                    PrefixWidth::U8 => out.push(declared as u8),
                    PrefixWidth::U16 => out.extend_from_slice(&(declared as u16).to_le_bytes()),
                }
                let start = out.len();
                out.resize(start + len, 0);
                rng.fill_bytes(&mut out[start..]);
            }
            FieldTemplate::Bytes { len } => {
                let start = out.len();
                out.resize(start + len, 0);
                rng.fill_bytes(&mut out[start..]);
            }
        }
    }
}

impl<R: Rng + ?Sized> TemplateMutator<R> for RandomFieldMutator {
    fn instantiate(&mut self, template: &MessageTemplate, rng: &mut R) -> Vec<u8> {
        let mut body = Vec::new();
        for field in &template.fields {
            self.fill_field(field, rng, &mut body);
        }
        body
    }
}
