use crate::template::{MessageTemplate, TemplateMutator};
use rand::Rng;

/// Number of distinct sequences for `message_types` templates at `max_depth` positions.
///
/// Returns `None` when the space does not fit in a `u64`.
pub fn total_sequences(message_types: usize, max_depth: u32) -> Option<u64> {
    (message_types as u64).checked_pow(max_depth)
}

/// Expands a linear sequence index into template picks, most-significant digit first.
///
/// The result is not padded: index 0 yields an empty list and small indices yield
/// fewer than `max_depth` picks.
pub fn expand(index: u64, message_types: usize) -> Vec<usize> {
    let base = message_types as u64;
    let mut picks = Vec::new();
    if base < 2 {
        return picks;
    }
    let mut remaining = index;
    while remaining != 0 {
        picks.push((remaining % base) as usize);
        remaining /= base;
    }
    picks.reverse();
    picks
}

/// Maps sequence indices onto ordered lists of fuzzed messages.
#[derive(Debug, Clone)]
pub struct SequenceCodec {
    templates: Vec<MessageTemplate>,
    max_depth: u32,
}

impl SequenceCodec {
    pub fn new(templates: Vec<MessageTemplate>, max_depth: u32) -> Self {
        Self {
            templates,
            max_depth,
        }
    }

    pub fn message_types(&self) -> usize {
        self.templates.len()
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn templates(&self) -> &[MessageTemplate] {
        &self.templates
    }

    pub fn total_sequences(&self) -> Option<u64> {
        total_sequences(self.templates.len(), self.max_depth)
    }

    pub fn expand(&self, index: u64) -> Vec<usize> {
        expand(index, self.templates.len())
    }

    /// Produces one wire message per pick: the template's opcode byte followed by a
    /// freshly fuzzed body. Every call draws new field values.
    pub fn materialize<M, R>(&self, picks: &[usize], mutator: &mut M, rng: &mut R) -> Vec<Vec<u8>>
    where
        M: TemplateMutator<R> + ?Sized,
        R: Rng + ?Sized,
    {
        picks
            .iter()
            .map(|&pick| {
                let template = &self.templates[pick];
                let body = mutator.instantiate(template, rng);
                let mut message = Vec::with_capacity(body.len() + 1);
                message.push(template.opcode);
                message.extend_from_slice(&body);
                message
            })
            .collect()
    }
}
