use bzip2::read::BzDecoder;
use std::io::Read;
use thiserror::Error;

/// Marker that opens a compressed reassembled block.
pub const COMPRESSION_MARKER: &[u8; 4] = b"BZ2\x00";

const DESCRIPTOR_LEN: usize = 8;

#[derive(Error, Debug)]
pub enum FragmentError {
    #[error("Fragment descriptor list truncated at byte {0}")]
    TruncatedDescriptors(usize),
    #[error("Fragment {id} is outside the declared count of {count}")]
    InvalidFragmentId { id: u16, count: usize },
    #[error("Fragment {id} range {offset}+{length} exceeds remaining payload of {available} bytes")]
    RangeOutOfBounds {
        id: u16,
        offset: usize,
        length: usize,
        available: usize,
    },
    #[error("Failed to decompress reassembled block: {0}")]
    Decompression(#[from] std::io::Error),
}

/// One entry of the descriptor list at the head of a fragmented payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDescriptor {
    pub id: u16,
    pub count: u16,
    pub offset: u16,
    pub length: u16,
}

impl FragmentDescriptor {
    fn parse(bytes: &[u8]) -> Self {
        let word = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Self {
            id: ((word >> 16) & 0xFFFF) as u16,
            count: (word & 0xFFFF) as u16,
            offset: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_LEN] {
        let word = (self.id as u32) << 16 | self.count as u32;
        let mut out = [0u8; DESCRIPTOR_LEN];
        out[..4].copy_from_slice(&word.to_le_bytes());
        out[4..6].copy_from_slice(&self.offset.to_le_bytes());
        out[6..].copy_from_slice(&self.length.to_le_bytes());
        out
    }
}

/// Splits a fragmented payload into its descriptor list and the bytes that follow it.
pub fn parse_descriptors(data: &[u8]) -> Result<(Vec<FragmentDescriptor>, &[u8]), FragmentError> {
    let mut descriptors = Vec::new();
    let mut pos = 0;
    loop {
        let marker = *data
            .get(pos)
            .ok_or(FragmentError::TruncatedDescriptors(pos))?;
        pos += 1;
        if marker == 0 {
            return Ok((descriptors, &data[pos..]));
        }
        let bytes = data
            .get(pos..pos + DESCRIPTOR_LEN)
            .ok_or(FragmentError::TruncatedDescriptors(pos))?;
        descriptors.push(FragmentDescriptor::parse(bytes));
        pos += DESCRIPTOR_LEN;
    }
}

/// Per-connection fragment slots.
///
/// Slots are sized by the first fragment seen and released once every slot is
/// filled. Incomplete sets survive across payloads.
#[derive(Debug, Default)]
pub struct FragmentBuffer {
    slots: Option<Vec<Option<Vec<u8>>>>,
}

impl FragmentBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of slots currently filled, or `None` when no set is in progress.
    pub fn pending(&self) -> Option<(usize, usize)> {
        self.slots.as_ref().map(|slots| {
            (slots.iter().filter(|slot| slot.is_some()).count(), slots.len())
        })
    }

    pub fn clear(&mut self) {
        self.slots = None;
    }

    /// Excises every described fragment from `data` and returns the residual bytes,
    /// with any completed reassembly appended.
    ///
    /// Slot updates are committed only when the whole payload is accepted.
    pub fn reassemble(&mut self, data: &[u8]) -> Result<Vec<u8>, FragmentError> {
        let (descriptors, rest) = parse_descriptors(data)?;
        let mut residual = rest.to_vec();
        let mut removed = 0usize;
        let mut pending = self.slots.clone();

        for descriptor in descriptors {
            let offset = (descriptor.offset as usize).checked_sub(removed).ok_or(
                FragmentError::RangeOutOfBounds {
                    id: descriptor.id,
                    offset: descriptor.offset as usize,
                    length: descriptor.length as usize,
                    available: residual.len(),
                },
            )?;
            let length = descriptor.length as usize;
            if offset + length > residual.len() {
                return Err(FragmentError::RangeOutOfBounds {
                    id: descriptor.id,
                    offset,
                    length,
                    available: residual.len(),
                });
            }

            let slots = pending.get_or_insert_with(|| vec![None; descriptor.count as usize]);
            let index = (descriptor.id as usize)
                .checked_sub(1)
                .filter(|&index| index < slots.len())
                .ok_or(FragmentError::InvalidFragmentId {
                    id: descriptor.id,
                    count: slots.len(),
                })?;

            let fragment: Vec<u8> = residual.drain(offset..offset + length).collect();
            removed += length;
            slots[index] = Some(fragment);

            if slots.iter().all(Option::is_some) {
                let joined: Vec<u8> = slots.iter().flatten().flatten().copied().collect();
                pending = None;
                residual.extend_from_slice(&expand_block(joined)?);
            }
        }
        self.slots = pending;
        Ok(residual)
    }
}

fn expand_block(block: Vec<u8>) -> Result<Vec<u8>, FragmentError> {
    match block.strip_prefix(COMPRESSION_MARKER.as_slice()) {
        Some(compressed) => {
            let mut decompressed = Vec::new();
            BzDecoder::new(compressed).read_to_end(&mut decompressed)?;
            Ok(decompressed)
        }
        None => Ok(block),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use std::io::Write;

    fn fragmented(descriptors: &[FragmentDescriptor], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for descriptor in descriptors {
            out.push(1);
            out.extend_from_slice(&descriptor.to_bytes());
        }
        out.push(0);
        out.extend_from_slice(body);
        out
    }

    fn descriptor(id: u16, count: u16, offset: u16, length: u16) -> FragmentDescriptor {
        FragmentDescriptor {
            id,
            count,
            offset,
            length,
        }
    }

    #[test]
    fn descriptor_word_splits_id_and_count() {
        let bytes = [0x03, 0x00, 0x02, 0x00, 0x10, 0x00, 0x20, 0x00];
        let payload = [&[1u8][..], &bytes[..], &[0u8, 0xEE][..]].concat();
        let (descriptors, rest) = parse_descriptors(&payload).unwrap();
        assert_eq!(descriptors, vec![descriptor(2, 3, 0x10, 0x20)]);
        assert_eq!(rest, &[0xEE]);
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut buffer = FragmentBuffer::new();
        assert!(matches!(
            buffer.reassemble(&[]),
            Err(FragmentError::TruncatedDescriptors(0))
        ));
        assert!(matches!(
            buffer.reassemble(&[1, 0, 0]),
            Err(FragmentError::TruncatedDescriptors(1))
        ));
    }

    #[test]
    fn out_of_order_fragments_combine_only_when_complete() {
        let mut buffer = FragmentBuffer::new();

        let out = buffer
            .reassemble(&fragmented(&[descriptor(2, 3, 0, 3)], b"BBBxy"))
            .unwrap();
        assert_eq!(out, b"xy");
        assert_eq!(buffer.pending(), Some((1, 3)));

        let out = buffer
            .reassemble(&fragmented(&[descriptor(1, 3, 1, 2)], b"zAA"))
            .unwrap();
        assert_eq!(out, b"z");
        assert_eq!(buffer.pending(), Some((2, 3)));

        let out = buffer
            .reassemble(&fragmented(&[descriptor(3, 3, 0, 1)], b"Cq"))
            .unwrap();
        assert_eq!(out, b"qAABBBC");
        assert_eq!(buffer.pending(), None);
    }

    #[test]
    fn later_offsets_are_corrected_for_earlier_excisions() {
        let mut buffer = FragmentBuffer::new();
        // Offsets are relative to the original remainder "r1AAr2BBBr3".
        let payload = fragmented(
            &[descriptor(1, 2, 2, 2), descriptor(2, 2, 6, 3)],
            b"r1AAr2BBBr3",
        );
        let out = buffer.reassemble(&payload).unwrap();
        assert_eq!(out, b"r1r2r3AABBB");
    }

    #[test]
    fn compressed_reassembly_is_expanded() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(4);
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&original).unwrap();
        let mut block = COMPRESSION_MARKER.to_vec();
        block.extend_from_slice(&encoder.finish().unwrap());

        let split = block.len() / 2;
        let mut buffer = FragmentBuffer::new();
        let first = [&block[split..], b"head".as_slice()].concat();
        let out = buffer
            .reassemble(&fragmented(
                &[descriptor(2, 2, 0, (block.len() - split) as u16)],
                &first,
            ))
            .unwrap();
        assert_eq!(out, b"head");

        let out = buffer
            .reassemble(&fragmented(
                &[descriptor(1, 2, 3, split as u16)],
                &[b"abc".as_slice(), &block[..split]].concat(),
            ))
            .unwrap();
        let mut expected = b"abc".to_vec();
        expected.extend_from_slice(&original);
        assert_eq!(out, expected);
    }

    #[test]
    fn range_past_payload_end_is_rejected() {
        let mut buffer = FragmentBuffer::new();
        let result = buffer.reassemble(&fragmented(&[descriptor(1, 1, 2, 8)], b"abcd"));
        assert!(matches!(
            result,
            Err(FragmentError::RangeOutOfBounds { id: 1, .. })
        ));
    }

    #[test]
    fn rejected_payload_leaves_slots_untouched() {
        let mut buffer = FragmentBuffer::new();
        buffer
            .reassemble(&fragmented(&[descriptor(1, 3, 0, 2)], b"AAx"))
            .unwrap();
        assert_eq!(buffer.pending(), Some((1, 3)));

        let result = buffer.reassemble(&fragmented(
            &[descriptor(2, 3, 0, 2), descriptor(3, 3, 4, 8)],
            b"BBcdef",
        ));
        assert!(matches!(
            result,
            Err(FragmentError::RangeOutOfBounds { id: 3, .. })
        ));
        assert_eq!(buffer.pending(), Some((1, 3)));

        let out = buffer
            .reassemble(&fragmented(
                &[descriptor(2, 3, 0, 2), descriptor(3, 3, 3, 1)],
                b"BByCz",
            ))
            .unwrap();
        assert_eq!(out, b"yzAABBC");
        assert_eq!(buffer.pending(), None);
    }

    #[test]
    fn fragment_id_beyond_count_is_rejected() {
        let mut buffer = FragmentBuffer::new();
        let result = buffer.reassemble(&fragmented(&[descriptor(4, 3, 0, 1)], b"abcd"));
        assert!(matches!(
            result,
            Err(FragmentError::InvalidFragmentId { id: 4, count: 3 })
        ));
        let result = buffer.reassemble(&fragmented(&[descriptor(0, 3, 0, 1)], b"abcd"));
        assert!(matches!(
            result,
            Err(FragmentError::InvalidFragmentId { id: 0, .. })
        ));
    }
}
