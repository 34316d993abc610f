//! Word-wise XOR obfuscation applied to sequenced link payloads.
//!
//! Each 4-byte little-endian word is mixed with a one-byte key and a rotating
//! window of a 16-entry substitution table. Trailing bytes that do not fill a
//! word are copied through untouched.

/// A 16-entry substitution table.
pub type MungeTable = [u8; 16];

/// General-purpose table, kept for configurations that select it.
pub const MUNGE_TABLE_1: MungeTable = [
    0x7A, 0x64, 0x05, 0xF1, 0x1B, 0x9B, 0xA0, 0xB5, 0xCA, 0xED, 0x61, 0x0D, 0x4A, 0xDF, 0x8E, 0xC7,
];

/// Table used for sequenced payloads in both directions.
pub const MUNGE_TABLE_2: MungeTable = [
    0x05, 0x61, 0x7A, 0xED, 0x1B, 0xCA, 0x0D, 0x9B, 0x4A, 0xF1, 0x64, 0xC7, 0xB5, 0x8E, 0xDF, 0xA0,
];

/// Table used for the server identity value exchanged during the handshake.
pub const MUNGE_TABLE_3: MungeTable = [
    0x20, 0x07, 0x13, 0x61, 0x03, 0x45, 0x17, 0x72, 0x0A, 0x2D, 0x48, 0x0C, 0x4A, 0x12, 0xA9, 0xB5,
];

const TABLE_MASK: u32 = 0xBFAF_A7A5;

fn table_word(table: &MungeTable, index: usize) -> u32 {
    (table[(index + 3) & 0x0F] as u32) << 24
        | (table[(index + 2) & 0x0F] as u32) << 16
        | (table[(index + 1) & 0x0F] as u32) << 8
        | table[index & 0x0F] as u32
        | TABLE_MASK
}

fn apply<F>(data: &[u8], mut word_fn: F) -> Vec<u8>
where
    F: FnMut(usize, u32) -> u32,
{
    let mut out = Vec::with_capacity(data.len());
    let mut words = data.chunks_exact(4);
    for (index, chunk) in words.by_ref().enumerate() {
        let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        out.extend_from_slice(&word_fn(index, word).to_le_bytes());
    }
    out.extend_from_slice(words.remainder());
    out
}

/// Obfuscates `data` with `table` under `key`.
pub fn munge(data: &[u8], table: &MungeTable, key: u8) -> Vec<u8> {
    let key = key as u32;
    apply(data, |index, word| {
        (word ^ !key).swap_bytes() ^ table_word(table, index) ^ key
    })
}

/// Inverse of [`munge`] for the same table and key.
pub fn unmunge(data: &[u8], table: &MungeTable, key: u8) -> Vec<u8> {
    let key = key as u32;
    apply(data, |index, word| {
        (word ^ key ^ table_word(table, index)).swap_bytes() ^ !key
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    #[test]
    fn munge_matches_reference_vectors() {
        let data: Vec<u8> = (1..14).collect();
        assert_eq!(
            munge(&data, &MUNGE_TABLE_2, 0x47),
            hex("191b0246550716024b1b4a4e0d")
        );
        assert_eq!(
            munge(b"\x03new\x00\x01\x01\x01", &MUNGE_TABLE_2, 1),
            hex("2c7d6e021a011141")
        );
        assert_eq!(munge(&[0, 0, 0, 0], &MUNGE_TABLE_1, 0), hex("00185000"));
    }

    #[test]
    fn unmunge_matches_reference_vector() {
        assert_eq!(
            unmunge(&hex("726a6444"), &MUNGE_TABLE_3, 0x10),
            hex("54243238")
        );
    }

    #[test]
    fn trailing_bytes_are_copied_verbatim() {
        let data = [0u8, 1, 2, 3, 0xAA, 0xBB, 0xCC];
        let munged = munge(&data, &MUNGE_TABLE_2, 9);
        assert_eq!(&munged[4..], &[0xAA, 0xBB, 0xCC]);
        assert_eq!(munge(&[0x10, 0x20], &MUNGE_TABLE_2, 200), vec![0x10, 0x20]);
        assert!(munge(&[], &MUNGE_TABLE_2, 1).is_empty());
    }

    proptest! {
        #[test]
        fn unmunge_inverts_munge(words in prop::collection::vec(any::<[u8; 4]>(), 0..64), key: u8) {
            let data: Vec<u8> = words.concat();
            for table in [&MUNGE_TABLE_1, &MUNGE_TABLE_2, &MUNGE_TABLE_3] {
                prop_assert_eq!(unmunge(&munge(&data, table, key), table, key), data.clone());
            }
        }

        #[test]
        fn unmunge_inverts_munge_with_tail(
            data in prop::collection::vec(any::<u8>(), 0..64),
            key: u8,
        ) {
            let munged = munge(&data, &MUNGE_TABLE_2, key);
            prop_assert_eq!(unmunge(&munged, &MUNGE_TABLE_2, key), data);
        }
    }
}
