//! Base58 text encoding (Bitcoin alphabet).
//!
//! Node IDs and stream IDs are displayed as Base58. Each leading zero byte
//! maps to a leading `'1'` and vice versa; the alphabet excludes `0`, `O`,
//! `I` and `l`.

use crate::error::Base58Error;

const ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

const INVALID: u8 = 0xFF;

const DECODE_TABLE: [u8; 128] = {
    let mut table = [INVALID; 128];
    let mut i = 0;
    while i < ALPHABET.len() {
        table[ALPHABET[i] as usize] = i as u8;
        i += 1;
    }
    table
};

/// Encode bytes as Base58 text.
#[must_use]
pub fn encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|&&b| b == 0).count();

    // Little-endian base-58 digits of the non-zero tail
    let mut digits: Vec<u8> = Vec::with_capacity(input.len() * 138 / 100 + 1);
    for &byte in &input[zeros..] {
        let mut carry = u32::from(byte);
        for digit in &mut digits {
            carry += u32::from(*digit) << 8;
            *digit = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }

    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat_n('1', zeros));
    out.extend(digits.iter().rev().map(|&d| ALPHABET[d as usize] as char));
    out
}

/// Decode Base58 text.
///
/// # Errors
///
/// Returns [`Base58Error::InvalidCharacter`] for any character outside the
/// alphabet.
pub fn decode(input: &str) -> Result<Vec<u8>, Base58Error> {
    let mut zeros = 0;
    let mut leading = true;

    // Little-endian base-256 bytes of the significant part
    let mut bytes: Vec<u8> = Vec::with_capacity(input.len());
    for (position, character) in input.chars().enumerate() {
        let value = lookup(character).ok_or(Base58Error::InvalidCharacter {
            character,
            position,
        })?;

        if leading && value == 0 {
            zeros += 1;
            continue;
        }
        leading = false;

        let mut carry = u32::from(value);
        for byte in &mut bytes {
            carry += u32::from(*byte) * 58;
            *byte = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }

    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

fn lookup(c: char) -> Option<u8> {
    let idx = usize::try_from(u32::from(c)).ok()?;
    match DECODE_TABLE.get(idx) {
        Some(&v) if v != INVALID => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_vectors() {
        let vectors: &[(&[u8], &str)] = &[
            (&[0x00], "1"),
            (&[0x00, 0x00, 0x00], "111"),
            (&[0x01], "2"),
            (&[0x39], "z"),
            (&[0x3A], "21"),
            (&[0xFF], "5Q"),
            (&[0x00, 0x01], "12"),
            (&[0x62, 0x62, 0x62], "a3gV"),
            (&[0x63, 0x63, 0x63], "aPEr"),
        ];

        for (raw, text) in vectors {
            assert_eq!(encode(raw), *text, "encode {raw:02x?}");
            assert_eq!(decode(text).unwrap(), *raw, "decode {text}");
        }
    }

    #[test]
    fn test_empty() {
        assert_eq!(encode(&[]), "");
        assert!(decode("").unwrap().is_empty());
    }

    #[test]
    fn test_single_byte_roundtrip_full_range() {
        for b in 0..=255u8 {
            assert_eq!(decode(&encode(&[b])).unwrap(), [b], "byte 0x{b:02x}");
        }
    }

    #[test]
    fn test_node_id_and_key_roundtrip() {
        let node_id = [
            0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ];
        assert_eq!(decode(&encode(&node_id)).unwrap(), node_id);

        let key: Vec<u8> = (0..32).collect();
        assert_eq!(decode(&encode(&key)).unwrap(), key);

        let high: Vec<u8> = (0..8).map(|i| 0xFF - i).collect();
        assert_eq!(decode(&encode(&high)).unwrap(), high);
    }

    #[test]
    fn test_excluded_characters_rejected() {
        for c in ['0', 'O', 'I', 'l'] {
            assert_eq!(
                decode(&c.to_string()),
                Err(Base58Error::InvalidCharacter {
                    character: c,
                    position: 0
                })
            );
        }
        assert!(decode("2é").is_err());
    }

    #[test]
    fn test_output_never_contains_excluded_characters() {
        for i in 0..50u8 {
            let input: Vec<u8> = (0..16).map(|j| j + i).collect();
            let encoded = encode(&input);
            assert!(!encoded.contains(['0', 'O', 'I', 'l']), "{encoded}");
        }
    }
}
