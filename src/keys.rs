//! Blowfish key derivation: combine a caller ASCII key with the fixed
//! Silkroad base key by XOR, truncated to the ASCII key's length.

/// The base key XORed into every derived PK2 Blowfish key.
pub const DEFAULT_BASE_KEY: [u8; 10] = [0x03, 0xF8, 0xE4, 0x44, 0x88, 0x99, 0x3F, 0x64, 0xFE, 0x35];

/// The default ASCII key used by official Silkroad Online clients.
pub const DEFAULT_ASCII_KEY: &[u8] = b"169841";

/// Derives Blowfish key material from `ascii_key` and `base_key`.
///
/// `ascii_key` is clamped to 56 bytes (the maximum Blowfish key length); each
/// byte is XORed with the corresponding `base_key` byte, treated as zero past
/// `base_key`'s length.
pub fn derive_key(ascii_key: &[u8], base_key: &[u8]) -> Vec<u8> {
    let len = ascii_key.len().min(56);
    let mut derived = Vec::with_capacity(len);
    for i in 0..len {
        let b = base_key.get(i).copied().unwrap_or(0);
        derived.push(ascii_key[i] ^ b);
    }
    derived
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_manual_xor_for_known_key() {
        let derived = derive_key(b"169841", &DEFAULT_BASE_KEY);
        let expected: Vec<u8> = b"169841"
            .iter()
            .zip(DEFAULT_BASE_KEY.iter())
            .map(|(a, b)| a ^ b)
            .collect();
        assert_eq!(derived, expected);
    }

    #[test]
    fn truncates_to_ascii_key_length() {
        let derived = derive_key(b"ab", &DEFAULT_BASE_KEY);
        assert_eq!(derived.len(), 2);
    }

    #[test]
    fn base_key_treated_as_zero_past_its_length() {
        let long_key = [0x42u8; 20];
        let derived = derive_key(&long_key, &DEFAULT_BASE_KEY);
        assert_eq!(derived[10], 0x42);
        assert_eq!(derived[19], 0x42);
    }

    #[test]
    fn clamps_to_56_bytes() {
        let long_key = [0x11u8; 100];
        let derived = derive_key(&long_key, &DEFAULT_BASE_KEY);
        assert_eq!(derived.len(), 56);
    }
}
