//! Identities of the two sync peers. The engine only accepts device ids in
//! its canonical form: the base32 encoding of a certificate digest with a
//! Luhn check character appended to each 13-character group, rendered as
//! eight dash-separated groups of seven. Ids outside that form are rejected
//! when the engine loads its configuration. The CLI and the sidecar image
//! ship fixed certificates, so both ids are constants of the product.

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Digest of the certificate bundled with the CLI.
const LOCAL_DIGEST: [u8; 32] = [
    0x4c, 0x9a, 0x12, 0xe7, 0x5b, 0x03, 0xd8, 0x66, 0xaf, 0x21, 0x77, 0xc4, 0x0e, 0x58, 0xb9,
    0x3d, 0x81, 0xf2, 0x6a, 0x15, 0xc0, 0x9e, 0x44, 0x7b, 0x32, 0xd5, 0x08, 0xe1, 0x5f, 0xa6,
    0x93, 0x2c,
];

/// Digest of the certificate baked into the sidecar image.
const REMOTE_DIGEST: [u8; 32] = [
    0xb7, 0x40, 0xe9, 0x2d, 0x16, 0xcf, 0x58, 0x03, 0x9a, 0x64, 0xf1, 0x28, 0xd3, 0x7e, 0x45,
    0xb0, 0x6c, 0x91, 0x0a, 0xe7, 0x52, 0x3f, 0xc8, 0x14, 0xad, 0x69, 0xf6, 0x20, 0x8b, 0x57,
    0xce, 0x72,
];

pub fn local_device_id() -> String {
    encode(&LOCAL_DIGEST)
}

pub fn remote_device_id() -> String {
    encode(&REMOTE_DIGEST)
}

fn encode(digest: &[u8; 32]) -> String {
    let data = base32(digest);
    let mut with_checks = Vec::with_capacity(56);
    for block in data.chunks(13) {
        with_checks.extend_from_slice(block);
        with_checks.push(luhn32(block));
    }
    let mut id = String::with_capacity(63);
    for (index, chunk) in with_checks.chunks(7).enumerate() {
        if index > 0 {
            id.push('-');
        }
        for &byte in chunk {
            id.push(byte as char);
        }
    }
    id
}

/// Unpadded base32; 32 digest bytes become 52 characters.
fn base32(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    for &byte in bytes {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize]);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize]);
    }
    out
}

/// The engine's Luhn variant over the base32 alphabet: the factor starts at
/// one and the addend is folded digit-wise before summing.
fn luhn32(block: &[u8]) -> u8 {
    let mut factor = 1usize;
    let mut sum = 0usize;
    for &byte in block {
        let codepoint = BASE32_ALPHABET
            .iter()
            .position(|&a| a == byte)
            .unwrap_or(0);
        let addend = factor * codepoint;
        factor = if factor == 2 { 1 } else { 2 };
        sum += addend / 32 + addend % 32;
    }
    BASE32_ALPHABET[(32 - sum % 32) % 32]
}

/// Full format check, the same one the engine applies when parsing a device
/// id: group shape, alphabet, per-group check character, and a clean decode
/// back to a 32-byte digest.
#[cfg(test)]
pub(crate) fn is_valid(id: &str) -> bool {
    let groups: Vec<&str> = id.split('-').collect();
    if groups.len() != 8 || groups.iter().any(|group| group.len() != 7) {
        return false;
    }
    let stripped: Vec<u8> = id.bytes().filter(|&byte| byte != b'-').collect();
    if stripped.len() != 56 || !stripped.iter().all(|byte| BASE32_ALPHABET.contains(byte)) {
        return false;
    }
    let mut data = Vec::with_capacity(52);
    for block in stripped.chunks(14) {
        if luhn32(&block[..13]) != block[13] {
            return false;
        }
        data.extend_from_slice(&block[..13]);
    }
    decode(&data).is_some()
}

#[cfg(test)]
fn decode(data: &[u8]) -> Option<[u8; 32]> {
    let mut buffer: u32 = 0;
    let mut bits = 0u32;
    let mut out = Vec::with_capacity(32);
    for &byte in data {
        let value = BASE32_ALPHABET.iter().position(|&a| a == byte)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
        }
    }
    // 52 characters carry 260 bits; the trailing 4 must be padding zeros.
    if bits > 0 && buffer & ((1 << bits) - 1) != 0 {
        return None;
    }
    out.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_ids_are_stable_and_distinct() {
        assert_eq!(local_device_id(), local_device_id());
        assert_eq!(remote_device_id(), remote_device_id());
        assert_ne!(local_device_id(), remote_device_id());
    }

    #[test]
    fn device_ids_satisfy_the_engine_format() {
        for id in [local_device_id(), remote_device_id()] {
            assert_eq!(id.len(), 63, "8 groups of 7 plus 7 dashes: {id}");
            assert!(is_valid(&id), "engine would reject {id}");
        }
    }

    #[test]
    fn ids_decode_back_to_the_certificate_digest() {
        let id = local_device_id();
        let data: Vec<u8> = id
            .bytes()
            .filter(|&byte| byte != b'-')
            .collect::<Vec<u8>>()
            .chunks(14)
            .flat_map(|block| block[..13].to_vec())
            .collect();
        assert_eq!(decode(&data), Some(LOCAL_DIGEST));
    }

    #[test]
    fn corruption_is_detected() {
        let id = local_device_id();
        let replacement = if id.starts_with('A') { 'B' } else { 'A' };
        let mut corrupted = id.clone();
        corrupted.replace_range(0..1, &replacement.to_string());
        assert!(!is_valid(&corrupted));

        assert!(!is_valid("COVE-LOCAL"));
        assert!(!is_valid(""));
    }
}
