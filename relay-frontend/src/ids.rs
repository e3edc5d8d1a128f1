//! Identifier generation for client sockets and frontend nodes.
//!
//! Socket ids are ULIDs (26 Crockford base32 characters: a 48-bit
//! millisecond timestamp followed by 80 random bits), so ids sort in
//! connection order within a worker's logs.

use rand::Rng;

const ULID_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ULID_LEN: u32 = 26;
const RANDOM_BITS: u32 = 80;

/// Generate a new socket id.
pub fn socket_id() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let entropy = rand::thread_rng().r#gen::<u128>() & ((1 << RANDOM_BITS) - 1);
    encode_ulid((millis << RANDOM_BITS) | entropy)
}

fn encode_ulid(value: u128) -> String {
    (0..ULID_LEN)
        .rev()
        .map(|group| ULID_ALPHABET[((value >> (group * 5)) & 0x1f) as usize] as char)
        .collect()
}

/// Generate the id this process uses for its liveness record.
///
/// `prefix` is the operator-configured node name; the random suffix keeps
/// respawned workers from inheriting a predecessor's record.
pub fn node_id(prefix: Option<&str>, slot: usize) -> String {
    let suffix: u32 = rand::thread_rng().r#gen();
    match prefix {
        Some(p) => format!("{p}-{slot}-{suffix:08x}"),
        None => format!("frontend-{slot}-{suffix:08x}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_id_length_and_uniqueness() {
        let a = socket_id();
        let b = socket_id();
        assert_eq!(a.len(), 26);
        assert_eq!(b.len(), 26);
        assert_ne!(a, b);
    }

    #[test]
    fn socket_id_is_crockford() {
        for c in socket_id().chars() {
            assert!(
                c.is_ascii_digit() || (c.is_ascii_uppercase() && !"ILOU".contains(c)),
                "Invalid Crockford char: {c}"
            );
        }
    }

    #[test]
    fn socket_ids_sort_by_creation_time() {
        let a = socket_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = socket_id();
        assert!(a < b, "socket ids should sort chronologically: {a} vs {b}");
    }

    #[test]
    fn timestamp_leads_the_encoding() {
        assert_eq!(encode_ulid(0), "0".repeat(26));
        let id = encode_ulid(42 << RANDOM_BITS);
        assert_eq!(&id[..10], "000000001A");
        assert_eq!(&id[10..], "0".repeat(16));
        assert_eq!(encode_ulid(u128::MAX >> 2), format!("3{}", "Z".repeat(25)));
    }

    #[test]
    fn node_id_carries_prefix_and_slot() {
        let id = node_id(Some("edge-eu"), 3);
        assert!(id.starts_with("edge-eu-3-"), "{id}");
        assert!(node_id(None, 0).starts_with("frontend-0-"));
    }
}
