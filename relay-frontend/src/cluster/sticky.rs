//! Client IP resolution and sticky hashing for worker selection.
//!
//! The master sees only the first bytes of a connection. Behind a trusted
//! reverse proxy the real client address is in `X-Forwarded-For`; anywhere
//! else the direct peer address is used as-is.

use std::net::IpAddr;
use std::sync::LazyLock;

use regex::bytes::Regex;

static X_FORWARDED_FOR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)x-forwarded-for: ([^\r\n]*)\r\n").ok());

const HASH_MODULUS: u64 = 1 << 31;
const HASH_SEED: u64 = 0;

/// Extract the raw `X-Forwarded-For` header value from sniffed bytes.
pub fn forwarded_header(initial_data: &[u8]) -> Option<String> {
    X_FORWARDED_FOR
        .as_ref()?
        .captures(initial_data)
        .and_then(|caps| caps.get(1))
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
}

/// Determine the real client IP for a connection.
///
/// The header is only believed when the direct peer is a trusted proxy; the
/// first comma-separated entry that parses as an IP wins.
pub fn resolve_client_ip(
    direct_peer: IpAddr,
    forwarded: Option<&str>,
    is_trusted: impl Fn(&IpAddr) -> bool,
) -> IpAddr {
    let direct_peer = direct_peer.to_canonical();
    if !is_trusted(&direct_peer) {
        return direct_peer;
    }
    forwarded
        .and_then(|header| {
            header
                .split(',')
                .find_map(|entry| entry.trim().parse::<IpAddr>().ok())
        })
        .map(|ip| ip.to_canonical())
        .unwrap_or(direct_peer)
}

/// Map an IP to a worker index in `[0, max)`.
///
/// A one-at-a-time hash over the address octets, kept inside 31 bits at
/// every step so the result is identical on every platform. Strings that
/// are not IPs hash over their UTF-8 bytes.
pub fn sticky_hash(ip: &str, max: usize) -> usize {
    if max == 0 {
        return 0;
    }
    let bytes: Vec<u8> = match ip.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.octets().to_vec(),
        Ok(IpAddr::V6(v6)) => v6.octets().to_vec(),
        Err(_) => ip.as_bytes().to_vec(),
    };

    let mut hash = HASH_SEED;
    for byte in bytes {
        hash = (hash + u64::from(byte)) % HASH_MODULUS;
        hash += hash << 10;
        hash %= HASH_MODULUS;
        hash ^= hash >> 6;
    }

    hash += hash << 3;
    hash %= HASH_MODULUS;
    hash ^= hash >> 11;
    hash += hash << 15;
    hash %= HASH_MODULUS;

    (hash % max as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trusted(ip: &IpAddr) -> bool {
        *ip == "10.0.0.1".parse::<IpAddr>().unwrap()
    }

    #[test]
    fn hash_is_deterministic_and_in_range() {
        for n in 1..16 {
            for ip in ["1.2.3.4", "10.0.0.1", "::1", "2001:db8::7", "not-an-ip"] {
                let first = sticky_hash(ip, n);
                assert!(first < n);
                assert_eq!(first, sticky_hash(ip, n), "{ip} over {n}");
            }
        }
    }

    #[test]
    fn hash_matches_pinned_values() {
        // Pinned so a refactor cannot silently move every client to a new worker.
        assert_eq!(sticky_hash("127.0.0.1", 4), 1);
        assert_eq!(sticky_hash("10.0.0.1", 4), 3);
        assert_eq!(sticky_hash("1.2.3.4", 8), 3);
    }

    #[test]
    fn hash_spreads_ipv4_evenly() {
        let mut buckets = [0usize; 4];
        for i in 0..10_000u32 {
            let ip = format!("10.{}.{}.{}", (i >> 16) & 0xFF, (i >> 8) & 0xFF, i & 0xFF);
            buckets[sticky_hash(&ip, 4)] += 1;
        }
        let mean = 10_000 / 4;
        for (bucket, count) in buckets.iter().enumerate() {
            assert!(
                count * 4 >= mean * 3 && count * 4 <= mean * 5,
                "bucket {bucket} has {count} of 10000: {buckets:?}"
            );
        }
    }

    #[test]
    fn zero_pool_maps_to_zero() {
        assert_eq!(sticky_hash("1.2.3.4", 0), 0);
    }

    #[test]
    fn trusted_proxy_uses_first_forwarded_ip() {
        let ip = resolve_client_ip("10.0.0.1".parse().unwrap(), Some("1.2.3.4, 5.6.7.8"), trusted);
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn untrusted_peer_ignores_header() {
        let ip = resolve_client_ip("10.0.0.9".parse().unwrap(), Some("1.2.3.4, 5.6.7.8"), trusted);
        assert_eq!(ip, "10.0.0.9".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn invalid_forwarded_entries_are_skipped() {
        let ip = resolve_client_ip("10.0.0.1".parse().unwrap(), Some("unknown, 5.6.7.8"), trusted);
        assert_eq!(ip, "5.6.7.8".parse::<IpAddr>().unwrap());

        let ip = resolve_client_ip("10.0.0.1".parse().unwrap(), Some("garbage"), trusted);
        assert_eq!(ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn mapped_ipv6_peer_is_trusted_as_ipv4() {
        let ip = resolve_client_ip("::ffff:10.0.0.1".parse().unwrap(), Some("1.2.3.4"), trusted);
        assert_eq!(ip, "1.2.3.4".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn header_is_found_case_insensitively() {
        let request = b"GET /socket HTTP/1.1\r\nHost: a\r\nX-FORWARDED-FOR: 1.2.3.4, 5.6.7.8\r\n\r\n";
        assert_eq!(forwarded_header(request).as_deref(), Some("1.2.3.4, 5.6.7.8"));
        assert_eq!(forwarded_header(b"GET / HTTP/1.1\r\n\r\n"), None);
    }
}
