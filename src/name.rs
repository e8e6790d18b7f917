//! Name handling: normalisation for hosts lookups, cache keys, and wire
//! questions, plus the reverse-`arpa` forms for address lookups.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::types::ResolutionError;

/// Maximum length of a name in presentation form, without the trailing dot.
const MAX_NAME_LENGTH: usize = 253;

/// Maximum length of a single label.
const MAX_LABEL_LENGTH: usize = 63;

/// Normalise a host name: lowercase it, strip a single trailing dot, and
/// enforce the length limits.  The normalised form is what gets used for
/// hosts lookups, cache keys, and wire questions, so the same name in
/// different case always maps to the same entry.
pub fn normalise(name: &str) -> Result<String, ResolutionError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);

    if trimmed.is_empty() || !trimmed.is_ascii() || trimmed.len() > MAX_NAME_LENGTH {
        return Err(invalid(name));
    }

    for label in trimmed.split('.') {
        if label.is_empty() || label.len() > MAX_LABEL_LENGTH {
            return Err(invalid(name));
        }
    }

    Ok(trimmed.to_ascii_lowercase())
}

fn invalid(name: &str) -> ResolutionError {
    ResolutionError::InvalidName { name: name.into() }
}

/// The reverse-lookup name for an address: `d.c.b.a.in-addr.arpa` for IPv4,
/// the nibble-reversed `ip6.arpa` form for IPv6.
pub fn reverse_lookup_name(address: IpAddr) -> String {
    match address {
        IpAddr::V4(address) => reverse_v4(address),
        IpAddr::V6(address) => reverse_v6(address),
    }
}

fn reverse_v4(address: Ipv4Addr) -> String {
    let [a, b, c, d] = address.octets();
    format!("{d}.{c}.{b}.{a}.in-addr.arpa")
}

fn reverse_v6(address: Ipv6Addr) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut name = String::with_capacity(72);
    for octet in address.octets().iter().rev() {
        name.push(HEX[usize::from(octet & 0x0f)] as char);
        name.push('.');
        name.push(HEX[usize::from(octet >> 4)] as char);
        name.push('.');
    }
    name.push_str("ip6.arpa");
    name
}
