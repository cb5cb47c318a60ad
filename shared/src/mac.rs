use crate::protocol::UNKNOWN_HARDWARE_ADDRESS;

/// Normalize a hardware address to uppercase, colon-separated form
/// (`AA:BB:CC:DD:EE:FF`).
///
/// Accepts `:`, `-` or `.` separators as well as bare 12-digit hex strings.
/// Returns `None` for the `UNKNOWN` placeholder, the all-zero address and
/// anything that is not exactly six octets.
pub fn normalize_hardware_address(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNKNOWN_HARDWARE_ADDRESS) {
        return None;
    }

    let digits: String = trimmed
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();

    if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    // Separators, when present, must split the address into whole octets
    let separated = trimmed.len() != digits.len();
    if separated {
        let groups: Vec<&str> = trimmed.split([':', '-', '.']).collect();
        let valid_grouping = match groups.len() {
            6 => groups.iter().all(|g| g.len() == 2),
            3 => groups.iter().all(|g| g.len() == 4),
            _ => false,
        };
        if !valid_grouping {
            return None;
        }
    }

    if digits.chars().all(|c| c == '0') {
        return None;
    }

    let upper = digits.to_ascii_uppercase();
    let octets: Vec<&str> = (0..6).map(|i| &upper[i * 2..i * 2 + 2]).collect();
    Some(octets.join(":"))
}

/// First three octets of a normalized address, without separators (`AABBCC`).
pub fn oui_prefix(normalized: &str) -> Option<String> {
    let prefix: String = normalized
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(6)
        .collect();
    (prefix.len() == 6).then(|| prefix.to_ascii_uppercase())
}

/// Whether the locally-administered bit (0x02 of the first octet) is set.
/// Randomized client addresses and most virtual NICs set it.
pub fn is_locally_administered(normalized: &str) -> bool {
    normalized
        .get(0..2)
        .and_then(|b| u8::from_str_radix(b, 16).ok())
        .map(|first| first & 0x02 != 0)
        .unwrap_or(false)
}
