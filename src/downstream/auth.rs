// =============================================================================
// Shared-secret check for the WebSocket upgrade
// =============================================================================
//
// Clients pass the secret as `?token=<secret>`. When the server has no secret
// configured every upgrade is accepted.
// =============================================================================

/// Compare two byte slices without an early exit on the first mismatching
/// byte. A length mismatch returns immediately; the expected length is not
/// secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Whether an upgrade presenting `presented` may proceed.
pub fn token_allows(expected: Option<&str>, presented: Option<&str>) -> bool {
    match expected {
        None => true,
        Some(expected) => presented.is_some_and(|p| constant_time_eq(p.as_bytes(), expected.as_bytes())),
    }
}
