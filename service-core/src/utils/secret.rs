use subtle::ConstantTimeEq;

/// Compare a presented credential with the configured one in constant time.
///
/// Length differences return early; only equal-length inputs are compared
/// byte-for-byte without short-circuiting.
pub fn secrets_match(expected: &str, presented: &str) -> bool {
    let expected = expected.as_bytes();
    let presented = presented.as_bytes();

    if expected.is_empty() || expected.len() != presented.len() {
        return false;
    }

    expected.ct_eq(presented).into()
}

/// Extract the key from an `Authorization: <scheme> <key>` header value.
///
/// The scheme is matched case-insensitively; surrounding whitespace is ignored.
pub fn credential_for_scheme<'a>(header_value: &'a str, scheme: &str) -> Option<&'a str> {
    let (presented_scheme, key) = header_value.trim().split_once(' ')?;
    if !presented_scheme.eq_ignore_ascii_case(scheme) {
        return None;
    }
    let key = key.trim();
    (!key.is_empty()).then_some(key)
}
