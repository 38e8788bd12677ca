//! Identifier validation for lease namespaces and holders.
//!
//! A namespace is an application name: lowercase alphanumeric words joined
//! by single hyphens, starting with a letter, with at least one letter in
//! every word (so purely numeric words cannot masquerade as unit ordinals).
//! A holder is a unit name: `<application>/<ordinal>`.

/// Whether `name` is a well-formed application name.
pub fn is_application(name: &str) -> bool {
    let mut words = name.split('-');
    let Some(first) = words.next() else {
        return false;
    };
    if !is_word(first) || !first.chars().next().is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }
    words.all(is_word)
}

fn is_word(word: &str) -> bool {
    !word.is_empty()
        && word.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && word.chars().any(|c| c.is_ascii_lowercase())
}

/// Whether `name` is a well-formed unit name (`<application>/<ordinal>`).
pub fn is_unit(name: &str) -> bool {
    match name.split_once('/') {
        Some((application, ordinal)) => is_application(application) && is_ordinal(ordinal),
        None => false,
    }
}

fn is_ordinal(s: &str) -> bool {
    // Decimal, no leading zeros (except "0" itself).
    match s.as_bytes() {
        [] => false,
        [b'0'] => true,
        [b'1'..=b'9', rest @ ..] => rest.iter().all(u8::is_ascii_digit),
        _ => false,
    }
}
