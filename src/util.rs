use std::time;

/// Get the current system time in epoch format.
///
/// # Returns
///
/// Current system time in seconds from epoch.
///
/// # Panics
///
/// Panics if the system time is before epoch.
pub fn now_from_epoch() -> u64 {
    time::SystemTime::now()
        .duration_since(time::UNIX_EPOCH)
        .expect("system time is before epoch")
        .as_secs()
}

/// Reads the string value following `"key":"` in raw markup.
///
/// This is a textual scan over HTML and inline scripts, not a JSON parse:
/// the value runs up to the next double quote.
///
/// # Examples
///
/// ```rust
/// let html = r#"<script>{"flowCtx":"abc:123","x":1}</script>"#;
/// assert_eq!(find_marker(html, "flowCtx"), Some("abc:123"));
/// ```
#[must_use]
pub fn find_marker<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    let marker = format!("{key}\":\"");
    let start = text.find(&marker)? + marker.len();
    let len = text[start..].find('"')?;
    Some(&text[start..start + len])
}

/// Random lowercase hexadecimal string of `len` characters.
#[must_use]
pub fn random_hex(len: usize) -> String {
    (0..len)
        .map(|_| char::from_digit(fastrand::u32(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Random ASCII letters, optionally followed by a digit and a symbol.
#[must_use]
pub fn random_string(len: usize, strong: bool) -> String {
    let mut s: String = (0..len).map(|_| fastrand::alphabetic()).collect();
    if strong {
        s.push(fastrand::digit(10));
        s.push(fastrand::choice(['@', '$', '%', '&', '*', '!', '?']).unwrap_or('!'));
    }
    s
}

/// Random address at a common mail provider.
#[must_use]
pub fn random_email() -> String {
    const DOMAINS: [&str; 12] = [
        "gmail.com",
        "outlook.com",
        "yahoo.com",
        "hotmail.com",
        "aol.com",
        "comcast.net",
        "icloud.com",
        "msn.com",
        "live.com",
        "protonmail.com",
        "yandex.com",
        "tutanota.com",
    ];
    let domain = fastrand::choice(DOMAINS).unwrap_or("gmail.com");
    format!("{}@{domain}", random_string(10, false))
}

/// Random date of birth as `YYYY-MM-DD`.
#[must_use]
pub fn random_birthdate() -> String {
    format!(
        "{}-{:02}-{:02}",
        fastrand::u16(1950..=2000),
        fastrand::u8(1..=12),
        fastrand::u8(1..=28)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_scan_reads_up_to_quote() {
        let html = r#"{"csrfToken":"tok-1","flowCtx":"a:b"}"#;
        assert_eq!(find_marker(html, "csrfToken"), Some("tok-1"));
        assert_eq!(find_marker(html, "flowCtx"), Some("a:b"));
        assert_eq!(find_marker(html, "spT"), None);
    }

    #[test]
    fn marker_without_closing_quote_is_missing() {
        assert_eq!(find_marker(r#""flowId":"unterminated"#, "flowId"), None);
    }

    #[test]
    fn random_values_have_expected_shape() {
        let hex = random_hex(32);
        assert_eq!(hex.len(), 32);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));

        let password = random_string(10, true);
        assert_eq!(password.chars().count(), 12);

        let email = random_email();
        assert!(email.contains('@'));

        let birthdate = random_birthdate();
        assert_eq!(birthdate.len(), 10);
    }
}
