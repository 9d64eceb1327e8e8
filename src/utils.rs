//! Small helpers shared by the stores and the upload pipeline.

use rand::Rng;

/// Alphabet used for every generated identifier (staging rows, delete tokens, categories).
pub const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Default identifier length.
pub const DEFAULT_ID_LENGTH: usize = 10;

/// Generate a random alphanumeric identifier of `length` characters
pub fn generate_id(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

const SIZE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Format a byte count using base-1024 units.
///
/// Values are rounded to two decimals and trailing zeros are trimmed, so
/// `1024` renders as `1 KB` and `1536` as `1.5 KB`.
pub fn format_file_size(bytes: u64) -> String {
    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut unit = 0;
    let mut value = bytes as f64;
    while value >= 1024.0 && unit < SIZE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let rounded = format!("{:.2}", value);
    let trimmed = rounded.trim_end_matches('0').trim_end_matches('.');
    format!("{} {}", trimmed, SIZE_UNITS[unit])
}

/// Last path segment of a URL (everything after the final `/`)
pub fn filename_from_url(url: &str) -> &str {
    match url.rfind('/') {
        Some(idx) => &url[idx + 1..],
        None => url,
    }
}

/// Extract the 10-character content hash from a hosted image URL.
///
/// Accepts both the current layout (`.../{hash}`) and the legacy
/// `.../{hash}-{filename}` layout. Returns `None` when neither matches.
pub fn hash_from_url(url: &str) -> Option<&str> {
    let filename = filename_from_url(url);

    if is_fingerprint(filename) {
        return Some(filename);
    }

    match filename.split_once('-') {
        Some((prefix, _)) if is_fingerprint(prefix) => Some(prefix),
        _ => None,
    }
}

/// True when `value` looks like a fingerprint: exactly 10 lowercase hex characters
pub fn is_fingerprint(value: &str) -> bool {
    value.len() == 10 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_length_and_alphabet() {
        let id = generate_id(10);
        assert_eq!(id.len(), 10);
        assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));

        let token = generate_id(20);
        assert_eq!(token.len(), 20);
    }

    #[test]
    fn test_generate_id_consecutive_calls_differ() {
        // 62^10 possibilities, a collision here means the RNG is broken
        assert_ne!(generate_id(10), generate_id(10));
    }

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1_048_576), "1 MB");
        assert_eq!(format_file_size(1_073_741_824), "1 GB");
        assert_eq!(format_file_size(1_234_567), "1.18 MB");
    }

    #[test]
    fn test_format_file_size_is_monotonic() {
        let sizes = [1u64, 1000, 1023, 1024, 2048, 10_000, 1_000_000];
        let parsed: Vec<f64> = sizes
            .iter()
            .map(|&s| {
                let text = format_file_size(s);
                let (num, unit) = text.split_once(' ').unwrap();
                let exp = SIZE_UNITS.iter().position(|u| *u == unit).unwrap() as i32;
                num.parse::<f64>().unwrap() * 1024f64.powi(exp)
            })
            .collect();
        assert!(parsed.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_hash_from_url() {
        assert_eq!(hash_from_url("https://img.example/ab12cd34ef"), Some("ab12cd34ef"));
        assert_eq!(hash_from_url("https://img.example/ab12cd34ef-cat.png"), Some("ab12cd34ef"));
        assert_eq!(hash_from_url("https://img.example/cat.png"), None);
        assert_eq!(hash_from_url("https://img.example/AB12CD34EF"), None);
    }

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://a.b/c/d.png"), "d.png");
        assert_eq!(filename_from_url("plain"), "plain");
        assert_eq!(filename_from_url("https://a.b/"), "");
    }
}
