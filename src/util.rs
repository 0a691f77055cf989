//! Shared helpers: weak ETags, gzip, URI splitting, version comparison and
//! pagination clamping.

use std::io::Write;

use flate2::write::GzEncoder;
use flate2::{Compression, Crc};

/// Compute the CRC32 checksum of a byte slice.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = Crc::new();
    crc.update(data);
    crc.sum()
}

/// Weak ETag for a body: `W/"<crc32-base36>"`.
pub fn etag(data: &[u8]) -> String {
    format!("W/\"{}\"", to_base36(crc32(data) as u64))
}

/// Lowercase base36 rendering of an integer.
pub fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_string();
    }
    let mut buf = Vec::new();
    while n > 0 {
        buf.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    buf.reverse();
    String::from_utf8(buf).unwrap_or_default()
}

/// Split a URI into the part before `?` and the raw query after it.
pub fn split_uri(uri: &str) -> (&str, &str) {
    match uri.find('?') {
        Some(i) => (&uri[..i], &uri[i + 1..]),
        None => (uri, ""),
    }
}

/// Gzip a body with the default compression level.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    // Writing to a Vec cannot fail.
    let _ = encoder.write_all(data);
    encoder.finish().unwrap_or_default()
}

/// MIME types whose bodies are worth compressing even when published as
/// Binary files.
pub fn is_text_mime(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    matches!(
        essence.as_str(),
        "application/json" | "text/css" | "text/html" | "text/plain" | "text/xml" | "application/js"
    )
}

/// Compare two dotted version strings section by section, zero-padding the
/// shorter section so `"1.2" < "1.10"`.
pub fn compare_version(a: &str, b: &str) -> i32 {
    let pa = parse_version(a);
    let pb = parse_version(b);

    for (s1, s2) in pa.iter().zip(pb.iter()) {
        let res = compare_section(s1, s2);
        if res != 0 {
            return res;
        }
    }
    0
}

fn compare_section(s1: &str, s2: &str) -> i32 {
    let (l1, l2) = (s1.len(), s2.len());
    let ord = if l1 == l2 {
        s1.cmp(s2)
    } else if l1 < l2 {
        let padded = format!("{}{}", "0".repeat(l2 - l1), s1);
        padded.as_str().cmp(s2)
    } else {
        let padded = format!("{}{}", "0".repeat(l1 - l2), s2);
        s1.cmp(padded.as_str())
    };
    ord as i32
}

fn parse_version(s: &str) -> [String; 3] {
    let mut sections = s.split('.');
    [
        sections.next().unwrap_or("").to_string(),
        sections.next().unwrap_or("").to_string(),
        sections.next().unwrap_or("").to_string(),
    ]
}

/// Clamp an offset/limit pair against a collection size, bounding the page
/// size by `max_limit`. Returns the `(left, right)` range to slice.
pub fn slicer(offset: usize, limit: usize, max: usize, max_limit: usize) -> (usize, usize) {
    let limit = limit.min(max_limit);
    let mut left = offset;
    let right = (left + limit).min(max);
    if left > right {
        left = right;
    }
    (left, right)
}

/// Parse a raw query string into decoded key/value pairs, preserving order
/// and duplicate keys.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for part in raw.split('&') {
        if part.is_empty() {
            continue;
        }
        let (k, v) = match part.split_once('=') {
            Some((k, v)) => (k, v),
            None => (part, ""),
        };
        let k = urlencoding::decode(k).map(|c| c.into_owned()).unwrap_or_else(|_| k.to_string());
        let v = urlencoding::decode(v).map(|c| c.into_owned()).unwrap_or_else(|_| v.to_string());
        pairs.push((k, v));
    }
    pairs
}

/// Resident memory of this process in KiB, best effort. Returns 0 where the
/// information is unavailable.
pub fn resident_mem_kib() -> u64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    let kb = rest
                        .trim()
                        .trim_end_matches("kB")
                        .trim()
                        .parse::<u64>()
                        .unwrap_or(0);
                    return kb;
                }
            }
        }
    }
    0
}
