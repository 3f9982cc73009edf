use chrono::Utc;
use rand::Rng;

/// Milliseconds since the Unix epoch. All key expirations and the
/// persistence bookkeeping run off this clock.
pub fn now_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    Utc::now().timestamp() as u64
}

/// Parse a byte string as a canonical base-10 signed 64-bit integer.
///
/// Canonical means the textual form is exactly what `i64::to_string`
/// would produce for the value: an optional leading minus, no leading
/// zeroes (except the single digit "0"), no sign for zero, nothing else.
/// INCR and friends refuse to operate on anything looser.
pub fn parse_i64_strict(bytes: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(bytes).ok()?;
    let v: i64 = s.parse().ok()?;
    if v.to_string().as_bytes() == bytes {
        Some(v)
    } else {
        None
    }
}

/// Lenient integer parse used for index/count arguments.
pub fn parse_i64(bytes: &[u8]) -> Option<i64> {
    std::str::from_utf8(bytes).ok()?.trim().parse().ok()
}

pub fn parse_f64(bytes: &[u8]) -> Option<f64> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    let v: f64 = match s {
        "inf" | "+inf" => f64::INFINITY,
        "-inf" => f64::NEG_INFINITY,
        _ => s.parse().ok()?,
    };
    if v.is_nan() {
        None
    } else {
        Some(v)
    }
}

/// Format a sorted-set score the way clients expect: integral scores
/// print without a trailing ".0".
pub fn format_f64(v: f64) -> String {
    if v == f64::INFINITY {
        "inf".to_string()
    } else if v == f64::NEG_INFINITY {
        "-inf".to_string()
    } else if v.fract() == 0.0 && v.abs() < 1e17 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

pub fn yes_no_to_bool(s: &str) -> Result<bool, String> {
    match &s.to_ascii_lowercase()[..] {
        "yes" => Ok(true),
        "no" => Ok(false),
        _ => Err("argument must be 'yes' or 'no'".to_string()),
    }
}

/// 40 lowercase hex characters identifying a primary's command history.
pub fn gen_run_id() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..40)
        .map(|_| HEX[rng.gen_range(0..16)] as char)
        .collect()
}

/// Glob matcher for KEYS/SCAN patterns: `*`, `?`, `[a-z]` classes with
/// `^` negation, and backslash escapes, over raw bytes.
pub fn glob_match(pattern: &[u8], string: &[u8]) -> bool {
    let (mut p, mut s) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while s < string.len() {
        let mut advance = 1usize;
        let matched = if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, s));
                    p += 1;
                    continue;
                }
                b'?' => true,
                b'[' => {
                    let (ok, len) = match_class(&pattern[p..], string[s]);
                    advance = len;
                    ok
                }
                b'\\' if p + 1 < pattern.len() => {
                    advance = 2;
                    pattern[p + 1] == string[s]
                }
                c => c == string[s],
            }
        } else {
            false
        };
        if matched {
            p += advance;
            s += 1;
        } else if let Some((sp, ss)) = star {
            p = sp + 1;
            s = ss + 1;
            star = Some((sp, ss + 1));
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Match one `[...]` class starting at `pat[0] == b'['` against `c`.
/// Returns (matched, byte length of the class in the pattern).
fn match_class(pat: &[u8], c: u8) -> (bool, usize) {
    let mut i = 1;
    let negate = i < pat.len() && pat[i] == b'^';
    if negate {
        i += 1;
    }
    let mut found = false;
    while i < pat.len() && pat[i] != b']' {
        if pat[i] == b'\\' && i + 1 < pat.len() {
            i += 1;
            if pat[i] == c {
                found = true;
            }
            i += 1;
        } else if i + 2 < pat.len() && pat[i + 1] == b'-' && pat[i + 2] != b']' {
            let (lo, hi) = (pat[i].min(pat[i + 2]), pat[i].max(pat[i + 2]));
            if c >= lo && c <= hi {
                found = true;
            }
            i += 3;
        } else {
            if pat[i] == c {
                found = true;
            }
            i += 1;
        }
    }
    if i < pat.len() {
        i += 1; // consume ']'
    }
    (found != negate, i)
}
