use unicode_normalization::UnicodeNormalization;

/// Unicode NFC normalization + BOM strip + CRLF -> LF + trim.
pub fn clean_text(s: &str) -> String {
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

pub fn clamp_round_f32(x: f32, lo: f32, hi: f32, dp: u32) -> f32 {
    let clamped = x.clamp(lo, hi);
    let p = 10f32.powi(dp as i32);
    (clamped * p).round() / p
}

/// Accepts integers and floats (truncated); negatives and NaN are rejected.
pub fn clamp_token_count(raw: f64, ceiling: u32) -> Option<u32> {
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }
    let n = raw.trunc();
    if n < 1.0 {
        return Some(1);
    }
    Some(if n >= ceiling as f64 { ceiling } else { n as u32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_strips_bom() {
        assert_eq!(clean_text("  Hello world   "), "Hello world");
        assert_eq!(clean_text("\u{FEFF}hi"), "hi");
    }

    #[test]
    fn unicode_nfc_and_crlf_normalization() {
        // "e" + combining acute accent should normalize to "é"
        assert_eq!(clean_text("e\u{301}"), "é");
        assert_eq!(clean_text("line1\r\nline2"), "line1\nline2");
    }

    #[test]
    fn clamp_and_round_floats() {
        assert_eq!(clamp_round_f32(2.0000002, 0.0, 2.0, 3), 2.0);
        assert_eq!(clamp_round_f32(-1.0, 0.0, 2.0, 3), 0.0);
        assert_eq!(clamp_round_f32(0.12345, 0.0, 2.0, 3), 0.123);
    }

    #[test]
    fn token_count_bounds() {
        assert_eq!(clamp_token_count(500.0, 4096), Some(500));
        assert_eq!(clamp_token_count(500.9, 4096), Some(500));
        assert_eq!(clamp_token_count(1e9, 4096), Some(4096));
        assert_eq!(clamp_token_count(0.0, 4096), Some(1));
        assert_eq!(clamp_token_count(-3.0, 4096), None);
        assert_eq!(clamp_token_count(f64::NAN, 4096), None);
    }
}
