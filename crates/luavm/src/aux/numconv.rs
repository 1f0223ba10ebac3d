// Number <-> string conversion.
//
// Parsing accepts decimal with optional exponent and hex with an 0x/0X
// prefix, with surrounding whitespace. If the first parse fails and the
// text contains a comma, it is retried with the comma as the decimal
// separator (input written under a different locale convention).
//
// Formatting is canonical and round-trippable: integral values in i64
// range print without a fractional part, everything else uses the
// shortest representation that parses back to the same double.

/// `tonumber` semantics for strings.
pub fn str_to_number(s: &str) -> Option<f64> {
    let t = s.trim();
    if t.is_empty() {
        return None;
    }
    if let Some(n) = parse_once(t) {
        return Some(n);
    }
    // decimal-separator retry
    if t.contains(',') {
        return parse_once(&t.replace(',', "."));
    }
    None
}

fn parse_once(t: &str) -> Option<f64> {
    let (neg, body) = match t.as_bytes().first() {
        Some(b'-') => (true, &t[1..]),
        Some(b'+') => (false, &t[1..]),
        _ => (false, t),
    };
    let mag = if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        if hex.is_empty() {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()? as f64
    } else {
        // reject forms f64::from_str takes but the language does not
        if body.contains(|c: char| c.is_ascii_alphabetic() && !matches!(c, 'e' | 'E' | 'x' | 'X'))
        {
            return None;
        }
        body.parse::<f64>().ok()?
    };
    Some(if neg { -mag } else { mag })
}

/// `tostring` semantics for numbers.
pub fn number_to_str(n: f64) -> String {
    if n.is_nan() {
        return "nan".to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if n == n.floor() && n.abs() < 1e15 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    let mut s = format!("{}", n);
    // normalize "1e20"-style output the shortest formatter may produce
    if !s.contains('.') && !s.contains('e') && !s.contains("inf") && !s.contains("nan") {
        s.push_str(".0");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_hex_and_exponent() {
        assert_eq!(str_to_number("42"), Some(42.0));
        assert_eq!(str_to_number("  3.5  "), Some(3.5));
        assert_eq!(str_to_number("0xFF"), Some(255.0));
        assert_eq!(str_to_number("-0x10"), Some(-16.0));
        assert_eq!(str_to_number("1e3"), Some(1000.0));
        assert_eq!(str_to_number("-2.5e-1"), Some(-0.25));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(str_to_number(""), None);
        assert_eq!(str_to_number("  "), None);
        assert_eq!(str_to_number("0x"), None);
        assert_eq!(str_to_number("12abc"), None);
        assert_eq!(str_to_number("nan?"), None);
    }

    #[test]
    fn comma_retry() {
        assert_eq!(str_to_number("3,5"), Some(3.5));
    }

    #[test]
    fn integral_values_print_without_fraction() {
        assert_eq!(number_to_str(3.0), "3");
        assert_eq!(number_to_str(-120.0), "-120");
        assert_eq!(number_to_str(0.0), "0");
    }

    #[test]
    fn round_trip_is_exact() {
        for n in [
            0.1,
            1.5,
            -2.75,
            1e100,
            -1e-100,
            std::f64::consts::PI,
            123456789.123,
        ] {
            let s = number_to_str(n);
            assert_eq!(str_to_number(&s), Some(n), "via {:?}", s);
        }
    }
}
