// String to number conversion shared by the lexer, `tonumber` and the
// arithmetic coercions. Accepts decimal and hexadecimal integers and floats
// (hex floats with a binary `p` exponent), surrounded by optional spaces.

use crate::lua_value::LuaValue;

#[inline]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !is_space(*b)).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !is_space(*b)).map_or(start, |p| p + 1);
    &bytes[start..end]
}

fn hex_value(b: u8) -> Option<u32> {
    (b as char).to_digit(16)
}

/// Integer numeral. Hexadecimal numerals wrap around; decimal numerals that
/// overflow are rejected so they can be read as floats.
fn str_to_int(s: &[u8]) -> Option<i64> {
    let (neg, digits) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if digits.is_empty() {
        return None;
    }

    let mut value: u64 = 0;
    if digits.len() > 2 && digits[0] == b'0' && matches!(digits[1], b'x' | b'X') {
        for &b in &digits[2..] {
            value = value.wrapping_mul(16).wrapping_add(hex_value(b)? as u64);
        }
    } else {
        // Magnitude limit: i64::MAX, or one more for negative numerals
        let limit = i64::MAX as u64 + neg as u64;
        for &b in digits {
            if !b.is_ascii_digit() {
                return None;
            }
            value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
            if value > limit {
                return None;
            }
        }
    }
    let value = value as i64;
    Some(if neg { value.wrapping_neg() } else { value })
}

/// `0x` float with optional fraction and binary exponent
fn hex_to_float(s: &[u8]) -> Option<f64> {
    let mut mantissa = 0.0f64;
    let mut exp: i64 = 0;
    let mut any_digit = false;
    let mut seen_dot = false;
    let mut i = 0;
    while i < s.len() {
        let b = s[i];
        if b == b'.' {
            if seen_dot {
                return None;
            }
            seen_dot = true;
        } else if let Some(d) = hex_value(b) {
            mantissa = mantissa * 16.0 + d as f64;
            any_digit = true;
            if seen_dot {
                exp -= 4;
            }
        } else {
            break;
        }
        i += 1;
    }
    if !any_digit {
        return None;
    }
    if i < s.len() {
        if !matches!(s[i], b'p' | b'P') {
            return None;
        }
        i += 1;
        let (neg, rest) = match s.get(i) {
            Some(b'-') => (true, &s[i + 1..]),
            Some(b'+') => (false, &s[i + 1..]),
            _ => (false, &s[i..]),
        };
        if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
            return None;
        }
        let mut e: i64 = 0;
        for &b in rest {
            e = (e * 10 + (b - b'0') as i64).min(1 << 20);
        }
        exp += if neg { -e } else { e };
    }
    let exp = exp.clamp(-4000, 4000) as i32;
    // Split the scaling so intermediate powers stay finite
    let half = exp / 2;
    Some(mantissa * 2f64.powi(half) * 2f64.powi(exp - half))
}

fn str_to_float(s: &[u8]) -> Option<f64> {
    // 'inf' and 'nan' are not numerals
    if s.iter().any(|b| matches!(b, b'n' | b'N')) {
        return None;
    }
    let (neg, body) = match s.first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let value = if body.len() > 1 && body[0] == b'0' && matches!(body[1], b'x' | b'X') {
        hex_to_float(&body[2..])?
    } else {
        if body.is_empty()
            || !body
                .iter()
                .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-'))
        {
            return None;
        }
        // Only ASCII was let through
        let text = std::str::from_utf8(body).ok()?;
        text.parse::<f64>().ok()?
    };
    Some(if neg { -value } else { value })
}

/// Convert a numeral to an integer or float value
pub fn parse_number(bytes: &[u8]) -> Option<LuaValue> {
    let s = trim(bytes);
    if let Some(i) = str_to_int(s) {
        return Some(LuaValue::Integer(i));
    }
    str_to_float(s).map(LuaValue::Float)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(s: &str) -> Option<LuaValue> {
        parse_number(s.as_bytes())
    }

    #[test]
    fn test_integers() {
        assert_eq!(num("42"), Some(LuaValue::Integer(42)));
        assert_eq!(num("  -7  "), Some(LuaValue::Integer(-7)));
        assert_eq!(num("0x10"), Some(LuaValue::Integer(16)));
        assert_eq!(num("0xffffffffffffffff"), Some(LuaValue::Integer(-1)));
        assert_eq!(num("9223372036854775807"), Some(LuaValue::Integer(i64::MAX)));
        assert_eq!(num("-9223372036854775808"), Some(LuaValue::Integer(i64::MIN)));
    }

    #[test]
    fn test_decimal_overflow_becomes_float() {
        assert_eq!(num("9223372036854775808"), Some(LuaValue::Float(9223372036854775808.0)));
    }

    #[test]
    fn test_floats() {
        assert_eq!(num("3.5"), Some(LuaValue::Float(3.5)));
        assert_eq!(num(".5"), Some(LuaValue::Float(0.5)));
        assert_eq!(num("5."), Some(LuaValue::Float(5.0)));
        assert_eq!(num("1e3"), Some(LuaValue::Float(1000.0)));
        assert_eq!(num("0x1p4"), Some(LuaValue::Float(16.0)));
        assert_eq!(num("0x.8"), Some(LuaValue::Float(0.5)));
        assert_eq!(num("0xA.8p1"), Some(LuaValue::Float(21.0)));
    }

    #[test]
    fn test_rejects() {
        assert_eq!(num(""), None);
        assert_eq!(num("  "), None);
        assert_eq!(num("inf"), None);
        assert_eq!(num("nan"), None);
        assert_eq!(num("1e"), None);
        assert_eq!(num("0x"), None);
        assert_eq!(num("12a"), None);
        assert_eq!(num("1 2"), None);
    }
}
