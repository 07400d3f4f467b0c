use crate::lua_value::LuaValue;

/// Format a float the way `%.14g` does, adding `.0` when the result would
/// otherwise read as an integer.
pub fn fmt_float(f: f64) -> String {
    if f.is_nan() {
        return if f.is_sign_negative() { "-nan".into() } else { "nan".into() };
    }
    if f.is_infinite() {
        return if f < 0.0 { "-inf".into() } else { "inf".into() };
    }
    const PRECISION: i32 = 14;

    // Exponent after rounding to PRECISION significant digits
    let sci = format!("{:.*e}", (PRECISION - 1) as usize, f);
    let (mantissa, exp) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };

    let mut out = if exp < -4 || exp >= PRECISION {
        let mut m = mantissa.to_string();
        strip_trailing_zeros(&mut m);
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{m}e{sign}{:02}", exp.abs())
    } else {
        let decimals = (PRECISION - 1 - exp).max(0) as usize;
        let mut s = format!("{:.*}", decimals, f);
        strip_trailing_zeros(&mut s);
        s
    };

    if out.bytes().all(|b| b == b'-' || b.is_ascii_digit()) {
        out.push_str(".0");
    }
    out
}

fn strip_trailing_zeros(s: &mut String) {
    if s.contains('.') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
}

/// String form of a number value, None for other types
pub fn fmt_number(v: &LuaValue) -> Option<String> {
    match v {
        LuaValue::Integer(i) => {
            let mut buf = itoa::Buffer::new();
            Some(buf.format(*i).to_owned())
        }
        LuaValue::Float(f) => Some(fmt_float(*f)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fmt_float_matches_g14() {
        assert_eq!(fmt_float(1.0), "1.0");
        assert_eq!(fmt_float(-0.0), "-0.0");
        assert_eq!(fmt_float(0.1), "0.1");
        assert_eq!(fmt_float(1.2345678901234567), "1.2345678901235");
        assert_eq!(fmt_float(1e15), "1e+15");
        assert_eq!(fmt_float(1e100), "1e+100");
        assert_eq!(fmt_float(123456789012346.0), "1.2345678901235e+14");
        assert_eq!(fmt_float(0.0001), "0.0001");
        assert_eq!(fmt_float(0.00001), "1e-05");
        assert_eq!(fmt_float(2.5e-7), "2.5e-07");
        assert_eq!(fmt_float(f64::INFINITY), "inf");
        assert_eq!(fmt_float(-f64::INFINITY), "-inf");
        assert_eq!(fmt_float(100.0), "100.0");
    }

    #[test]
    fn test_fmt_number_integers() {
        assert_eq!(fmt_number(&LuaValue::Integer(-42)).as_deref(), Some("-42"));
        assert_eq!(fmt_number(&LuaValue::Integer(i64::MIN)).as_deref(), Some("-9223372036854775808"));
        assert_eq!(fmt_number(&LuaValue::Nil), None);
    }
}
