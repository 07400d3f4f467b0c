// Arithmetic, comparison and length, with string coercion and metamethod
// fallback. The number-only core is shared with the compiler's constant folding.

use crate::compiler::parse_number;
use crate::lua_value::{LuaValue, float_ceil_to_integer, float_floor_to_integer};
use crate::lua_vm::{LuaResult, LuaVM, RuntimeErrorKind, TmKind, ValueSource};

/// Why a numeric operation could not produce a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithFailure {
    /// Bitwise operand without an integer representation
    NoInteger,
    DivideByZero,
    ModuloByZero,
}

/// `m % n` with the sign of the divisor; `n` must not be zero
#[inline]
pub(crate) fn lua_imod(m: i64, n: i64) -> i64 {
    if n == -1 {
        return 0;
    }
    let r = m % n;
    if r != 0 && (r ^ n) < 0 { r + n } else { r }
}

/// Floor division; `n` must not be zero
#[inline]
pub(crate) fn lua_idiv(m: i64, n: i64) -> i64 {
    if n == -1 {
        return m.wrapping_neg();
    }
    let q = m / n;
    if (m ^ n) < 0 && m % n != 0 { q - 1 } else { q }
}

#[inline]
pub(crate) fn lua_fmod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

/// Logical shift left; negative counts shift right
#[inline]
pub(crate) fn lua_shiftl(x: i64, y: i64) -> i64 {
    if y <= -64 || y >= 64 {
        0
    } else if y >= 0 {
        ((x as u64) << y) as i64
    } else {
        ((x as u64) >> -y) as i64
    }
}

#[inline]
fn to_int_exact(v: LuaValue) -> Option<i64> {
    v.to_integer_exact()
}

/// Apply `op` to two numeric values (Integer or Float). Unary operators
/// ignore `b`.
pub(crate) fn arith_raw(op: TmKind, a: LuaValue, b: LuaValue) -> Result<LuaValue, ArithFailure> {
    use LuaValue::{Float, Integer};
    match op {
        TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr | TmKind::BNot => {
            let x = to_int_exact(a).ok_or(ArithFailure::NoInteger)?;
            let y = if op == TmKind::BNot {
                0
            } else {
                to_int_exact(b).ok_or(ArithFailure::NoInteger)?
            };
            Ok(Integer(match op {
                TmKind::BAnd => x & y,
                TmKind::BOr => x | y,
                TmKind::BXor => x ^ y,
                TmKind::Shl => lua_shiftl(x, y),
                TmKind::Shr => lua_shiftl(x, y.wrapping_neg()),
                _ => !x,
            }))
        }
        TmKind::Div | TmKind::Pow => {
            let (x, y) = (a.as_number().unwrap_or(f64::NAN), b.as_number().unwrap_or(f64::NAN));
            Ok(Float(if op == TmKind::Div {
                x / y
            } else if y == 2.0 {
                x * x
            } else {
                x.powf(y)
            }))
        }
        _ => match (a, b) {
            (Integer(x), Integer(y)) => Ok(Integer(match op {
                TmKind::Add => x.wrapping_add(y),
                TmKind::Sub => x.wrapping_sub(y),
                TmKind::Mul => x.wrapping_mul(y),
                TmKind::Mod => {
                    if y == 0 {
                        return Err(ArithFailure::ModuloByZero);
                    }
                    lua_imod(x, y)
                }
                TmKind::IDiv => {
                    if y == 0 {
                        return Err(ArithFailure::DivideByZero);
                    }
                    lua_idiv(x, y)
                }
                _ => x.wrapping_neg(),
            })),
            (Integer(x), _) if op == TmKind::Unm => Ok(Integer(x.wrapping_neg())),
            _ => {
                let x = a.as_number().unwrap_or(f64::NAN);
                let y = b.as_number().unwrap_or(f64::NAN);
                Ok(Float(match op {
                    TmKind::Add => x + y,
                    TmKind::Sub => x - y,
                    TmKind::Mul => x * y,
                    TmKind::Mod => lua_fmod(x, y),
                    TmKind::IDiv => (x / y).floor(),
                    _ => -x,
                }))
            }
        },
    }
}

/// Constant folding entry point for the compiler
pub(crate) fn arith_numbers(op: TmKind, a: LuaValue, b: LuaValue) -> Option<LuaValue> {
    if !a.is_number() || !b.is_number() {
        return None;
    }
    arith_raw(op, a, b).ok()
}

#[inline]
fn lt_int_float(i: i64, f: f64) -> bool {
    match float_ceil_to_integer(f) {
        Some(c) => i < c,
        None => f > 0.0,
    }
}

#[inline]
fn le_int_float(i: i64, f: f64) -> bool {
    match float_floor_to_integer(f) {
        Some(c) => i <= c,
        None => f > 0.0,
    }
}

#[inline]
fn lt_float_int(f: f64, i: i64) -> bool {
    match float_floor_to_integer(f) {
        Some(c) => c < i,
        None => f < 0.0,
    }
}

#[inline]
fn le_float_int(f: f64, i: i64) -> bool {
    match float_ceil_to_integer(f) {
        Some(c) => c <= i,
        None => f < 0.0,
    }
}

/// Exact mixed integer/float ordering
pub(crate) fn num_less_than(a: LuaValue, b: LuaValue) -> Option<bool> {
    use LuaValue::{Float, Integer};
    Some(match (a, b) {
        (Integer(x), Integer(y)) => x < y,
        (Float(x), Float(y)) => x < y,
        (Integer(x), Float(y)) => lt_int_float(x, y),
        (Float(x), Integer(y)) => lt_float_int(x, y),
        _ => return None,
    })
}

pub(crate) fn num_less_equal(a: LuaValue, b: LuaValue) -> Option<bool> {
    use LuaValue::{Float, Integer};
    Some(match (a, b) {
        (Integer(x), Integer(y)) => x <= y,
        (Float(x), Float(y)) => x <= y,
        (Integer(x), Float(y)) => le_int_float(x, y),
        (Float(x), Integer(y)) => le_float_int(x, y),
        _ => return None,
    })
}

impl LuaVM {
    /// Numeric value of `v`, converting strings
    pub(crate) fn to_number(&self, v: &LuaValue) -> Option<LuaValue> {
        match v {
            LuaValue::Integer(_) | LuaValue::Float(_) => Some(*v),
            LuaValue::String(id) => parse_number(self.pool.strings[*id].as_bytes()),
            _ => None,
        }
    }

    /// Integer value of `v`; floats and strings must have an exact integer value
    pub(crate) fn to_integer(&self, v: &LuaValue) -> Option<i64> {
        self.to_number(v)?.to_integer_exact()
    }

    /// Binary (or unary, with `a == b`) arithmetic and bitwise operation
    pub(crate) fn arith(
        &mut self,
        op: TmKind,
        a: LuaValue,
        b: LuaValue,
        sa: ValueSource,
        sb: ValueSource,
    ) -> LuaResult<LuaValue> {
        if let (Some(x), Some(y)) = (self.to_number(&a), self.to_number(&b)) {
            match arith_raw(op, x, y) {
                Ok(v) => return Ok(v),
                Err(ArithFailure::DivideByZero) => {
                    return Err(self.runtime_error(RuntimeErrorKind::Type, "attempt to perform 'n//0'"));
                }
                Err(ArithFailure::ModuloByZero) => {
                    return Err(self.runtime_error(RuntimeErrorKind::Type, "attempt to perform 'n%0'"));
                }
                // Try metamethods before reporting
                Err(ArithFailure::NoInteger) => {}
            }
        }
        if let Some(v) = self.try_bin_tm(a, b, op)? {
            return Ok(v);
        }

        let bitwise = matches!(
            op,
            TmKind::BAnd | TmKind::BOr | TmKind::BXor | TmKind::Shl | TmKind::Shr | TmKind::BNot
        );
        let a_num = self.to_number(&a);
        let b_num = self.to_number(&b);
        if bitwise && a_num.is_some() && b_num.is_some() {
            let culprit = if a_num.and_then(|v| v.to_integer_exact()).is_none() {
                sa
            } else {
                sb
            };
            let info = self.varinfo(culprit);
            return Err(self.runtime_error(
                RuntimeErrorKind::Type,
                format!("number{info} has no integer representation"),
            ));
        }
        let (culprit, src) = if a_num.is_none() { (a, sa) } else { (b, sb) };
        let what = if bitwise {
            "perform bitwise operation on"
        } else {
            "perform arithmetic on"
        };
        Err(self.operand_error(culprit, src, what))
    }

    /// `attempt to <what> a <type> value (<varinfo>)`
    pub(crate) fn operand_error(&mut self, v: LuaValue, src: ValueSource, what: &str) -> crate::lua_vm::LuaError {
        let info = self.varinfo(src);
        let name = self.type_name_with_meta(&v);
        self.runtime_error(RuntimeErrorKind::Type, format!("attempt to {what} a {name} value{info}"))
    }

    pub(crate) fn less_than(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if let Some(r) = num_less_than(a, b) {
            return Ok(r);
        }
        if let (LuaValue::String(x), LuaValue::String(y)) = (a, b) {
            return Ok(self.string_bytes(x) < self.string_bytes(y));
        }
        match self.try_bin_tm(a, b, TmKind::Lt)? {
            Some(v) => Ok(v.is_truthy()),
            None => Err(self.order_error(a, b)),
        }
    }

    pub(crate) fn less_equal(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if let Some(r) = num_less_equal(a, b) {
            return Ok(r);
        }
        if let (LuaValue::String(x), LuaValue::String(y)) = (a, b) {
            return Ok(self.string_bytes(x) <= self.string_bytes(y));
        }
        match self.try_bin_tm(a, b, TmKind::Le)? {
            Some(v) => Ok(v.is_truthy()),
            None => Err(self.order_error(a, b)),
        }
    }

    fn order_error(&mut self, a: LuaValue, b: LuaValue) -> crate::lua_vm::LuaError {
        let t1 = self.type_name_with_meta(&a);
        let t2 = self.type_name_with_meta(&b);
        let msg = if t1 == t2 {
            format!("attempt to compare two {t1} values")
        } else {
            format!("attempt to compare {t1} with {t2}")
        };
        self.runtime_error(RuntimeErrorKind::Type, msg)
    }

    /// `==` with `__eq` for pairs of tables or pairs of userdata
    pub(crate) fn equal_values(&mut self, a: LuaValue, b: LuaValue) -> LuaResult<bool> {
        if a.raw_equal(&b) {
            return Ok(true);
        }
        let both_tables = a.is_table() && b.is_table();
        let both_userdata = matches!((a, b), (LuaValue::Userdata(_), LuaValue::Userdata(_)));
        if !both_tables && !both_userdata {
            return Ok(false);
        }
        let mut tm = self.get_metamethod(&a, TmKind::Eq);
        if tm.is_nil() {
            tm = self.get_metamethod(&b, TmKind::Eq);
        }
        if tm.is_nil() {
            return Ok(false);
        }
        Ok(self.call_value1(tm, &[a, b])?.is_truthy())
    }

    /// `#v`
    pub(crate) fn len_of(&mut self, v: LuaValue, src: ValueSource) -> LuaResult<LuaValue> {
        if let LuaValue::String(id) = v {
            return Ok(LuaValue::Integer(self.pool.strings[id].len() as i64));
        }
        let tm = self.get_metamethod(&v, TmKind::Len);
        if !tm.is_nil() {
            return self.call_value1(tm, &[v, v]);
        }
        match v {
            LuaValue::Table(id) => Ok(LuaValue::Integer(self.pool.tables[id].len() as i64)),
            _ => Err(self.operand_error(v, src, "get length of")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_floor_division_and_modulo() {
        assert_eq!(lua_idiv(7, 2), 3);
        assert_eq!(lua_idiv(-7, 2), -4);
        assert_eq!(lua_idiv(i64::MIN, -1), i64::MIN);
        assert_eq!(lua_imod(-7, 2), 1);
        assert_eq!(lua_imod(7, -2), -1);
        assert_eq!(lua_imod(i64::MIN, -1), 0);
    }

    #[test]
    fn test_float_modulo_follows_divisor_sign() {
        assert_eq!(lua_fmod(5.5, -2.0), -0.5);
        assert_eq!(lua_fmod(-5.5, 2.0), 0.5);
        assert_eq!(lua_fmod(1.0, f64::INFINITY), 1.0);
        assert_eq!(lua_fmod(-1.0, f64::INFINITY), f64::INFINITY);
        assert_eq!(lua_fmod(-1.0, f64::NEG_INFINITY), -1.0);
    }

    #[test]
    fn test_shifts() {
        assert_eq!(lua_shiftl(1, 63), i64::MIN);
        assert_eq!(lua_shiftl(1, 64), 0);
        assert_eq!(lua_shiftl(-1, -1), i64::MAX);
        assert_eq!(lua_shiftl(-1, -64), 0);
    }

    #[test]
    fn test_arith_result_subtypes() {
        let two = LuaValue::Integer(2);
        let three = LuaValue::Integer(3);
        assert!(matches!(arith_raw(TmKind::Add, two, three), Ok(LuaValue::Integer(5))));
        assert!(matches!(arith_raw(TmKind::Div, LuaValue::Integer(6), three), Ok(LuaValue::Float(f)) if f == 2.0));
        assert!(matches!(arith_raw(TmKind::Pow, two, two), Ok(LuaValue::Float(f)) if f == 4.0));
        assert_eq!(arith_raw(TmKind::IDiv, two, LuaValue::Integer(0)), Err(ArithFailure::DivideByZero));
        assert_eq!(arith_raw(TmKind::BAnd, LuaValue::Float(1.5), two), Err(ArithFailure::NoInteger));
        assert!(matches!(arith_raw(TmKind::BOr, LuaValue::Float(4.0), LuaValue::Integer(1)), Ok(LuaValue::Integer(5))));
    }

    #[test]
    fn test_mixed_comparisons_are_exact() {
        let big = LuaValue::Integer(i64::MAX);
        let two63 = LuaValue::Float(9_223_372_036_854_775_808.0);
        assert_eq!(num_less_than(big, two63), Some(true));
        assert_eq!(num_less_equal(two63, big), Some(false));
        assert_eq!(num_less_than(LuaValue::Integer(1), LuaValue::Float(f64::NAN)), Some(false));
        assert_eq!(num_less_equal(LuaValue::Float(1.0), LuaValue::Integer(1)), Some(true));
        assert_eq!(num_less_than(LuaValue::Float(-0.5), LuaValue::Integer(0)), Some(true));
    }
}
