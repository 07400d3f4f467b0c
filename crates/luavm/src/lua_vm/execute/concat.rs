// CONCAT: right-to-left folding of `R[ra] .. ... .. R[ra+n-1]`.
// Runs of strings and numbers are joined in one buffer; any other pair
// goes through `__concat`.

use crate::lua_value::{LuaValue, fmt_number};
use crate::lua_vm::{LuaResult, LuaVM, TmKind, ValueSource};

impl LuaVM {
    #[inline]
    fn is_concatable(v: &LuaValue) -> bool {
        matches!(v, LuaValue::String(_) | LuaValue::Integer(_) | LuaValue::Float(_))
    }

    fn append_concatable(&self, buf: &mut Vec<u8>, v: &LuaValue) {
        match v {
            LuaValue::String(id) => buf.extend_from_slice(self.string_bytes(*id)),
            _ => {
                if let Some(s) = fmt_number(v) {
                    buf.extend_from_slice(s.as_bytes());
                }
            }
        }
    }

    /// Concatenate `n` values starting at `ra`; the result lands in `ra`
    pub(crate) fn concat(&mut self, ra: usize, n: usize) -> LuaResult<()> {
        let mut total = n;
        while total > 1 {
            let top = ra + total;
            let a = self.state.stack[top - 2];
            let b = self.state.stack[top - 1];
            if !Self::is_concatable(&a) || !Self::is_concatable(&b) {
                match self.try_bin_tm(a, b, TmKind::Concat)? {
                    Some(v) => self.state.stack[top - 2] = v,
                    None => {
                        let (culprit, slot) = if Self::is_concatable(&a) {
                            (b, top - 1)
                        } else {
                            (a, top - 2)
                        };
                        return Err(self.operand_error(culprit, ValueSource::Stack(slot), "concatenate"));
                    }
                }
                total -= 1;
                continue;
            }

            // Gather the longest run of strings/numbers ending at the top
            let mut count = 2;
            while count < total && Self::is_concatable(&self.state.stack[top - count - 1]) {
                count += 1;
            }
            let mut buf = Vec::new();
            for slot in top - count..top {
                let v = self.state.stack[slot];
                self.append_concatable(&mut buf, &v);
            }
            let s = self.intern_bytes(&buf);
            self.state.stack[top - count] = LuaValue::String(s);
            total -= count - 1;
        }
        Ok(())
    }
}
