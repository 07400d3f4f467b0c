// Lexer: source bytes to tokens, with one token of lookahead.
// Line numbers are tracked as characters are consumed; `last_line` is the
// line of the last consumed token and is what instructions are tagged with.

use smol_str::SmolStr;

use super::parse_lua_number::parse_number;
use crate::lua_value::LuaValue;
use crate::lua_vm::{LuaError, LuaResult};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Reserved words
    And,
    Break,
    Do,
    Else,
    ElseIf,
    End,
    False,
    For,
    Function,
    Goto,
    If,
    In,
    Local,
    Nil,
    Not,
    Or,
    Repeat,
    Return,
    Then,
    True,
    Until,
    While,
    // Multi-character symbols
    IDiv,
    Concat,
    Dots,
    Eq,
    Ge,
    Le,
    Ne,
    Shl,
    Shr,
    DbColon,
    /// Single-character symbol
    Char(u8),
    Float(f64),
    Int(i64),
    Name(SmolStr),
    String(Vec<u8>),
    Eos,
}

impl Token {
    fn keyword(name: &[u8]) -> Option<Token> {
        Some(match name {
            b"and" => Token::And,
            b"break" => Token::Break,
            b"do" => Token::Do,
            b"else" => Token::Else,
            b"elseif" => Token::ElseIf,
            b"end" => Token::End,
            b"false" => Token::False,
            b"for" => Token::For,
            b"function" => Token::Function,
            b"goto" => Token::Goto,
            b"if" => Token::If,
            b"in" => Token::In,
            b"local" => Token::Local,
            b"nil" => Token::Nil,
            b"not" => Token::Not,
            b"or" => Token::Or,
            b"repeat" => Token::Repeat,
            b"return" => Token::Return,
            b"then" => Token::Then,
            b"true" => Token::True,
            b"until" => Token::Until,
            b"while" => Token::While,
            _ => return None,
        })
    }

    /// Quoted display form, as used in "expected" and "near" messages
    pub fn describe(&self) -> String {
        let text = match self {
            Token::And => "and",
            Token::Break => "break",
            Token::Do => "do",
            Token::Else => "else",
            Token::ElseIf => "elseif",
            Token::End => "end",
            Token::False => "false",
            Token::For => "for",
            Token::Function => "function",
            Token::Goto => "goto",
            Token::If => "if",
            Token::In => "in",
            Token::Local => "local",
            Token::Nil => "nil",
            Token::Not => "not",
            Token::Or => "or",
            Token::Repeat => "repeat",
            Token::Return => "return",
            Token::Then => "then",
            Token::True => "true",
            Token::Until => "until",
            Token::While => "while",
            Token::IDiv => "//",
            Token::Concat => "..",
            Token::Dots => "...",
            Token::Eq => "==",
            Token::Ge => ">=",
            Token::Le => "<=",
            Token::Ne => "~=",
            Token::Shl => "<<",
            Token::Shr => ">>",
            Token::DbColon => "::",
            Token::Char(c) => {
                return if c.is_ascii_graphic() || *c == b' ' {
                    format!("'{}'", *c as char)
                } else {
                    format!("'<\\{}>'", c)
                };
            }
            // Token classes print unquoted
            Token::Float(_) => return "<number>".to_string(),
            Token::Int(_) => return "<integer>".to_string(),
            Token::Name(_) => return "<name>".to_string(),
            Token::String(_) => return "<string>".to_string(),
            Token::Eos => return "<eof>".to_string(),
        };
        format!("'{text}'")
    }

    fn has_text(&self) -> bool {
        matches!(
            self,
            Token::Float(_) | Token::Int(_) | Token::Name(_) | Token::String(_)
        )
    }
}

#[derive(Debug, Clone)]
struct Scanned {
    token: Token,
    start: usize,
    end: usize,
}

pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    /// Line of the scanning position
    pub line: u32,
    /// Line of the last consumed token
    pub last_line: u32,
    pub token: Token,
    token_start: usize,
    token_end: usize,
    ahead: Option<Scanned>,
    chunk: SmolStr,
}

#[inline]
fn is_newline(b: u8) -> bool {
    b == b'\n' || b == b'\r'
}

#[inline]
fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

#[inline]
fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

#[inline]
fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Append the UTF-8 style encoding of `x` (up to 31 bits, six bytes)
fn push_utf8(buf: &mut Vec<u8>, mut x: u32) {
    if x < 0x80 {
        buf.push(x as u8);
        return;
    }
    let mut tail = [0u8; 6];
    let mut n = 0;
    // Largest value that still fits in the first byte
    let mut mfb: u32 = 0x3f;
    loop {
        tail[n] = 0x80 | (x & 0x3f) as u8;
        n += 1;
        x >>= 6;
        mfb >>= 1;
        if x <= mfb {
            break;
        }
    }
    buf.push(((!mfb << 1) | x) as u8);
    buf.extend(tail[..n].iter().rev());
}

impl<'s> Lexer<'s> {
    /// `chunk` is the printable chunk name used in error messages
    pub fn new(src: &'s [u8], chunk: SmolStr) -> Self {
        Lexer {
            src,
            pos: 0,
            line: 1,
            last_line: 1,
            token: Token::Eos,
            token_start: 0,
            token_end: 0,
            ahead: None,
            chunk,
        }
    }

    pub fn chunk(&self) -> &SmolStr {
        &self.chunk
    }

    /// Consume the current token
    pub fn next(&mut self) -> LuaResult<()> {
        self.last_line = self.line;
        let scanned = match self.ahead.take() {
            Some(s) => s,
            None => self.scan()?,
        };
        self.token = scanned.token;
        self.token_start = scanned.start;
        self.token_end = scanned.end;
        Ok(())
    }

    /// Token after the current one
    pub fn lookahead(&mut self) -> LuaResult<&Token> {
        if self.ahead.is_none() {
            let scanned = self.scan()?;
            self.ahead = Some(scanned);
        }
        match &self.ahead {
            Some(s) => Ok(&s.token),
            None => Ok(&Token::Eos),
        }
    }

    fn error_at(&self, message: String) -> LuaError {
        LuaError::Syntax {
            message,
            line: self.line,
            chunk: self.chunk.clone(),
        }
    }

    /// Syntax error pointing at the current token
    pub fn syntax_error(&self, msg: &str) -> LuaError {
        let near = if self.token.has_text() {
            format!("'{}'", String::from_utf8_lossy(&self.src[self.token_start..self.token_end]))
        } else {
            self.token.describe()
        };
        self.error_at(format!("{msg} near {near}"))
    }

    /// Error without a token reference (scoping and limit errors)
    pub fn semantic_error(&self, msg: &str) -> LuaError {
        self.error_at(msg.to_string())
    }

    /// Error raised while scanning; `near` is the text read so far, or the
    /// end of input
    fn lex_error(&self, msg: &str, start: usize, at_eof: bool) -> LuaError {
        if at_eof {
            return self.error_at(format!("{msg} near <eof>"));
        }
        let end = self.pos.min(self.src.len());
        let text = String::from_utf8_lossy(&self.src[start..end]);
        self.error_at(format!("{msg} near '{text}'"))
    }

    #[inline]
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    #[inline]
    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.src.get(self.pos + offset).copied()
    }

    /// Skip a newline sequence (`\n`, `\r`, `\n\r` or `\r\n`)
    fn newline(&mut self) {
        let first = self.src[self.pos];
        self.pos += 1;
        if let Some(b) = self.peek() {
            if is_newline(b) && b != first {
                self.pos += 1;
            }
        }
        self.line += 1;
    }

    fn scan(&mut self) -> LuaResult<Scanned> {
        loop {
            let start = self.pos;
            let Some(c) = self.peek() else {
                return Ok(Scanned {
                    token: Token::Eos,
                    start,
                    end: start,
                });
            };
            let token = match c {
                b'\n' | b'\r' => {
                    self.newline();
                    continue;
                }
                b' ' | b'\t' | 0x0b | 0x0c => {
                    self.pos += 1;
                    continue;
                }
                b'-' => {
                    if self.peek_at(1) != Some(b'-') {
                        self.pos += 1;
                        Token::Char(b'-')
                    } else {
                        self.pos += 2;
                        self.skip_comment(start)?;
                        continue;
                    }
                }
                b'[' => {
                    let sep = self.skip_sep();
                    if sep >= 2 {
                        let body = self.read_long_string(start, sep, false)?;
                        Token::String(body)
                    } else if sep == 0 {
                        return Err(self.lex_error("invalid long string delimiter", start, false));
                    } else {
                        Token::Char(b'[')
                    }
                }
                b'=' => self.one_or_two(b'=', Token::Eq, b'='),
                b'<' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'=') => {
                            self.pos += 1;
                            Token::Le
                        }
                        Some(b'<') => {
                            self.pos += 1;
                            Token::Shl
                        }
                        _ => Token::Char(b'<'),
                    }
                }
                b'>' => {
                    self.pos += 1;
                    match self.peek() {
                        Some(b'=') => {
                            self.pos += 1;
                            Token::Ge
                        }
                        Some(b'>') => {
                            self.pos += 1;
                            Token::Shr
                        }
                        _ => Token::Char(b'>'),
                    }
                }
                b'/' => self.one_or_two(b'/', Token::IDiv, b'/'),
                b'~' => self.one_or_two(b'=', Token::Ne, b'~'),
                b':' => self.one_or_two(b':', Token::DbColon, b':'),
                b'"' | b'\'' => Token::String(self.read_string(c, start)?),
                b'.' => {
                    if self.peek_at(1) == Some(b'.') {
                        if self.peek_at(2) == Some(b'.') {
                            self.pos += 3;
                            Token::Dots
                        } else {
                            self.pos += 2;
                            Token::Concat
                        }
                    } else if self.peek_at(1).is_some_and(|b| b.is_ascii_digit()) {
                        self.read_numeral(start)?
                    } else {
                        self.pos += 1;
                        Token::Char(b'.')
                    }
                }
                b'0'..=b'9' => self.read_numeral(start)?,
                c if is_name_start(c) => {
                    while self.peek().is_some_and(is_name_char) {
                        self.pos += 1;
                    }
                    let word = &self.src[start..self.pos];
                    match Token::keyword(word) {
                        Some(kw) => kw,
                        // Name characters are ASCII
                        None => Token::Name(SmolStr::new(String::from_utf8_lossy(word))),
                    }
                }
                other => {
                    self.pos += 1;
                    Token::Char(other)
                }
            };
            return Ok(Scanned {
                token,
                start,
                end: self.pos,
            });
        }
    }

    /// `second` follows: two-character token; otherwise the single `single`
    fn one_or_two(&mut self, second: u8, two: Token, single: u8) -> Token {
        self.pos += 1;
        if self.peek() == Some(second) {
            self.pos += 1;
            two
        } else {
            Token::Char(single)
        }
    }

    /// After `--`: long comment or comment to end of line
    fn skip_comment(&mut self, start: usize) -> LuaResult<()> {
        if self.peek() == Some(b'[') {
            let sep = self.skip_sep();
            if sep >= 2 {
                self.read_long_string(start, sep, true)?;
                return Ok(());
            }
        }
        while self.peek().is_some_and(|b| !is_newline(b)) {
            self.pos += 1;
        }
        Ok(())
    }

    /// Read `[=*[` or `]=*]`. Returns the level plus 2 when well formed,
    /// 1 for a lone bracket and 0 for a bracket followed by `=`s only.
    fn skip_sep(&mut self) -> usize {
        let bracket = self.src[self.pos];
        self.pos += 1;
        let mut count = 0;
        while self.peek() == Some(b'=') {
            self.pos += 1;
            count += 1;
        }
        if self.peek() == Some(bracket) {
            count + 2
        } else if count == 0 {
            1
        } else {
            0
        }
    }

    fn read_long_string(&mut self, start: usize, sep: usize, comment: bool) -> LuaResult<Vec<u8>> {
        // Second opening bracket
        self.pos += 1;
        if self.peek().is_some_and(is_newline) {
            self.newline();
        }
        let mut buf = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                let what = if comment {
                    "unfinished long comment"
                } else {
                    "unfinished long string"
                };
                return Err(self.lex_error(what, start, true));
            };
            match c {
                b']' => {
                    let save = self.pos;
                    if self.skip_sep() == sep {
                        self.pos += 1;
                        return Ok(buf);
                    }
                    buf.extend_from_slice(&self.src[save..self.pos]);
                }
                b'\n' | b'\r' => {
                    buf.push(b'\n');
                    self.newline();
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn escape_check(&mut self, ok: bool, msg: &str, start: usize) -> LuaResult<()> {
        if ok {
            return Ok(());
        }
        // Include the offending character in the message
        if self.peek().is_some() {
            self.pos += 1;
        }
        Err(self.lex_error(msg, start, false))
    }

    fn hex_digit(&mut self, start: usize) -> LuaResult<u32> {
        self.pos += 1;
        let digit = self.peek().and_then(|b| (b as char).to_digit(16));
        self.escape_check(digit.is_some(), "hexadecimal digit expected", start)?;
        Ok(digit.unwrap_or(0))
    }

    fn read_string(&mut self, delim: u8, start: usize) -> LuaResult<Vec<u8>> {
        self.pos += 1;
        let mut buf = Vec::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(self.lex_error("unfinished string", start, true));
            };
            if c == delim {
                self.pos += 1;
                return Ok(buf);
            }
            match c {
                b'\n' | b'\r' => return Err(self.lex_error("unfinished string", start, false)),
                b'\\' => {
                    self.pos += 1;
                    let Some(e) = self.peek() else {
                        // Reported as an unfinished string on the next round
                        continue;
                    };
                    match e {
                        b'a' | b'b' | b'f' | b'n' | b'r' | b't' | b'v' | b'\\' | b'"' | b'\'' => {
                            buf.push(match e {
                                b'a' => 0x07,
                                b'b' => 0x08,
                                b'f' => 0x0c,
                                b'n' => b'\n',
                                b'r' => b'\r',
                                b't' => b'\t',
                                b'v' => 0x0b,
                                other => other,
                            });
                            self.pos += 1;
                        }
                        b'x' => {
                            let hi = self.hex_digit(start)?;
                            let lo = self.hex_digit(start)?;
                            buf.push((hi * 16 + lo) as u8);
                            self.pos += 1;
                        }
                        b'u' => self.read_utf8_escape(&mut buf, start)?,
                        b'\n' | b'\r' => {
                            self.newline();
                            buf.push(b'\n');
                        }
                        b'z' => {
                            self.pos += 1;
                            while let Some(b) = self.peek() {
                                if is_newline(b) {
                                    self.newline();
                                } else if is_space(b) {
                                    self.pos += 1;
                                } else {
                                    break;
                                }
                            }
                        }
                        d if d.is_ascii_digit() => {
                            let mut value: u32 = 0;
                            let mut n = 0;
                            while n < 3 && self.peek().is_some_and(|b| b.is_ascii_digit()) {
                                value = value * 10 + (self.src[self.pos] - b'0') as u32;
                                self.pos += 1;
                                n += 1;
                            }
                            self.escape_check(value <= 255, "decimal escape too large", start)?;
                            buf.push(value as u8);
                        }
                        _ => self.escape_check(false, "invalid escape sequence", start)?,
                    }
                }
                _ => {
                    buf.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    /// `\u{XXX}`; the current byte is the `u`
    fn read_utf8_escape(&mut self, buf: &mut Vec<u8>, start: usize) -> LuaResult<()> {
        self.pos += 1;
        self.escape_check(self.peek() == Some(b'{'), "missing '{' in \\u{xxxx}", start)?;
        let mut value = self.hex_digit(start)?;
        loop {
            self.pos += 1;
            let Some(d) = self.peek().and_then(|b| (b as char).to_digit(16)) else {
                break;
            };
            self.escape_check(value <= 0x7FF_FFFF, "UTF-8 value too large", start)?;
            value = value * 16 + d;
        }
        self.escape_check(self.peek() == Some(b'}'), "missing '}' in \\u{xxxx}", start)?;
        self.pos += 1;
        push_utf8(buf, value);
        Ok(())
    }

    fn read_numeral(&mut self, start: usize) -> LuaResult<Token> {
        let mut exponent = [b'e', b'E'];
        let first = self.src[self.pos];
        self.pos += 1;
        if first == b'0' && matches!(self.peek(), Some(b'x' | b'X')) {
            self.pos += 1;
            exponent = [b'p', b'P'];
        }
        loop {
            match self.peek() {
                Some(b) if exponent.contains(&b) => {
                    self.pos += 1;
                    if matches!(self.peek(), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                Some(b) if b.is_ascii_hexdigit() || b == b'.' => self.pos += 1,
                _ => break,
            }
        }
        // A numeral touching a letter is malformed
        if self.peek().is_some_and(is_name_start) {
            self.pos += 1;
        }
        match parse_number(&self.src[start..self.pos]) {
            Some(LuaValue::Integer(i)) => Ok(Token::Int(i)),
            Some(LuaValue::Float(f)) => Ok(Token::Float(f)),
            _ => Err(self.lex_error("malformed number", start, false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(src: &str) -> Vec<Token> {
        let mut lex = Lexer::new(src.as_bytes(), SmolStr::new("test"));
        let mut out = Vec::new();
        loop {
            lex.next().unwrap();
            if lex.token == Token::Eos {
                break;
            }
            out.push(lex.token.clone());
        }
        out
    }

    fn lex_error(src: &str) -> String {
        let mut lex = Lexer::new(src.as_bytes(), SmolStr::new("test"));
        loop {
            match lex.next() {
                Err(e) => return e.to_string(),
                Ok(()) if lex.token == Token::Eos => panic!("no error for {src:?}"),
                Ok(()) => {}
            }
        }
    }

    #[test]
    fn test_operators_maximal_munch() {
        assert_eq!(
            tokens("a//b..c...~=<=>=<<>>::"),
            vec![
                Token::Name("a".into()),
                Token::IDiv,
                Token::Name("b".into()),
                Token::Concat,
                Token::Name("c".into()),
                Token::Dots,
                Token::Ne,
                Token::Le,
                Token::Ge,
                Token::Shl,
                Token::Shr,
                Token::DbColon,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            tokens("3 3.0 0xff 1e2 .5 0x1p-1"),
            vec![
                Token::Int(3),
                Token::Float(3.0),
                Token::Int(255),
                Token::Float(100.0),
                Token::Float(0.5),
                Token::Float(0.5),
            ]
        );
        assert_eq!(lex_error("x = 3x"), "test:1: malformed number near '3x'");
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            tokens(r#""a\tb\65\x41\u{48}\z
                   c""#),
            vec![Token::String(b"a\tbAAHc".to_vec())]
        );
        assert_eq!(tokens("'\\u{7FF}'"), vec![Token::String("\u{7FF}".as_bytes().to_vec())]);
        assert_eq!(tokens("'a\\\nb'"), vec![Token::String(b"a\nb".to_vec())]);
    }

    #[test]
    fn test_long_strings_and_comments() {
        assert_eq!(
            tokens("--[==[ skipped ]] ]==] [[\nfirst\nsecond]] -- tail"),
            vec![Token::String(b"first\nsecond".to_vec())]
        );
        assert_eq!(tokens("[=[a]]b]=]"), vec![Token::String(b"a]]b".to_vec())]);
    }

    #[test]
    fn test_line_tracking() {
        let mut lex = Lexer::new(b"a\r\nb\n\nc", SmolStr::new("test"));
        lex.next().unwrap();
        assert_eq!(lex.line, 1);
        lex.next().unwrap();
        assert_eq!(lex.line, 2);
        lex.next().unwrap();
        assert_eq!(lex.line, 4);
    }

    #[test]
    fn test_lexical_errors() {
        assert_eq!(lex_error("x = 'abc"), "test:1: unfinished string near <eof>");
        assert_eq!(lex_error("x = 'abc\n'"), "test:1: unfinished string near ''abc'");
        assert_eq!(lex_error("x = '\\q'"), "test:1: invalid escape sequence near ''\\q'");
        assert_eq!(lex_error("x = '\\300'"), "test:1: decimal escape too large near ''\\300''");
        assert_eq!(lex_error("x = [==[ abc"), "test:1: unfinished long string near <eof>");
    }
}
