//! A small tokenizer for C#-like source.
//!
//! It only knows enough of the grammar to separate identifiers and punctuation
//! from literals, comments and preprocessor lines, so pattern matching never
//! fires on text inside a string or a comment. Token text borrows from the
//! source, and byte offsets are kept so rewrites can splice the original text.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Ident,
    Number,
    Str,
    Char,
    Punct,
    Comment,
    Whitespace,
    /// A `#...` line such as `#region` or `#r "nuget: ..."`
    Directive,
}

impl TokenKind {
    /// Trivia carries no meaning for the analyzer.
    pub fn is_trivia(self) -> bool {
        matches!(self, Self::Comment | Self::Whitespace | Self::Directive)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the first character
    pub start: usize,
}

impl<'a> Token<'a> {
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    pub fn is_ident(&self, name: &str) -> bool {
        self.kind == TokenKind::Ident && self.text == name
    }

    pub fn is_punct(&self, p: char) -> bool {
        self.kind == TokenKind::Punct && self.text.len() == p.len_utf8() && self.text.starts_with(p)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexError {
    pub message: String,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at line {}, column {}",
            self.message, self.line, self.column
        )
    }
}

impl std::error::Error for LexError {}

/// 1-based line and column of a byte offset.
pub fn position(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
    let column = before[line_start..].chars().count() + 1;
    (line, column)
}

struct Cursor<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, n: usize) -> Option<u8> {
        self.bytes.get(self.pos + n).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        self.src[self.pos..].starts_with(s)
    }

    fn error(&self, message: &str, at: usize) -> LexError {
        let (line, column) = position(self.src, at);
        LexError {
            message: message.to_string(),
            line,
            column,
        }
    }

    /// Advance past one (possibly multi-byte) character.
    fn bump_char(&mut self) {
        if let Some(c) = self.src[self.pos..].chars().next() {
            self.pos += c.len_utf8();
        }
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn skip_block_comment(&mut self, start: usize) -> Result<(), LexError> {
        self.pos += 2;
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated block comment", start)),
                Some(b'*') if self.peek_at(1) == Some(b'/') => {
                    self.pos += 2;
                    return Ok(());
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Regular `"..."` string with backslash escapes; cursor on the opening quote.
    fn skip_regular_string(&mut self, start: usize, interpolated: bool) -> Result<(), LexError> {
        self.pos += 1;
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("Unterminated string literal", start)),
                Some(b'\\') => {
                    self.pos += 1;
                    self.bump_char();
                }
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b'{') if interpolated => {
                    if self.peek_at(1) == Some(b'{') {
                        self.pos += 2;
                    } else {
                        self.skip_hole(start)?;
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Verbatim `@"..."` string where `""` is an escaped quote.
    fn skip_verbatim_string(&mut self, start: usize, interpolated: bool) -> Result<(), LexError> {
        self.pos += 1;
        loop {
            match self.peek() {
                None => return Err(self.error("Unterminated verbatim string literal", start)),
                Some(b'"') if self.peek_at(1) == Some(b'"') => self.pos += 2,
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(b'{') if interpolated => {
                    if self.peek_at(1) == Some(b'{') {
                        self.pos += 2;
                    } else {
                        self.skip_hole(start)?;
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
    }

    /// Raw `"""..."""` string; closes on the same number of quotes it opened with.
    fn skip_raw_string(&mut self, start: usize) -> Result<(), LexError> {
        let mut quotes = 0;
        while self.peek() == Some(b'"') {
            quotes += 1;
            self.pos += 1;
        }
        let fence = "\"".repeat(quotes);
        match self.src[self.pos..].find(&fence) {
            Some(i) => {
                self.pos += i + quotes;
                // A longer run of quotes still closes the literal at its end.
                while self.peek() == Some(b'"') {
                    self.pos += 1;
                }
                Ok(())
            }
            None => Err(self.error("Unterminated raw string literal", start)),
        }
    }

    /// Interpolation hole `{ ... }`; cursor on the opening brace.
    fn skip_hole(&mut self, string_start: usize) -> Result<(), LexError> {
        self.pos += 1;
        let mut depth = 1usize;
        while depth > 0 {
            let here = self.pos;
            match self.peek() {
                None => return Err(self.error("Unterminated interpolated string", string_start)),
                Some(b'{') => {
                    depth += 1;
                    self.pos += 1;
                }
                Some(b'}') => {
                    depth -= 1;
                    self.pos += 1;
                }
                Some(b'"') | Some(b'@') | Some(b'$') | Some(b'\'') => {
                    if !self.skip_literal(here)? {
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek_at(1) == Some(b'*') => self.skip_block_comment(here)?,
                Some(_) => self.bump_char(),
            }
        }
        Ok(())
    }

    fn skip_char_literal(&mut self, start: usize) -> Result<(), LexError> {
        self.pos += 1;
        loop {
            match self.peek() {
                None | Some(b'\n') => return Err(self.error("Unterminated character literal", start)),
                Some(b'\\') => {
                    self.pos += 1;
                    self.bump_char();
                }
                Some(b'\'') => {
                    self.pos += 1;
                    return Ok(());
                }
                Some(_) => self.bump_char(),
            }
        }
    }

    /// Skip any string or char literal starting at the cursor. Returns false
    /// when the cursor is not on a literal.
    fn skip_literal(&mut self, start: usize) -> Result<bool, LexError> {
        if self.starts_with("\"\"\"") {
            self.skip_raw_string(start)?;
        } else if self.starts_with("\"") {
            self.skip_regular_string(start, false)?;
        } else if self.starts_with("'") {
            self.skip_char_literal(start)?;
        } else if self.starts_with("@\"") {
            self.pos += 1;
            self.skip_verbatim_string(start, false)?;
        } else if self.starts_with("$@\"") || self.starts_with("@$\"") {
            self.pos += 2;
            self.skip_verbatim_string(start, true)?;
        } else if self.starts_with("$") {
            let dollars = self.src[self.pos..].bytes().take_while(|b| *b == b'$').count();
            let rest = &self.src[self.pos + dollars..];
            if rest.starts_with("\"\"\"") {
                self.pos += dollars;
                self.skip_raw_string(start)?;
            } else if dollars == 1 && rest.starts_with('"') {
                self.pos += 1;
                self.skip_regular_string(start, true)?;
            } else {
                return Ok(false);
            }
        } else {
            return Ok(false);
        }
        Ok(true)
    }
}

fn is_ident_start(c: char) -> bool {
    c == '_' || c.is_alphabetic()
}

fn is_ident_continue(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

/// Split source into tokens, trivia included, so the concatenated token text
/// reproduces the input exactly.
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut cur = Cursor::new(source);
    let mut tokens = Vec::new();
    let mut line_start = true;
    let mut depth: Vec<(u8, usize)> = Vec::new();

    while let Some(b) = cur.peek() {
        let start = cur.pos;
        let kind = if b.is_ascii_whitespace() {
            while cur.peek().is_some_and(|b| b.is_ascii_whitespace()) {
                cur.pos += 1;
            }
            TokenKind::Whitespace
        } else if b == b'#' && line_start {
            cur.skip_line();
            TokenKind::Directive
        } else if cur.starts_with("//") {
            cur.skip_line();
            TokenKind::Comment
        } else if cur.starts_with("/*") {
            cur.skip_block_comment(start)?;
            TokenKind::Comment
        } else if b == b'\'' {
            cur.skip_char_literal(start)?;
            TokenKind::Char
        } else if cur.skip_literal(start)? {
            TokenKind::Str
        } else if b.is_ascii_digit()
            || (b == b'.' && cur.peek_at(1).is_some_and(|n| n.is_ascii_digit()))
        {
            cur.pos += 1;
            while let Some(n) = cur.peek() {
                let continues = n.is_ascii_alphanumeric()
                    || n == b'_'
                    || (n == b'.' && cur.peek_at(1).is_some_and(|d| d.is_ascii_digit()));
                if !continues {
                    break;
                }
                cur.pos += 1;
            }
            TokenKind::Number
        } else {
            let c = source[start..].chars().next().unwrap_or('\0');
            if is_ident_start(c) || (c == '@' && source[start + 1..].starts_with(is_ident_start)) {
                cur.bump_char();
                while source[cur.pos..].chars().next().is_some_and(is_ident_continue) {
                    cur.bump_char();
                }
                TokenKind::Ident
            } else {
                match b {
                    b'{' | b'(' | b'[' => depth.push((b, start)),
                    b'}' | b')' | b']' => {
                        let open = match b {
                            b'}' => b'{',
                            b')' => b'(',
                            _ => b'[',
                        };
                        match depth.pop() {
                            Some((o, _)) if o == open => {}
                            _ => return Err(cur.error("Unbalanced closing bracket", start)),
                        }
                    }
                    _ => {}
                }
                cur.bump_char();
                TokenKind::Punct
            }
        };

        let text = &source[start..cur.pos];
        if kind == TokenKind::Whitespace {
            if text.contains('\n') {
                line_start = true;
            }
        } else {
            line_start = false;
        }
        tokens.push(Token { kind, text, start });
    }

    if let Some((_, at)) = depth.pop() {
        return Err(cur.error("Unclosed bracket", at));
    }

    Ok(tokens)
}

/// Tokens with trivia removed.
pub fn significant<'a>(tokens: &[Token<'a>]) -> Vec<Token<'a>> {
    tokens.iter().filter(|t| !t.kind.is_trivia()).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, &str)> {
        significant(&tokenize(src).unwrap())
            .into_iter()
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_lossless() {
        let src = "using System;\n// hi\nvar s = $\"a {x + \"}\"} b\";\r\n#region r\nint y = 0x1F;";
        let rebuilt: String = tokenize(src).unwrap().iter().map(|t| t.text).collect();
        assert_eq!(rebuilt, src);
    }

    #[test]
    fn test_strings_hide_identifiers() {
        let toks = kinds(r#"Console.WriteLine("Process.Start(\"x\")");"#);
        assert_eq!(toks[0], (TokenKind::Ident, "Console"));
        assert_eq!(toks[4], (TokenKind::Str, r#""Process.Start(\"x\")""#));
        assert!(!toks.iter().any(|(_, t)| *t == "Process"));
    }

    #[test]
    fn test_verbatim_and_raw_strings() {
        let toks = kinds("var a = @\"c:\\dir\"\"q\"\"\"; var b = \"\"\"\n raw \"quoted\" \n\"\"\";");
        let strings: Vec<_> = toks.iter().filter(|(k, _)| *k == TokenKind::Str).collect();
        assert_eq!(strings.len(), 2);
        assert_eq!(strings[0].1, "@\"c:\\dir\"\"q\"\"\"");
    }

    #[test]
    fn test_verbatim_identifier() {
        let toks = kinds("var @class = 1;");
        assert_eq!(toks[1], (TokenKind::Ident, "@class"));
    }

    #[test]
    fn test_directive_only_at_line_start() {
        let toks = tokenize("#r \"nuget: X\"\nint a = 1;").unwrap();
        assert_eq!(toks[0].kind, TokenKind::Directive);
    }

    #[test]
    fn test_comments_are_trivia() {
        let toks = kinds("/* Process.Start */ x(); // Environment.Exit(1)");
        assert_eq!(toks.len(), 4);
    }

    #[test]
    fn test_unterminated_string_is_error() {
        let err = tokenize("var s = \"abc;\nint x;").unwrap_err();
        assert_eq!(err.line, 1);
        assert_eq!(err.column, 9);
    }

    #[test]
    fn test_unbalanced_braces_are_errors() {
        assert!(tokenize("class A { void M() { }").is_err());
        assert!(tokenize("x = (1 + 2));").is_err());
    }

    #[test]
    fn test_position() {
        assert_eq!(position("ab\ncd", 4), (2, 2));
        assert_eq!(position("ab", 0), (1, 1));
    }
}
