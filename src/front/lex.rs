//! The lexer.

use derive_more::Display;
use regex::Regex;

/// Tokens in the program
#[derive(Clone, Copy, PartialEq, Eq, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub col: u32,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
pub enum TokenKind {
    #[display("id")]
    Id,
    #[display("num")]
    Num,
    #[display("string")]
    Str,
    #[display("char")]
    Char,
    #[display("int")]
    KwInt,
    #[display("char")]
    KwChar,
    #[display("void")]
    KwVoid,
    #[display("long")]
    KwLong,
    #[display("short")]
    KwShort,
    #[display("float")]
    KwFloat,
    #[display("double")]
    KwDouble,
    #[display("signed")]
    KwSigned,
    #[display("unsigned")]
    KwUnsigned,
    #[display("struct")]
    KwStruct,
    #[display("union")]
    KwUnion,
    #[display("enum")]
    KwEnum,
    #[display("typedef")]
    KwTypedef,
    #[display("static")]
    KwStatic,
    #[display("const")]
    KwConst,
    #[display("volatile")]
    KwVolatile,
    #[display("register")]
    KwRegister,
    #[display("extern")]
    KwExtern,
    #[display("if")]
    KwIf,
    #[display("else")]
    KwElse,
    #[display("while")]
    KwWhile,
    #[display("for")]
    KwFor,
    #[display("do")]
    KwDo,
    #[display("switch")]
    KwSwitch,
    #[display("case")]
    KwCase,
    #[display("default")]
    KwDefault,
    #[display("break")]
    KwBreak,
    #[display("continue")]
    KwContinue,
    #[display("return")]
    KwReturn,
    #[display("sizeof")]
    KwSizeof,
    #[display("goto")]
    KwGoto,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Star,
    #[display("/")]
    Slash,
    #[display("%")]
    Percent,
    #[display("=")]
    Assign,
    #[display("+=")]
    PlusAssign,
    #[display("-=")]
    MinusAssign,
    #[display("*=")]
    StarAssign,
    #[display("/=")]
    SlashAssign,
    #[display("%=")]
    PercentAssign,
    #[display("&=")]
    AmpAssign,
    #[display("|=")]
    PipeAssign,
    #[display("^=")]
    CaretAssign,
    #[display("<<=")]
    ShlAssign,
    #[display(">>=")]
    ShrAssign,
    #[display("==")]
    EqEq,
    #[display("!=")]
    Ne,
    #[display("<")]
    Lt,
    #[display("<=")]
    Le,
    #[display(">")]
    Gt,
    #[display(">=")]
    Ge,
    #[display("&&")]
    AndAnd,
    #[display("||")]
    OrOr,
    #[display("!")]
    Bang,
    #[display("&")]
    Amp,
    #[display("|")]
    Pipe,
    #[display("^")]
    Caret,
    #[display("~")]
    Tilde,
    #[display("<<")]
    Shl,
    #[display(">>")]
    Shr,
    #[display("++")]
    PlusPlus,
    #[display("--")]
    MinusMinus,
    #[display("->")]
    Arrow,
    #[display(".")]
    Dot,
    #[display(",")]
    Comma,
    #[display(";")]
    Semi,
    #[display(":")]
    Colon,
    #[display("?")]
    Question,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("[")]
    LBracket,
    #[display("]")]
    RBracket,
    #[display("{{")]
    LBrace,
    #[display("}}")]
    RBrace,
    #[display("...")]
    Ellipsis,
}

pub struct LexError {
    line: u32,
    col: u32,
    ch: char,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Lexer error: unexpected character {:?} at line {}, column {}",
            self.ch, self.line, self.col
        )
    }
}

impl std::fmt::Debug for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self}")
    }
}

/// Multi-character punctuation first: matching is longest-first.
static PUNCT: &[(&str, TokenKind)] = &[
    ("...", TokenKind::Ellipsis),
    ("<<=", TokenKind::ShlAssign),
    (">>=", TokenKind::ShrAssign),
    ("++", TokenKind::PlusPlus),
    ("--", TokenKind::MinusMinus),
    ("->", TokenKind::Arrow),
    ("<<", TokenKind::Shl),
    (">>", TokenKind::Shr),
    ("<=", TokenKind::Le),
    (">=", TokenKind::Ge),
    ("==", TokenKind::EqEq),
    ("!=", TokenKind::Ne),
    ("&&", TokenKind::AndAnd),
    ("||", TokenKind::OrOr),
    ("+=", TokenKind::PlusAssign),
    ("-=", TokenKind::MinusAssign),
    ("*=", TokenKind::StarAssign),
    ("/=", TokenKind::SlashAssign),
    ("%=", TokenKind::PercentAssign),
    ("&=", TokenKind::AmpAssign),
    ("|=", TokenKind::PipeAssign),
    ("^=", TokenKind::CaretAssign),
    ("+", TokenKind::Plus),
    ("-", TokenKind::Minus),
    ("*", TokenKind::Star),
    ("/", TokenKind::Slash),
    ("%", TokenKind::Percent),
    ("=", TokenKind::Assign),
    ("<", TokenKind::Lt),
    (">", TokenKind::Gt),
    ("!", TokenKind::Bang),
    ("&", TokenKind::Amp),
    ("|", TokenKind::Pipe),
    ("^", TokenKind::Caret),
    ("~", TokenKind::Tilde),
    (".", TokenKind::Dot),
    (",", TokenKind::Comma),
    (";", TokenKind::Semi),
    (":", TokenKind::Colon),
    ("?", TokenKind::Question),
    ("(", TokenKind::LParen),
    (")", TokenKind::RParen),
    ("[", TokenKind::LBracket),
    ("]", TokenKind::RBracket),
    ("{", TokenKind::LBrace),
    ("}", TokenKind::RBrace),
];

fn keyword(text: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match text {
        "int" => KwInt,
        "char" => KwChar,
        "void" => KwVoid,
        "long" => KwLong,
        "short" => KwShort,
        "float" => KwFloat,
        "double" => KwDouble,
        "signed" => KwSigned,
        "unsigned" => KwUnsigned,
        "struct" => KwStruct,
        "union" => KwUnion,
        "enum" => KwEnum,
        "typedef" => KwTypedef,
        "static" => KwStatic,
        "const" => KwConst,
        "volatile" => KwVolatile,
        "register" => KwRegister,
        "extern" => KwExtern,
        "if" => KwIf,
        "else" => KwElse,
        "while" => KwWhile,
        "for" => KwFor,
        "do" => KwDo,
        "switch" => KwSwitch,
        "case" => KwCase,
        "default" => KwDefault,
        "break" => KwBreak,
        "continue" => KwContinue,
        "return" => KwReturn,
        "sizeof" => KwSizeof,
        "goto" => KwGoto,
        _ => return None,
    })
}

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    line: u32,
    col: u32,
    whitespace: Regex,
    ident: Regex,
    number: Regex,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        Lexer {
            input,
            pos: 0,
            line: 1,
            col: 1,
            whitespace: Regex::new(r"\A(?:[ \t\f\r\n\v]|//[^\n]*|/\*(?s:.*?)\*/)*").unwrap(),
            ident: Regex::new(r"\A[A-Za-z_][A-Za-z0-9_]*").unwrap(),
            number: Regex::new(r"\A(?:0[xX][0-9a-fA-F]+|[0-9]+\.[0-9]+|[0-9]+)[uUlLfF]*").unwrap(),
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    fn rest(&self) -> &'input str {
        &self.input[self.pos..]
    }

    /// Advance past `len` bytes, keeping line/column in sync.
    fn advance(&mut self, len: usize) {
        for c in self.input[self.pos..self.pos + len].chars() {
            if c == '\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.pos += len;
    }

    // Skip comments and whitespace
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(self.rest()) {
            self.advance(m.end());
        }
    }

    fn take(&mut self, kind: TokenKind, len: usize) -> Token<'input> {
        let tok = Token {
            kind,
            text: &self.input[self.pos..self.pos + len],
            line: self.line,
            col: self.col,
        };
        self.advance(len);
        tok
    }

    /// Length in bytes of a quoted literal starting at the current
    /// position, including both quote characters.  Escapes are honored.
    fn quoted_len(&self, quote: u8) -> Option<usize> {
        let bytes = self.rest().as_bytes();
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' => i += 2,
                b if b == quote => return Some(i + 1),
                _ => i += 1,
            }
        }
        None
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }
        let rest = self.rest();
        let first = rest.chars().next().unwrap();

        if first == '"' {
            if let Some(len) = self.quoted_len(b'"') {
                return Ok(Some(self.take(TokenKind::Str, len)));
            }
            return Err(self.error(first));
        }
        if first == '\'' {
            if let Some(len) = self.quoted_len(b'\'') {
                return Ok(Some(self.take(TokenKind::Char, len)));
            }
            return Err(self.error(first));
        }
        if let Some(m) = self.ident.find(rest) {
            let kind = keyword(&rest[..m.end()]).unwrap_or(TokenKind::Id);
            return Ok(Some(self.take(kind, m.end())));
        }
        if let Some(m) = self.number.find(rest) {
            return Ok(Some(self.take(TokenKind::Num, m.end())));
        }
        for (text, kind) in PUNCT {
            if rest.starts_with(text) {
                return Ok(Some(self.take(*kind, text.len())));
            }
        }
        Err(self.error(first))
    }

    fn error(&self, ch: char) -> LexError {
        LexError {
            line: self.line,
            col: self.col,
            ch,
        }
    }
}

/// Tokenize a whole input.
pub fn tokenize(input: &str) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer::new(input);
    let mut toks = vec![];
    while let Some(tok) = lexer.next()? {
        toks.push(tok);
    }
    Ok(toks)
}

/// Decode a raw string-literal lexeme (quotes included) into its bytes.
pub fn unescape_string(raw: &str) -> String {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some('\'') => out.push('\''),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Integer value of a character-literal lexeme (quotes included).
pub fn char_value(raw: &str) -> i64 {
    let decoded = unescape_string(raw);
    decoded.chars().next().map(|c| c as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input).unwrap().iter().map(|t| t.kind).collect()
    }

    #[test]
    fn keywords_and_idents() {
        use TokenKind::*;
        assert_eq!(
            kinds("int main() { return x; }"),
            vec![KwInt, Id, LParen, RParen, LBrace, KwReturn, Id, Semi, RBrace]
        );
    }

    #[test]
    fn longest_punct_wins() {
        use TokenKind::*;
        assert_eq!(kinds("a <<= b >> c"), vec![Id, ShlAssign, Id, Shr, Id]);
        assert_eq!(kinds("p->x++"), vec![Id, Arrow, Id, PlusPlus]);
        assert_eq!(kinds("f(a, ...)"), vec![Id, LParen, Id, Comma, Ellipsis, RParen]);
    }

    #[test]
    fn literals() {
        let toks = tokenize("0x1F 3.14 'a' \"hi\\n\"").unwrap();
        assert_eq!(toks[0].text, "0x1F");
        assert_eq!(toks[1].text, "3.14");
        assert_eq!(char_value(toks[2].text), 'a' as i64);
        assert_eq!(unescape_string(toks[3].text), "hi\n");
    }

    #[test]
    fn comments_are_skipped() {
        use TokenKind::*;
        assert_eq!(kinds("a // line\n b /* block\n */ c"), vec![Id, Id, Id]);
    }

    #[test]
    fn positions() {
        let toks = tokenize("int\n  x;").unwrap();
        assert_eq!((toks[0].line, toks[0].col), (1, 1));
        assert_eq!((toks[1].line, toks[1].col), (2, 3));
    }
}
