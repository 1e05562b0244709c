//! State-machine lexer for the varlink interface definition language.
//!
//! The lexer is pull-driven: [`Lexer::next`] runs state functions until at
//! least one token lands in the internal buffer, then hands it out. Cursor
//! positions are tracked per rune so that every token reports where it
//! started and ended in the source text.

use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::sync::OnceLock;

use regex::Regex;

use crate::SyntaxError;

/// A position within an interface definition document. Line and column
/// both start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub line: usize,
    pub column: usize,
}

impl Cursor {
    fn start() -> Self {
        Cursor { line: 1, column: 1 }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// The type of a [`Token`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Eof,
    Error,
    Newline,
    Whitespace,
    Comment,
    Name,
    FieldName,
    InterfaceName,
    KwInterface,
    KwMethod,
    KwType,
    KwError,
    TyBool,
    TyString,
    TyInt,
    TyFloat,
    TyAny,
    TyObject,
    Array,
    Dict,
    Optional,
    LParen,
    RParen,
    Colon,
    Comma,
    Arrow,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenType::Eof => "<eof>",
            TokenType::Error => "<error>",
            TokenType::Newline => "<newline>",
            TokenType::Whitespace => "<whitespace>",
            TokenType::Comment => "<comment>",
            TokenType::Name => "<name>",
            TokenType::FieldName => "<field-name>",
            TokenType::InterfaceName => "<interface-name>",
            TokenType::KwInterface => "interface",
            TokenType::KwMethod => "method",
            TokenType::KwType => "type",
            TokenType::KwError => "error",
            TokenType::TyBool => "bool",
            TokenType::TyString => "string",
            TokenType::TyInt => "int",
            TokenType::TyFloat => "float",
            TokenType::TyAny => "any",
            TokenType::TyObject => "object",
            TokenType::Array => "[]",
            TokenType::Dict => "[string]",
            TokenType::Optional => "?",
            TokenType::LParen => "(",
            TokenType::RParen => ")",
            TokenType::Colon => ":",
            TokenType::Comma => ",",
            TokenType::Arrow => "->",
        };
        f.write_str(s)
    }
}

/// The interpreted value of a token, typed by token kind: identifier and
/// comment tokens carry their text, error tokens carry the lex failure,
/// punctuation carries nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    None,
    Text(String),
    Error(SyntaxError),
}

/// A token in the lexer stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The type of this token.
    pub kind: TokenType,
    /// The original string representation of this token.
    pub raw: String,
    /// The value interpreted from `raw`.
    pub value: TokenValue,
    /// The starting position of this token.
    pub start: Cursor,
    /// The end position of this token.
    pub end: Cursor,
}

impl Token {
    /// The text carried by identifier, keyword and comment tokens.
    pub fn text(&self) -> &str {
        match &self.value {
            TokenValue::Text(s) => s,
            _ => "",
        }
    }

    /// Returns true if the token is one of the specified token types.
    pub fn is_any(&self, types: &[TokenType]) -> bool {
        types.contains(&self.kind)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Stashed {
    r: char,
    w: usize,
    next: Cursor,
    pos: Cursor,
}

/// Two-slot ring of the most recently read runes, allowing one rune of
/// lookahead with full cursor restoration on unread.
#[derive(Debug, Default)]
struct BackBuffer {
    buf: [Stashed; 2],
    rlen: usize,
    widx: usize,
}

impl BackBuffer {
    fn idx(&self, off: isize) -> usize {
        let len = self.buf.len() as isize;
        let mut i = (self.widx as isize + off) % len;
        if i < 0 {
            i += len;
        }
        i as usize
    }

    fn write(&mut self, r: char, w: usize, next: Cursor, pos: Cursor) {
        if self.rlen != 0 {
            panic!("programming error: can't write into backbuffer while there are unread runes");
        }
        self.buf[self.widx] = Stashed { r, w, next, pos };
        self.widx = self.idx(1);
    }

    fn read(&mut self) -> Stashed {
        if self.rlen == 0 {
            panic!("programming error: no runes in backbuffer");
        }
        let e = self.buf[self.idx(-(self.rlen as isize))];
        self.rlen -= 1;
        e
    }

    fn unread(&mut self) -> Stashed {
        if self.rlen >= self.buf.len() {
            panic!("programming error: can't unread more runes than backbuffer capacity");
        }
        self.rlen += 1;
        let e = self.buf[self.idx(-(self.rlen as isize))];
        if e.w == 0 {
            panic!("programming error: can't unread more runes than backbuffer length");
        }
        e
    }

    /// Total byte width of the stashed runes that have been unread but not
    /// re-read yet.
    fn pending_width(&self) -> usize {
        let mut total = 0;
        for i in 1..=self.rlen {
            total += self.buf[self.idx(-(i as isize))].w;
        }
        total
    }
}

struct StateFn(fn(&mut Lexer<'_>) -> Option<StateFn>);

const LINE_SEP: char = '\u{2028}';
const PAR_SEP: char = '\u{2029}';

/// Lexes varlink IDL input into a stream of [`Token`]s.
pub struct Lexer<'a> {
    src: &'a str,
    off: usize,

    /// The cursor position marking the start of the current token.
    pub token_position: Cursor,
    /// The cursor position of the current rune.
    pub position: Cursor,
    /// The cursor position at which the lexer will be reading next.
    pub next_position: Cursor,
    /// The token type to coerce ambiguous identifiers to. The grammar
    /// decides when a keyword spelling is really a field or method name.
    pub coerce_identifier_type: Option<TokenType>,

    state: Option<StateFn>,
    token: String,
    tokens: VecDeque<Token>,
    prev: BackBuffer,
}

impl<'a> Lexer<'a> {
    /// Creates a new lexer over the input source text.
    pub fn new(src: &'a str) -> Self {
        Lexer {
            src,
            off: 0,
            token_position: Cursor::start(),
            position: Cursor::start(),
            next_position: Cursor::start(),
            coerce_identifier_type: None,
            state: Some(StateFn(lex)),
            token: String::new(),
            tokens: VecDeque::with_capacity(2),
            prev: BackBuffer::default(),
        }
    }

    /// Advances the lexer stream and returns the next token. Once the
    /// terminal EOF or error token has been produced, every further call
    /// yields an EOF token at the final position.
    pub fn next(&mut self) -> Token {
        loop {
            if let Some(token) = self.tokens.pop_front() {
                return token;
            }
            match self.state.take() {
                Some(f) => self.state = (f.0)(self),
                None => {
                    return Token {
                        kind: TokenType::Eof,
                        raw: String::new(),
                        value: TokenValue::None,
                        start: self.token_position,
                        end: self.position,
                    };
                }
            }
        }
    }

    fn read_rune(&mut self) -> Option<(char, usize)> {
        let (r, w);
        if self.prev.rlen > 0 {
            let e = self.prev.read();
            r = e.r;
            w = e.w;
            self.next_position = e.next;
            self.position = e.pos;
        } else {
            r = self.src[self.off..].chars().next()?;
            w = r.len_utf8();
            self.off += w;
            self.prev.write(r, w, self.next_position, self.position);
        }
        self.token.push(r);
        self.position = self.next_position;
        if r == '\n' {
            self.next_position.line += 1;
            self.next_position.column = 1;
        } else {
            self.next_position.column += 1;
        }
        Some((r, w))
    }

    fn unread_rune(&mut self) {
        let e = self.prev.unread();
        self.next_position = e.next;
        self.position = e.pos;
        self.token.truncate(self.token.len() - e.w);
    }

    /// Byte offset into the source of the rune the lexer will read next.
    fn byte_offset(&self) -> usize {
        self.off - self.prev.pending_width()
    }

    fn emit(&mut self, kind: TokenType, value: TokenValue) {
        let token = Token {
            kind,
            raw: mem::take(&mut self.token),
            value,
            start: self.token_position,
            end: self.position,
        };
        self.tokens.push_back(token);
        self.token_position = self.next_position;
    }

    /// Emits the terminal error token and stops the state machine.
    fn error(&mut self, err: SyntaxError) -> Option<StateFn> {
        self.emit(TokenType::Error, TokenValue::Error(err));
        None
    }

    fn errorf(&mut self, cause: String) -> Option<StateFn> {
        let err = SyntaxError {
            cursor: self.token_position,
            cause,
        };
        self.error(err)
    }

    /// Emits the terminal EOF token and stops the state machine.
    fn end_of_input(&mut self) -> Option<StateFn> {
        self.emit(TokenType::Eof, TokenValue::None);
        None
    }

    fn accept_string(&mut self, expect: &str) -> bool {
        for exp in expect.chars() {
            match self.read_rune() {
                Some((r, _)) if r == exp => {}
                _ => return false,
            }
        }
        true
    }
}

fn is_newline(r: char) -> bool {
    matches!(r, '\n' | '\r' | LINE_SEP | PAR_SEP)
}

fn is_identifier_start(r: char) -> bool {
    r.is_ascii_alphabetic() || r == '-' || r == '_' || r == '.'
}

fn lex(l: &mut Lexer<'_>) -> Option<StateFn> {
    let Some((r, _)) = l.read_rune() else {
        return l.end_of_input();
    };

    match r {
        '(' => l.emit(TokenType::LParen, TokenValue::None),
        ')' => l.emit(TokenType::RParen, TokenValue::None),
        '[' => match l.read_rune() {
            None => return l.end_of_input(),
            Some((']', _)) => l.emit(TokenType::Array, TokenValue::None),
            Some(('s', _)) => {
                if !l.accept_string("tring]") {
                    return l.errorf("expected [string]".to_string());
                }
                l.emit(TokenType::Dict, TokenValue::None);
            }
            Some((r, _)) => return l.errorf(format!("unexpected character {:?}", r)),
        },
        ':' => l.emit(TokenType::Colon, TokenValue::None),
        ',' => l.emit(TokenType::Comma, TokenValue::None),
        '?' => l.emit(TokenType::Optional, TokenValue::None),
        '-' => match l.read_rune() {
            Some(('>', _)) => l.emit(TokenType::Arrow, TokenValue::None),
            Some((r, _)) => return l.errorf(format!("expected '>', got {:?}", r)),
            None => return l.end_of_input(),
        },
        '\n' | LINE_SEP | PAR_SEP => l.emit(TokenType::Newline, TokenValue::None),
        '\r' => {
            match l.read_rune() {
                None => {
                    l.emit(TokenType::Newline, TokenValue::None);
                    return l.end_of_input();
                }
                Some((lf, _)) => {
                    if lf != '\n' {
                        l.unread_rune();
                    }
                }
            }
            l.emit(TokenType::Newline, TokenValue::None);
        }
        '#' => {
            let mut comment = String::new();
            let mut at_eof = false;
            loop {
                match l.read_rune() {
                    None => {
                        at_eof = true;
                        break;
                    }
                    Some(('\n', _)) => {
                        // Newlines end the comment, and stay part of it.
                        break;
                    }
                    Some((r, _)) => comment.push(r),
                }
            }
            l.emit(
                TokenType::Comment,
                TokenValue::Text(comment.trim().to_string()),
            );
            if at_eof {
                return l.end_of_input();
            }
        }
        _ => {
            if r.is_whitespace() {
                loop {
                    match l.read_rune() {
                        None => {
                            l.emit(TokenType::Whitespace, TokenValue::None);
                            return l.end_of_input();
                        }
                        Some((r, _)) => {
                            if is_newline(r) || !r.is_whitespace() {
                                l.unread_rune();
                                break;
                            }
                        }
                    }
                }
                l.emit(TokenType::Whitespace, TokenValue::None);
                return Some(StateFn(lex));
            }

            if is_identifier_start(r) {
                l.unread_rune();
                return Some(StateFn(lex_identifier));
            }
            return l.errorf(format!("unexpected character {:?}", r));
        }
    }
    Some(StateFn(lex))
}

struct IdentClasses {
    name: Regex,
    interface: Regex,
    field: Regex,
    keyword: Regex,
}

fn ident_classes() -> &'static IdentClasses {
    static CLASSES: OnceLock<IdentClasses> = OnceLock::new();
    CLASSES.get_or_init(|| IdentClasses {
        name: Regex::new(r"^[A-Z][A-Za-z0-9]*").unwrap(),
        interface: Regex::new(r"^[A-Za-z](?:-*[A-Za-z0-9])*(?:\.[A-Za-z0-9](?:-*[A-Za-z0-9])*)+")
            .unwrap(),
        field: Regex::new(r"^[A-Za-z](?:_?[A-Za-z0-9])*").unwrap(),
        keyword: Regex::new(r"^(?:interface|method|error|type|any|object|string|int|float|bool)")
            .unwrap(),
    })
}

fn keyword_token_type(kw: &str) -> TokenType {
    match kw {
        "interface" => TokenType::KwInterface,
        "method" => TokenType::KwMethod,
        "error" => TokenType::KwError,
        "type" => TokenType::KwType,
        "any" => TokenType::TyAny,
        "object" => TokenType::TyObject,
        "string" => TokenType::TyString,
        "int" => TokenType::TyInt,
        "float" => TokenType::TyFloat,
        "bool" => TokenType::TyBool,
        _ => unreachable!("keyword class matched a non-keyword"),
    }
}

/// Classifies an identifier. The four identifier classes overlap, so each
/// class is matched at the current position independently; the longest
/// extent is the identifier, and classes that match a shorter prefix are
/// discarded. Coercion picks a class when the grammar has already
/// disambiguated; otherwise the first surviving class wins, in keyword,
/// name, interface-name, field-name order.
fn lex_identifier(l: &mut Lexer<'_>) -> Option<StateFn> {
    let rest = &l.src[l.byte_offset()..];
    let classes = ident_classes();

    let name_len = classes.name.find(rest).map_or(0, |m| m.end());
    let intf_len = classes.interface.find(rest).map_or(0, |m| m.end());
    let field_len = classes.field.find(rest).map_or(0, |m| m.end());
    let keyword_len = classes.keyword.find(rest).map_or(0, |m| m.end());

    let full = name_len.max(intf_len).max(field_len).max(keyword_len);
    if full == 0 {
        return l.errorf("invalid identifier".to_string());
    }

    let text = rest[..full].to_string();
    for _ in text.chars() {
        let _ = l.read_rune();
    }

    // reject classes that do not take the length of the full match
    let name = name_len == full;
    let intf = intf_len == full;
    let field = field_len == full;
    let keyword = keyword_len == full;

    match l.coerce_identifier_type {
        // Coercion rules -- some keywords can be names, depending on where
        // they appear in the parse tree.
        Some(TokenType::Name) if name => l.emit(TokenType::Name, TokenValue::Text(text)),
        Some(TokenType::InterfaceName) if intf => {
            l.emit(TokenType::InterfaceName, TokenValue::Text(text))
        }
        Some(TokenType::FieldName) if field => l.emit(TokenType::FieldName, TokenValue::Text(text)),

        // Normal rules
        _ if keyword => {
            let kind = keyword_token_type(&text);
            l.emit(kind, TokenValue::Text(text));
        }
        _ if name => l.emit(TokenType::Name, TokenValue::Text(text)),
        _ if intf => l.emit(TokenType::InterfaceName, TokenValue::Text(text)),
        _ if field => l.emit(TokenType::FieldName, TokenValue::Text(text)),
        _ => return l.errorf(format!("invalid identifier {:?}", text)),
    }

    Some(StateFn(lex))
}
