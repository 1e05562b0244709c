//! Parser for [varlink](https://varlink.org) interface definition files.
//!
//! The crate exposes a hand-written [`Lexer`] and a recursive-descent
//! [`Parser`] producing a typed AST. Every AST node records its source
//! position and the comment tokens attached to it.
//!
//! # Examples
//!
//! ```rust
//! use varlink_idl::parse;
//!
//! let interface = parse(
//!     "# Example service
//! interface org.example.ping
//!
//! # Returns the same string
//! method Ping(ping: string) -> (pong: string)
//! ",
//! )
//! .unwrap();
//! assert_eq!(interface.name, "org.example.ping");
//! assert_eq!(interface.methods[0].name, "Ping");
//! ```

use std::fmt;

pub use crate::lexer::{Cursor, Lexer, Token, TokenType, TokenValue};

pub mod lexer;


/// A lex or parse failure, reported with the cursor it happened at.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub cursor: Cursor,
    pub cause: String,
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.cursor, self.cause)
    }
}

impl std::error::Error for SyntaxError {}

type Result<T> = std::result::Result<T, SyntaxError>;

/// Source position and attached comments, embedded in every AST node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Node {
    /// The starting position of the node in the file (ignoring comments
    /// and whitespace).
    pub position: Cursor,
    /// Any comments attached to this node.
    pub comments: Vec<Token>,
}

/// The definition of a varlink interface.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct InterfaceDef {
    pub node: Node,
    /// The fully-qualified name of the interface.
    pub name: String,
    /// Types defined in this interface.
    pub types: Vec<TypeDef>,
    /// Methods defined in this interface.
    pub methods: Vec<MethodDef>,
    /// Error types defined in this interface.
    pub errors: Vec<ErrorDef>,
}

/// The definition of a named varlink type.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDef {
    pub node: Node,
    pub name: String,
    pub ty: Type,
}

/// A varlink type, classified once at parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    Struct(StructType),
    Enum(EnumType),
    Builtin(BuiltinType),
    Named(NamedType),
    Array(ArrayType),
    Dict(DictType),
    Nullable(NullableType),
}

/// A structure type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StructType {
    pub node: Node,
    /// The fields making up this struct, in declaration order.
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub node: Node,
    pub name: String,
    pub ty: Type,
}

/// An enumeration type. Valid input always has at least one value.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EnumType {
    pub node: Node,
    pub values: Vec<EnumValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub node: Node,
    pub name: String,
}

/// A builtin type. `float` is recorded as `float64`; `any` and `object`
/// both record the opaque JSON document marker `value`.
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltinType {
    pub node: Node,
    pub name: &'static str,
}

/// A reference to a user-defined named type.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedType {
    pub node: Node,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArrayType {
    pub node: Node,
    pub elem: Box<Type>,
}

/// A `[string]T` map type.
#[derive(Debug, Clone, PartialEq)]
pub struct DictType {
    pub node: Node,
    pub elem: Box<Type>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NullableType {
    pub node: Node,
    pub inner: Box<Type>,
}

/// A method definition. Input and output are always struct types.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDef {
    pub node: Node,
    pub name: String,
    pub input: StructType,
    pub output: StructType,
}

/// An error type definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorDef {
    pub node: Node,
    pub name: String,
    pub params: StructType,
}

/// Parses a complete interface definition.
pub fn parse(input: &str) -> Result<InterfaceDef> {
    Parser::new(input).parse()
}

/// Recursive-descent parser over the token stream of a [`Lexer`], with a
/// pushback buffer for backtracking.
pub struct Parser<'a> {
    lexer: Lexer<'a>,
    prev: Vec<Token>,
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a str) -> Self {
        Parser {
            lexer: Lexer::new(input),
            prev: Vec::new(),
        }
    }

    /// Returns the next non-whitespace token. Lex errors surface here.
    fn next(&mut self) -> Result<Token> {
        loop {
            let token = match self.prev.pop() {
                Some(t) => t,
                None => self.lexer.next(),
            };
            match token.kind {
                TokenType::Whitespace => continue,
                TokenType::Error => match token.value {
                    TokenValue::Error(err) => return Err(err),
                    _ => {
                        return Err(SyntaxError {
                            cursor: token.start,
                            cause: "malformed error token".to_string(),
                        })
                    }
                },
                _ => return Ok(token),
            }
        }
    }

    fn back(&mut self, token: Token) {
        self.prev.push(token);
    }

    /// Pushes tokens back so that the first element pops out first.
    fn back_all(&mut self, tokens: Vec<Token>) {
        for token in tokens.into_iter().rev() {
            self.prev.push(token);
        }
    }

    fn peek(&mut self) -> Result<Token> {
        let token = self.next()?;
        self.back(token.clone());
        Ok(token)
    }

    fn accept(&mut self, expect: &[TokenType]) -> Result<Token> {
        let token = self.next()?;
        if token.is_any(expect) {
            return Ok(token);
        }
        Err(unexpected(&token, expect))
    }

    /// Parses the whole input into an [`InterfaceDef`]. Parsing does not
    /// attempt recovery; the first failure propagates out.
    pub fn parse(&mut self) -> Result<InterfaceDef> {
        let comments = self.comments()?;

        // "interface"
        let token = self.accept(&[TokenType::KwInterface])?;
        let mut intf = InterfaceDef {
            node: Node {
                position: token.start,
                comments,
            },
            ..InterfaceDef::default()
        };

        // <interface-name>
        let name = self.accept(&[TokenType::InterfaceName])?;
        intf.name = name.text().to_string();

        self.accept(&[TokenType::Newline, TokenType::Comment])?;

        loop {
            let comments = self.comments()?;
            let token = self.peek()?;

            match token.kind {
                TokenType::KwType => {
                    let mut typedef = self.type_def()?;
                    typedef.node.comments = comments;
                    intf.types.push(typedef);
                }
                TokenType::KwMethod => {
                    let mut method = self.method_def()?;
                    method.node.comments = comments;
                    intf.methods.push(method);
                }
                TokenType::KwError => {
                    let mut errdef = self.error_def()?;
                    errdef.node.comments = comments;
                    intf.errors.push(errdef);
                }
                TokenType::Eof => return Ok(intf),
                _ => {
                    return Err(unexpected(
                        &token,
                        &[TokenType::KwType, TokenType::KwMethod, TokenType::KwError],
                    ))
                }
            }
        }
    }

    /// Accumulates the comment tokens preceding a declaration. A blank
    /// line clears the accumulator.
    fn comments(&mut self) -> Result<Vec<Token>> {
        let mut comments = Vec::new();
        loop {
            let token = self.next()?;
            match token.kind {
                TokenType::Comment => comments.push(token),
                TokenType::Newline => comments.clear(),
                TokenType::Eof => return Ok(comments),
                _ => {
                    self.back(token);
                    return Ok(comments);
                }
            }
        }
    }

    fn type_def(&mut self) -> Result<TypeDef> {
        let token = self.accept(&[TokenType::KwType])?;
        let name = self.accept(&[TokenType::Name])?;
        Ok(TypeDef {
            node: Node {
                position: token.start,
                comments: Vec::new(),
            },
            name: name.text().to_string(),
            ty: self.parse_type()?,
        })
    }

    fn parse_type(&mut self) -> Result<Type> {
        let token = self.next()?;
        match token.kind {
            TokenType::Optional => Ok(Type::Nullable(NullableType {
                node: Node {
                    position: token.start,
                    comments: Vec::new(),
                },
                inner: Box::new(self.parse_type()?),
            })),
            _ => {
                self.back(token);
                self.non_nullable_type()
            }
        }
    }

    fn non_nullable_type(&mut self) -> Result<Type> {
        let token = self.next()?;
        match token.kind {
            TokenType::Array => Ok(Type::Array(ArrayType {
                node: Node {
                    position: token.start,
                    comments: Vec::new(),
                },
                elem: Box::new(self.parse_type()?),
            })),
            TokenType::Dict => Ok(Type::Dict(DictType {
                node: Node {
                    position: token.start,
                    comments: Vec::new(),
                },
                elem: Box::new(self.parse_type()?),
            })),
            _ => {
                self.back(token);
                self.element_type()
            }
        }
    }

    fn element_type(&mut self) -> Result<Type> {
        let token = self.next()?;
        let node = Node {
            position: token.start,
            comments: Vec::new(),
        };
        match token.kind {
            TokenType::TyBool => Ok(Type::Builtin(BuiltinType { node, name: "bool" })),
            TokenType::TyInt => Ok(Type::Builtin(BuiltinType { node, name: "int" })),
            TokenType::TyString => Ok(Type::Builtin(BuiltinType {
                node,
                name: "string",
            })),
            TokenType::TyFloat => Ok(Type::Builtin(BuiltinType {
                node,
                name: "float64",
            })),
            TokenType::TyObject | TokenType::TyAny => Ok(Type::Builtin(BuiltinType {
                node,
                name: "value",
            })),

            TokenType::LParen => {
                // Struct or enum; peek the first field name and the token
                // after it to tell the two apart, then rewind.
                self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
                let comments = self.comments()?;
                let firstname_or_rparen =
                    self.accept(&[TokenType::FieldName, TokenType::RParen])?;
                self.lexer.coerce_identifier_type = None;

                if firstname_or_rparen.kind == TokenType::RParen {
                    self.back(firstname_or_rparen);
                    self.back_all(comments);
                    self.back(token);
                    return Ok(Type::Struct(self.struct_type()?));
                }

                // `:` starts a struct; `,` or `)` an enum (which may have
                // a single element).
                let comma_or_colon =
                    self.accept(&[TokenType::Colon, TokenType::Comma, TokenType::RParen])?;
                let decide = comma_or_colon.kind;
                self.back_all(vec![firstname_or_rparen, comma_or_colon]);
                self.back_all(comments);
                self.back(token);

                match decide {
                    TokenType::Colon => Ok(Type::Struct(self.struct_type()?)),
                    _ => Ok(Type::Enum(self.enum_type()?)),
                }
            }

            TokenType::Name => Ok(Type::Named(NamedType {
                node,
                name: token.text().to_string(),
            })),

            _ => Err(unexpected(
                &token,
                &[
                    TokenType::TyBool,
                    TokenType::TyInt,
                    TokenType::TyFloat,
                    TokenType::TyString,
                    TokenType::TyObject,
                    TokenType::TyAny,
                    TokenType::Name,
                    TokenType::LParen,
                ],
            )),
        }
    }

    fn enum_type(&mut self) -> Result<EnumType> {
        let start = self.accept(&[TokenType::LParen])?;
        let mut e = EnumType {
            node: Node {
                position: start.start,
                comments: Vec::new(),
            },
            values: Vec::new(),
        };

        self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
        let next = self.accept(&[
            TokenType::FieldName,
            TokenType::Comment,
            TokenType::Newline,
        ])?;
        self.lexer.coerce_identifier_type = None;
        if next.kind == TokenType::FieldName {
            self.back(next);
        }

        let mut last = false;
        loop {
            let comments = self.comments()?;

            self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
            let name = self.accept(&[TokenType::FieldName, TokenType::RParen])?;
            self.lexer.coerce_identifier_type = None;

            if name.kind == TokenType::RParen {
                return Ok(e);
            }
            if last {
                return Err(unexpected(&name, &[TokenType::RParen]));
            }

            let mut value = EnumValue {
                node: Node {
                    position: name.start,
                    comments,
                },
                name: name.text().to_string(),
            };

            let comma = self.next()?;
            if comma.kind != TokenType::Comma {
                // The last value may skip the comma, but requires no more
                // values after that.
                last = true;
                self.back(comma);
            }

            self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
            let next = self.accept(&[
                TokenType::RParen,
                TokenType::Comment,
                TokenType::Newline,
                TokenType::FieldName,
            ])?;
            self.lexer.coerce_identifier_type = None;
            match next.kind {
                TokenType::FieldName => self.back(next),
                TokenType::Comment => value.node.comments.push(next),
                TokenType::Newline => {}
                TokenType::RParen => {
                    e.values.push(value);
                    return Ok(e);
                }
                _ => unreachable!(),
            }
            e.values.push(value);
        }
    }

    fn struct_type(&mut self) -> Result<StructType> {
        let start = self.accept(&[TokenType::LParen])?;
        let mut s = StructType {
            node: Node {
                position: start.start,
                comments: Vec::new(),
            },
            fields: Vec::new(),
        };

        self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
        let next = self.accept(&[
            TokenType::FieldName,
            TokenType::Comment,
            TokenType::Newline,
            TokenType::RParen,
        ])?;
        self.lexer.coerce_identifier_type = None;
        match next.kind {
            TokenType::RParen => return Ok(s),
            TokenType::FieldName => self.back(next),
            _ => {}
        }

        let mut last = false;
        loop {
            let comments = self.comments()?;

            self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
            let name = self.accept(&[TokenType::FieldName, TokenType::RParen])?;
            self.lexer.coerce_identifier_type = None;

            if name.kind == TokenType::RParen {
                return Ok(s);
            }
            if last {
                return Err(unexpected(&name, &[TokenType::RParen]));
            }

            self.accept(&[TokenType::Colon])?;
            let ty = self.parse_type()?;
            let mut field = StructField {
                node: Node {
                    position: name.start,
                    comments,
                },
                name: name.text().to_string(),
                ty,
            };

            let comma = self.next()?;
            if comma.kind != TokenType::Comma {
                // The last field may skip the comma, but requires no more
                // fields after that.
                last = true;
                self.back(comma);
            }

            self.lexer.coerce_identifier_type = Some(TokenType::FieldName);
            let next = self.accept(&[
                TokenType::RParen,
                TokenType::Comment,
                TokenType::Newline,
                TokenType::FieldName,
            ])?;
            self.lexer.coerce_identifier_type = None;
            match next.kind {
                TokenType::FieldName => self.back(next),
                TokenType::Comment => field.node.comments.push(next),
                TokenType::Newline => {}
                TokenType::RParen => {
                    s.fields.push(field);
                    return Ok(s);
                }
                _ => unreachable!(),
            }
            s.fields.push(field);
        }
    }

    fn method_def(&mut self) -> Result<MethodDef> {
        let token = self.accept(&[TokenType::KwMethod])?;

        self.lexer.coerce_identifier_type = Some(TokenType::Name);
        let name = self.accept(&[TokenType::Name])?;
        self.lexer.coerce_identifier_type = None;

        let input = self.struct_type()?;
        self.accept(&[TokenType::Arrow])?;
        let output = self.struct_type()?;

        Ok(MethodDef {
            node: Node {
                position: token.start,
                comments: Vec::new(),
            },
            name: name.text().to_string(),
            input,
            output,
        })
    }

    fn error_def(&mut self) -> Result<ErrorDef> {
        let token = self.accept(&[TokenType::KwError])?;
        let name = self.accept(&[TokenType::Name])?;
        Ok(ErrorDef {
            node: Node {
                position: token.start,
                comments: Vec::new(),
            },
            name: name.text().to_string(),
            params: self.struct_type()?,
        })
    }
}

fn unexpected(token: &Token, expect: &[TokenType]) -> SyntaxError {
    let expected = expect
        .iter()
        .map(|t| format!("`{}`", t))
        .collect::<Vec<_>>()
        .join(" or ");
    SyntaxError {
        cursor: token.start,
        cause: format!("unexpected token `{}`, expected {}", token.kind, expected),
    }
}
