// File: src/lexer.rs
//
// Hand-written lexer producing a flat token stream. Peripheral to the
// compiler/VM/GC core — kept deliberately simple.

use crate::ast::IntBase;

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Identifier(String),
    Keyword(String),
    Int(String, IntBase),
    Float(String),
    Str(Vec<u8>),
    Operator(String),
    Punctuation(char),
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub line: usize,
    pub column: usize,
}

const KEYWORDS: &[&str] = &[
    "def", "let", "return", "if", "else", "while", "for", "class", "true", "false", "null",
    "super",
];

pub fn tokenize(source: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1usize;
    let mut col = 1usize;

    macro_rules! bump {
        () => {{
            chars.next();
            col += 1;
        }};
    }

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => bump!(),
            '\n' => {
                chars.next();
                line += 1;
                col = 1;
            }
            '#' => {
                while let Some(&ch) = chars.peek() {
                    if ch == '\n' {
                        break;
                    }
                    chars.next();
                    col += 1;
                }
            }
            '"' => {
                let start_col = col;
                bump!(); // opening quote
                let mut bytes = Vec::new();
                loop {
                    match chars.peek().copied() {
                        None => break,
                        Some('"') => {
                            bump!();
                            break;
                        }
                        Some('\\') => {
                            bump!();
                            match chars.peek().copied() {
                                Some('n') => {
                                    bytes.push(b'\n');
                                    bump!();
                                }
                                Some('t') => {
                                    bytes.push(b'\t');
                                    bump!();
                                }
                                Some('\\') => {
                                    bytes.push(b'\\');
                                    bump!();
                                }
                                Some('"') => {
                                    bytes.push(b'"');
                                    bump!();
                                }
                                Some(other) => {
                                    let mut buf = [0u8; 4];
                                    bytes.extend_from_slice(other.encode_utf8(&mut buf).as_bytes());
                                    bump!();
                                }
                                None => break,
                            }
                        }
                        Some(ch) => {
                            let mut buf = [0u8; 4];
                            bytes.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                            bump!();
                        }
                    }
                }
                tokens.push(Token { kind: TokenKind::Str(bytes), line, column: start_col });
            }
            '0'..='9' => {
                let start_col = col;
                let mut text = String::new();
                let mut base = IntBase::Decimal;
                let mut is_float = false;

                if c == '0' {
                    let mut lookahead = chars.clone();
                    lookahead.next();
                    match lookahead.peek() {
                        Some('x') | Some('X') => {
                            base = IntBase::Hex;
                            bump!();
                            bump!();
                            while let Some(&ch) = chars.peek() {
                                if ch.is_ascii_hexdigit() {
                                    text.push(ch);
                                    bump!();
                                } else {
                                    break;
                                }
                            }
                            tokens.push(Token {
                                kind: TokenKind::Int(text, base),
                                line,
                                column: start_col,
                            });
                            continue;
                        }
                        Some('b') | Some('B') => {
                            base = IntBase::Binary;
                            bump!();
                            bump!();
                            while let Some(&ch) = chars.peek() {
                                if ch == '0' || ch == '1' {
                                    text.push(ch);
                                    bump!();
                                } else {
                                    break;
                                }
                            }
                            tokens.push(Token {
                                kind: TokenKind::Int(text, base),
                                line,
                                column: start_col,
                            });
                            continue;
                        }
                        _ => {}
                    }
                }

                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() {
                        text.push(ch);
                        bump!();
                    } else if ch == '.' && !is_float {
                        is_float = true;
                        text.push(ch);
                        bump!();
                    } else {
                        break;
                    }
                }
                if is_float {
                    tokens.push(Token { kind: TokenKind::Float(text), line, column: start_col });
                } else {
                    tokens.push(Token {
                        kind: TokenKind::Int(text, base),
                        line,
                        column: start_col,
                    });
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start_col = col;
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        ident.push(ch);
                        bump!();
                    } else {
                        break;
                    }
                }
                let kind = if KEYWORDS.contains(&ident.as_str()) {
                    TokenKind::Keyword(ident)
                } else {
                    TokenKind::Identifier(ident)
                };
                tokens.push(Token { kind, line, column: start_col });
            }
            '=' | '!' | '<' | '>' | '&' | '|' => {
                let start_col = col;
                let first = c;
                bump!();
                let second = chars.peek().copied();
                let op = match (first, second) {
                    ('=', Some('=')) => {
                        bump!();
                        "==".to_string()
                    }
                    ('!', Some('=')) => {
                        bump!();
                        "!=".to_string()
                    }
                    ('&', Some('&')) => {
                        bump!();
                        "&&".to_string()
                    }
                    ('|', Some('|')) => {
                        bump!();
                        "||".to_string()
                    }
                    _ => first.to_string(),
                };
                tokens.push(Token { kind: TokenKind::Operator(op), line, column: start_col });
            }
            '+' | '-' | '*' | '/' => {
                let start_col = col;
                bump!();
                tokens.push(Token {
                    kind: TokenKind::Operator(c.to_string()),
                    line,
                    column: start_col,
                });
            }
            '.' | ',' | ';' | '(' | ')' | '{' | '}' | '@' => {
                let start_col = col;
                bump!();
                tokens.push(Token { kind: TokenKind::Punctuation(c), line, column: start_col });
            }
            _ => bump!(),
        }
    }

    tokens.push(Token { kind: TokenKind::Eof, line, column: col });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_int_bases() {
        let toks = tokenize("10 0x1F 0b101");
        let ints: Vec<_> = toks
            .iter()
            .filter_map(|t| match &t.kind {
                TokenKind::Int(text, base) => Some((text.clone(), *base)),
                _ => None,
            })
            .collect();
        assert_eq!(ints, vec![
            ("10".to_string(), IntBase::Decimal),
            ("1F".to_string(), IntBase::Hex),
            ("101".to_string(), IntBase::Binary),
        ]);
    }

    #[test]
    fn tokenizes_string_escapes() {
        let toks = tokenize(r#""a\nb""#);
        match &toks[0].kind {
            TokenKind::Str(bytes) => assert_eq!(bytes, b"a\nb"),
            other => panic!("expected string token, got {:?}", other),
        }
    }

    #[test]
    fn distinguishes_keywords_from_identifiers() {
        let toks = tokenize("def foo");
        assert_eq!(toks[0].kind, TokenKind::Keyword("def".to_string()));
        assert_eq!(toks[1].kind, TokenKind::Identifier("foo".to_string()));
    }
}
