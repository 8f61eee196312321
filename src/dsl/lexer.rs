use crate::error::{DbError, DbResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    // Literals and identifiers
    Str,
    Number,
    Ident,

    // Symbols
    LBracket,
    RBracket,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Dot,
    Join, // ::
    Comma,
    Colon,
    Eq,
    Gt,
    Lt,
    Ne,
    Ge,
    Le,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Dollar,

    // Keywords (mapped case-insensitively from identifiers)
    And,
    Or,
    In,
    Not,
    As,

    // Composite tokens, recognized before a plain '['
    RowAccess, // [N]
    Slice,     // [a:b] / [a:b:c], fields optional, negatives allowed
}

/// One lexed token. `pos` is the index in the token stream, carried into
/// parse errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub pos: usize,
}

/// Tokenizes a query into a restartable stream. The parser re-reads and
/// seeks, so all tokens are produced up front.
pub fn tokenize(input: &str) -> DbResult<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];

        if ch.is_whitespace() {
            i += 1;
            continue;
        }

        let start = i;
        let (kind, value) = match ch {
            '"' => {
                i += 1;
                let mut s = String::new();
                let mut closed = false;
                while i < chars.len() {
                    match chars[i] {
                        '"' => {
                            i += 1;
                            closed = true;
                            break;
                        }
                        '\\' => {
                            i += 1;
                            if i < chars.len() {
                                s.push(match chars[i] {
                                    'n' => '\n',
                                    't' => '\t',
                                    'r' => '\r',
                                    other => other,
                                });
                                i += 1;
                            }
                        }
                        other => {
                            s.push(other);
                            i += 1;
                        }
                    }
                }
                if !closed {
                    return Err(DbError::parse(start, "unterminated string"));
                }
                (TokenKind::Str, s)
            }

            '0'..='9' => {
                let mut s = String::new();
                let mut has_dot = false;
                while i < chars.len() {
                    let c = chars[i];
                    if c.is_ascii_digit() {
                        s.push(c);
                        i += 1;
                    } else if c == '.' && !has_dot && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                        has_dot = true;
                        s.push(c);
                        i += 1;
                    } else {
                        break;
                    }
                }
                (TokenKind::Number, s)
            }

            c if c.is_alphabetic() || c == '_' => {
                let mut s = String::new();
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    s.push(chars[i]);
                    i += 1;
                }
                let kind = match s.to_lowercase().as_str() {
                    "and" => TokenKind::And,
                    "or" => TokenKind::Or,
                    "not" => TokenKind::Not,
                    "in" => TokenKind::In,
                    "as" => TokenKind::As,
                    _ => TokenKind::Ident,
                };
                (kind, s)
            }

            '[' => match scan_bracket_composite(&chars, i) {
                Some((kind, inner, end)) => {
                    i = end;
                    (kind, inner)
                }
                None => {
                    i += 1;
                    (TokenKind::LBracket, "[".to_string())
                }
            },

            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    (TokenKind::Ne, "!=".to_string())
                } else {
                    return Err(DbError::parse(start, "unexpected character '!'"));
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    (TokenKind::Ge, ">=".to_string())
                } else {
                    i += 1;
                    (TokenKind::Gt, ">".to_string())
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    i += 2;
                    (TokenKind::Le, "<=".to_string())
                } else {
                    i += 1;
                    (TokenKind::Lt, "<".to_string())
                }
            }
            ':' => {
                if chars.get(i + 1) == Some(&':') {
                    i += 2;
                    (TokenKind::Join, "::".to_string())
                } else {
                    i += 1;
                    (TokenKind::Colon, ":".to_string())
                }
            }
            '=' => {
                i += 1;
                (TokenKind::Eq, "=".to_string())
            }
            ']' => {
                i += 1;
                (TokenKind::RBracket, "]".to_string())
            }
            '(' => {
                i += 1;
                (TokenKind::LParen, "(".to_string())
            }
            ')' => {
                i += 1;
                (TokenKind::RParen, ")".to_string())
            }
            '{' => {
                i += 1;
                (TokenKind::LBrace, "{".to_string())
            }
            '}' => {
                i += 1;
                (TokenKind::RBrace, "}".to_string())
            }
            '.' => {
                i += 1;
                (TokenKind::Dot, ".".to_string())
            }
            ',' => {
                i += 1;
                (TokenKind::Comma, ",".to_string())
            }
            '+' => {
                i += 1;
                (TokenKind::Plus, "+".to_string())
            }
            '-' => {
                i += 1;
                (TokenKind::Minus, "-".to_string())
            }
            '*' => {
                i += 1;
                (TokenKind::Star, "*".to_string())
            }
            '/' => {
                i += 1;
                (TokenKind::Slash, "/".to_string())
            }
            '%' => {
                i += 1;
                (TokenKind::Percent, "%".to_string())
            }
            '$' => {
                i += 1;
                (TokenKind::Dollar, "$".to_string())
            }

            other => {
                return Err(DbError::parse(start, format!("unexpected character '{}'", other)));
            }
        };

        let pos = tokens.len();
        tokens.push(Token { kind, value, pos });
    }

    Ok(tokens)
}

/// Tries to read `[N]` or `[a:b]` / `[a:b:c]` starting at the `[` at
/// `start`. Returns the token kind, the bracket-stripped inner text with
/// whitespace removed, and the index just past the `]`. Returns None when
/// the bracket is a filter opener.
fn scan_bracket_composite(chars: &[char], start: usize) -> Option<(TokenKind, String, usize)> {
    let mut i = start + 1;
    let mut inner = String::new();
    while i < chars.len() {
        let c = chars[i];
        if c == ']' {
            break;
        }
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c.is_ascii_digit() || c == ':' || c == '-' {
            inner.push(c);
            i += 1;
            continue;
        }
        return None;
    }
    if i >= chars.len() {
        return None;
    }

    let colons = inner.matches(':').count();
    let field_ok = |f: &str| f.is_empty() || f.strip_prefix('-').unwrap_or(f).chars().all(|c| c.is_ascii_digit()) && !f.strip_prefix('-').unwrap_or(f).is_empty();

    if colons == 0 {
        // [N] - plain non-negative integer
        if !inner.is_empty() && inner.chars().all(|c| c.is_ascii_digit()) {
            return Some((TokenKind::RowAccess, inner, i + 1));
        }
        return None;
    }
    if colons <= 2 && inner.split(':').all(field_ok) {
        return Some((TokenKind::Slice, inner, i + 1));
    }
    None
}
