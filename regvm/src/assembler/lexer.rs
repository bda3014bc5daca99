use super::{AsmError, AsmErrorKind};

#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(Vec<u8>),
    /// `.name`
    Label(String),
    /// `%name`
    Function(String),
    /// `$name`
    Directive(String),
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Comma,
    Colon,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Ident(name) => format!("'{name}'"),
            Token::Int(value) => format!("integer {value}"),
            Token::Float(value) => format!("float {value}"),
            Token::Str(_) => "string literal".to_string(),
            Token::Label(name) => format!("label .{name}"),
            Token::Function(name) => format!("function %{name}"),
            Token::Directive(name) => format!("directive ${name}"),
            Token::LBracket => "'['".to_string(),
            Token::RBracket => "']'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::Plus => "'+'".to_string(),
            Token::Minus => "'-'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Colon => "':'".to_string(),
        }
    }
}

/// Tokens of one non-empty source line.
#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub number: usize,
    pub tokens: Vec<Token>,
}

pub fn tokenize(source: &str) -> Result<Vec<Line>, AsmError> {
    let mut lines = Vec::new();
    for (index, text) in source.lines().enumerate() {
        let number = index + 1;
        let tokens = tokenize_line(text).map_err(|kind| AsmError::new(number, kind))?;
        if !tokens.is_empty() {
            lines.push(Line { number, tokens });
        }
    }
    Ok(lines)
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn tokenize_line(text: &str) -> Result<Vec<Token>, AsmErrorKind> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < chars.len() {
        let ch = chars[pos];
        match ch {
            ';' | '#' => break,
            c if c.is_whitespace() => pos += 1,
            '[' => {
                tokens.push(Token::LBracket);
                pos += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                pos += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                pos += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                pos += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                pos += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                pos += 1;
            }
            '"' => {
                let (bytes, next) = lex_string(&chars, pos)?;
                tokens.push(Token::Str(bytes));
                pos = next;
            }
            '\'' => {
                let (value, next) = lex_char(&chars, pos)?;
                tokens.push(Token::Int(value as i64));
                pos = next;
            }
            '.' | '%' | '$' => {
                let (name, next) = lex_ident(&chars, pos + 1);
                if name.is_empty() {
                    return Err(AsmErrorKind::Syntax(format!("expected a name after '{ch}'")));
                }
                tokens.push(match ch {
                    '.' => Token::Label(name),
                    '%' => Token::Function(name),
                    _ => Token::Directive(name),
                });
                pos = next;
            }
            c if c.is_ascii_digit() => {
                let start = pos;
                while pos < chars.len() && (is_ident_char(chars[pos]) || chars[pos] == '.') {
                    // exponent sign
                    if matches!(chars[pos], 'e' | 'E')
                        && !chars[start..pos].iter().any(|c| matches!(c, 'x' | 'X' | 'b' | 'B'))
                        && matches!(chars.get(pos + 1), Some('+' | '-'))
                    {
                        pos += 1;
                    }
                    pos += 1;
                }
                let literal: String = chars[start..pos].iter().collect();
                tokens.push(parse_number(&literal)?);
            }
            c if is_ident_start(c) => {
                let (name, next) = lex_ident(&chars, pos);
                tokens.push(Token::Ident(name));
                pos = next;
            }
            other => {
                return Err(AsmErrorKind::Syntax(format!("unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn lex_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut pos = start;
    while pos < chars.len() && is_ident_char(chars[pos]) {
        pos += 1;
    }
    (chars[start..pos].iter().collect(), pos)
}

/// Integer (`42`, `0x2a`, `0b101010`, `0o52`, `052`) or float (`1.5`, `2e3`) literal.
pub fn parse_number(literal: &str) -> Result<Token, AsmErrorKind> {
    let invalid = || AsmErrorKind::InvalidNumber(literal.to_string());
    let lower = literal.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if lower.contains(['.', 'e']) {
        return lower.parse::<f64>().map(Token::Float).map_err(|_| invalid());
    } else if lower.len() > 1 && lower.starts_with('0') {
        (&lower[1..], 8)
    } else {
        (lower.as_str(), 10)
    };
    if digits.is_empty() {
        return Err(invalid());
    }
    // Values above i64::MAX are accepted as their two's complement bit pattern.
    u64::from_str_radix(digits, radix)
        .map(|value| Token::Int(value as i64))
        .map_err(|_| invalid())
}

fn escape(ch: char) -> Result<u8, AsmErrorKind> {
    Ok(match ch {
        'n' => b'\n',
        'r' => b'\r',
        't' => b'\t',
        '0' => 0,
        'a' => 0x07,
        'b' => 0x08,
        'f' => 0x0C,
        'v' => 0x0B,
        '\\' => b'\\',
        '"' => b'"',
        '\'' => b'\'',
        other => return Err(AsmErrorKind::InvalidString(format!("invalid escape '\\{other}'"))),
    })
}

fn push_char(out: &mut Vec<u8>, ch: char) {
    let mut buf = [0u8; 4];
    out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
}

fn lex_string(chars: &[char], start: usize) -> Result<(Vec<u8>, usize), AsmErrorKind> {
    let mut out = Vec::new();
    let mut pos = start + 1;
    while pos < chars.len() {
        match chars[pos] {
            '"' => return Ok((out, pos + 1)),
            '\\' => {
                let next = chars
                    .get(pos + 1)
                    .ok_or_else(|| AsmErrorKind::InvalidString("dangling escape".to_string()))?;
                if *next == 'x' {
                    let digits = chars
                        .get(pos + 2..pos + 4)
                        .filter(|digits| digits.iter().all(char::is_ascii_hexdigit))
                        .ok_or_else(|| {
                            let hex: String = chars.iter().skip(pos + 2).take(2).collect();
                            AsmErrorKind::InvalidString(format!(
                                "hex escape '\\x{hex}' needs two hex digits"
                            ))
                        })?;
                    let byte = digits
                        .iter()
                        .filter_map(|digit| digit.to_digit(16))
                        .fold(0u8, |acc, digit| acc << 4 | digit as u8);
                    out.push(byte);
                    pos += 4;
                } else {
                    out.push(escape(*next)?);
                    pos += 2;
                }
            }
            other => {
                push_char(&mut out, other);
                pos += 1;
            }
        }
    }
    Err(AsmErrorKind::InvalidString("unterminated string literal".to_string()))
}

fn lex_char(chars: &[char], start: usize) -> Result<(u8, usize), AsmErrorKind> {
    let invalid = || AsmErrorKind::InvalidString("malformed character literal".to_string());
    let (value, close) = match chars.get(start + 1) {
        Some('\\') => (escape(*chars.get(start + 2).ok_or_else(invalid)?)?, start + 3),
        Some(ch) if ch.is_ascii() && *ch != '\'' => (*ch as u8, start + 2),
        _ => return Err(invalid()),
    };
    if chars.get(close) != Some(&'\'') {
        return Err(invalid());
    }
    Ok((value, close + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_operands_and_skips_comments() {
        let lines = tokenize("  mov long [rbp - 8], 0x10 ; trailing\n\n# whole line\n.loop:")
            .expect("tokenize");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].number, 1);
        assert_eq!(
            lines[0].tokens,
            vec![
                Token::Ident("mov".into()),
                Token::Ident("long".into()),
                Token::LBracket,
                Token::Ident("rbp".into()),
                Token::Minus,
                Token::Int(8),
                Token::RBracket,
                Token::Comma,
                Token::Int(16),
            ]
        );
        assert_eq!(lines[1].number, 4);
        assert_eq!(lines[1].tokens, vec![Token::Label("loop".into()), Token::Colon]);
    }

    #[test]
    fn number_bases() {
        assert_eq!(parse_number("42"), Ok(Token::Int(42)));
        assert_eq!(parse_number("0x2A"), Ok(Token::Int(42)));
        assert_eq!(parse_number("0b101010"), Ok(Token::Int(42)));
        assert_eq!(parse_number("0o52"), Ok(Token::Int(42)));
        assert_eq!(parse_number("052"), Ok(Token::Int(42)));
        assert_eq!(parse_number("0"), Ok(Token::Int(0)));
        assert_eq!(parse_number("0xffffffffffffffff"), Ok(Token::Int(-1)));
        assert_eq!(parse_number("2.5"), Ok(Token::Float(2.5)));
        assert!(parse_number("09").is_err());
        assert!(parse_number("0x").is_err());
    }

    #[test]
    fn strings_and_chars_unescape() {
        let lines = tokenize(r#""a\tb\x41\0" '\n' 'z'"#).expect("tokenize");
        assert_eq!(
            lines[0].tokens,
            vec![
                Token::Str(b"a\tbA\0".to_vec()),
                Token::Int(10),
                Token::Int(b'z' as i64),
            ]
        );
        assert!(tokenize("\"open").is_err());
        assert!(tokenize("'ab'").is_err());
    }

    #[test]
    fn hex_escapes_take_exactly_two_digits() {
        let lines = tokenize(r#""\xff\x0A""#).expect("tokenize");
        assert_eq!(lines[0].tokens, vec![Token::Str(vec![0xFF, 0x0A])]);
        for source in [r#""\x+1""#, r#""\x4"#, r#""\xg0""#, r#""\x""#] {
            assert!(
                matches!(tokenize(source), Err(err) if matches!(err.kind, AsmErrorKind::InvalidString(_))),
                "{source}"
            );
        }
    }
}
