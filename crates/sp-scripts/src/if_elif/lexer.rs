//! Tokenizer for condition expressions.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Token::Number(n) => n.to_string(),
            Token::Str(s) => format!("{:?}", s),
            Token::Ident(name) => name.clone(),
            Token::LParen => "(".into(),
            Token::RParen => ")".into(),
            Token::LBracket => "[".into(),
            Token::RBracket => "]".into(),
            Token::LBrace => "{".into(),
            Token::RBrace => "}".into(),
            Token::Comma => ",".into(),
            Token::Colon => ":".into(),
            Token::Dot => ".".into(),
            Token::Eq => "==".into(),
            Token::Ne => "!=".into(),
            Token::Lt => "<".into(),
            Token::Le => "<=".into(),
            Token::Gt => ">".into(),
            Token::Ge => ">=".into(),
        }
    }
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, ExpressionError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => push(&mut tokens, &mut i, Token::LParen),
            ')' => push(&mut tokens, &mut i, Token::RParen),
            '[' => push(&mut tokens, &mut i, Token::LBracket),
            ']' => push(&mut tokens, &mut i, Token::RBracket),
            '{' => push(&mut tokens, &mut i, Token::LBrace),
            '}' => push(&mut tokens, &mut i, Token::RBrace),
            ',' => push(&mut tokens, &mut i, Token::Comma),
            ':' => push(&mut tokens, &mut i, Token::Colon),
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (token, width) = match (c, next) {
                    ('=', Some('=')) => (Token::Eq, 2),
                    ('!', Some('=')) => (Token::Ne, 2),
                    ('<', Some('=')) => (Token::Le, 2),
                    ('>', Some('=')) => (Token::Ge, 2),
                    ('<', _) => (Token::Lt, 1),
                    ('>', _) => (Token::Gt, 1),
                    _ => {
                        return Err(ExpressionError::Syntax(format!(
                            "Unsupported operator '{}' at position {}",
                            c, i
                        )))
                    }
                };
                tokens.push(token);
                i += width;
            }
            '"' | '\'' => {
                let (value, end) = read_string(&chars, i)?;
                tokens.push(Token::Str(value));
                i = end;
            }
            '.' if !chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                push(&mut tokens, &mut i, Token::Dot)
            }
            c if c.is_ascii_digit() || c == '.' || c == '-' => {
                let (value, end) = read_number(&chars, i)?;
                tokens.push(Token::Number(value));
                i = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(ExpressionError::Syntax(format!(
                    "Unexpected character '{}' at position {}",
                    other, i
                )))
            }
        }
    }

    Ok(tokens)
}

fn push(tokens: &mut Vec<Token>, i: &mut usize, token: Token) {
    tokens.push(token);
    *i += 1;
}

/// Reads a quoted string starting at `start`. Unknown escapes keep their backslash.
fn read_string(chars: &[char], start: usize) -> Result<(String, usize), ExpressionError> {
    let quote = chars[start];
    let mut value = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((value, i + 1)),
            '\\' => {
                match chars.get(i + 1) {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('\\') => value.push('\\'),
                    Some(c) if *c == '"' || *c == '\'' => value.push(*c),
                    Some(c) => {
                        value.push('\\');
                        value.push(*c);
                    }
                    None => break,
                }
                i += 2;
            }
            c => {
                value.push(c);
                i += 1;
            }
        }
    }
    Err(ExpressionError::Syntax(format!(
        "Unterminated string starting at position {}",
        start
    )))
}

fn read_number(chars: &[char], start: usize) -> Result<(f64, usize), ExpressionError> {
    let mut i = start;
    if chars[i] == '-' {
        i += 1;
    }
    while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
        i += 1;
    }
    let text: String = chars[start..i].iter().collect();
    text.parse::<f64>()
        .map(|n| (n, i))
        .map_err(|_| ExpressionError::Syntax(format!("Invalid number '{}'", text)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_operators_and_literals() {
        let tokens = tokenize(r#"1 <= 2.5 != 'a' == "b""#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Number(1.0),
                Token::Le,
                Token::Number(2.5),
                Token::Ne,
                Token::Str("a".into()),
                Token::Eq,
                Token::Str("b".into()),
            ]
        );
    }

    #[test]
    fn test_unknown_escape_is_kept() {
        let tokens = tokenize(r#""\s""#).unwrap();
        assert_eq!(tokens, vec![Token::Str("\\s".into())]);
    }

    #[test]
    fn test_rejects_assignment_and_arithmetic() {
        assert!(tokenize("a = 1").is_err());
        assert!(tokenize("1 + 1").is_err());
        assert!(tokenize("'open").is_err());
    }

    #[test]
    fn test_attribute_dot() {
        let tokens = tokenize("sys.exit()").unwrap();
        assert_eq!(tokens[1], Token::Dot);
    }
}
