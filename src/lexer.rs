//! Token definitions for the source language.
//!
//! The lexer is the first stage of the embedded parser; it hands spanned
//! tokens to [`crate::parser`], which builds the tree the macro processor and
//! compiler consume.

pub use logos::{Lexer, Logos};

fn process_string(lexer: &mut Lexer<Token>) -> Result<Box<str>, LexerError> {
    let mut built = String::new();

    // Skip the quote at the beginning; the regex guarantees a closing one.
    let mut chars = lexer.slice()[1..].chars().peekable();
    while let Some(chr) = chars.next() {
        match chr {
            '\\' => match chars.next() {
                Some('n') => built.push('\n'),
                Some('t') => built.push('\t'),
                Some('r') => built.push('\r'),
                Some('0') => built.push('\0'),
                Some('"') => built.push('"'),
                Some('\\') => built.push('\\'),
                Some(other) => return Err(LexerError::UnknownEscape(other)),
                None => unreachable!("the string regex validates escape shapes"),
            },
            // stop at the closing quote
            '"' => break,
            c => built.push(c),
        }
    }

    Ok(Box::from(built.as_str()))
}

fn number(lexer: &mut Lexer<Token>) -> Result<f64, LexerError> {
    lexer
        .slice()
        .parse::<f64>()
        .map_err(|_| LexerError::Invalid)
}

#[derive(thiserror::Error, Debug, PartialEq, Clone, Default)]
pub enum LexerError {
    #[default]
    #[error("invalid token encountered")]
    Invalid,
    #[error("unknown escape sequence: \\{0}")]
    UnknownEscape(char),
}

/// Tokens are lexed from some source, and can arbitrarily borrow from it.
#[derive(Debug, Clone, PartialEq, Logos)]
#[logos(error = LexerError)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    // [a b c] is shorthand for (list a b c)
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    // {a b c} is shorthand for (begin a b c)
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("!{")]
    MacroStart,
    // 'x is shorthand for (quote x)
    #[token("'")]
    Quote,

    #[regex(r"-?[0-9]+(\.[0-9]+)?", number, priority = 3)]
    Number(f64),
    #[regex(r#""([^"\\]|\\.)*""#, process_string)]
    String(Box<str>),
    #[regex(r"@[a-zA-Z_][a-zA-Z0-9_\-?!]*", |l| Box::from(&l.slice()[1..]))]
    Spread(Box<str>),
    #[regex(r"&[a-zA-Z_][a-zA-Z0-9_\-?!]*", |l| Box::from(&l.slice()[1..]))]
    Capture(Box<str>),
    #[regex(r"\.[a-zA-Z_][a-zA-Z0-9_\-?!]*", |l| Box::from(&l.slice()[1..]))]
    GetField(Box<str>),
    // operators are plain identifiers; `@` alone is the index operator
    // (lower priority than Number, so `-2` lexes as a number)
    #[regex(
        r"[a-zA-Z+\-*/<>=!?_%^~$][a-zA-Z0-9+\-*/<>=!?_%^~$:]*",
        |l| Box::from(l.slice()),
        priority = 2
    )]
    #[token("@", |l| Box::from(l.slice()))]
    Identifier(Box<str>),
}

#[cfg(test)]
mod tests {
    use super::{LexerError, Logos, Token};
    use assert2::{assert, check, let_assert};

    #[test]
    fn identifier_checklist() {
        macro_rules! test_valid {
            ($source:literal) => {{
                let mut lexer = Token::lexer($source);
                let token = lexer.next();
                let_assert!(Some(Ok(Token::Identifier(_))) = token);
                assert!(lexer.slice() == $source);
            }};
        }

        test_valid!("+");
        test_valid!("-");
        test_valid!("*");
        test_valid!("/");
        test_valid!("<=");
        test_valid!("!=");
        test_valid!("@");
        test_valid!("empty?");
        test_valid!("firstOf");
        test_valid!("toNumber");
        test_valid!("str:format");
        test_valid!("the-word-recursion-has-many-meanings");
    }

    #[test]
    fn numbers_including_negative_and_decimal() {
        check!(Token::lexer("42").next() == Some(Ok(Token::Number(42.0))));
        check!(Token::lexer("-2").next() == Some(Ok(Token::Number(-2.0))));
        check!(Token::lexer("3.25").next() == Some(Ok(Token::Number(3.25))));
        // a lone minus is the subtraction operator
        check!(Token::lexer("- 2").next() == Some(Ok(Token::Identifier("-".into()))));
    }

    #[test]
    fn string_escapes() {
        let_assert!(Some(Ok(Token::String(s))) = Token::lexer(r#""a\tb\n""#).next());
        check!(s.as_ref() == "a\tb\n");
        let_assert!(Some(Ok(Token::String(s))) = Token::lexer(r#""say \"hi\"""#).next());
        check!(s.as_ref() == "say \"hi\"");
        check!(Token::lexer(r#""bad \q""#).next() == Some(Err(LexerError::UnknownEscape('q'))));
    }

    #[test]
    fn sigils() {
        check!(Token::lexer("@rest").next() == Some(Ok(Token::Spread("rest".into()))));
        check!(Token::lexer("&outer").next() == Some(Ok(Token::Capture("outer".into()))));
        check!(Token::lexer(".field").next() == Some(Ok(Token::GetField("field".into()))));
        // a dot inside a number is not a field access
        check!(Token::lexer("1.5").next() == Some(Ok(Token::Number(1.5))));
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        let tokens: Vec<_> = Token::lexer("(a # rest of line\n  b)").collect();
        check!(
            tokens
                == vec![
                    Ok(Token::LParen),
                    Ok(Token::Identifier("a".into())),
                    Ok(Token::Identifier("b".into())),
                    Ok(Token::RParen),
                ]
        );
    }

    #[test]
    fn macro_start_wins_over_lone_brace() {
        let tokens: Vec<_> = Token::lexer("!{a 1}").collect();
        check!(tokens.first() == Some(&Ok(Token::MacroStart)));
        check!(tokens.last() == Some(&Ok(Token::RBrace)));
    }
}
