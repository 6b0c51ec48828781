use super::error::{ErrorKind, Result};
use super::token::Token;
use combine::error::ParseError;
use combine::parser::char::{digit, spaces};
use combine::parser::Parser;
use combine::stream::Stream;
use combine::{any, choice, eof, many, many1, parser, satisfy, skip_many, token};
use std::collections::VecDeque;
use std::io::BufRead;

/// Pull interface the parser reads tokens through.
pub(crate) trait TokenSource {
    fn next_token(&mut self) -> Result<Token>;
}

// Mirrors strtod: the longest prefix that is a valid float wins, garbage
// after it is dropped with the rest of the run.
fn number_prefix(s: &str) -> f64 {
    (1..=s.len())
        .rev()
        .find_map(|end| s[..end].parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn number<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    many1(choice((digit(), token('.')))).map(|ns: String| Token::Number(number_prefix(&ns)))
}

fn ident<Input>() -> impl Parser<Input, Output = Token>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        satisfy(|c: char| c.is_ascii_alphabetic()),
        many(satisfy(|c: char| c.is_ascii_alphanumeric())),
    )
        .map(|(first, rest): (char, String)| {
            let mut id = String::with_capacity(rest.len() + 1);
            id.push(first);
            id.push_str(&rest);
            Token::keyword(&id).unwrap_or(Token::Ident(id))
        })
}

fn comment<Input>() -> impl Parser<Input, Output = ()>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    (
        token('#'),
        skip_many(satisfy(|c: char| c != '\n' && c != '\r')),
    )
        .map(|_| ())
}

fn lex_<Input>() -> impl Parser<Input, Output = Option<Token>>
where
    Input: Stream<Token = char>,
    Input::Error: ParseError<Input::Token, Input::Range, Input::Position>,
{
    spaces().with(choice((
        number().map(Some),
        ident().map(Some),
        comment().with(lex()),
        eof().map(|_| None),
        any().map(|c| Some(Token::Kwd(c))),
    )))
}

parser! {
    pub(crate) fn lex[Input]()(Input) -> Option<Token>
        where [Input: Stream<Token=char>]
    {
        lex_()
    }
}

/// Scans its reader one line at a time and hands tokens out on demand.
pub(crate) struct Lexer<R> {
    reader: R,
    pending: VecDeque<Token>,
    exhausted: bool,
}

impl<R: BufRead> Lexer<R> {
    pub(crate) fn new(reader: R) -> Self {
        Lexer {
            reader,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    // Bytes that are not UTF-8 come through as U+FFFD and lex as `Kwd`.
    fn fill(&mut self) -> Result<()> {
        while self.pending.is_empty() && !self.exhausted {
            let mut raw = Vec::new();
            if self.reader.read_until(b'\n', &mut raw)? == 0 {
                self.exhausted = true;
                break;
            }

            let line = String::from_utf8_lossy(&raw);
            let mut buf: &str = &line;
            loop {
                match lex().parse(buf) {
                    Ok((Some(token), rest)) => {
                        buf = rest;
                        self.pending.push_back(token);
                    }
                    Ok((None, _)) => break,
                    Err(e) => return Err(ErrorKind::Lexical(e.to_string()).into()),
                }
            }
        }
        Ok(())
    }
}

impl<R: BufRead> TokenSource for Lexer<R> {
    fn next_token(&mut self) -> Result<Token> {
        self.fill()?;
        Ok(self.pending.pop_front().unwrap_or(Token::Eof))
    }
}
