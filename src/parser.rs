use super::ast::{Expr, Function, Prototype};
use super::error::{Error, Result};
use super::lexer::TokenSource;
use super::token::Token;
use std::collections::HashMap;

/// Recursive-descent parser with precedence climbing for binary operators.
///
/// Holds exactly one token of lookahead, `current`.
pub(crate) struct Parser<S> {
    source: S,
    current: Token,
    binop_precedence: HashMap<char, i32>,
}

impl<S: TokenSource> Parser<S> {
    /// Reads the first token so that `current` is always valid.
    pub(crate) fn new(mut source: S) -> Result<Self> {
        let current = source.next_token()?;
        let binop_precedence = [('<', 10), ('>', 10), ('+', 20), ('-', 20), ('*', 40), ('/', 40)]
            .iter()
            .cloned()
            .collect();
        Ok(Parser {
            source,
            current,
            binop_precedence,
        })
    }

    pub(crate) fn current(&self) -> &Token {
        &self.current
    }

    pub(crate) fn advance(&mut self) -> Result<&Token> {
        self.current = self.source.next_token()?;
        Ok(&self.current)
    }

    fn expect_kwd(&mut self, c: char, msg: &str) -> Result<()> {
        if self.current != Token::Kwd(c) {
            return Err(Error::syntax(msg));
        }
        self.advance()?;
        Ok(())
    }

    fn expect(&mut self, token: Token, msg: &str) -> Result<()> {
        if self.current != token {
            return Err(Error::syntax(msg));
        }
        self.advance()?;
        Ok(())
    }

    /// -1 for anything that is not a registered binary operator.
    fn token_precedence(&self) -> i32 {
        match self.current {
            Token::Kwd(c) if c.is_ascii() => self.binop_precedence.get(&c).cloned().unwrap_or(-1),
            _ => -1,
        }
    }

    // numberexpr ::= number
    fn number(&mut self, n: f64) -> Result<Expr> {
        self.advance()?;
        Ok(Expr::Number(n))
    }

    // parenexpr ::= '(' expression ')'
    fn paren(&mut self) -> Result<Expr> {
        self.advance()?;
        let e = self.expr()?;
        self.expect_kwd(')', "expected ')'")?;
        Ok(e)
    }

    // identifierexpr ::= identifier | identifier '(' expression* ')'
    fn identifier(&mut self, id: String) -> Result<Expr> {
        self.advance()?;
        if self.current != Token::Kwd('(') {
            return Ok(Expr::Variable(id));
        }

        self.advance()?;
        let mut args = Vec::new();
        if self.current != Token::Kwd(')') {
            loop {
                args.push(self.expr()?);
                match self.current {
                    Token::Kwd(')') => break,
                    Token::Kwd(',') => {
                        self.advance()?;
                    }
                    _ => return Err(Error::syntax("expected ')' or ',' in argument list")),
                }
            }
        }
        self.advance()?;
        Ok(Expr::Call(id, args))
    }

    // ifexpr ::= 'if' expression 'then' expression 'else' expression
    fn parse_if(&mut self) -> Result<Expr> {
        self.advance()?;
        let cond = self.expr()?;
        self.expect(Token::Then, "expected then")?;
        let then = self.expr()?;
        self.expect(Token::Else, "expected else")?;
        let els = self.expr()?;
        Ok(Expr::If(Box::new(cond), Box::new(then), Box::new(els)))
    }

    // forexpr ::= 'for' identifier '=' expr ',' expr (',' expr)? 'in' expression
    fn parse_for(&mut self) -> Result<Expr> {
        self.advance()?;
        let var = match &self.current {
            Token::Ident(id) => id.clone(),
            _ => return Err(Error::syntax("expected identifier after for")),
        };
        self.advance()?;
        self.expect_kwd('=', "expected '=' after for")?;

        let start = self.expr()?;
        self.expect_kwd(',', "expected ',' after for start value")?;
        let end = self.expr()?;

        let step = if self.current == Token::Kwd(',') {
            self.advance()?;
            Some(Box::new(self.expr()?))
        } else {
            None
        };

        self.expect(Token::In, "expected 'in' after for")?;
        let body = self.expr()?;

        Ok(Expr::For {
            var,
            start: Box::new(start),
            end: Box::new(end),
            step,
            body: Box::new(body),
        })
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.current.clone() {
            Token::Ident(id) => self.identifier(id),
            Token::Number(n) => self.number(n),
            Token::Kwd('(') => self.paren(),
            Token::If => self.parse_if(),
            Token::For => self.parse_for(),
            _ => Err(Error::syntax("unknown token when expecting an expression")),
        }
    }

    // expression ::= primary binoprhs
    pub(crate) fn expr(&mut self) -> Result<Expr> {
        let lhs = self.primary()?;
        self.binop_rhs(0, lhs)
    }

    // binoprhs ::= (binop primary)*
    fn binop_rhs(&mut self, expr_prec: i32, mut lhs: Expr) -> Result<Expr> {
        loop {
            let tok_prec = self.token_precedence();
            if tok_prec < expr_prec {
                return Ok(lhs);
            }

            let op = match self.current {
                Token::Kwd(c) => c,
                _ => return Ok(lhs),
            };
            self.advance()?;

            let mut rhs = self.primary()?;
            if tok_prec < self.token_precedence() {
                rhs = self.binop_rhs(tok_prec + 1, rhs)?;
            }
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    // prototype ::= id '(' id* ')'
    fn prototype(&mut self) -> Result<Prototype> {
        let name = match &self.current {
            Token::Ident(id) => id.clone(),
            _ => return Err(Error::syntax("expected function name in prototype")),
        };
        self.advance()?;
        if self.current != Token::Kwd('(') {
            return Err(Error::syntax("expected '(' in prototype"));
        }

        let mut params: Vec<String> = Vec::new();
        while let Token::Ident(id) = self.advance()? {
            if params.contains(id) {
                return Err(Error::syntax(format!("duplicate parameter name '{}'", id)));
            }
            params.push(id.clone());
        }
        self.expect_kwd(')', "expected ')' in prototype")?;

        Ok(Prototype::new(name, params))
    }

    // definition ::= 'def' prototype expression
    pub(crate) fn definition(&mut self) -> Result<Function> {
        self.advance()?;
        let proto = self.prototype()?;
        let body = self.expr()?;
        Ok(Function { proto, body })
    }

    // external ::= 'extern' prototype
    pub(crate) fn extern_decl(&mut self) -> Result<Prototype> {
        self.advance()?;
        self.prototype()
    }

    // toplevelexpr ::= expression
    pub(crate) fn toplevel(&mut self) -> Result<Function> {
        let body = self.expr()?;
        Ok(Function {
            proto: Prototype::anonymous(),
            body,
        })
    }
}
