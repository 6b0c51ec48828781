/// Name given to the prototype synthesized for a top-level expression.
pub(crate) const ANON_FN_NAME: &str = "__anon_expr";

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(f64),
    Variable(String),
    Binary(char, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    /// `for var = start, end, step in body`
    For {
        var: String,
        start: Box<Expr>,
        end: Box<Expr>,
        step: Option<Box<Expr>>,
        body: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Prototype {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
}

impl Prototype {
    pub(crate) fn new<S: Into<String>>(name: S, params: Vec<String>) -> Self {
        Prototype {
            name: name.into(),
            params,
        }
    }

    pub(crate) fn anonymous() -> Self {
        Prototype::new(ANON_FN_NAME, vec![])
    }

    pub(crate) fn arity(&self) -> usize {
        self.params.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) proto: Prototype,
    pub(crate) body: Expr,
}
