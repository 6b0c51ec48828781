use super::ast::ANON_FN_NAME;
use super::backend::{Backend, Submitted};
use super::codegen::CodeGen;
use super::config::Config;
use super::error::{Error, ErrorKind, Result};
use super::ir::Module;
use super::lexer::TokenSource;
use super::parser::Parser;
use super::registry::PrototypeRegistry;
use super::token::Token;
use std::io::Write;
use std::mem;
use tracing::{debug, debug_span, trace};

/// What one top-level unit came to.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Outcome {
    Defined(String),
    Declared(String),
    Evaluated(f64),
    Skipped,
    Failed(String),
    Finished,
}

/// Owns the prototype registry and the unit being filled, and decides when a
/// unit is handed to the backend.
///
/// Every definition and every top-level expression ends its unit; externs
/// only add a declaration to the current one.
pub(crate) struct Session<B: Backend> {
    registry: PrototypeRegistry,
    module: Module,
    backend: B,
    config: Config,
    trace: Box<dyn Write>,
}

// Parse errors skip the offending token so the next unit starts past it.
fn recover<T, S: TokenSource>(parser: &mut Parser<S>, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        if *e.kind() != ErrorKind::Io {
            trace!(skipped = %parser.current(), "recovering from parse error");
            parser.advance()?;
        }
    }
    result
}

impl<B: Backend> Session<B> {
    pub(crate) fn new(backend: B, config: Config, trace: Box<dyn Write>) -> Self {
        let module = Module::new(config.module_name.clone());
        Session {
            registry: PrototypeRegistry::new(),
            module,
            backend,
            config,
            trace,
        }
    }

    /// Runs units until the source is exhausted, then dumps the unit left in
    /// progress.
    pub(crate) fn run<S: TokenSource>(&mut self, source: S) -> Result<()> {
        self.prompt()?;
        let mut parser = Parser::new(source)?;
        loop {
            match self.step(&mut parser)? {
                Outcome::Finished => break,
                outcome => trace!(?outcome, "unit done"),
            }
        }
        write!(self.trace, "{}", self.module)?;
        self.trace.flush()?;
        Ok(())
    }

    /// Handles one top-level unit. Only I/O failures are returned as errors;
    /// everything else is reported on the trace and the session goes on.
    pub(crate) fn step<S: TokenSource>(&mut self, parser: &mut Parser<S>) -> Result<Outcome> {
        self.prompt()?;
        let result = match parser.current().clone() {
            Token::Eof => return Ok(Outcome::Finished),
            Token::Kwd(';') => {
                parser.advance()?;
                return Ok(Outcome::Skipped);
            }
            Token::Def => self.handle_definition(parser),
            Token::Extern => self.handle_extern(parser),
            _ => self.handle_toplevel(parser),
        };

        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if *e.kind() == ErrorKind::Io {
                    return Err(e);
                }
                writeln!(self.trace, "Error: {}", e)?;
                Ok(Outcome::Failed(e.to_string()))
            }
        }
    }

    fn prompt(&mut self) -> Result<()> {
        write!(self.trace, "{}", self.config.prompt)?;
        self.trace.flush()?;
        Ok(())
    }

    // Swaps in a fresh unit and returns the finished one.
    fn rotate(&mut self) -> Module {
        mem::replace(&mut self.module, Module::new(self.config.module_name.clone()))
    }

    fn handle_definition<S: TokenSource>(&mut self, parser: &mut Parser<S>) -> Result<Outcome> {
        let result = parser.definition();
        let def = recover(parser, result)?;
        let name = def.proto.name.clone();
        let _span = debug_span!("definition", %name).entered();

        {
            let mut codegen =
                CodeGen::new(&mut self.module, &mut self.registry).optimize(self.config.optimize);
            let f = codegen.codegen_func(&def)?;
            writeln!(self.trace, "Parsed a function definition:")?;
            write!(self.trace, "{}", f)?;
        }

        let unit = self.rotate();
        let handle = self.backend.submit(unit)?;
        debug!(?handle, "definition submitted");
        Ok(Outcome::Defined(name))
    }

    fn handle_extern<S: TokenSource>(&mut self, parser: &mut Parser<S>) -> Result<Outcome> {
        let result = parser.extern_decl();
        let proto = recover(parser, result)?;
        let name = proto.name.clone();

        {
            let mut codegen = CodeGen::new(&mut self.module, &mut self.registry);
            let f = codegen.codegen_proto(&proto);
            writeln!(self.trace, "Parsed an extern:")?;
            write!(self.trace, "{}", f)?;
        }

        self.registry.insert(proto);
        debug!(%name, "extern declared");
        Ok(Outcome::Declared(name))
    }

    fn handle_toplevel<S: TokenSource>(&mut self, parser: &mut Parser<S>) -> Result<Outcome> {
        let result = parser.toplevel();
        let func = recover(parser, result)?;
        let _span = debug_span!("toplevel").entered();

        {
            let mut codegen =
                CodeGen::new(&mut self.module, &mut self.registry).optimize(self.config.optimize);
            let f = codegen.codegen_func(&func)?;
            writeln!(self.trace, "Parsed a top-level expr:")?;
            write!(self.trace, "{}", f)?;
        }

        let unit = self.rotate();
        let value = self.evaluate(unit);
        self.registry.remove(ANON_FN_NAME);
        let value = value?;

        writeln!(self.trace, "Evaluated to {:.6}", value)?;
        Ok(Outcome::Evaluated(value))
    }

    // The unit is released again whether or not the call succeeds.
    fn evaluate(&mut self, unit: Module) -> Result<f64> {
        let mut jit = Submitted::new(&mut self.backend, unit)?;
        let symbol = jit
            .backend()
            .lookup_symbol(ANON_FN_NAME)
            .ok_or_else(|| Error::backend(format!("symbol '{}' not found", ANON_FN_NAME)))?;
        let value = jit.backend().invoke(&symbol)?;
        jit.release()?;
        Ok(value)
    }
}

#[cfg(test)]
mod test {
    use super::super::backend::UnitHandle;
    use super::super::interpreter::{self, Interpreter};
    use super::super::lexer::Lexer;
    use super::super::runtime::SharedBuffer;
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Run {
        outcomes: Vec<Outcome>,
        trace: SharedBuffer,
        output: SharedBuffer,
    }

    fn session(src: &str) -> Run {
        let trace = SharedBuffer::default();
        let output = SharedBuffer::default();
        let backend = Interpreter::with_output(output.clone(), 200);
        let mut session = Session::new(backend, Config::default(), Box::new(trace.clone()));
        let mut parser = Parser::new(Lexer::new(src.as_bytes())).unwrap();
        let mut outcomes = Vec::new();
        loop {
            match session.step(&mut parser).unwrap() {
                Outcome::Finished => break,
                Outcome::Skipped => {}
                o => outcomes.push(o),
            }
        }
        Run {
            outcomes,
            trace,
            output,
        }
    }

    fn values(run: &Run) -> Vec<f64> {
        run.outcomes
            .iter()
            .filter_map(|o| match o {
                Outcome::Evaluated(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_precedence_and_associativity() {
        let run = session("1 + 2 * 3; 1 * 2 + 3; 8 - 4 - 2;");
        assert_eq!(values(&run), vec![7.0, 5.0, 2.0]);
    }

    #[test]
    fn test_arity_mismatch_is_reported() {
        let run = session("def f(a b) a+b\nf(1)\nf(1, 2)");
        assert_eq!(
            run.outcomes,
            vec![
                Outcome::Defined("f".to_owned()),
                Outcome::Failed("incorrect # arguments passed to 'f': expected 2, found 1".to_owned()),
                Outcome::Evaluated(3.0),
            ]
        );
        assert!(run
            .trace
            .contents()
            .contains("Error: incorrect # arguments passed to 'f': expected 2, found 1\n"));
    }

    #[test]
    fn test_extern_forward_reference() {
        let run = session("extern g(x)\ndef h(x) g(x)\n");
        assert_eq!(
            run.outcomes,
            vec![
                Outcome::Declared("g".to_owned()),
                Outcome::Defined("h".to_owned()),
            ]
        );
        let trace = run.trace.contents();
        assert!(trace.contains("Parsed an extern:\ndeclare double @g(double %x)\n"));
        assert!(trace.contains("%calltmp = call double @g(double %x)"));
    }

    #[test]
    fn test_calling_undefined_extern_fails_at_run_time() {
        let run = session("extern g(x)\ng(1)\n2");
        assert_eq!(
            run.outcomes,
            vec![
                Outcome::Declared("g".to_owned()),
                Outcome::Failed("backend: unresolved symbol 'g'".to_owned()),
                Outcome::Evaluated(2.0),
            ]
        );
    }

    #[test]
    fn test_if_truthiness() {
        let run = session("if 0 then 1 else 2; if 5 then 1 else 2;");
        assert_eq!(values(&run), vec![2.0, 1.0]);
    }

    #[test]
    fn test_for_loop_prints_and_yields_zero() {
        let run = session("extern printd(x)\nfor i = 1, i < 5, 1 in printd(i)\n");
        assert_eq!(values(&run), vec![0.0]);
        assert_eq!(
            run.output.contents(),
            "1.000000\n2.000000\n3.000000\n4.000000\n"
        );
        assert!(run.trace.contents().contains("Evaluated to 0.000000\n"));
    }

    #[test]
    fn test_loop_variable_is_scoped_to_body() {
        let run = session("def f(i) (for i = 1, i < 3 in 0) + i\nf(10)");
        assert_eq!(values(&run), vec![10.0]);
    }

    #[test]
    fn test_redefinition_latest_wins() {
        let run = session("def k() 1\ndef k() 2\nk()");
        assert_eq!(values(&run), vec![2.0]);
    }

    #[test]
    fn test_pure_expressions_are_idempotent() {
        let run = session("def sq(x) x * x\nsq(1.5) + 4 - 1\nsq(1.5) + 4 - 1");
        let v = values(&run);
        assert_eq!(v.len(), 2);
        assert_eq!(v[0].to_bits(), v[1].to_bits());
        assert_eq!(v[0], 5.25);
    }

    #[test]
    fn test_recursion() {
        let run = session("def fib(x) if x < 3 then 1 else fib(x-1)+fib(x-2)\nfib(15)");
        assert_eq!(values(&run), vec![610.0]);
    }

    #[test]
    fn test_parse_error_recovery() {
        // Skipping '(' leaves `x ) 1` to be read as units of their own.
        let run = session("def (x) 1\n4 + 5");
        assert_eq!(
            run.outcomes,
            vec![
                Outcome::Failed("expected function name in prototype".to_owned()),
                Outcome::Failed("unknown variable name 'x'".to_owned()),
                Outcome::Failed("unknown token when expecting an expression".to_owned()),
                Outcome::Evaluated(1.0),
                Outcome::Evaluated(9.0),
            ]
        );
    }

    #[test]
    fn test_failed_definition_leaves_no_trace() {
        let run = session("def bad(x) y\nbad(1)");
        assert_eq!(
            run.outcomes,
            vec![
                Outcome::Failed("unknown variable name 'y'".to_owned()),
                Outcome::Failed("unknown function referenced 'bad'".to_owned()),
            ]
        );
    }

    #[test]
    fn test_redeclaration_with_different_arity_is_permitted() {
        let run = session("def f(x) x\nextern f(a b)\nf(1, 2)");
        assert_eq!(run.outcomes[1], Outcome::Declared("f".to_owned()));
        match &run.outcomes[2] {
            Outcome::Failed(msg) => assert!(msg.contains("'f' takes 1 arguments")),
            o => panic!("unexpected outcome {:?}", o),
        }
    }

    #[test]
    fn test_putchard_output() {
        let run = session("extern putchard(c)\nputchard(72) + putchard(105)");
        assert_eq!(values(&run), vec![0.0]);
        assert_eq!(run.output.contents(), "Hi");
    }

    #[test]
    fn test_run_traces_prompts_and_final_unit() {
        let trace = SharedBuffer::default();
        let backend = Interpreter::with_output(SharedBuffer::default(), 200);
        let mut session = Session::new(backend, Config::default(), Box::new(trace.clone()));
        session.run(Lexer::new("extern sin(x)\n".as_bytes())).unwrap();
        assert_eq!(
            trace.contents(),
            "ready> ready> Parsed an extern:\ndeclare double @sin(double %x)\nready> \
             ; ModuleID = 'my cool jit'\n\ndeclare double @sin(double %x)\n"
        );
    }

    #[test]
    fn test_invalid_utf8_does_not_end_the_session() {
        let trace = SharedBuffer::default();
        let backend = Interpreter::with_output(SharedBuffer::default(), 200);
        let mut session = Session::new(backend, Config::default(), Box::new(trace.clone()));
        session
            .run(Lexer::new(&b"1 + 1\n\xff\n2 + 2\n"[..]))
            .unwrap();
        let trace = trace.contents();
        assert!(trace.contains("Evaluated to 2.000000\n"));
        assert!(trace.contains("Error: unknown token when expecting an expression\n"));
        assert!(trace.contains("Evaluated to 4.000000\n"));
    }

    /// Interpreter that remembers which units are still submitted.
    struct Tracked {
        inner: Interpreter<SharedBuffer>,
        live: Rc<RefCell<Vec<UnitHandle>>>,
    }

    impl Backend for Tracked {
        type Symbol = interpreter::Symbol;

        fn submit(&mut self, unit: Module) -> Result<UnitHandle> {
            let handle = self.inner.submit(unit)?;
            self.live.borrow_mut().push(handle);
            Ok(handle)
        }

        fn lookup_symbol(&mut self, name: &str) -> Option<Self::Symbol> {
            self.inner.lookup_symbol(name)
        }

        fn invoke(&mut self, symbol: &Self::Symbol) -> Result<f64> {
            self.inner.invoke(symbol)
        }

        fn release(&mut self, handle: UnitHandle) -> Result<()> {
            self.inner.release(handle)?;
            self.live.borrow_mut().retain(|h| *h != handle);
            Ok(())
        }
    }

    fn tracked(src: &str) -> (Vec<Outcome>, usize) {
        let live = Rc::new(RefCell::new(Vec::new()));
        let backend = Tracked {
            inner: Interpreter::with_output(SharedBuffer::default(), 200),
            live: Rc::clone(&live),
        };
        let mut session = Session::new(backend, Config::default(), Box::new(SharedBuffer::default()));
        let mut parser = Parser::new(Lexer::new(src.as_bytes())).unwrap();
        let mut outcomes = Vec::new();
        loop {
            match session.step(&mut parser).unwrap() {
                Outcome::Finished => break,
                o => outcomes.push(o),
            }
        }
        let remaining = live.borrow().len();
        (outcomes, remaining)
    }

    #[test]
    fn test_expression_units_are_released_after_evaluation() {
        let (outcomes, live) = tracked("def k() 3
k() + 1");
        assert_eq!(outcomes[1], Outcome::Evaluated(4.0));
        // only the definition's unit stays
        assert_eq!(live, 1);
    }

    #[test]
    fn test_expression_units_are_released_when_the_call_fails() {
        let (outcomes, live) = tracked("extern g(x)\ng(1)");
        assert_eq!(
            outcomes[1],
            Outcome::Failed("backend: unresolved symbol 'g'".to_owned())
        );
        assert_eq!(live, 0);
    }
}
