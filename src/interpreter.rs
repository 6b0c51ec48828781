//! Backend that runs SSA units directly.

use super::backend::{Backend, UnitHandle};
use super::error::{Error, Result};
use super::ir::{BlockId, Function, Inst, Module, Terminator, Value};
use super::runtime;
use std::io::{self, Stderr, Write};
use std::rc::Rc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub(crate) struct Symbol {
    unit: Rc<Module>,
    index: usize,
}

enum Callee {
    Defined(Rc<Module>, usize),
    Builtin(&'static str),
}

pub(crate) struct Interpreter<W> {
    units: Vec<(UnitHandle, Rc<Module>)>,
    next_handle: u64,
    out: W,
    max_call_depth: usize,
}

impl Interpreter<Stderr> {
    pub(crate) fn new(max_call_depth: usize) -> Self {
        Interpreter::with_output(io::stderr(), max_call_depth)
    }
}

impl<W: Write> Interpreter<W> {
    /// `out` receives whatever `putchard`/`printd` write.
    pub(crate) fn with_output(out: W, max_call_depth: usize) -> Self {
        Interpreter {
            units: Vec::new(),
            next_handle: 0,
            out,
            max_call_depth,
        }
    }

    // Newest unit first, then the runtime primitives.
    fn resolve(&self, name: &str) -> Option<Callee> {
        for (_, unit) in self.units.iter().rev() {
            let found = unit
                .functions()
                .iter()
                .position(|f| f.name == name && !f.is_declaration());
            if let Some(index) = found {
                return Some(Callee::Defined(Rc::clone(unit), index));
            }
        }
        match name {
            runtime::PUTCHARD => Some(Callee::Builtin(runtime::PUTCHARD)),
            runtime::PRINTD => Some(Callee::Builtin(runtime::PRINTD)),
            _ => None,
        }
    }

    fn call(&mut self, name: &str, args: &[f64], depth: usize) -> Result<f64> {
        let callee = self
            .resolve(name)
            .ok_or_else(|| Error::backend(format!("unresolved symbol '{}'", name)))?;
        let arity = match &callee {
            Callee::Defined(unit, index) => unit.functions()[*index].arity(),
            Callee::Builtin(_) => 1,
        };
        if arity != args.len() {
            return Err(Error::backend(format!(
                "'{}' takes {} arguments but was linked against a call with {}",
                name,
                arity,
                args.len()
            )));
        }

        match callee {
            Callee::Defined(unit, index) => self.exec(&unit.functions()[index], args, depth + 1),
            Callee::Builtin(runtime::PUTCHARD) => Ok(runtime::putchard(&mut self.out, args[0])?),
            Callee::Builtin(_) => Ok(runtime::printd(&mut self.out, args[0])?),
        }
    }

    fn exec(&mut self, f: &Function, args: &[f64], depth: usize) -> Result<f64> {
        if depth > self.max_call_depth {
            return Err(Error::backend(format!(
                "call depth limit of {} exceeded in '{}'",
                self.max_call_depth, f.name
            )));
        }
        trace!(function = %f.name, ?args, depth, "exec");

        let mut regs = vec![0.0; f.inst_count()];
        let value = |regs: &[f64], v: Value| match v {
            Value::Const(n) => n,
            Value::Param(i) => args[i],
            Value::Inst(id) => regs[id.index()],
        };

        let mut block = f
            .entry()
            .ok_or_else(|| Error::backend(format!("'{}' has no body", f.name)))?;
        let mut pred: Option<BlockId> = None;
        loop {
            let b = f.block(block);

            // All phis of a block read their inputs before any is written.
            let mut incoming = Vec::new();
            for &id in &b.insts {
                if let Inst::Phi(edges) = &f.inst(id).kind {
                    let v = edges
                        .iter()
                        .find(|(_, from)| Some(*from) == pred)
                        .map(|(v, _)| value(&regs, *v))
                        .ok_or_else(|| {
                            Error::backend(format!(
                                "phi %{} has no edge for its predecessor",
                                f.inst(id).name
                            ))
                        })?;
                    incoming.push((id, v));
                }
            }
            for (id, v) in incoming {
                regs[id.index()] = v;
            }

            for &id in &b.insts {
                let v = match &f.inst(id).kind {
                    Inst::Phi(_) => continue,
                    Inst::FAdd(l, r) => value(&regs, *l) + value(&regs, *r),
                    Inst::FSub(l, r) => value(&regs, *l) - value(&regs, *r),
                    Inst::FMul(l, r) => value(&regs, *l) * value(&regs, *r),
                    Inst::FCmp(pred, l, r) => {
                        if pred.eval(value(&regs, *l), value(&regs, *r)) {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    Inst::UIToFP(v) => value(&regs, *v),
                    Inst::Call { callee, args } => {
                        let args: Vec<f64> = args.iter().map(|a| value(&regs, *a)).collect();
                        self.call(callee, &args, depth)?
                    }
                };
                regs[id.index()] = v;
            }

            match &b.terminator {
                Some(Terminator::Br(target)) => {
                    pred = Some(block);
                    block = *target;
                }
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    pred = Some(block);
                    block = if value(&regs, *cond) != 0.0 {
                        *then_block
                    } else {
                        *else_block
                    };
                }
                Some(Terminator::Ret(v)) => return Ok(value(&regs, *v)),
                None => {
                    return Err(Error::backend(format!(
                        "block '{}' of '{}' falls off its end",
                        b.label, f.name
                    )))
                }
            }
        }
    }
}

impl<W: Write> Backend for Interpreter<W> {
    type Symbol = Symbol;

    fn submit(&mut self, unit: Module) -> Result<UnitHandle> {
        let handle = UnitHandle::new(self.next_handle);
        self.next_handle += 1;
        debug!(?handle, unit = %unit.name, functions = unit.functions().len(), "submitted unit");
        self.units.push((handle, Rc::new(unit)));
        Ok(handle)
    }

    fn lookup_symbol(&mut self, name: &str) -> Option<Symbol> {
        match self.resolve(name)? {
            Callee::Defined(unit, index) => Some(Symbol { unit, index }),
            Callee::Builtin(_) => None,
        }
    }

    fn invoke(&mut self, symbol: &Symbol) -> Result<f64> {
        let unit = Rc::clone(&symbol.unit);
        let f = &unit.functions()[symbol.index];
        if f.arity() != 0 {
            return Err(Error::backend(format!(
                "'{}' expects {} arguments",
                f.name,
                f.arity()
            )));
        }
        self.exec(f, &[], 0)
    }

    fn release(&mut self, handle: UnitHandle) -> Result<()> {
        let pos = self
            .units
            .iter()
            .position(|(h, _)| *h == handle)
            .ok_or_else(|| Error::backend(format!("unknown unit {:?}", handle)))?;
        self.units.remove(pos);
        debug!(?handle, "released unit");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::super::ast::Prototype;
    use super::super::codegen::CodeGen;
    use super::super::error::ErrorKind;
    use super::super::lexer::Lexer;
    use super::super::parser::Parser;
    use super::super::registry::PrototypeRegistry;
    use super::super::runtime::SharedBuffer;
    use super::*;

    fn unit(registry: &mut PrototypeRegistry, defs: &[&str]) -> Module {
        let mut m = Module::new("test");
        for src in defs {
            let mut p = Parser::new(Lexer::new(src.as_bytes())).unwrap();
            let func = match p.current() {
                super::super::token::Token::Def => p.definition().unwrap(),
                _ => p.toplevel().unwrap(),
            };
            CodeGen::new(&mut m, registry).codegen_func(&func).unwrap();
        }
        m
    }

    fn run(interp: &mut Interpreter<SharedBuffer>, name: &str) -> Result<f64> {
        let sym = interp.lookup_symbol(name).unwrap();
        interp.invoke(&sym)
    }

    #[test]
    fn test_evaluates_expression() {
        let mut r = PrototypeRegistry::new();
        let mut i = Interpreter::with_output(SharedBuffer::default(), 100);
        i.submit(unit(&mut r, &["8 - 4 - 2"])).unwrap();
        assert_eq!(run(&mut i, "__anon_expr").unwrap(), 2.0);
    }

    #[test]
    fn test_recursion_across_units() {
        let mut r = PrototypeRegistry::new();
        let mut i = Interpreter::with_output(SharedBuffer::default(), 100);
        i.submit(unit(
            &mut r,
            &["def fib(x) if x < 3 then 1 else fib(x - 1) + fib(x - 2)"],
        ))
        .unwrap();
        i.submit(unit(&mut r, &["fib(10)"])).unwrap();
        assert_eq!(run(&mut i, "__anon_expr").unwrap(), 55.0);
    }

    #[test]
    fn test_runtime_output() {
        let mut r = PrototypeRegistry::new();
        r.insert(Prototype::new("putchard", vec!["c".to_owned()]));
        let out = SharedBuffer::default();
        let mut i = Interpreter::with_output(out.clone(), 100);
        i.submit(unit(&mut r, &["putchard(79) + putchard(75)"]))
            .unwrap();
        assert_eq!(run(&mut i, "__anon_expr").unwrap(), 0.0);
        assert_eq!(out.contents(), "OK");
    }

    #[test]
    fn test_newest_definition_wins_and_release_uncovers_older() {
        let mut r = PrototypeRegistry::new();
        let mut i = Interpreter::with_output(SharedBuffer::default(), 100);
        i.submit(unit(&mut r, &["def k() 1"])).unwrap();
        let newer = i.submit(unit(&mut r, &["def k() 2"])).unwrap();
        assert_eq!(run(&mut i, "k").unwrap(), 2.0);
        i.release(newer).unwrap();
        assert_eq!(run(&mut i, "k").unwrap(), 1.0);
        assert!(i.release(newer).is_err());
    }

    #[test]
    fn test_unresolved_extern_fails_at_call_time() {
        let mut r = PrototypeRegistry::new();
        r.insert(Prototype::new("g", vec!["x".to_owned()]));
        let mut i = Interpreter::with_output(SharedBuffer::default(), 100);
        i.submit(unit(&mut r, &["def h(x) g(x)"])).unwrap();
        i.submit(unit(&mut r, &["h(1)"])).unwrap();
        let err = run(&mut i, "__anon_expr").unwrap_err();
        assert_eq!(
            err.kind(),
            &ErrorKind::Backend("unresolved symbol 'g'".to_owned())
        );
    }

    #[test]
    fn test_call_depth_limit() {
        let mut r = PrototypeRegistry::new();
        let mut i = Interpreter::with_output(SharedBuffer::default(), 20);
        i.submit(unit(&mut r, &["def spin(x) spin(x + 1)"])).unwrap();
        i.submit(unit(&mut r, &["spin(0)"])).unwrap();
        let err = run(&mut i, "__anon_expr").unwrap_err();
        assert!(err.to_string().contains("call depth limit of 20 exceeded"));
    }

    #[test]
    fn test_builtins_are_not_invocable_symbols() {
        let mut i = Interpreter::with_output(SharedBuffer::default(), 10);
        assert!(i.lookup_symbol("printd").is_none());
        assert!(i.lookup_symbol("missing").is_none());
    }
}
