use super::ast::{self, Expr, Prototype};
use super::error::{ErrorKind, Result};
use super::ir::{self, BlockId, Inst, Module, Predicate, Terminator, Value};
use super::passes;
use super::registry::PrototypeRegistry;
use std::collections::HashMap;
use tracing::{debug, trace};

/// Variable bindings of the function being lowered. Each name maps to a
/// stack so a loop variable can shadow an outer binding and be popped again.
#[derive(Debug, Default)]
struct Scope {
    bindings: HashMap<String, Vec<Value>>,
}

impl Scope {
    fn lookup(&self, name: &str) -> Option<Value> {
        self.bindings.get(name).and_then(|s| s.last().cloned())
    }

    fn push(&mut self, name: &str, value: Value) {
        self.bindings.entry(name.to_owned()).or_default().push(value);
    }

    fn pop(&mut self, name: &str) {
        if let Some(stack) = self.bindings.get_mut(name) {
            stack.pop();
            if stack.is_empty() {
                self.bindings.remove(name);
            }
        }
    }
}

struct FnBuilder {
    function: ir::Function,
    scope: Scope,
}

/// Lowers AST into the current compilation unit, resolving callees through
/// the unit first and the session's prototype registry second.
pub(crate) struct CodeGen<'a> {
    module: &'a mut Module,
    registry: &'a mut PrototypeRegistry,
    optimize: bool,
}

impl<'a> CodeGen<'a> {
    pub(crate) fn new(module: &'a mut Module, registry: &'a mut PrototypeRegistry) -> Self {
        CodeGen {
            module,
            registry,
            optimize: false,
        }
    }

    pub(crate) fn optimize(mut self, optimize: bool) -> Self {
        self.optimize = optimize;
        self
    }

    /// Arity of `name` as seen from the current unit, declaring it from the
    /// registry when the unit has not seen it yet.
    fn get_function(&mut self, name: &str) -> Option<usize> {
        if let Some(f) = self.module.get_function(name) {
            return Some(f.arity());
        }
        let proto = self.registry.get(name)?.clone();
        trace!(%name, "declaring function from registry");
        Some(self.codegen_proto(&proto).arity())
    }

    /// Declares `proto` in the current unit. A definition of the same name
    /// and arity already in the unit is kept as is.
    pub(crate) fn codegen_proto(&mut self, proto: &Prototype) -> &ir::Function {
        let defined = self.module.functions().iter().position(|f| {
            f.name == proto.name && !f.is_declaration() && f.arity() == proto.arity()
        });
        match defined {
            Some(pos) => &self.module.functions()[pos],
            None => self.module.add_function(ir::Function::declare(proto)),
        }
    }

    /// Lowers a whole definition. Either the finished function lands in the
    /// unit and its prototype in the registry, or neither changes.
    pub(crate) fn codegen_func(&mut self, func: &ast::Function) -> Result<&ir::Function> {
        let name = func.proto.name.clone();
        let previous_proto = self.registry.insert(func.proto.clone());
        let previous_fn = self.module.get_function(&name).cloned();
        self.module.add_function(ir::Function::declare(&func.proto));

        let mut b = FnBuilder {
            function: ir::Function::declare(&func.proto),
            scope: Scope::default(),
        };
        let entry = b.function.append_block("entry");
        for (i, param) in func.proto.params.iter().enumerate() {
            b.scope.push(param, Value::Param(i));
        }

        match self.codegen_expr(&mut b, &func.body, entry) {
            Ok((ret, last)) => {
                b.function.terminate(last, Terminator::Ret(ret));
                if self.optimize {
                    passes::optimize(&mut b.function);
                }
                Ok(self.module.add_function(b.function))
            }
            Err(e) => {
                debug!(%name, error = %e, "discarding partially lowered function");
                match previous_fn {
                    Some(f) => {
                        self.module.add_function(f);
                    }
                    None => {
                        self.module.remove_function(&name);
                    }
                }
                self.registry.restore(&name, previous_proto);
                Err(e)
            }
        }
    }

    /// Lowers `e` starting in `block`; returns its value and the block the
    /// code for it ends in, which differs from `block` after control flow.
    fn codegen_expr(
        &mut self,
        b: &mut FnBuilder,
        e: &Expr,
        block: BlockId,
    ) -> Result<(Value, BlockId)> {
        match e {
            Expr::Number(n) => Ok((Value::Const(*n), block)),
            Expr::Variable(name) => match b.scope.lookup(name) {
                Some(v) => Ok((v, block)),
                None => Err(ErrorKind::UnknownVariable(name.clone()).into()),
            },
            Expr::Binary(op, lhs, rhs) => {
                let (l, block) = self.codegen_expr(b, lhs, block)?;
                let (r, block) = self.codegen_expr(b, rhs, block)?;
                let f = &mut b.function;
                let v = match op {
                    '+' => f.push(block, "addtmp", Inst::FAdd(l, r)),
                    '-' => f.push(block, "subtmp", Inst::FSub(l, r)),
                    '*' => f.push(block, "multmp", Inst::FMul(l, r)),
                    '<' => {
                        let cmp = f.push(block, "cmptmp", Inst::FCmp(Predicate::Ult, l, r));
                        f.push(block, "booltmp", Inst::UIToFP(cmp))
                    }
                    _ => return Err(ErrorKind::InvalidOperator(*op).into()),
                };
                Ok((v, block))
            }
            Expr::Call(callee, args) => {
                let expected = self
                    .get_function(callee)
                    .ok_or_else(|| ErrorKind::UnknownFunction(callee.clone()))?;
                if expected != args.len() {
                    return Err(ErrorKind::Arity {
                        callee: callee.clone(),
                        expected,
                        found: args.len(),
                    }
                    .into());
                }

                let mut block = block;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    let (v, next) = self.codegen_expr(b, arg, block)?;
                    values.push(v);
                    block = next;
                }
                let call = Inst::Call {
                    callee: callee.clone(),
                    args: values,
                };
                Ok((b.function.push(block, "calltmp", call), block))
            }
            Expr::If(cond, then, els) => self.codegen_if(b, cond, then, els, block),
            Expr::For {
                var,
                start,
                end,
                step,
                body,
            } => {
                let (start, preheader) = self.codegen_expr(b, start, block)?;
                let loop_bb = b.function.append_block("loop");
                b.function.terminate(preheader, Terminator::Br(loop_bb));
                let variable = b
                    .function
                    .push(loop_bb, var, Inst::Phi(vec![(start, preheader)]));

                b.scope.push(var, variable);
                let after = self.codegen_loop(b, var, variable, loop_bb, end, step.as_deref(), body);
                b.scope.pop(var);

                Ok((Value::Const(0.0), after?))
            }
        }
    }

    fn codegen_if(
        &mut self,
        b: &mut FnBuilder,
        cond: &Expr,
        then: &Expr,
        els: &Expr,
        block: BlockId,
    ) -> Result<(Value, BlockId)> {
        let (cond, block) = self.codegen_expr(b, cond, block)?;
        let f = &mut b.function;
        let cond = f.push(
            block,
            "ifcond",
            Inst::FCmp(Predicate::One, cond, Value::Const(0.0)),
        );

        let then_bb = f.append_block("then");
        let else_bb = f.create_block("else");
        let merge_bb = f.create_block("ifcont");
        f.terminate(
            block,
            Terminator::CondBr {
                cond,
                then_block: then_bb,
                else_block: else_bb,
            },
        );

        let (then_v, then_end) = self.codegen_expr(b, then, then_bb)?;
        b.function.terminate(then_end, Terminator::Br(merge_bb));

        b.function.attach_block(else_bb);
        let (else_v, else_end) = self.codegen_expr(b, els, else_bb)?;
        b.function.terminate(else_end, Terminator::Br(merge_bb));

        b.function.attach_block(merge_bb);
        let phi = b.function.push(
            merge_bb,
            "iftmp",
            Inst::Phi(vec![(then_v, then_end), (else_v, else_end)]),
        );
        Ok((phi, merge_bb))
    }

    // loop:
    //   var = phi [start, preheader], [nextvar, loopend]
    //   body
    //   nextvar = var + step
    //   endcond = end            ; evaluated with var bound to nextvar
    //   br endcond, loop, afterloop
    #[allow(clippy::too_many_arguments)]
    fn codegen_loop(
        &mut self,
        b: &mut FnBuilder,
        var: &str,
        variable: Value,
        loop_bb: BlockId,
        end: &Expr,
        step: Option<&Expr>,
        body: &Expr,
    ) -> Result<BlockId> {
        let (_, body_end) = self.codegen_expr(b, body, loop_bb)?;

        let (step, step_end) = match step {
            Some(step) => self.codegen_expr(b, step, body_end)?,
            None => (Value::Const(1.0), body_end),
        };
        let next = b
            .function
            .push(step_end, "nextvar", Inst::FAdd(variable, step));

        b.scope.push(var, next);
        let end = self.codegen_expr(b, end, step_end);
        b.scope.pop(var);
        let (end, loop_end) = end?;

        let f = &mut b.function;
        let end_cond = f.push(
            loop_end,
            "loopcond",
            Inst::FCmp(Predicate::One, end, Value::Const(0.0)),
        );
        let after = f.append_block("afterloop");
        f.terminate(
            loop_end,
            Terminator::CondBr {
                cond: end_cond,
                then_block: loop_bb,
                else_block: after,
            },
        );
        f.add_incoming(variable, next, loop_end);
        Ok(after)
    }
}
