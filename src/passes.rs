//! Per-function cleanup run on freshly lowered definitions.

use super::ir::{Function, Inst, InstId, Terminator, Value};
use std::collections::{HashMap, HashSet};
use tracing::trace;

#[derive(Debug, Clone, Copy)]
enum Known {
    Float(f64),
    Bool(bool),
}

pub(crate) fn optimize(f: &mut Function) {
    let folded = fold_constants(f);
    let removed = eliminate_dead_code(f);
    trace!(function = %f.name, folded, removed, "optimized");
}

fn resolve(known: &HashMap<InstId, Known>, v: Value) -> Value {
    match v {
        Value::Inst(id) => match known.get(&id) {
            Some(Known::Float(n)) => Value::Const(*n),
            _ => v,
        },
        _ => v,
    }
}

fn fold(known: &HashMap<InstId, Known>, inst: &Inst) -> Option<Known> {
    match inst {
        Inst::FAdd(Value::Const(l), Value::Const(r)) => Some(Known::Float(l + r)),
        Inst::FSub(Value::Const(l), Value::Const(r)) => Some(Known::Float(l - r)),
        Inst::FMul(Value::Const(l), Value::Const(r)) => Some(Known::Float(l * r)),
        Inst::FCmp(pred, Value::Const(l), Value::Const(r)) => Some(Known::Bool(pred.eval(*l, *r))),
        Inst::UIToFP(Value::Inst(cmp)) => match known.get(cmp) {
            Some(Known::Bool(b)) => Some(Known::Float(if *b { 1.0 } else { 0.0 })),
            _ => None,
        },
        Inst::Phi(incoming) => {
            let first = match incoming.first() {
                Some((Value::Const(n), _)) => *n,
                _ => return None,
            };
            let same = incoming.iter().all(|(v, _)| match v {
                Value::Const(n) => n.to_bits() == first.to_bits(),
                _ => false,
            });
            if same {
                Some(Known::Float(first))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Folds arithmetic, comparisons, widening and single-valued phis whose
/// operands are constants, rewriting their uses. Returns the fold count.
fn fold_constants(f: &mut Function) -> usize {
    let mut known = HashMap::new();
    let layout = f.layout().to_vec();

    for &bb in &layout {
        let insts = f.block(bb).insts.clone();
        for id in insts {
            f.inst_mut(id).kind.map_operands(|v| resolve(&known, v));
            if let Some(k) = fold(&known, &f.inst(id).kind) {
                known.insert(id, k);
            }
        }
    }

    // Phis can name values defined further down the layout (loop back
    // edges), so uses are rewritten once more after everything is known.
    for &bb in &layout {
        let insts = f.block(bb).insts.clone();
        for id in insts {
            f.inst_mut(id).kind.map_operands(|v| resolve(&known, v));
        }
        if let Some(t) = f.block_mut(bb).terminator.as_mut() {
            t.map_operands(|v| resolve(&known, v));
        }
    }

    known.len()
}

/// Drops instructions nothing uses. Calls always stay.
fn eliminate_dead_code(f: &mut Function) -> usize {
    let layout = f.layout().to_vec();
    let mut removed = 0;
    loop {
        let mut used = HashSet::new();
        for &bb in &layout {
            let block = f.block(bb);
            for &id in &block.insts {
                for v in f.inst(id).kind.operands() {
                    if let Value::Inst(u) = v {
                        used.insert(u);
                    }
                }
            }
            if let Some(Value::Inst(u)) = block.terminator.as_ref().and_then(Terminator::operand) {
                used.insert(u);
            }
        }

        let mut changed = false;
        for &bb in &layout {
            let live: Vec<InstId> = f
                .block(bb)
                .insts
                .iter()
                .cloned()
                .filter(|id| match f.inst(*id).kind {
                    Inst::Call { .. } => true,
                    _ => used.contains(id),
                })
                .collect();
            let before = f.block(bb).insts.len();
            if live.len() != before {
                removed += before - live.len();
                changed = true;
                f.block_mut(bb).insts = live;
            }
        }

        if !changed {
            return removed;
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::ast::Prototype;
    use super::super::codegen::CodeGen;
    use super::super::ir::Module;
    use super::super::lexer::Lexer;
    use super::super::parser::Parser;
    use super::super::registry::PrototypeRegistry;

    fn optimized(src: &str) -> String {
        let def = Parser::new(Lexer::new(src.as_bytes()))
            .unwrap()
            .definition()
            .unwrap();
        let mut m = Module::new("test");
        let mut r = PrototypeRegistry::new();
        r.insert(Prototype::new("printd", vec!["x".to_owned()]));
        CodeGen::new(&mut m, &mut r)
            .optimize(true)
            .codegen_func(&def)
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_folds_arithmetic() {
        assert_eq!(
            optimized("def f() 1 + 2 * 3"),
            "define double @f() {\nentry:\n  ret double 7.000000e+00\n}\n"
        );
    }

    #[test]
    fn test_folds_comparison_through_widening() {
        let f = optimized("def f(x) (1 < 2) + x");
        assert!(f.contains("%addtmp = fadd double 1.000000e+00, %x"));
        assert!(!f.contains("fcmp"));
        assert!(!f.contains("uitofp"));
    }

    #[test]
    fn test_keeps_calls() {
        let f = optimized("def g(x) printd(1 + 1)");
        assert!(f.contains("%calltmp = call double @printd(double 2.000000e+00)"));
        assert!(f.contains("ret double %calltmp"));
    }

    #[test]
    fn test_folds_uniform_phi() {
        let f = optimized("def f(x) if x then 5 else 5");
        assert!(f.contains("ret double 5.000000e+00"));
        assert!(!f.contains("phi"));
        // the branch itself depends on x and survives
        assert!(f.contains("%ifcond = fcmp one double %x, 0.000000e+00"));
    }

    #[test]
    fn test_leaves_loop_phi_alone() {
        let f = optimized("def f(n) for i = 1, i < n in printd(i)");
        assert!(f.contains("%i = phi double [ 1.000000e+00, %entry ], [ %nextvar, %loop ]"));
    }
}
