//! SSA intermediate form produced by lowering and consumed by the backends.
//!
//! Every value is a 64-bit float except the results of `fcmp`, which are
//! one-bit booleans and only feed `uitofp` and conditional branches.

use super::ast::Prototype;
use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct InstId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct BlockId(usize);

impl InstId {
    pub(crate) fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum Value {
    Const(f64),
    Param(usize),
    Inst(InstId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Predicate {
    /// unordered or less than
    Ult,
    /// ordered and not equal
    One,
}

impl Predicate {
    pub(crate) fn eval(self, l: f64, r: f64) -> bool {
        match self {
            Predicate::Ult => l.is_nan() || r.is_nan() || l < r,
            Predicate::One => !l.is_nan() && !r.is_nan() && l != r,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Inst {
    FAdd(Value, Value),
    FSub(Value, Value),
    FMul(Value, Value),
    FCmp(Predicate, Value, Value),
    UIToFP(Value),
    Call { callee: String, args: Vec<Value> },
    Phi(Vec<(Value, BlockId)>),
}

impl Inst {
    pub(crate) fn operands(&self) -> Vec<Value> {
        match self {
            Inst::FAdd(l, r) | Inst::FSub(l, r) | Inst::FMul(l, r) | Inst::FCmp(_, l, r) => {
                vec![*l, *r]
            }
            Inst::UIToFP(v) => vec![*v],
            Inst::Call { args, .. } => args.clone(),
            Inst::Phi(incoming) => incoming.iter().map(|(v, _)| *v).collect(),
        }
    }

    pub(crate) fn map_operands<F: FnMut(Value) -> Value>(&mut self, mut f: F) {
        match self {
            Inst::FAdd(l, r) | Inst::FSub(l, r) | Inst::FMul(l, r) | Inst::FCmp(_, l, r) => {
                *l = f(*l);
                *r = f(*r);
            }
            Inst::UIToFP(v) => *v = f(*v),
            Inst::Call { args, .. } => args.iter_mut().for_each(|a| *a = f(*a)),
            Inst::Phi(incoming) => incoming.iter_mut().for_each(|(v, _)| *v = f(*v)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Terminator {
    Br(BlockId),
    CondBr {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
    Ret(Value),
}

impl Terminator {
    pub(crate) fn map_operands<F: FnMut(Value) -> Value>(&mut self, mut f: F) {
        match self {
            Terminator::Br(_) => {}
            Terminator::CondBr { cond, .. } => *cond = f(*cond),
            Terminator::Ret(v) => *v = f(*v),
        }
    }

    pub(crate) fn operand(&self) -> Option<Value> {
        match self {
            Terminator::Br(_) => None,
            Terminator::CondBr { cond, .. } => Some(*cond),
            Terminator::Ret(v) => Some(*v),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Instruction {
    pub(crate) name: String,
    pub(crate) kind: Inst,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Block {
    pub(crate) label: String,
    pub(crate) insts: Vec<InstId>,
    pub(crate) terminator: Option<Terminator>,
}

/// A function; without blocks it is only a declaration.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Function {
    pub(crate) name: String,
    pub(crate) params: Vec<String>,
    insts: Vec<Instruction>,
    blocks: Vec<Block>,
    layout: Vec<BlockId>,
    names: HashMap<String, usize>,
    used: HashSet<String>,
}

impl Function {
    pub(crate) fn declare(proto: &Prototype) -> Self {
        let mut f = Function {
            name: proto.name.clone(),
            params: Vec::with_capacity(proto.arity()),
            insts: Vec::new(),
            blocks: Vec::new(),
            layout: Vec::new(),
            names: HashMap::new(),
            used: HashSet::new(),
        };
        for p in &proto.params {
            let name = f.unique_name(p);
            f.params.push(name);
        }
        f
    }

    pub(crate) fn arity(&self) -> usize {
        self.params.len()
    }

    pub(crate) fn is_declaration(&self) -> bool {
        self.layout.is_empty()
    }

    // LLVM style: the first `x` stays `x`, later ones become `x1`, `x2`, ...
    fn unique_name(&mut self, base: &str) -> String {
        loop {
            let count = self.names.entry(base.to_owned()).or_insert(0);
            let name = if *count == 0 {
                base.to_owned()
            } else {
                format!("{}{}", base, count)
            };
            *count += 1;
            if self.used.insert(name.clone()) {
                return name;
            }
        }
    }

    /// Creates a block that is not yet part of the layout.
    pub(crate) fn create_block(&mut self, label: &str) -> BlockId {
        let label = self.unique_name(label);
        self.blocks.push(Block {
            label,
            insts: Vec::new(),
            terminator: None,
        });
        BlockId(self.blocks.len() - 1)
    }

    pub(crate) fn attach_block(&mut self, block: BlockId) {
        debug_assert!(!self.layout.contains(&block));
        self.layout.push(block);
    }

    pub(crate) fn append_block(&mut self, label: &str) -> BlockId {
        let block = self.create_block(label);
        self.attach_block(block);
        block
    }

    pub(crate) fn push(&mut self, block: BlockId, name: &str, kind: Inst) -> Value {
        let name = self.unique_name(name);
        let id = InstId(self.insts.len());
        self.insts.push(Instruction { name, kind });
        self.blocks[block.0].insts.push(id);
        Value::Inst(id)
    }

    /// Adds an incoming edge to the phi behind `phi`.
    pub(crate) fn add_incoming(&mut self, phi: Value, value: Value, from: BlockId) {
        if let Value::Inst(id) = phi {
            if let Inst::Phi(incoming) = &mut self.insts[id.0].kind {
                incoming.push((value, from));
            }
        }
    }

    pub(crate) fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        debug_assert!(self.blocks[block.0].terminator.is_none());
        self.blocks[block.0].terminator = Some(terminator);
    }

    pub(crate) fn entry(&self) -> Option<BlockId> {
        self.layout.first().cloned()
    }

    pub(crate) fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0]
    }

    pub(crate) fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0]
    }

    /// Block ids in layout order.
    pub(crate) fn layout(&self) -> &[BlockId] {
        &self.layout
    }

    pub(crate) fn inst(&self, id: InstId) -> &Instruction {
        &self.insts[id.0]
    }

    pub(crate) fn inst_mut(&mut self, id: InstId) -> &mut Instruction {
        &mut self.insts[id.0]
    }

    pub(crate) fn inst_count(&self) -> usize {
        self.insts.len()
    }

    fn fmt_value(&self, v: Value) -> String {
        match v {
            Value::Const(n) => fmt_float(n),
            Value::Param(i) => format!("%{}", self.params[i]),
            Value::Inst(id) => format!("%{}", self.insts[id.0].name),
        }
    }

    fn fmt_signature(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "double @{}(", self.name)?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "double %{}", p)?;
        }
        f.write_str(")")
    }
}

/// Formats a float constant the way LLVM assembly does, e.g. `1.000000e+00`.
pub(crate) fn fmt_float(n: f64) -> String {
    let s = format!("{:.6e}", n);
    match s.find('e') {
        Some(pos) => {
            let exp: i32 = s[pos + 1..].parse().unwrap_or(0);
            format!("{}e{:+03}", &s[..pos], exp)
        }
        None => s,
    }
}

impl fmt::Display for Function {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_declaration() {
            f.write_str("declare ")?;
            self.fmt_signature(f)?;
            return writeln!(f);
        }

        f.write_str("define ")?;
        self.fmt_signature(f)?;
        writeln!(f, " {{")?;
        for (n, &b) in self.layout.iter().enumerate() {
            let block = &self.blocks[b.0];
            if n > 0 {
                writeln!(f)?;
            }
            writeln!(f, "{}:", block.label)?;
            for &id in &block.insts {
                let inst = &self.insts[id.0];
                write!(f, "  %{} = ", inst.name)?;
                match &inst.kind {
                    Inst::FAdd(l, r) => {
                        write!(f, "fadd double {}, {}", self.fmt_value(*l), self.fmt_value(*r))?
                    }
                    Inst::FSub(l, r) => {
                        write!(f, "fsub double {}, {}", self.fmt_value(*l), self.fmt_value(*r))?
                    }
                    Inst::FMul(l, r) => {
                        write!(f, "fmul double {}, {}", self.fmt_value(*l), self.fmt_value(*r))?
                    }
                    Inst::FCmp(pred, l, r) => {
                        let pred = match pred {
                            Predicate::Ult => "ult",
                            Predicate::One => "one",
                        };
                        write!(
                            f,
                            "fcmp {} double {}, {}",
                            pred,
                            self.fmt_value(*l),
                            self.fmt_value(*r)
                        )?
                    }
                    Inst::UIToFP(v) => write!(f, "uitofp i1 {} to double", self.fmt_value(*v))?,
                    Inst::Call { callee, args } => {
                        write!(f, "call double @{}(", callee)?;
                        for (i, a) in args.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "double {}", self.fmt_value(*a))?;
                        }
                        f.write_str(")")?
                    }
                    Inst::Phi(incoming) => {
                        f.write_str("phi double ")?;
                        for (i, (v, from)) in incoming.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(
                                f,
                                "[ {}, %{} ]",
                                self.fmt_value(*v),
                                self.blocks[from.0].label
                            )?;
                        }
                    }
                }
                writeln!(f)?;
            }
            match &block.terminator {
                Some(Terminator::Br(t)) => writeln!(f, "  br label %{}", self.blocks[t.0].label)?,
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => writeln!(
                    f,
                    "  br i1 {}, label %{}, label %{}",
                    self.fmt_value(*cond),
                    self.blocks[then_block.0].label,
                    self.blocks[else_block.0].label
                )?,
                Some(Terminator::Ret(v)) => writeln!(f, "  ret double {}", self.fmt_value(*v))?,
                None => {}
            }
        }
        writeln!(f, "}}")
    }
}

/// One compilation unit.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Module {
    pub(crate) name: String,
    functions: Vec<Function>,
}

impl Module {
    pub(crate) fn new<S: Into<String>>(name: S) -> Self {
        Module {
            name: name.into(),
            functions: Vec::new(),
        }
    }

    pub(crate) fn functions(&self) -> &[Function] {
        &self.functions
    }

    pub(crate) fn get_function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    /// Adds `function`, replacing any function of the same name in place.
    pub(crate) fn add_function(&mut self, function: Function) -> &Function {
        let pos = match self.functions.iter().position(|f| f.name == function.name) {
            Some(pos) => {
                self.functions[pos] = function;
                pos
            }
            None => {
                self.functions.push(function);
                self.functions.len() - 1
            }
        };
        &self.functions[pos]
    }

    pub(crate) fn remove_function(&mut self, name: &str) -> Option<Function> {
        let pos = self.functions.iter().position(|f| f.name == name)?;
        Some(self.functions.remove(pos))
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name)?;
        for func in &self.functions {
            writeln!(f)?;
            write!(f, "{}", func)?;
        }
        Ok(())
    }
}
