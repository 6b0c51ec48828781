//! Native backend: units are translated to LLVM modules and run by MCJIT.

use super::backend::{Backend, UnitHandle};
use super::error::{Error, Result};
use super::ir::{self, Inst, InstId, Predicate, Terminator, Value};
use super::runtime::{self, native};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::mem;
use std::os::raw::{c_char, c_void};
use std::ptr::null_mut;
use tracing::debug;

use llvm_sys::analysis::{LLVMVerifierFailureAction, LLVMVerifyModule};
use llvm_sys::execution_engine::{self as ee, LLVMExecutionEngineRef, LLVMMCJITCompilerOptions};
use llvm_sys::prelude::*;
use llvm_sys::{core, support, target, target_machine, LLVMRealPredicate};

pub(crate) type Symbol = extern "C" fn() -> f64;

pub(crate) struct LlvmJit {
    context: LLVMContextRef,
    engine: LLVMExecutionEngineRef,
    units: HashMap<UnitHandle, LLVMModuleRef>,
    next_handle: u64,
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::backend(format!("name '{}' contains a NUL byte", s)))
}

// Takes ownership of a message LLVM allocated.
unsafe fn take_message(msg: *mut c_char) -> String {
    if msg.is_null() {
        return String::new();
    }
    let s = CStr::from_ptr(msg).to_string_lossy().into_owned();
    core::LLVMDisposeMessage(msg);
    s
}

impl LlvmJit {
    pub(crate) fn new(module_name: &str) -> Result<Self> {
        unsafe {
            ee::LLVMLinkInMCJIT();
            if target::LLVM_InitializeNativeTarget() != 0
                || target::LLVM_InitializeNativeAsmPrinter() != 0
            {
                return Err(Error::backend("failed to initialize the native target"));
            }

            let putchard = cstring(runtime::PUTCHARD)?;
            let printd = cstring(runtime::PRINTD)?;
            support::LLVMAddSymbol(
                putchard.as_ptr(),
                native::putchard as usize as *mut c_void,
            );
            support::LLVMAddSymbol(printd.as_ptr(), native::printd as usize as *mut c_void);

            let context = core::LLVMContextCreate();
            let name = cstring(module_name)?;
            let root = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), context);

            let mut options: LLVMMCJITCompilerOptions = mem::zeroed();
            ee::LLVMInitializeMCJITCompilerOptions(
                &mut options,
                mem::size_of::<LLVMMCJITCompilerOptions>(),
            );
            let mut engine = null_mut();
            let mut err = null_mut();
            if ee::LLVMCreateMCJITCompilerForModule(
                &mut engine,
                root,
                &mut options,
                mem::size_of::<LLVMMCJITCompilerOptions>(),
                &mut err,
            ) != 0
            {
                let msg = take_message(err);
                core::LLVMContextDispose(context);
                return Err(Error::backend(format!("failed to create MCJIT: {}", msg)));
            }

            Ok(LlvmJit {
                context,
                engine,
                units: HashMap::new(),
                next_handle: 0,
            })
        }
    }

    unsafe fn emit_module(&self, unit: &ir::Module) -> Result<LLVMModuleRef> {
        let name = cstring(&unit.name)?;
        let module = core::LLVMModuleCreateWithNameInContext(name.as_ptr(), self.context);
        let td = ee::LLVMGetExecutionEngineTargetData(self.engine);
        let layout = target::LLVMCopyStringRepOfTargetData(td);
        core::LLVMSetDataLayout(module, layout);
        core::LLVMDisposeMessage(layout);
        let triple = target_machine::LLVMGetDefaultTargetTriple();
        core::LLVMSetTarget(module, triple);
        core::LLVMDisposeMessage(triple);

        let double = core::LLVMDoubleTypeInContext(self.context);

        let mut functions = HashMap::new();
        for f in unit.functions() {
            let mut params = vec![double; f.arity()];
            let ty = core::LLVMFunctionType(double, params.as_mut_ptr(), params.len() as u32, 0);
            let fname = cstring(&f.name)?;
            let fv = core::LLVMAddFunction(module, fname.as_ptr(), ty);
            for (i, p) in f.params.iter().enumerate() {
                core::LLVMSetValueName2(
                    core::LLVMGetParam(fv, i as u32),
                    p.as_ptr() as *const c_char,
                    p.len(),
                );
            }
            functions.insert(f.name.as_str(), fv);
        }

        let builder = core::LLVMCreateBuilderInContext(self.context);
        let result = unit
            .functions()
            .iter()
            .filter(|f| !f.is_declaration())
            .try_for_each(|f| self.emit_body(builder, double, &functions, f));
        core::LLVMDisposeBuilder(builder);
        if let Err(e) = result {
            core::LLVMDisposeModule(module);
            return Err(e);
        }

        let mut err = null_mut();
        if LLVMVerifyModule(
            module,
            LLVMVerifierFailureAction::LLVMReturnStatusAction,
            &mut err,
        ) != 0
        {
            let msg = take_message(err);
            core::LLVMDisposeModule(module);
            return Err(Error::backend(format!("invalid module '{}': {}", unit.name, msg)));
        }
        take_message(err);
        Ok(module)
    }

    unsafe fn emit_body(
        &self,
        builder: LLVMBuilderRef,
        double: LLVMTypeRef,
        functions: &HashMap<&str, LLVMValueRef>,
        f: &ir::Function,
    ) -> Result<()> {
        let fv = functions[f.name.as_str()];

        let mut blocks = HashMap::new();
        for &bb in f.layout() {
            let label = cstring(&f.block(bb).label)?;
            let b = core::LLVMAppendBasicBlockInContext(self.context, fv, label.as_ptr());
            blocks.insert(bb, b);
        }

        let mut values: HashMap<InstId, LLVMValueRef> = HashMap::new();
        let mut phis = Vec::new();
        let value = |values: &HashMap<InstId, LLVMValueRef>, v: Value| -> Result<LLVMValueRef> {
            match v {
                Value::Const(n) => Ok(core::LLVMConstReal(double, n)),
                Value::Param(i) => Ok(core::LLVMGetParam(fv, i as u32)),
                Value::Inst(id) => values
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::backend(format!("use before definition in '{}'", f.name))),
            }
        };

        for &bb in f.layout() {
            core::LLVMPositionBuilderAtEnd(builder, blocks[&bb]);
            let block = f.block(bb);
            for &id in &block.insts {
                let inst = f.inst(id);
                let name = cstring(&inst.name)?;
                let name = name.as_ptr();
                let v = match &inst.kind {
                    Inst::FAdd(l, r) => core::LLVMBuildFAdd(
                        builder,
                        value(&values, *l)?,
                        value(&values, *r)?,
                        name,
                    ),
                    Inst::FSub(l, r) => core::LLVMBuildFSub(
                        builder,
                        value(&values, *l)?,
                        value(&values, *r)?,
                        name,
                    ),
                    Inst::FMul(l, r) => core::LLVMBuildFMul(
                        builder,
                        value(&values, *l)?,
                        value(&values, *r)?,
                        name,
                    ),
                    Inst::FCmp(pred, l, r) => {
                        let pred = match pred {
                            Predicate::Ult => LLVMRealPredicate::LLVMRealULT,
                            Predicate::One => LLVMRealPredicate::LLVMRealONE,
                        };
                        core::LLVMBuildFCmp(
                            builder,
                            pred,
                            value(&values, *l)?,
                            value(&values, *r)?,
                            name,
                        )
                    }
                    Inst::UIToFP(v) => {
                        core::LLVMBuildUIToFP(builder, value(&values, *v)?, double, name)
                    }
                    Inst::Call { callee, args } => {
                        let callee = *functions.get(callee.as_str()).ok_or_else(|| {
                            Error::backend(format!("'{}' is not declared in the unit", callee))
                        })?;
                        let mut args = args
                            .iter()
                            .map(|a| value(&values, *a))
                            .collect::<Result<Vec<_>>>()?;
                        core::LLVMBuildCall(
                            builder,
                            callee,
                            args.as_mut_ptr(),
                            args.len() as u32,
                            name,
                        )
                    }
                    Inst::Phi(_) => {
                        let phi = core::LLVMBuildPhi(builder, double, name);
                        phis.push(id);
                        phi
                    }
                };
                values.insert(id, v);
            }

            match &block.terminator {
                Some(Terminator::Br(target)) => {
                    core::LLVMBuildBr(builder, blocks[target]);
                }
                Some(Terminator::CondBr {
                    cond,
                    then_block,
                    else_block,
                }) => {
                    core::LLVMBuildCondBr(
                        builder,
                        value(&values, *cond)?,
                        blocks[then_block],
                        blocks[else_block],
                    );
                }
                Some(Terminator::Ret(v)) => {
                    core::LLVMBuildRet(builder, value(&values, *v)?);
                }
                None => {
                    return Err(Error::backend(format!(
                        "block '{}' of '{}' has no terminator",
                        block.label, f.name
                    )))
                }
            }
        }

        // Incoming values may be defined after the phi (loop back edges).
        for id in phis {
            if let Inst::Phi(edges) = &f.inst(id).kind {
                for (v, from) in edges {
                    let mut v = value(&values, *v)?;
                    let mut from = blocks[from];
                    core::LLVMAddIncoming(values[&id], &mut v, &mut from, 1);
                }
            }
        }
        Ok(())
    }
}

impl Backend for LlvmJit {
    type Symbol = Symbol;

    fn submit(&mut self, unit: ir::Module) -> Result<UnitHandle> {
        let module = unsafe { self.emit_module(&unit)? };
        unsafe { ee::LLVMAddModule(self.engine, module) };
        let handle = UnitHandle::new(self.next_handle);
        self.next_handle += 1;
        self.units.insert(handle, module);
        debug!(?handle, unit = %unit.name, "added module to MCJIT");
        Ok(handle)
    }

    fn lookup_symbol(&mut self, name: &str) -> Option<Symbol> {
        let name = cstring(name).ok()?;
        let addr = unsafe { ee::LLVMGetFunctionAddress(self.engine, name.as_ptr()) };
        if addr == 0 {
            None
        } else {
            Some(unsafe { mem::transmute::<usize, Symbol>(addr as usize) })
        }
    }

    fn invoke(&mut self, symbol: &Symbol) -> Result<f64> {
        Ok(symbol())
    }

    fn release(&mut self, handle: UnitHandle) -> Result<()> {
        let module = self
            .units
            .remove(&handle)
            .ok_or_else(|| Error::backend(format!("unknown unit {:?}", handle)))?;
        unsafe {
            let mut out = null_mut();
            let mut err = null_mut();
            if ee::LLVMRemoveModule(self.engine, module, &mut out, &mut err) != 0 {
                return Err(Error::backend(format!(
                    "failed to remove module: {}",
                    take_message(err)
                )));
            }
            core::LLVMDisposeModule(out);
        }
        debug!(?handle, "removed module from MCJIT");
        Ok(())
    }
}

impl Drop for LlvmJit {
    fn drop(&mut self) {
        unsafe {
            // The engine owns every module still added to it.
            ee::LLVMDisposeExecutionEngine(self.engine);
            core::LLVMContextDispose(self.context);
        }
    }
}
