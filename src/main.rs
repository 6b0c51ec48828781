mod ast;
mod backend;
mod codegen;
mod config;
mod error;
mod interpreter;
mod ir;
mod lexer;
#[cfg(feature = "llvm")]
mod llvm;
mod parser;
mod passes;
mod registry;
mod runtime;
mod token;
mod toplevel;

use config::Config;
use lexer::Lexer;
use std::io::{stderr, stdin};
use std::process;
use toplevel::Session;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(stderr)
        .init();
}

#[cfg(not(feature = "llvm"))]
fn run(config: Config) -> error::Result<()> {
    let backend = interpreter::Interpreter::new(config.max_call_depth);
    info!("using the interpreter backend");
    let stdin = stdin();
    Session::new(backend, config, Box::new(stderr())).run(Lexer::new(stdin.lock()))
}

#[cfg(feature = "llvm")]
fn run(config: Config) -> error::Result<()> {
    let backend = llvm::LlvmJit::new(&config.module_name)?;
    info!("using the MCJIT backend");
    let stdin = stdin();
    Session::new(backend, config, Box::new(stderr())).run(Lexer::new(stdin.lock()))
}

fn main() {
    init_logging();
    let config = Config::from_env();
    if let Err(e) = run(config) {
        tracing::error!(error = %e, "session aborted");
        eprintln!("error: {}", e);
        process::exit(1);
    }
}
