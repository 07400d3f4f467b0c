use clap::Parser;
use luavm::lua_value::Constant;
use luavm::lua_value::chunk_serializer::is_binary_chunk;
use luavm::lua_vm::OpMode;
use luavm::{Chunk, LuaVM, SafeOption};
use std::process::ExitCode;

#[derive(Parser)]
#[command(version, about = "List the bytecode of a Lua chunk", long_about = None)]
struct Options {
    /// Source file or binary chunk
    input: String,

    /// Write the compiled chunk to this file
    #[arg(short, long)]
    output: Option<String>,

    /// Drop debug information from the written chunk
    #[arg(long)]
    strip: bool,

    /// Only write the chunk, skip the listing
    #[arg(short, long)]
    quiet: bool,
}

fn main() -> ExitCode {
    let options = Options::parse();

    let bytes = match std::fs::read(&options.input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("bytecode_dump: cannot open {}: {e}", options.input);
            return ExitCode::FAILURE;
        }
    };

    let vm = LuaVM::new(SafeOption::default());
    let loaded = if is_binary_chunk(&bytes) {
        vm.undump(&bytes)
    } else {
        vm.compile_bytes(&bytes, &format!("@{}", options.input))
    };
    let chunk = match loaded {
        Ok(chunk) => chunk,
        Err(e) => {
            eprintln!("bytecode_dump: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !options.quiet {
        list_chunk(&chunk, "main", 0);
    }

    if let Some(path) = &options.output {
        let dumped = vm.dump(&chunk, options.strip);
        if let Err(e) = std::fs::write(path, &dumped) {
            eprintln!("bytecode_dump: cannot write {path}: {e}");
            return ExitCode::FAILURE;
        }
        tracing::debug!(path = %path, bytes = dumped.len(), "chunk written");
    }

    ExitCode::SUCCESS
}

fn list_chunk(chunk: &Chunk, name: &str, depth: usize) {
    let indent = "  ".repeat(depth);

    println!(
        "{indent}{name} <{}:{},{}> ({} instructions)",
        chunk.source_name.as_deref().unwrap_or("?"),
        chunk.linedefined,
        chunk.lastlinedefined,
        chunk.code.len()
    );
    println!(
        "{indent}{} params, {} slots, {} upvalues, {} locals, {} constants, {} functions{}",
        chunk.param_count,
        chunk.max_stack_size,
        chunk.upvalue_descs.len(),
        chunk.locals.len(),
        chunk.constants.len(),
        chunk.child_protos.len(),
        if chunk.is_vararg { ", vararg" } else { "" }
    );

    for (pc, &instr) in chunk.code.iter().enumerate() {
        let op = instr.get_opcode();
        let operands = match op.get_mode() {
            OpMode::IABC => {
                let k = if instr.get_k() { "k" } else { "" };
                format!("{} {} {}{k}", instr.get_a(), instr.get_b(), instr.get_c())
            }
            OpMode::IABx => format!("{} {}", instr.get_a(), instr.get_bx()),
            OpMode::IAsBx => format!("{} {}", instr.get_a(), instr.get_sbx()),
            OpMode::IAx => format!("{}", instr.get_ax()),
            OpMode::IsJ => format!("{}", instr.get_sj()),
        };
        let line = chunk
            .line_at(pc)
            .map(|l| format!("[{l}]"))
            .unwrap_or_else(|| "[-]".to_string());
        println!("{indent}  {:<5} {line:<6} {:<10} {operands}", pc + 1, op.name());
    }

    if !chunk.constants.is_empty() {
        println!("{indent}constants ({}):", chunk.constants.len());
        for (i, k) in chunk.constants.iter().enumerate() {
            println!("{indent}  {i:<5} {}", describe_constant(k));
        }
    }

    if !chunk.upvalue_descs.is_empty() {
        println!("{indent}upvalues ({}):", chunk.upvalue_descs.len());
        for (i, up) in chunk.upvalue_descs.iter().enumerate() {
            println!(
                "{indent}  {i:<5} {:<10} {} {}",
                up.name,
                if up.in_stack { "stack" } else { "upvalue" },
                up.index
            );
        }
    }

    for (i, child) in chunk.child_protos.iter().enumerate() {
        println!();
        list_chunk(child, &format!("function {i}"), depth + 1);
    }
}

fn describe_constant(k: &Constant) -> String {
    match k {
        Constant::Nil => "nil".to_string(),
        Constant::Boolean(b) => b.to_string(),
        Constant::Integer(i) => i.to_string(),
        Constant::Float(f) => luavm::lua_value::fmt_float(*f),
        Constant::String(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
    }
}
