use clap::{Parser, ValueEnum};
use luavm::lua_value::chunk_serializer::is_binary_chunk;
use luavm::{GcModeOption, LuaError, LuaVM, LuaValue, SafeOption, Stdlib};
use std::io::Read;
use std::process::ExitCode;

const VERSION: &str = "Lua 5.4 (luavm)";

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GcModeArg {
    Incremental,
    Generational,
}

#[derive(Parser)]
#[command(version = VERSION, about, long_about = None)]
struct Options {
    /// Script to run; `-` reads from stdin. Text and binary chunks are accepted
    script: Option<String>,

    /// Arguments passed to the script as `...` and in the global `arg`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Execute string
    #[arg(short)]
    execute: Vec<String>,

    /// Collector mode
    #[arg(long, value_enum, default_value_t = GcModeArg::Incremental)]
    gc_mode: GcModeArg,

    /// Compile the script, then run it through a stripped dump/undump round
    #[arg(long)]
    strip: bool,
}

fn main() -> ExitCode {
    let options = Options::parse();

    let mut safe = SafeOption::default();
    safe.gc.mode = match options.gc_mode {
        GcModeArg::Incremental => GcModeOption::Incremental,
        GcModeArg::Generational => GcModeOption::Generational,
    };
    let mut vm = LuaVM::new(safe);
    if let Err(e) = vm.open_stdlib(Stdlib::All) {
        eprintln!("lua: {e}");
        return ExitCode::FAILURE;
    }
    tracing::debug!(gc_mode = ?options.gc_mode, "interpreter started");

    set_arg_table(&mut vm, options.script.as_deref(), &options.args);

    for source in &options.execute {
        let result = vm
            .load_source(source, "=(command line)")
            .and_then(|f| vm.call(f, &[]));
        if let Err(e) = result {
            report(&e);
            return ExitCode::FAILURE;
        }
    }

    if let Some(script) = &options.script {
        if let Err(e) = run_script(&mut vm, script, &options.args, options.strip) {
            report(&e);
            return ExitCode::FAILURE;
        }
    } else if options.execute.is_empty() {
        println!("{VERSION}");
        println!("usage: lua [-e stat] [--gc-mode mode] [--strip] [script [args]]");
    }

    ExitCode::SUCCESS
}

/// `arg[0]` is the script name, `arg[1..]` its arguments
fn set_arg_table(vm: &mut LuaVM, script: Option<&str>, args: &[String]) {
    let table = vm.create_table(args.len(), 1);
    if let Some(name) = script {
        let name = vm.create_string(name);
        // Integer keys are always accepted
        let _ = vm.raw_set(&table, LuaValue::Integer(0), name);
    }
    for (i, a) in args.iter().enumerate() {
        let s = vm.create_string(a);
        let _ = vm.raw_set(&table, LuaValue::Integer(i as i64 + 1), s);
    }
    vm.set_global("arg", table);
}

fn run_script(vm: &mut LuaVM, script: &str, args: &[String], strip: bool) -> Result<(), LuaError> {
    let bytes = match read_script(script) {
        Ok(bytes) => bytes,
        Err(e) => {
            let msg = vm.create_string(&format!("cannot open {script}: {e}"));
            return Err(vm.error_with_value(msg));
        }
    };

    let f = if is_binary_chunk(&bytes) {
        vm.load_binary(&bytes)?
    } else {
        let chunk_name = if script == "-" {
            "=stdin".to_string()
        } else {
            format!("@{script}")
        };
        let chunk = vm.compile_bytes(&bytes, &chunk_name)?;
        if strip {
            let dumped = vm.dump(&chunk, true);
            vm.load_binary(&dumped)?
        } else {
            vm.load(chunk)
        }
    };

    let args: Vec<LuaValue> = args.iter().map(|a| vm.create_string(a)).collect();
    vm.call(f, &args)?;
    Ok(())
}

fn read_script(script: &str) -> std::io::Result<Vec<u8>> {
    if script == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        Ok(buf)
    } else {
        std::fs::read(script)
    }
}

fn report(e: &LuaError) {
    eprintln!("lua: {e}");
    if let Some(traceback) = e.traceback() {
        eprintln!("{traceback}");
    }
}
