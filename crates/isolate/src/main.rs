use std::fs;
use std::io::{self, Read, Write};
use std::process;

use bumpalo::Bump;
use clap::{Arg, ArgAction, Command};

use wasm_isolate::isolate;

pub const FLAG_FUNCS: &str = "funcs";
pub const FLAG_OUT: &str = "out";
pub const FLAG_VERBOSE: &str = "verbose";
pub const WASM_FILE: &str = "WASM_FILE";

fn main() -> io::Result<()> {
    let arena = Bump::new();

    // Define the command line arguments

    let flag_funcs = Arg::new(FLAG_FUNCS)
        .long(FLAG_FUNCS)
        .short('f')
        .help("The indices of the functions to isolate, separated by commas")
        .default_value("")
        .required(false);

    let flag_out = Arg::new(FLAG_OUT)
        .long(FLAG_OUT)
        .short('o')
        .help("The file to write output to. Defaults to stdout.")
        .default_value("-")
        .required(false);

    let flag_verbose = Arg::new(FLAG_VERBOSE)
        .long(FLAG_VERBOSE)
        .help("Print a summary of each section to stderr while scanning.")
        .action(ArgAction::SetTrue)
        .required(false);

    let wasm_file = Arg::new(WASM_FILE)
        .help("The .wasm file to isolate, or - for stdin")
        .required(true);

    let app = Command::new("wasm-isolate")
        .about(
            "Strip a WebAssembly module down to specific functions of interest \
             without breaking validation",
        )
        .arg(flag_funcs)
        .arg(flag_out)
        .arg(flag_verbose)
        .arg(wasm_file);

    // Parse the command line arguments

    let matches = app.get_matches();
    let funcs_arg = matches.get_one::<String>(FLAG_FUNCS).unwrap();
    let out_name = matches.get_one::<String>(FLAG_OUT).unwrap();
    let verbose = matches.get_flag(FLAG_VERBOSE);
    let wasm_path = matches.get_one::<String>(WASM_FILE).unwrap();

    let funcs = match parse_func_indices(funcs_arg) {
        Ok(funcs) => funcs,
        Err(message) => exit_with_error(&message),
    };

    // Load the module

    let module_bytes = if wasm_path == "-" {
        let mut bytes = Vec::new();
        io::stdin().read_to_end(&mut bytes)?;
        bytes
    } else {
        match fs::read(wasm_path) {
            Ok(bytes) => bytes,
            Err(err) => exit_with_error(&format!("could not read file {wasm_path}: {err}")),
        }
    };

    // Isolate, then commit the output only on success

    match isolate(&arena, &module_bytes, &funcs, verbose) {
        Ok(out_bytes) => {
            if out_name == "-" {
                io::stdout().write_all(&out_bytes)?;
            } else if let Err(err) = fs::write(out_name, &out_bytes) {
                exit_with_error(&format!("could not write output file {out_name}: {err}"));
            }
        }
        Err(err) => exit_with_error(&err.to_string()),
    }

    Ok(())
}

/// Parse a comma-separated list of function indices. An empty argument
/// means no explicit requests (imports and element-referenced functions
/// are still kept).
fn parse_func_indices(arg: &str) -> Result<Vec<u32>, String> {
    let mut indices = Vec::new();
    for part in arg.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.parse::<u32>() {
            Ok(index) => indices.push(index),
            Err(_) => return Err(format!("invalid function index {part}")),
        }
    }
    Ok(indices)
}

fn exit_with_error(message: &str) -> ! {
    eprintln!("ERROR: {message}");
    process::exit(1);
}
