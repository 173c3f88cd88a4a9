//! `ridl-gen`: generate C code from a RIDL schema.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use ridl::{generate, invalid_prefix_char};

mod built {
    include!(concat!(env!("OUT_DIR"), "/build_info.rs"));
}

fn long_version() -> String {
    format!(
        "{} ({}, {}, built {})",
        built::VERSION,
        built::GIT_HASH,
        built::RUSTC_VERSION,
        built::BUILD_TIME
    )
}

#[derive(Parser)]
#[command(name = "ridl-gen", about = "Generate code from a RIDL schema")]
#[command(version = built::VERSION, long_version = long_version())]
struct Args {
    /// Generate code for built-in types
    #[arg(short, long)]
    builtins: bool,

    /// Write output to directory OUTPUT_DIR
    #[arg(short, long, value_name = "OUTPUT_DIR", default_value = "")]
    output_dir: PathBuf,

    /// Prefix for symbols
    #[arg(short, long, default_value = "")]
    prefix: String,

    /// Expose non-ABI names in introspection
    #[arg(short, long = "unmask-non-abi-names")]
    unmask: bool,

    /// The schema file to compile
    schema: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(funny_char) = invalid_prefix_char(&args.prefix) {
        eprintln!(
            "ridl-gen: funny character '{}' in argument of --prefix",
            funny_char
        );
        return ExitCode::FAILURE;
    }

    if let Err(err) = generate(
        &args.schema,
        &args.output_dir,
        &args.prefix,
        args.unmask,
        args.builtins,
    ) {
        eprintln!("ridl-gen: {:#}", err);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
