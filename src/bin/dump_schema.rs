//! `ridl-dump`: parse a schema and print each top-level expression
//! with its source location as JSON. Stops after expression checking,
//! before the semantic model is built.

use std::env;
use std::path::Path;
use std::process::ExitCode;

use serde_json::json;

use ridl::expr::check_exprs;
use ridl::parser::parse_schema;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: ridl-dump <schema.json>");
        return ExitCode::FAILURE;
    }

    let mut parsed = match parse_schema(Path::new(&args[1])) {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("ridl-dump: {}", err);
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = check_exprs(&mut parsed.exprs, &parsed.docs) {
        eprintln!("ridl-dump: {}", err);
        return ExitCode::FAILURE;
    }

    let dump: Vec<_> = parsed
        .exprs
        .iter()
        .map(|entry| {
            json!({
                "info": entry.info.loc(),
                "expr": entry.expr,
            })
        })
        .collect();
    match serde_json::to_string_pretty(&dump) {
        Ok(text) => {
            println!("{}", text);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("ridl-dump: {}", err);
            ExitCode::FAILURE
        }
    }
}
