use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process;

mod commands;

/// Standardized exit codes for CLI.
/// 0 = OK, 2 = parse error, 3 = link error, 4 = runtime fault, 5 = compile service, 1 = other.
#[allow(dead_code)]
const EXIT_OK: i32 = 0;
const EXIT_OTHER: i32 = 1;
const EXIT_PARSE: i32 = 2;
const EXIT_LINK: i32 = 3;
const EXIT_RUNTIME: i32 = 4;
const EXIT_COMPILE: i32 = 5;

#[derive(Parser)]
#[command(name = "hackx", version, about = "Hack VM CLI — check, format, run and compile VM programs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and link .vm files, then print the symbol tables
    Check {
        /// .vm files or directories containing them
        #[arg(required = true)]
        paths: Vec<String>,
        /// Entry function (default: Sys.init, else the first function)
        #[arg(long)]
        entry: Option<String>,
    },
    /// Print one .vm file in canonical form
    Fmt {
        /// Path to .vm file
        file: String,
    },
    /// Print the linked program with resolved jump targets
    Disasm {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Run a program until it halts
    Run {
        #[arg(required = true)]
        paths: Vec<String>,
        #[arg(long)]
        entry: Option<String>,
        /// Give up after this many instructions
        #[arg(long, default_value_t = 10_000_000)]
        max_steps: u64,
        /// Key to hold for one tick (name, character or code); repeat for a sequence
        #[arg(long = "key")]
        keys: Vec<String>,
        /// Print memory words, e.g. --dump 256:16
        #[arg(long)]
        dump: Option<String>,
        /// Print the BLAKE3 digest of memory after the run
        #[arg(long)]
        digest: bool,
    },
    /// Send source files to the compile service and collect the VM output
    Compile {
        #[arg(required = true)]
        files: Vec<String>,
        /// Directory to write .vm, .asm and .hack output to
        #[arg(long)]
        out: Option<String>,
        /// Run the returned VM files
        #[arg(long)]
        run: bool,
        /// Compile service URL (default: http://localhost:5000)
        #[arg(long, env = "HACK_COMPILE_URL")]
        compile_url: Option<String>,
    },
}

/// Map error messages to exit codes by their stage prefix.
fn exit_code_for(err: &str) -> i32 {
    if err.starts_with("parse:") {
        EXIT_PARSE
    } else if err.starts_with("link:") {
        EXIT_LINK
    } else if err.starts_with("runtime:") {
        EXIT_RUNTIME
    } else if err.starts_with("compile:") {
        EXIT_COMPILE
    } else {
        EXIT_OTHER
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Check { paths, entry } => commands::check(&paths, entry.as_deref()),
        Commands::Fmt { file } => commands::fmt(&file),
        Commands::Disasm { paths } => commands::disasm(&paths),
        Commands::Run {
            paths,
            entry,
            max_steps,
            keys,
            dump,
            digest,
        } => commands::run(
            &paths,
            &commands::RunOpts {
                entry,
                max_steps,
                keys,
                dump,
                digest,
            },
        ),
        Commands::Compile {
            files,
            out,
            run,
            compile_url,
        } => {
            let url = compile_url.unwrap_or_else(|| hack_config::COMPILE_URL.clone());
            commands::compile(&url, &files, out.as_deref(), run)
        }
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        process::exit(exit_code_for(&e));
    }
}
