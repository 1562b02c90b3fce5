//! ilaot command-line driver
//!
//! Reads an assembly in its JSON metadata form, compiles it ahead of time and
//! writes the textual IR of the resulting module.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ilaot_engine::ir::Module;
use ilaot_engine::{CharEncoding, ClassInitPolicy, Compiler, CompilerConfig};
use ilaot_metadata::{Assembly, TypeDefId, TypeRef};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ilaot")]
#[command(about = "Ahead-of-time compiler from stack bytecode to SSA IR", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output on stderr (-v: milestones, -vv: per method, -vvv: everything)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile an assembly and write its IR
    Compile {
        /// Assembly metadata (JSON)
        input: PathBuf,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        options: CompileOptions,
    },

    /// Compile an assembly and print a summary without writing IR
    Check {
        /// Assembly metadata (JSON)
        input: PathBuf,
        #[command(flatten)]
        options: CompileOptions,
    },
}

#[derive(Args, Default)]
struct CompileOptions {
    /// Compiler configuration (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Pointer width in bits, overriding the configuration
    #[arg(long)]
    pointer_width: Option<u32>,
    /// Target triple, overriding the configuration
    #[arg(long)]
    target: Option<String>,
    /// Char and string literal encoding
    #[arg(long, value_enum)]
    char_encoding: Option<Encoding>,
    /// Claim class initializers with compare-and-swap
    #[arg(long)]
    atomic_init: bool,
    /// Skip module registration with the runtime
    #[arg(long)]
    test_mode: bool,
    /// Do not emit `main`
    #[arg(long)]
    no_main: bool,
    /// Compile only these types (full names); default is the whole main module
    #[arg(long = "type", value_name = "NAME")]
    types: Vec<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum Encoding {
    Utf16,
    Utf8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Compile { input, output, options } => {
            let module = compile(&input, &options)?;
            let text = module.to_string();
            match output {
                Some(path) => {
                    std::fs::write(&path, text).with_context(|| format!("failed to write {}", path.display()))?;
                    info!(output = %path.display(), "wrote module");
                }
                None => print!("{}", text),
            }
        }
        Commands::Check { input, options } => {
            let module = compile(&input, &options)?;
            println!("{}", summary(&module));
        }
    }
    Ok(())
}

/// `RUST_LOG` applies unless `-v` is given
fn init_logging(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_ansi(false).init();
}

fn load_config(options: &CompileOptions) -> Result<CompilerConfig> {
    let mut config = match &options.config {
        Some(path) => {
            CompilerConfig::load(path).with_context(|| format!("failed to load config {}", path.display()))?
        }
        None => CompilerConfig::default(),
    };
    if let Some(bits) = options.pointer_width {
        config.pointer_width = bits;
        config.target_triple = None;
    }
    if let Some(target) = &options.target {
        config.target_triple = Some(target.clone());
    }
    if let Some(encoding) = options.char_encoding {
        config.char_encoding = match encoding {
            Encoding::Utf16 => CharEncoding::Utf16,
            Encoding::Utf8 => CharEncoding::Utf8,
        };
    }
    if options.atomic_init {
        config.class_init = ClassInitPolicy::Atomic;
    }
    config.test_mode |= options.test_mode;
    if options.no_main {
        config.emit_main = false;
    }
    Ok(config)
}

fn compile(input: &Path, options: &CompileOptions) -> Result<Module> {
    let config = load_config(options)?;
    let asm = Assembly::load(input).with_context(|| format!("failed to read assembly {}", input.display()))?;
    let mut compiler = Compiler::new(&asm, config)?;
    if options.types.is_empty() {
        compiler.process_module()?;
    } else {
        for name in &options.types {
            let ty = find_type(&asm, name)?;
            compiler.register_type(&TypeRef::Named(ty))?;
        }
    }
    compiler.generate_module().with_context(|| format!("failed to compile {}", asm.name))
}

fn find_type(asm: &Assembly, full_name: &str) -> Result<TypeDefId> {
    let (namespace, name) = full_name.rsplit_once('.').unwrap_or(("", full_name));
    match asm.find_type(namespace, name) {
        Some(ty) => Ok(ty),
        None => bail!("no type named {} in {}", full_name, asm.name),
    }
}

fn summary(module: &Module) -> String {
    format!(
        "{}: {} functions defined, {} declared, {} globals, {} types",
        module.name,
        module.defined_functions().count(),
        module.functions().filter(|(_, f)| f.is_declaration()).count(),
        module.globals().count(),
        module.structs().count()
    )
}
