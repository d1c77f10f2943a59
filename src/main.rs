use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cinder::bytecode::Program;
use cinder::frontend::lexer::Lexer;
use cinder::frontend::parse_program;
use cinder::frontend::token_dumper::TokenDumper;
use cinder::runtime::{NativeRegistry, Vm, VmConfig};
use cinder::translate;

#[derive(Parser)]
#[command(name = "cinder", about = "Cinder bytecode translator and VM", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Source file (.cin) or serialized program (.cbc)
    file: PathBuf,

    /// Dump tokens and stop
    #[arg(long)]
    tokens: bool,

    /// With --tokens: plain output without ANSI colours
    #[arg(long = "no-color")]
    no_color: bool,

    /// With --tokens: source spelling instead of token debug form
    #[arg(long)]
    pretty: bool,

    /// Print the parsed AST and stop
    #[arg(long)]
    ast: bool,

    /// Print the bytecode listing and stop
    #[arg(long)]
    disasm: bool,

    /// Print an opcode frequency table and stop
    #[arg(long)]
    stats: bool,

    /// Write the serialized program to OUT and stop
    #[arg(long, value_name = "OUT")]
    emit: Option<PathBuf>,

    /// Operand stack limit
    #[arg(long = "max-stack", value_name = "N")]
    max_stack: Option<usize>,

    /// Call depth limit
    #[arg(long = "max-depth", value_name = "N")]
    max_depth: Option<usize>,

    /// Abort after N executed instructions
    #[arg(long = "max-steps", value_name = "N")]
    max_steps: Option<u64>,

    /// Debug logging (overridden by CINDER_LOG)
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn vm_config(&self) -> VmConfig {
        let mut config = VmConfig::default();
        if let Some(n) = self.max_stack {
            config.max_stack_size = n;
        }
        if let Some(n) = self.max_depth {
            config.max_call_depth = n;
        }
        config.max_steps = self.max_steps;
        config
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("CINDER_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let program = if is_serialized(&cli.file) {
        let bytes = fs::read(&cli.file)
            .with_context(|| format!("failed to read '{}'", cli.file.display()))?;
        Program::from_bytes(&bytes)
            .with_context(|| format!("failed to load '{}'", cli.file.display()))?
    } else {
        let source = fs::read_to_string(&cli.file)
            .with_context(|| format!("failed to read '{}'", cli.file.display()))?;

        if cli.tokens {
            return dump_tokens(&source, cli);
        }

        let ast = match parse_program(&source) {
            Ok(ast) => ast,
            Err(e) => {
                eprintln!("syntax error at {}", e);
                return Ok(ExitCode::from(1));
            }
        };

        if cli.ast {
            println!("{:#?}", ast);
            return Ok(ExitCode::SUCCESS);
        }

        match translate(&ast) {
            Ok(program) => program,
            Err(e) => {
                eprintln!("{}", e);
                return Ok(ExitCode::from(1));
            }
        }
    };

    if cli.disasm {
        print!("{}", program.disassemble());
        return Ok(ExitCode::SUCCESS);
    }

    if cli.stats {
        print!("{}", program.stats());
        return Ok(ExitCode::SUCCESS);
    }

    if let Some(out) = &cli.emit {
        let bytes = program.to_bytes().context("failed to serialize program")?;
        fs::write(out, &bytes).with_context(|| format!("failed to write '{}'", out.display()))?;
        debug!(path = %out.display(), bytes = bytes.len(), "program written");
        return Ok(ExitCode::SUCCESS);
    }

    execute(&program, cli.vm_config())
}

fn is_serialized(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("cbc")
}

fn dump_tokens(source: &str, cli: &Cli) -> Result<ExitCode> {
    match Lexer::new(source).tokenize() {
        Ok(tokens) => {
            let mut dumper = TokenDumper::new();
            if cli.no_color {
                dumper = dumper.no_color();
            }
            if cli.pretty {
                dumper = dumper.pretty();
            }
            dumper.dump(&tokens);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("syntax error at {}", e);
            Ok(ExitCode::from(1))
        }
    }
}

fn execute(program: &Program, config: VmConfig) -> Result<ExitCode> {
    let mut vm = Vm::new(program, NativeRegistry::with_std(), config);
    let stdout = io::stdout();
    let mut out = stdout.lock();

    let result = vm.run(&mut [], &mut out);
    out.flush().context("failed to flush stdout")?;

    let stats = vm.stats();
    debug!(
        steps = stats.steps,
        calls = stats.calls,
        native_calls = stats.native_calls,
        max_depth = stats.max_depth,
        "run finished"
    );

    match result {
        Ok(status) => {
            debug!(?status, "exit");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("{}", e);
            Ok(ExitCode::from(2))
        }
    }
}
