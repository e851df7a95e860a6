use clap::{Parser, Subcommand};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stax::config::Config;
use stax::vm::Vm;
use stax::{asm, disasm};

#[derive(Parser)]
#[command(name = "stax")]
#[command(about = "A stack-machine assembler, interpreter and JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a source file into a binary program
    Asm {
        /// The source file to assemble
        file: PathBuf,

        /// Output path (defaults to the source path with a .bin extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Print the resolved label table
        #[arg(long)]
        verbose: bool,
    },
    /// Interpret a program (binary, or source assembled in-memory)
    Run {
        /// The program to run
        file: PathBuf,
    },
    /// Translate a program to x86-64 and execute it natively
    #[cfg(feature = "jit")]
    Jit {
        /// The program to run
        file: PathBuf,
    },
    /// Print a reassemblable listing of a binary program
    Dasm {
        /// The binary to decode
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let config = match Config::load(&cwd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Asm {
            file,
            output,
            verbose,
        } => cmd_asm(&file, output, verbose, &config),
        Commands::Run { file } => cmd_run(&file, &config),
        #[cfg(feature = "jit")]
        Commands::Jit { file } => cmd_jit(&file),
        Commands::Dasm { file } => cmd_dasm(&file),
    };

    if let Err(e) = result {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn cmd_asm(
    file: &Path,
    output: Option<PathBuf>,
    verbose: bool,
    config: &Config,
) -> Result<(), String> {
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let program = asm::assemble(&source).map_err(|e| format!("{}: {}", file.display(), e))?;

    if verbose {
        for (name, offset) in &program.labels {
            println!("{:<24} {:#06x}", name, offset);
        }
        println!("entry {:#06x}, {} bytes", program.entry, program.bytes.len());
    }

    let output = output
        .or_else(|| config.build.output.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| file.with_extension("bin"));
    std::fs::write(&output, &program.bytes)
        .map_err(|e| format!("failed to write {}: {}", output.display(), e))?;
    Ok(())
}

/// Binaries load as-is; anything else is treated as source and assembled
/// in-memory.
fn load_image(file: &Path) -> Result<Vec<u8>, String> {
    if file.extension().is_some_and(|ext| ext == "bin") {
        return std::fs::read(file).map_err(|e| format!("failed to read {}: {}", file.display(), e));
    }
    let source = std::fs::read_to_string(file)
        .map_err(|e| format!("failed to read {}: {}", file.display(), e))?;
    let program = asm::assemble(&source).map_err(|e| format!("{}: {}", file.display(), e))?;
    Ok(program.bytes)
}

fn cmd_run(file: &Path, config: &Config) -> Result<(), String> {
    let image = load_image(file)?;
    let mut vm = Vm::with_limits(
        &image,
        config.runtime.memory_size,
        config.runtime.stack_size,
        Box::new(BufReader::new(std::io::stdin())),
        Box::new(std::io::stdout()),
    )
    .map_err(|e| e.to_string())?;
    vm.run().map_err(|e| e.to_string())
}

#[cfg(feature = "jit")]
fn cmd_jit(file: &Path) -> Result<(), String> {
    let image = load_image(file)?;
    let mut image = stax::jit::Image::translate(&image).map_err(|e| e.to_string())?;
    image.execute().map_err(|e| e.to_string())
}

fn cmd_dasm(file: &Path) -> Result<(), String> {
    let image = load_image(file)?;
    let listing = disasm::disassemble(&image).map_err(|e| e.to_string())?;
    let mut stdout = std::io::stdout();
    stdout
        .write_all(listing.as_bytes())
        .map_err(|e| e.to_string())
}
