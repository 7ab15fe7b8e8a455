use burn_cpp_template::{
    gemm::LayoutType, init_log, ir::DType, BatchSize, BmmConfig, Config,
};
use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use std::process::ExitCode;

// CLI arguments
#[derive(Parser, Debug)]
#[clap(author, version, about = "Generate a C++ batched matmul kernel", long_about = None)]
struct Args {
    /// JSON kernel configuration, defaults are used when missing
    #[clap(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of OpenMP threads of the generated kernel
    #[clap(long)]
    num_threads: Option<usize>,

    /// Name of the exported function
    #[clap(long)]
    kernel_name: Option<String>,

    /// Batch size, a number or the name of a runtime size
    #[clap(long)]
    batch: Option<String>,

    /// Element type (f32, bf16, ...)
    #[clap(long)]
    dtype: Option<DType>,

    /// Weight layout required by the micro-kernel (normal, vnni2, vnni4)
    #[clap(long)]
    layout: Option<LayoutType>,

    /// Weight layout given by its interleave factor (1, 2 or 4)
    #[clap(long, value_name = "FACTOR", conflicts_with = "layout")]
    interleave: Option<usize>,

    /// Write the kernel source to a file instead of stdout
    #[clap(long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Write the weight preparation plan as JSON
    #[clap(long, value_name = "FILE")]
    plan: Option<PathBuf>,

    /// Log debug messages
    #[clap(short = 'v', long = "verbose")]
    verbose: bool,
}

fn config(args: &Args) -> Result<BmmConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => BmmConfig::load(path)?,
        None => BmmConfig::default(),
    };

    if let Some(num_threads) = args.num_threads {
        config = config.with_num_threads(num_threads);
    }
    if let Some(name) = &args.kernel_name {
        config = config.with_kernel_name(name.clone());
    }
    if let Some(batch) = &args.batch {
        let batch = match batch.parse::<usize>() {
            Ok(size) => BatchSize::Static(size),
            Err(_) => BatchSize::Symbolic(batch.clone()),
        };
        config = config.with_batch(batch);
    }
    if let Some(dtype) = args.dtype {
        config = config.with_dtype(dtype);
    }
    if let Some(layout) = args.layout {
        config = config.with_layout(layout);
    }
    if let Some(factor) = args.interleave {
        config = config.with_layout(LayoutType::from_interleave(factor)?);
    }

    Ok(config)
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = config(&args)?;
    log::debug!("Configuration: {config}");

    let kernel = config.generate()?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, &kernel.source)?;
            log::info!("Kernel written to {}", path.display());
        }
        None => print!("{}", kernel.source),
    }

    if let Some(path) = &args.plan {
        std::fs::write(path, serde_json::to_string_pretty(&kernel.weight)?)?;
        log::info!("Weight plan written to {}", path.display());
    }

    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if let Err(err) = init_log(level) {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(flags: &[&str]) -> Args {
        Args::parse_from(core::iter::once("bmm-codegen").chain(flags.iter().copied()))
    }

    #[test]
    fn interleave_selects_layout() {
        let config = config(&args(&["--interleave", "4"])).unwrap();

        assert_eq!(config.layout, LayoutType::Vnni4);
    }

    #[test]
    fn unknown_interleave_is_rejected() {
        assert!(config(&args(&["--interleave", "3"])).is_err());
    }

    #[test]
    fn interleave_conflicts_with_layout() {
        let parsed =
            Args::try_parse_from(["bmm-codegen", "--layout", "vnni2", "--interleave", "2"]);

        assert!(parsed.is_err());
    }
}
