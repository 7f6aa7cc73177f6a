//! Command-line front end: ONNX model in, SPIR-V assembly text out.

use std::collections::HashMap;
use std::path::PathBuf;

use clap::Parser;
use miette::{IntoDiagnostic, Result, WrapErr};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "kiln", version, about = "Compile small ONNX graphs to SPIR-V compute kernels")]
struct Cli {
    /// Path to the ONNX model.
    model: PathBuf,

    /// Where to write the assembled module.
    #[arg(short, long, default_value = "out.spvasm")]
    output: PathBuf,

    /// Resolve a named dynamic axis, e.g. `--set-axis batch_size=1`.
    /// Repeatable.
    #[arg(long = "set-axis", value_name = "NAME=SIZE", value_parser = parse_axis)]
    set_axis: Vec<(String, u32)>,

    /// Also print the assembled module to stdout.
    #[arg(long)]
    print: bool,
}

fn parse_axis(arg: &str) -> Result<(String, u32), String> {
    let (name, size) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=SIZE, got '{arg}'"))?;
    if name.is_empty() {
        return Err("axis name is empty".into());
    }
    let size: u32 = size
        .parse()
        .map_err(|_| format!("axis size '{size}' is not an unsigned integer"))?;
    Ok((name.to_string(), size))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let model = kiln_onnx::load_model(&cli.model)
        .into_diagnostic()
        .wrap_err_with(|| format!("loading {}", cli.model.display()))?;
    let axes: HashMap<String, u32> = cli.set_axis.into_iter().collect();
    let graph = kiln_onnx::build_graph(&model, &axes).into_diagnostic()?;
    let text = kiln_spirv::compile_graph(&graph).into_diagnostic()?;

    if cli.print {
        print!("{text}");
    }
    std::fs::write(&cli.output, &text)
        .into_diagnostic()
        .wrap_err_with(|| format!("writing {}", cli.output.display()))?;
    info!(output = %cli.output.display(), bytes = text.len(), "module written");
    Ok(())
}
