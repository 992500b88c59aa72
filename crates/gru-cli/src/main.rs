//! Command-line driver for the GRU runtime.
//!
//! Provides subcommands:
//! - probe: CPU capabilities and the ISA a pipeline would use
//! - init-config: write a default TOML config
//! - synth: write deterministic synthetic weights to a weight file
//! - run: pack a layer and run a sequence through it

mod logging;

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use gru_core::AppConfig;
use gru_kernels::Capabilities;
use gru_model::{reference_output, Direction, ExecContext, Gru, GruConfig, GruWeights};
use gru_tensor::verify::verify_outputs;
use gru_tensor::{ElemType, Tensor};

#[derive(Parser)]
#[command(name = "grurt")]
#[command(about = "CPU GRU inference runtime", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show detected CPU capabilities
    Probe,

    /// Write a default config file
    InitConfig {
        /// Output path
        #[arg(short, long, default_value = "grurt.toml")]
        output: PathBuf,
    },

    /// Write synthetic weights to a weight file
    Synth {
        #[command(flatten)]
        shape: ShapeArgs,

        /// Seed for the weight generator
        #[arg(long, default_value = "42")]
        seed: u32,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Run a sequence through a layer
    Run {
        /// Weight file; synthetic weights are generated when omitted
        #[arg(short, long)]
        weights: Option<PathBuf>,

        #[command(flatten)]
        shape: ShapeArgs,

        /// Timesteps in the generated input sequence
        #[arg(short = 't', long, default_value = "32")]
        steps: usize,

        /// Element type of the input and output tensors
        #[arg(short, long, value_enum, default_value = "f32")]
        elem: ElemArg,

        /// Use the int8 recurrence
        #[arg(long)]
        int8: bool,

        /// Worker threads (overrides the config file)
        #[arg(long)]
        threads: Option<usize>,

        /// Pin the scalar kernels
        #[arg(long)]
        force_scalar: bool,

        /// Number of timed forward calls
        #[arg(short, long, default_value = "1")]
        repeat: usize,

        /// Compare against the scalar f32 reference
        #[arg(long)]
        verify: bool,
    },
}

#[derive(clap::Args)]
struct ShapeArgs {
    /// Hidden units per direction
    #[arg(long, default_value = "64")]
    hidden: usize,

    /// Features per timestep
    #[arg(long, default_value = "32")]
    input: usize,

    /// Direction mode
    #[arg(long, value_enum, default_value = "forward")]
    direction: DirectionArg,
}

impl ShapeArgs {
    fn config(&self) -> GruConfig {
        GruConfig::new(self.hidden, self.input, self.direction.into())
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum DirectionArg {
    Forward,
    Reverse,
    Bidirectional,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Forward => Direction::Forward,
            DirectionArg::Reverse => Direction::Reverse,
            DirectionArg::Bidirectional => Direction::Bidirectional,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ElemArg {
    F32,
    F16,
    Bf16,
}

impl From<ElemArg> for ElemType {
    fn from(e: ElemArg) -> Self {
        match e {
            ElemArg::F32 => ElemType::F32,
            ElemArg::F16 => ElemType::F16,
            ElemArg::Bf16 => ElemType::Bf16,
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let app = match &cli.config {
        Some(path) => AppConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => AppConfig::default(),
    };
    logging::init_logging(&app.log_level);

    match cli.command {
        Commands::Probe => probe(),
        Commands::InitConfig { output } => init_config(&output)?,
        Commands::Synth {
            shape,
            seed,
            output,
        } => synth(&shape, seed, &output)?,
        Commands::Run {
            weights,
            shape,
            steps,
            elem,
            int8,
            threads,
            force_scalar,
            repeat,
            verify,
        } => {
            let mut app = app;
            if let Some(n) = threads {
                app.runtime.num_threads = n;
            }
            app.runtime.force_scalar |= force_scalar;
            match elem {
                ElemArg::F16 => app.runtime.use_fp16_storage = true,
                ElemArg::Bf16 => app.runtime.use_bf16_storage = true,
                ElemArg::F32 => {}
            }
            let opts = RunOptions {
                steps,
                elem: elem.into(),
                int8,
                repeat,
                verify,
            };
            run(app, weights.as_deref(), &shape, &opts)?
        }
    }

    Ok(())
}

fn probe() {
    let caps = Capabilities::detect();
    println!("sse2:          {}", caps.sse2);
    println!("neon:          {}", caps.neon);
    println!("fp16 storage:  {}", caps.fp16_storage);
    println!("bf16 storage:  {}", caps.bf16_storage);
    println!("int8:          {}", caps.int8);
    let isas: Vec<String> = caps.available_isas().iter().map(|i| i.to_string()).collect();
    println!("isas:          {}", isas.join(", "));
    println!("selected:      {} ({} lanes)", caps.best_isa(), caps.best_isa().lanes());
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    AppConfig::default().save(output)?;
    info!("wrote default config to {}", output.display());
    Ok(())
}

fn synth(shape: &ShapeArgs, seed: u32, output: &Path) -> anyhow::Result<()> {
    let config = shape.config();
    let weights = GruWeights::synthetic(&config, seed)?;
    weights.save(output)?;
    info!(
        "wrote {} bytes of {:?} weights (H={}, I={}) to {}",
        weights.size_bytes(),
        config.direction,
        config.num_output,
        config.input_size,
        output.display()
    );
    Ok(())
}

struct RunOptions {
    steps: usize,
    elem: ElemType,
    int8: bool,
    repeat: usize,
    verify: bool,
}

fn run(app: AppConfig, weights: Option<&Path>, shape: &ShapeArgs, opts: &RunOptions) -> anyhow::Result<()> {
    if opts.steps == 0 {
        bail!("--steps must be at least 1");
    }

    let weights = match weights {
        Some(path) => GruWeights::load(path)
            .with_context(|| format!("loading weights {}", path.display()))?,
        None => GruWeights::synthetic(&shape.config(), 42)?,
    };
    let config = weights.config().clone().with_int8(opts.int8);
    let (h, i) = (config.num_output, config.input_size);

    let ctx = ExecContext::new(app.runtime)?;
    let mut gru = Gru::new(config.clone())?;
    gru.load_weights(weights.clone())?;

    let start = Instant::now();
    gru.create_pipeline(&ctx)?;
    if let Some(p) = gru.pipeline() {
        info!(
            "pipeline ready in {:.2}ms: precision={} isa={} packed={} bytes",
            start.elapsed().as_secs_f64() * 1e3,
            p.precision,
            p.isa,
            p.weights.size_bytes()
        );
    }

    let values: Vec<f32> = (0..opts.steps * i)
        .map(|k| ((k as f32) * 0.173).sin())
        .collect();
    let input = Tensor::from_f32_2d(i, opts.steps, &values)?.cast(opts.elem, &ctx.blob_alloc)?;

    let mut output = None;
    let start = Instant::now();
    for _ in 0..opts.repeat.max(1) {
        output = Some(gru.forward(&input, &ctx)?);
    }
    let elapsed = start.elapsed().as_secs_f64() / opts.repeat.max(1) as f64;
    let output = output.context("no forward call ran")?;

    let out = output.to_f32_vec()?;
    let mean_abs = out.iter().map(|v| v.abs()).sum::<f32>() / out.len() as f32;
    println!("output:     {:?} {}", output.shape(), output.elem());
    println!("mean |h|:   {:.6}", mean_abs);
    println!("last row:   {:?}", &out[out.len() - h.min(8)..]);
    println!(
        "forward:    {:.3}ms ({:.1} steps/s)",
        elapsed * 1e3,
        opts.steps as f64 / elapsed
    );

    if opts.verify {
        let mut hidden = vec![0.0f32; h * config.num_directions()];
        let expected = reference_output(&weights, &values, opts.steps, &mut hidden)?;
        let tol = match (opts.int8, opts.elem) {
            (true, _) => 5e-2,
            (false, ElemType::F32) => 1e-4,
            (false, ElemType::F16) => 2e-2,
            _ => 5e-2,
        };
        let result = verify_outputs(&expected, &out, tol);
        println!(
            "verify:     pass={} fail={} max_diff={:.3e} (tol {:.0e})",
            result.pass, result.fail, result.max_diff, tol
        );
        if !result.ok() {
            warn!("output differs from the f32 reference");
            bail!("verification failed");
        }
    }
    Ok(())
}
