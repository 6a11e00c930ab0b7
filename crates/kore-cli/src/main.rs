use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use kore_core::{Accelerator, Device, SimAccelerator};
use kore_offload::{
    CategorySelection, OffloadEngine, OffloadError, ParamSpec, ProcessGroup, StateCategory, ThreadGroup,
    TrainingConfig, ZeroState,
};

const BANNER: &str = r#"
 _  _____  ____  _____
| |/ / _ \|  _ \| ____|
| ' / | | | |_) |  _|
| . \ |_| |  _ <| |___
|_|\_\___/|_| \_\_____|"#;

/// Mirrors a minimal ZeRO-3 bf16 Adam run.
const DEFAULT_CONFIG: &str = r#"{
    "train_micro_batch_size_per_gpu": 1,
    "optimizer": { "type": "Adam", "params": { "lr": 1e-6 } },
    "bf16": { "enabled": true },
    "zero_optimization": { "stage": 3 }
}"#;

#[derive(Parser)]
#[command(
    name = "kore",
    about = "Offload and restore ZeRO training state",
    long_about = "Moves partitioned training state (master weights, low-precision\nparameters, optimizer moments, gradients and the contiguous gradient\nbuffer) from accelerator memory to host memory and back.",
    version,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Show state categories and host memory
    Info,
    /// Run offload/restore cycles on simulated workers
    Cycle {
        /// Number of data-parallel workers (one thread each)
        #[arg(long, default_value = "2")]
        workers: usize,
        /// Hidden dimension of each linear layer
        #[arg(long, default_value = "1024")]
        hidden: usize,
        /// Number of linear layers
        #[arg(long, default_value = "2")]
        layers: usize,
        /// Offload/restore cycles per worker
        #[arg(long, default_value = "10")]
        steps: usize,
        /// Comma-separated categories to offload, or "all"
        #[arg(long)]
        include: Option<String>,
        /// DeepSpeed-style JSON config
        #[arg(long)]
        config: Option<PathBuf>,
        /// Use pageable instead of pinned host memory
        #[arg(long)]
        no_pin: bool,
        #[arg(long, default_value = "0")]
        seed: u64,
    },
}

struct CycleArgs {
    workers: usize,
    hidden: usize,
    layers: usize,
    steps: usize,
    seed: u64,
}

/// What one worker observed over all its cycles.
struct WorkerSummary {
    rank: usize,
    device: Device,
    resident: usize,
    offloaded: usize,
    moved: usize,
    cycles: usize,
    exact: bool,
    elapsed_ms: f64,
}

fn main() {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Info => {
            cmd_info();
            Ok(())
        }
        Commands::Cycle { workers, hidden, layers, steps, include, config, no_pin, seed } => {
            let args = CycleArgs { workers, hidden, layers, steps, seed };
            cmd_cycle(args, include.as_deref(), config, no_pin)
        }
    };
    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn cmd_info() {
    println!("{}", BANNER);
    println!("  v{}  -  ZeRO state offload\n", env!("CARGO_PKG_VERSION"));

    println!("Platform");
    println!("  OS:   {}", std::env::consts::OS);
    println!("  Arch: {}", std::env::consts::ARCH);

    let sys = sysinfo::System::new_with_specifics(
        sysinfo::RefreshKind::new().with_memory(sysinfo::MemoryRefreshKind::everything()),
    );
    println!("\nHost memory");
    println!("  Total:     {:>10.1} MB", mb(sys.total_memory() as usize));
    println!("  Available: {:>10.1} MB", mb(sys.available_memory() as usize));

    println!("\nState categories");
    for c in StateCategory::ALL {
        println!("  {:<24} {:<18} {}", c.name(), c.layout().to_string(), c.description());
    }

    println!("\nAccelerators");
    println!("  sim:  host-backed, per-device accounting");
    println!("  cuda: {}", if cfg!(feature = "cuda") { "[x]" } else { "[ ] (build with --features cuda)" });
}

fn cmd_cycle(
    args: CycleArgs,
    include: Option<&str>,
    config: Option<PathBuf>,
    no_pin: bool,
) -> Result<(), OffloadError> {
    let mut config = match config {
        Some(path) => TrainingConfig::from_file(path)?,
        None => TrainingConfig::from_json(DEFAULT_CONFIG)?,
    };
    if no_pin {
        config.offload_states.pin_memory = false;
    }
    let selection = match include {
        Some(list) => CategorySelection::parse_list(list)?,
        None => config.selection(),
    };

    println!("=== Offload cycle ===");
    println!(
        "Workers: {}, Layers: {} x {}, Steps: {}, Dtype: {}, Host: {:?}",
        args.workers,
        args.layers,
        args.hidden,
        args.steps,
        config.compute_dtype(),
        config.offload_options().host_alloc,
    );

    let params: Vec<ParamSpec> = (0..args.layers)
        .flat_map(|l| {
            [
                ParamSpec::new(format!("linears.{l}.weight"), &[args.hidden, args.hidden]),
                ParamSpec::new(format!("linears.{l}.bias"), &[args.hidden]),
            ]
        })
        .collect();

    let sim = Arc::new(SimAccelerator::new());
    let abort = Arc::new(AtomicBool::new(false));
    let config = Arc::new(config);

    let handles: Vec<_> = ThreadGroup::new(args.workers)
        .into_iter()
        .map(|group| {
            let sim = sim.clone();
            let abort = abort.clone();
            let config = config.clone();
            let params = params.clone();
            let selection = selection.clone();
            let (steps, seed) = (args.steps, args.seed);
            thread::spawn(move || run_worker(&group, &sim, &config, params, &selection, steps, seed, &abort))
        })
        .collect();

    let mut summaries = Vec::with_capacity(handles.len());
    let mut first_err = None;
    for handle in handles {
        match handle.join() {
            Ok(Ok(summary)) => summaries.push(summary),
            Ok(Err(e)) => {
                first_err.get_or_insert(e);
            }
            Err(_) => tracing::error!("worker thread panicked"),
        }
    }

    println!(
        "\n{:<6} {:<8} {:>14} {:>14} {:>14} {:>8} {:>7} {:>10}",
        "Rank", "Device", "Resident (MB)", "Offload (MB)", "Moved (MB)", "Cycles", "Exact", "ms/cycle"
    );
    println!("{}", "-".repeat(89));
    for s in &summaries {
        println!(
            "{:<6} {:<8} {:>14.2} {:>14.2} {:>14.2} {:>8} {:>7} {:>10.3}",
            s.rank,
            s.device.to_string(),
            mb(s.resident),
            mb(s.offloaded),
            mb(s.moved),
            s.cycles,
            if s.exact { "yes" } else { "NO" },
            s.elapsed_ms / s.cycles.max(1) as f64,
        );
    }
    println!("\nHost bytes still in use: {}", sim.bytes_in_use(Device::Cpu));

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[allow(clippy::too_many_arguments)]
fn run_worker(
    group: &ThreadGroup,
    sim: &Arc<SimAccelerator>,
    config: &TrainingConfig,
    params: Vec<ParamSpec>,
    selection: &CategorySelection,
    steps: usize,
    seed: u64,
    abort: &AtomicBool,
) -> Result<WorkerSummary, OffloadError> {
    let rank = group.rank();
    let device = Device::Cuda(rank);

    let built = ZeroState::builder(sim.clone())
        .from_config(config)
        .rank(rank)
        .world_size(group.world_size())
        .device(device)
        .params(params)
        .seed(seed)
        .build();
    if built.is_err() {
        abort.store(true, Ordering::SeqCst);
    }
    group.barrier();
    let state = built?;

    let before = snapshot(&state)?;
    let mut engine = OffloadEngine::with_options(config.offload_options());
    let mut summary = WorkerSummary {
        rank,
        device,
        resident: sim.bytes_in_use(device),
        offloaded: 0,
        moved: 0,
        cycles: 0,
        exact: true,
        elapsed_ms: 0.0,
    };
    if abort.load(Ordering::SeqCst) {
        tracing::warn!("rank {rank}: another worker failed to build its state");
        return Ok(summary);
    }

    for step in 0..steps {
        let start = Instant::now();
        group.barrier();
        let offloaded = engine.offload(&state, selection.clone(), Device::Cpu);
        if let Ok(report) = &offloaded {
            summary.offloaded = sim.bytes_in_use(device);
            summary.moved = report.bytes;
            tracing::debug!("rank {rank} step {step}: moved {} bytes", report.bytes);
        }
        group.barrier();
        let outcome = offloaded.and_then(|report| match engine.restore(&state) {
            Err(e) if e.is_benign() && report.categories.is_empty() => Ok(()),
            other => other.map(|_| ()),
        });
        summary.elapsed_ms += start.elapsed().as_secs_f64() * 1e3;

        if outcome.is_err() {
            abort.store(true, Ordering::SeqCst);
        } else {
            summary.cycles += 1;
            let same = snapshot(&state).is_ok_and(|now| now == before);
            summary.exact &= same && sim.bytes_in_use(device) == summary.resident;
        }
        group.barrier();
        outcome?;
        if abort.load(Ordering::SeqCst) {
            tracing::warn!("rank {rank}: stopping after step {step}, another worker failed");
            break;
        }
    }
    Ok(summary)
}

fn snapshot(state: &ZeroState) -> Result<Vec<Vec<Vec<u8>>>, OffloadError> {
    state
        .registry()
        .tracked()
        .into_iter()
        .map(|c| state.category_bytes(c))
        .collect()
}

fn mb(bytes: usize) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}
