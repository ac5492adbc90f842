use anyhow::Context;
use clap::Parser;
use segsum::config::{DEFAULT_GROUP_SIZE, DEFAULT_NUM_GROUPS, DEFAULT_TILE_SIZE};
use segsum::loader::{read_matrix, write_vector};
use segsum::{init_backend, BackendPreference, ComputeDevice, DeviceSelector, PlanKind, RowSumEngine, SegsumConfig};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::time::Instant;

/// Sum every row of an integer matrix on a GPU-style device.
///
/// Examples:
///   segsum matrix.txt
///   segsum --backend cpu --runs 10 -t runtimes.txt matrix.txt
///   echo '[[1, 2], [3, 4]]' | segsum --plan small-comm
#[derive(Parser, Debug)]
#[command(name = "segsum", version, about, long_about = None)]
struct Cli {
    /// Matrix file, text literal or binary (stdin if omitted)
    #[arg(value_name = "INPUT")]
    input: Option<PathBuf>,

    /// Compute backend: auto, cpu, opencl
    #[arg(long, default_value = "auto")]
    backend: String,

    /// Use the first platform whose name contains this
    #[arg(short, long)]
    platform: Option<String>,

    /// Use the first device whose name contains this
    #[arg(short, long)]
    device: Option<String>,

    /// Pick the n-th matching device
    #[arg(long, default_value_t = 0)]
    device_index: usize,

    /// Threads per work-group
    #[arg(long, default_value_t = DEFAULT_GROUP_SIZE)]
    group_size: usize,

    /// Group count hint for long rows
    #[arg(long, default_value_t = DEFAULT_NUM_GROUPS)]
    num_groups: usize,

    /// Transpose tile edge
    #[arg(long, default_value_t = DEFAULT_TILE_SIZE)]
    tile_size: usize,

    /// Time this many runs after one warmup run
    #[arg(short, long, default_value_t = 0)]
    runs: usize,

    /// Write the runtime of every run, in microseconds, to this file
    #[arg(short = 't', long, value_name = "FILE")]
    write_runtime_to: Option<PathBuf>,

    /// Trace allocations and report peak memory usage at exit
    #[arg(short, long)]
    memory: bool,

    /// Write the OpenCL program source to this file
    #[arg(long, value_name = "FILE")]
    dump_program: Option<PathBuf>,

    /// Build the OpenCL program from this file
    #[arg(long, value_name = "FILE")]
    load_program: Option<PathBuf>,

    /// Reduction strategy: auto, outer-parallel, intra-group,
    /// large-comm-one, large-comm-many, small-comm
    #[arg(long, default_value = "auto")]
    plan: String,

    /// List available devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Synchronize after every kernel and report kernel runtimes
    #[arg(short = 'D', long)]
    debug: bool,

    /// Only print warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

fn parse_backend(s: &str) -> Option<BackendPreference> {
    match s.to_lowercase().as_str() {
        "auto" => Some(BackendPreference::Auto),
        "cpu" => Some(BackendPreference::Cpu),
        #[cfg(feature = "opencl")]
        "opencl" => Some(BackendPreference::OpenCL),
        _ => None,
    }
}

fn parse_plan(s: &str) -> anyhow::Result<Option<PlanKind>> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(None);
    }
    s.parse::<PlanKind>().map(Some).map_err(anyhow::Error::msg)
}

fn print_device_summary() {
    println!("Available devices:");
    println!("  cpu: cpu-emulator");
    #[cfg(feature = "opencl")]
    {
        use segsum::kernels::opencl::OpenCLDevice;
        for (i, d) in OpenCLDevice::list_devices().iter().enumerate() {
            let kind = if d.is_gpu { "GPU" } else { "other" };
            println!("  opencl #{}: {} / {} ({})", i, d.platform_name, d.device_name, kind);
        }
    }
    #[cfg(not(feature = "opencl"))]
    println!("  (built without the `opencl` feature)");
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        tracing::Level::DEBUG
    } else if cli.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if cli.list_devices {
        print_device_summary();
        return Ok(());
    }

    let preference = parse_backend(&cli.backend).with_context(|| format!("unknown backend '{}'", cli.backend))?;
    let forced = parse_plan(&cli.plan)?;

    let selector = DeviceSelector {
        platform: cli.platform.clone(),
        device: cli.device.clone(),
        index: cli.device_index,
        dump_program: cli.dump_program.clone(),
        load_program: cli.load_program.clone(),
    };
    let backend = init_backend(preference, &selector).context("failed to initialize device")?;
    tracing::info!("Using {} backend: {}", backend.kind(), backend.name());

    let config = SegsumConfig::default()
        .with_group_size(cli.group_size)
        .with_num_groups(cli.num_groups)
        .with_tile_size(cli.tile_size)
        .with_detail_memory(cli.memory)
        .with_debug(cli.debug);
    let engine = RowSumEngine::new(backend, config);

    let matrix = match &cli.input {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
            read_matrix(BufReader::new(file)).with_context(|| format!("failed to read {}", path.display()))?
        }
        None => read_matrix(std::io::stdin().lock()).context("failed to read matrix from stdin")?,
    };
    tracing::info!("Read {}x{} matrix", matrix.nrows(), matrix.ncols());

    if cli.runs > 0 {
        // warmup
        engine.row_sums_with(matrix.view(), forced)?;
        engine.profile().reset();
    }

    let mut runtimes = Vec::with_capacity(cli.runs.max(1));
    let mut result = None;
    for _ in 0..cli.runs.max(1) {
        let start = Instant::now();
        let sums = engine.row_sums_with(matrix.view(), forced)?;
        runtimes.push(start.elapsed().as_micros());
        result = Some(sums);
    }

    if cli.runs > 0 {
        let mean = runtimes.iter().sum::<u128>() / runtimes.len() as u128;
        tracing::info!("{} runs, mean runtime {}us", runtimes.len(), mean);
    }

    if let Some(path) = &cli.write_runtime_to {
        let mut file = File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
        for runtime in &runtimes {
            writeln!(file, "{}", runtime)?;
        }
    }

    if let Some(sums) = result {
        write_vector(std::io::stdout().lock(), sums.view())?;
    }

    if cli.memory {
        eprintln!("{}", engine.arena().report());
    }
    if cli.debug {
        eprintln!("{}", engine.profile().snapshot());
    }

    Ok(())
}
