use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use kiln::cache::FileCache;
use kiln::environment::{Environment, EnvironmentConfig};
use kiln::registry::Registry;
use kiln::ui::{MachineReadableUi, Ui, WriterUi};

#[derive(Parser)]
#[command(
    name = "kiln",
    about = "Builds machine images from declarative templates",
    version,
    long_about = None
)]
struct Cli {
    /// Enable verbose output (use -vv for debug output)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit machine-readable, line-oriented output for scripting
    #[arg(long, global = true)]
    machine_readable: bool,

    /// Additional plugin search directory (repeatable, searched in order)
    #[arg(long = "plugin-dir", global = true)]
    plugin_dirs: Vec<PathBuf>,

    /// Prefer a discoverable plugin over a built-in of the same name
    #[arg(long, global = true)]
    prefer_plugins: bool,

    /// Cache directory for downloaded build dependencies
    #[arg(long, env = "KILN_CACHE_DIR", default_value = "kiln_cache")]
    cache_dir: PathBuf,

    /// Command name and arguments, resolved through the component registry
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut registry = Registry::with_defaults();
    for dir in &cli.plugin_dirs {
        registry.add_plugin_dir(dir.clone());
    }
    registry.prefer_plugins(cli.prefer_plugins);

    let ui: Arc<dyn Ui> = if cli.machine_readable {
        Arc::new(MachineReadableUi::stdout())
    } else {
        Arc::new(WriterUi::stdout())
    };

    std::fs::create_dir_all(&cli.cache_dir)?;
    let env = Environment::new(EnvironmentConfig {
        registry,
        ui,
        cache: Arc::new(FileCache::new(cli.cache_dir.clone())),
    });

    // An interrupt only triggers cancellation; the dispatcher performs the
    // same cleanup it would on any other exit path.
    {
        let env = Arc::clone(&env);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                env.cancel().await;
            }
        });
    }

    let code = env.run(&cli.args).await;
    std::process::exit(code);
}

fn init_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let filter = match verbose {
        0 => EnvFilter::new("kiln=warn"), // Default: warnings and errors only
        1 => EnvFilter::new("kiln=info"), // -v: info messages
        _ => EnvFilter::new("kiln=debug"), // -vv or more: full debug
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}
