use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use pixly_core::{
    init_logging, run_conversion, CancelToken, EngineConfig, LogConfig, ProcessingMode,
};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser)]
#[command(name = "pixly")]
#[command(version, about = "Batch media optimizer - JXL for stills, AVIF for animations, MOV rewraps for video", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert every eligible file under a directory
    Convert {
        /// Target directory
        #[arg(value_name = "DIR")]
        input: PathBuf,

        /// Processing mode
        #[arg(short, long, value_enum, default_value = "auto")]
        mode: CliMode,

        /// Worker count (0 = derive from CPU count)
        #[arg(short, long, default_value_t = 0)]
        jobs: usize,

        /// Write converted files into a mirror of the input tree here
        /// instead of replacing sources in place
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Decide and report, but write nothing
        #[arg(long)]
        dry_run: bool,

        /// Cap concurrently running encoder processes
        #[arg(long)]
        max_encoders: Option<usize>,

        /// Run without the learning store (predictions stay untuned)
        #[arg(long)]
        no_store: bool,

        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum CliMode {
    Auto,
    Quality,
    Emoji,
}

impl From<CliMode> for ProcessingMode {
    fn from(mode: CliMode) -> Self {
        match mode {
            CliMode::Auto => ProcessingMode::Auto,
            CliMode::Quality => ProcessingMode::Quality,
            CliMode::Emoji => ProcessingMode::Emoji,
        }
    }
}

fn main() {
    std::process::exit(real_main());
}

fn real_main() -> i32 {
    let log_level = if std::env::var("PIXLY_VERBOSE").is_ok() {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let _ = init_logging("pixly", LogConfig::default().with_level(log_level));

    let cli = Cli::parse();

    match cli.command {
        Commands::Convert {
            input,
            mode,
            jobs,
            output,
            dry_run,
            max_encoders,
            no_store,
            verbose,
        } => {
            let mut config = match EngineConfig::load() {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("❌ {}", e);
                    return 1;
                }
            };
            config.mode = mode.into();
            if jobs > 0 {
                config.workers = jobs;
            }
            config.output_dir = output;
            config.dry_run = dry_run;
            if max_encoders.is_some() {
                config.max_concurrent_encoders = max_encoders;
            }
            config.no_store = config.no_store || no_store;
            config.verbose = config.verbose || verbose;
            config.min_reduction = config.effective_min_reduction();

            if dry_run {
                eprintln!("📝 Dry run: decisions only, nothing is written");
            }
            if config.mode == ProcessingMode::Emoji {
                eprintln!("😀 Emoji mode: AVIF targets, ≥7% reduction required");
            }
            if config.mode == ProcessingMode::Quality {
                eprintln!("💎 Quality mode: lossless rules only");
            }
            match &config.output_dir {
                Some(dir) => eprintln!("📁 Output mirror: {}", dir.display()),
                None => eprintln!("🔄 In-place mode: sources are replaced after verification"),
            }

            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                if let Err(e) = ctrlc::set_handler(move || {
                    eprintln!(
                        "\n🛑 {} finishing in-flight files…",
                        style("Interrupt received,").yellow().bold()
                    );
                    cancel.cancel();
                }) {
                    tracing::warn!(error = %e, "Could not install ctrl-c handler");
                }
            }

            let started = Instant::now();
            match run_conversion(&config, &input, cancel) {
                Ok(result) => {
                    result.summary.print(started.elapsed());
                    result.summary.exit_code()
                }
                Err(e) => {
                    eprintln!("❌ {}", e);
                    e.exit_code()
                }
            }
        }
    }
}
