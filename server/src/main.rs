use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use ttp_common::{
    CandleFitter, JsonlTelemetrySource, TelemetrySource, TimeWindow, TrainOptions, TtpError,
};

use ttp_server::commands::{self, parse_time, TrainArgs};
use ttp_server::{
    setup_signal_handlers, PipelineRunner, ServerConfig, ShutdownCoordinator, SourceFactory,
};

#[derive(Parser, Debug)]
#[command(name = "ttp")]
#[command(about = "Transmission-time predictor: training and daily continual learning", long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    /// Override the telemetry directory from the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Fix the seed for weight init, shuffling and replay sampling
    #[arg(long)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train every horizon from a telemetry window, or continue from saved models
    Train {
        #[arg(long, value_parser = parse_time, conflicts_with = "continual")]
        from: Option<DateTime<Utc>>,

        #[arg(long, value_parser = parse_time, conflicts_with = "continual")]
        to: Option<DateTime<Utc>>,

        /// Only use sessions that ran this congestion control
        #[arg(long)]
        cc: Option<String>,

        /// Directory of models to start from
        #[arg(long)]
        load: Option<PathBuf>,

        /// Output directory; must not already hold models
        #[arg(long)]
        save: PathBuf,

        /// Replay-sample the recent days and fine-tune the models in --load
        #[arg(long, requires = "load")]
        continual: bool,

        /// Hold out a validation split and record its loss
        #[arg(long)]
        tune: bool,
    },

    /// Evaluate saved models on a labeled set
    Infer {
        #[arg(long)]
        load: PathBuf,

        #[arg(long)]
        data: PathBuf,
    },

    /// Write the rows of a telemetry window as a labeled set
    Export {
        #[arg(long, value_parser = parse_time)]
        from: DateTime<Utc>,

        #[arg(long, value_parser = parse_time)]
        to: DateTime<Utc>,

        #[arg(long)]
        cc: Option<String>,

        #[arg(long)]
        out: PathBuf,
    },

    /// Run the daily continual-learning loop
    Serve,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "ttp_server=debug,ttp_common=debug"
    } else {
        "ttp_server=info,ttp_common=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<TtpError>().map(|e| e.exit_code()).unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = if args.config.exists() {
        ServerConfig::load(&args.config)?
    } else {
        warn!("Config file {} not found, using defaults", args.config.display());
        ServerConfig::default()
    };
    if let Some(dir) = args.data_dir {
        config.telemetry.data_dir = dir;
    }
    if let Some(seed) = args.seed {
        config.model.seed = Some(seed);
    }
    config.validate()?;

    match args.command {
        Command::Train {
            from,
            to,
            cc,
            load,
            save,
            continual,
            tune,
        } => {
            let train = TrainArgs {
                from,
                to,
                cc: cc.or_else(|| config.telemetry.cc.clone()),
                load,
                save,
                continual,
                tune,
            };
            commands::check_train_args(&train, &config.model)?;
            let source = JsonlTelemetrySource::open(&config.telemetry.data_dir)?;
            let cancel = AtomicBool::new(false);
            let summaries = commands::run_train(&config.model, &source, &train, Utc::now(), &cancel)?;
            for s in &summaries {
                info!(
                    "[horizon {}] {} rows, {} epochs, final loss {:.6}",
                    s.horizon, s.rows, s.epochs, s.train_loss
                );
            }
            if source.malformed_lines() > 0 {
                warn!("Skipped {} malformed telemetry lines", source.malformed_lines());
            }
            info!("Models saved to {}", train.save.display());
        }

        Command::Infer { load, data } => {
            let results = commands::run_infer(&config.model, &load, &data)?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }

        Command::Export { from, to, cc, out } => {
            let source = JsonlTelemetrySource::open(&config.telemetry.data_dir)?;
            let window = TimeWindow::new(from, to)?;
            let cc = cc.or_else(|| config.telemetry.cc.clone());
            let rows = commands::run_export(&config.model, &source, &window, cc, &out)?;
            info!("Wrote {} labeled rows to {}", rows, out.display());
        }

        Command::Serve => serve(config)?,
    }

    Ok(())
}

fn serve(config: ServerConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("ttp-serve")
        .build()?;

    runtime.block_on(async move {
        info!("TTP continual learning v{}", env!("CARGO_PKG_VERSION"));
        info!("Models root: {}", config.pipeline.models_root.display());
        info!("Published link: {}", config.pipeline.published_path().display());
        info!("Daily rotation at {:02}:00 UTC", config.pipeline.scheduled_hour_utc);

        // Opened per rotation so a store that is down at startup is retried.
        let data_dir = config.telemetry.data_dir.clone();
        let source: SourceFactory = Arc::new(move || {
            JsonlTelemetrySource::open(&data_dir).map(|s| Arc::new(s) as Arc<dyn TelemetrySource>)
        });
        let fitter = Arc::new(CandleFitter::new(
            config.model.clone(),
            TrainOptions::from_config(&config.model, true, config.pipeline.tune),
        ));

        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(60)));
        setup_signal_handlers(coordinator.clone());

        let runner = PipelineRunner::new(config, source, fitter);
        runner.run(&coordinator).await?;
        Ok::<(), anyhow::Error>(())
    })
}
