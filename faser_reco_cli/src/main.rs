use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use libfaser_reco::config::Config;
use libfaser_reco::error::ProcessorError;
use libfaser_reco::process::{create_subsets, process_subset};
use libfaser_reco::reconstruction::Reconstructor;
use libfaser_reco::worker_status::WorkerStatus;

const BAR_TEMPLATE: &str = "{prefix:>12} [{bar:40.cyan/blue}] {pos:>3}% {msg}";

struct Worker {
    handle: JoinHandle<Result<(), ProcessorError>>,
    bar: ProgressBar,
}

fn make_bar(pb_manager: &MultiProgress, worker_id: usize) -> ProgressBar {
    let style = ProgressStyle::with_template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let bar = pb_manager.add(ProgressBar::new(100));
    bar.set_style(style);
    bar.set_prefix(format!("worker {worker_id}"));
    bar
}

/// Update the bars from every message waiting on the channel
fn poll_messages(rx: &mpsc::Receiver<WorkerStatus>, workers: &[(usize, Worker)]) {
    while let Ok(status) = rx.try_recv() {
        if let Some((_, worker)) = workers.iter().find(|(id, _)| *id == status.worker_id) {
            worker
                .bar
                .set_position((status.progress.clamp(0.0, 1.0) * 100.0) as u64);
            worker.bar.set_message(format!(
                "run {} {}",
                status.run_number,
                status.stage.label()
            ));
        }
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("faser_reco_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .required(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    // Initialize feedback
    let logger = simplelog::TermLogger::new(
        simplelog::LevelFilter::Info,
        simplelog::Config::default(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    );

    let pb_manager = MultiProgress::new();

    LogWrapper::new(pb_manager.clone(), logger)
        .try_init()
        .expect("Could not create logging/progress!");

    // Parse the cli
    let Some(path) = matches.get_one::<String>("path") else {
        log::error!("A configuration path is required");
        return;
    };
    let config_path = PathBuf::from(path);

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        match Config::default().write_config_file(&config_path) {
            Ok(()) => log::info!("Done."),
            Err(e) => log::error!("Could not write template config: {e}"),
        }
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path).and_then(|c| {
        c.validate()?;
        Ok(c)
    }) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    log::info!("Input Path: {}", config.input_path.to_string_lossy());
    log::info!("Output Path: {}", config.output_path.to_string_lossy());
    match &config.geometry_path {
        Some(p) => log::info!("Geometry Path: {}", p.to_string_lossy()),
        None => log::info!("Geometry Path: None"),
    }
    match &config.channel_map_path {
        Some(p) => log::info!("Channel Map Path: {}", p.to_string_lossy()),
        None => log::info!("Channel Map Path: Default"),
    }
    log::info!(
        "First Run: {} Last Run: {}",
        config.first_run_number,
        config.last_run_number
    );
    log::info!("Number of Workers: {}", config.n_threads);

    let reco = match Reconstructor::from_config(&config) {
        Ok(r) => r,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };

    // Spawn the workers, one per non-empty subset of runs
    let (tx, rx) = mpsc::channel::<WorkerStatus>();
    let mut workers = Vec::new();
    for (idx, subset) in create_subsets(&config).into_iter().enumerate() {
        if subset.is_empty() {
            continue;
        }
        let conf = config.clone();
        let reco = reco.clone();
        let tx = tx.clone();
        let bar = make_bar(&pb_manager, idx);
        let handle = std::thread::spawn(move || process_subset(conf, reco, tx, idx, subset));
        workers.push((idx, Worker { handle, bar }));
    }
    drop(tx);

    while workers.iter().any(|(_, w)| !w.handle.is_finished()) {
        poll_messages(&rx, &workers);
        std::thread::sleep(Duration::from_millis(250));
    }
    poll_messages(&rx, &workers);

    let mut failed = false;
    for (idx, worker) in workers {
        worker.bar.finish();
        match worker.handle.join() {
            Ok(Ok(())) => log::info!("Worker {idx} complete"),
            Ok(Err(e)) => {
                failed = true;
                log::error!("Worker {idx} failed with error: {e}");
            }
            Err(_) => {
                failed = true;
                log::error!("An error occured joining worker {idx}!");
            }
        }
    }

    if failed {
        log::error!("Reconstruction finished with errors. Check the log above.");
        std::process::exit(1);
    }
    log::info!("Done.");
}
