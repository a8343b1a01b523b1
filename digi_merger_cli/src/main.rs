use clap::{Arg, Command};
use indicatif::{MultiProgress, ProgressBar};
use indicatif_log_bridge::LogWrapper;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use libdigi_merger::config::Config;
use libdigi_merger::process::{dump_events, process};

fn make_template_config(path: &Path) {
    match Config::default().write_config_file(path) {
        Ok(()) => log::info!("Done."),
        Err(e) => log::error!("Could not write template config: {e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("digi_merger_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("dump")
                .about("Print the configured keys of the first events as yaml")
                .arg(
                    Arg::new("n_events")
                        .short('n')
                        .long("n-events")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("10")
                        .help("Number of events to print"),
                ),
        )
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

    if let Err(e) = LogWrapper::new(pb_manager.clone(), logger).try_init() {
        eprintln!("Could not create logging/progress: {e}");
        return;
    }

    // Parse the cli
    let config_path = match matches.get_one::<String>("path") {
        Some(p) => PathBuf::from(p),
        None => {
            log::error!("A configuration path is required");
            return;
        }
    };

    if let Some(("new", _)) = matches.subcommand() {
        log::info!(
            "Making a template config at {}...",
            config_path.to_string_lossy()
        );
        make_template_config(&config_path);
        return;
    }

    // Load our config
    log::info!("Loading config from {}...", config_path.to_string_lossy());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{e}");
            return;
        }
    };
    log::info!("Config successfully loaded.");
    for group in config.groups.iter() {
        log::info!(
            "Group {}: {} stream(s), format {}",
            group.name,
            group.streams.len(),
            group
                .format
                .map(|f| f.to_string())
                .unwrap_or_else(|| String::from("sniffed"))
        );
    }
    log::info!("Mode: {:?} Window: {}", config.mode, config.window);

    if let Some(("dump", sub)) = matches.subcommand() {
        let n_events = sub.get_one::<usize>("n_events").copied().unwrap_or(10);
        let mut stdout = std::io::stdout().lock();
        match dump_events(&config, n_events, &mut stdout) {
            Ok(n) => log::info!("Dumped {n} events."),
            Err(e) => log::error!("Dump failed with error: {e}"),
        }
        return;
    }

    // Setup the progress bar
    let pb = pb_manager.add(ProgressBar::new(100));
    let status = Arc::new(Mutex::new(0.0));
    let sent_status = status.clone();
    // Spawn the task!
    let handle = std::thread::spawn(|| process(config, sent_status));

    loop {
        // No UI here, so sleep for ~ 1 sec before trying to update
        std::thread::sleep(std::time::Duration::from_secs(1));
        match status.lock() {
            Ok(stat) => pb.set_position((*stat * 100.0) as u64),
            Err(e) => log::error!("{e}"),
        }

        if handle.is_finished() {
            match handle.join() {
                Ok(result) => match result {
                    Ok(summary) => log::info!(
                        "Successfully merged {} events ({} coincidences)!",
                        summary.n_events,
                        summary.coincidences
                    ),
                    Err(e) => log::error!("Merging failed with error: {e}"),
                },
                Err(_) => log::error!("Failed to join merging task!"),
            }
            break;
        }
    }

    pb.finish();

    log::info!("Done.");
}
