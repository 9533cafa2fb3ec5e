//! Tabletop Camera/Projector Tracker
//!
//! Entry point for the tablemap-tracker replay binary: loads the
//! configuration and stored calibration, then runs the tracking loop over a
//! directory of recorded frames and logs the overlay batches it produces.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};

use tablemap_tracker::camera::ImageSequenceSource;
use tablemap_tracker::config::load_config;
use tablemap_tracker::error::{ConfigurationError, RuntimeError};
use tablemap_tracker::render::RenderCommand;
use tablemap_tracker::{TrackerApp, TrackerError};

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("usage: {} <config.json> <frames-dir>", args[0]);
        return ExitCode::from(2);
    }
    let config_path = PathBuf::from(&args[1]);
    let frames_dir = PathBuf::from(&args[2]);

    log::info!("Tablemap tracker starting...");

    let config = match load_config(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let mut app = match TrackerApp::new(config) {
        Ok(app) => app,
        Err(e) => {
            log::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = app.load_calibration() {
        log::warn!("No usable calibration: {}", e);
    }

    let source = match ImageSequenceSource::from_dir(&frames_dir) {
        Ok(s) => s,
        Err(TrackerError::Configuration(ConfigurationError::MissingDevice)) => {
            log::error!("No frames to replay in {}", frames_dir.display());
            return ExitCode::FAILURE;
        }
        Err(e) => {
            log::error!("Cannot read frames from {}: {}", frames_dir.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let frame_count = source.len() as u64;

    let overlays = app.overlay_receiver();
    match app.start_tracking(source) {
        Ok(()) => {}
        Err(TrackerError::Runtime(RuntimeError::CalibrationMissing)) => {
            log::error!("Tracking needs a complete calibration; run the calibration sessions first");
            return ExitCode::FAILURE;
        }
        Err(e) => {
            log::error!("Failed to start tracking: {}", e);
            return ExitCode::FAILURE;
        }
    }

    let started = Instant::now();
    loop {
        if let Some(batch) = overlays.recv_timeout(Duration::from_millis(100)) {
            for command in &batch.commands {
                match command {
                    RenderCommand::DrawOverlay { marker_id, shape } => {
                        log::info!("cycle {}: draw {} {:?}", batch.cycle, marker_id, shape)
                    }
                    RenderCommand::ClearOverlay { marker_id } => {
                        log::info!("cycle {}: clear {}", batch.cycle, marker_id)
                    }
                }
            }
        }
        let processed = app
            .tracking_stats()
            .map(|s| s.completed + s.abandoned)
            .unwrap_or(0);
        if processed >= frame_count || !app.is_tracking() {
            break;
        }
    }

    let stats = app.tracking_stats();
    let result = app.stop_tracking();
    if let Some(stats) = stats {
        log::info!(
            "Processed {} frames in {:.1}s: {} completed, {} abandoned, {} capture failures",
            frame_count,
            started.elapsed().as_secs_f64(),
            stats.completed,
            stats.abandoned,
            stats.capture_failures
        );
    }
    match result {
        Ok(_) => ExitCode::SUCCESS,
        // The replay source reports failures once it runs out of frames.
        Err(TrackerError::Runtime(RuntimeError::DeviceLost { .. }))
            if stats.is_some_and(|s| s.completed + s.abandoned >= frame_count) =>
        {
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Tracking ended with an error: {}", e);
            ExitCode::FAILURE
        }
    }
}
