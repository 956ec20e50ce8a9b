//! nextalk — an always-resident offline voice-input daemon for Linux
//! desktops.
//!
//! CLI forms:
//! - `nextalk` — start the primary instance; fails with exit 1 if one is
//!   already running.
//! - `nextalk --toggle` / `--show` / `--hide` — forward a command to a
//!   running primary, or start one and apply the command immediately.
//! - `nextalk audio` — interactive input-device picker.
//!
//! No window, tray, or global hotkey binding lives here: hotkey binding
//! is delegated to the desktop environment (invoking `nextalk --toggle`),
//! and any UI is treated as an external collaborator.

mod diagnostic_log;
mod framing;
mod ime_client;
mod session;
mod settings;
mod single_instance;

use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use diagnostic_log::{DiagnosticLog, Level};
use nextalk_core::asr::init::initialize_preferred;
use nextalk_core::audio::device::enumerate_input_devices;
use nextalk_core::pipeline::{FlushPolicy, Pipeline};
use session::{ArboardSink, ControllerEvent, SessionController};
use settings::{default_settings_path, load_settings, save_settings};
use single_instance::{Command, Instance};

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nextalk=info".parse().unwrap()),
        )
        .init();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    Start,
    Toggle,
    Show,
    Hide,
    Audio,
}

fn parse_args(args: &[String]) -> Invocation {
    match args.first().map(String::as_str) {
        Some("--toggle") => Invocation::Toggle,
        Some("--show") => Invocation::Show,
        Some("--hide") => Invocation::Hide,
        Some("audio") => Invocation::Audio,
        _ => Invocation::Start,
    }
}

fn main() -> ExitCode {
    init_tracing();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = parse_args(&args);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    runtime.block_on(run(invocation))
}

async fn run(invocation: Invocation) -> ExitCode {
    let log = DiagnosticLog::at_default_location();
    log.log(Level::Info, "main", &format!("nextalk invoked: {invocation:?}"));

    if invocation == Invocation::Audio {
        return run_audio_picker();
    }

    let command_socket = single_instance::default_socket_path();
    let instance = match single_instance::claim(&command_socket).await {
        Ok(instance) => instance,
        Err(e) => {
            error!("failed to claim command channel: {e}");
            log.log(Level::Error, "main", &format!("command channel claim failed: {e}"));
            return ExitCode::FAILURE;
        }
    };

    match instance {
        Instance::Secondary => run_secondary(&command_socket, invocation).await,
        Instance::Primary(commands_rx) => {
            let initial = match invocation {
                Invocation::Toggle => Some(Command::Toggle),
                Invocation::Show => Some(Command::Show),
                Invocation::Hide => Some(Command::Hide),
                Invocation::Start => None,
                Invocation::Audio => unreachable!("handled before single-instance claim"),
            };
            start_daemon(commands_rx, initial, &log).await
        }
    }
}

async fn run_secondary(socket: &PathBuf, invocation: Invocation) -> ExitCode {
    let command = match invocation {
        Invocation::Toggle => Command::Toggle,
        Invocation::Show => Command::Show,
        Invocation::Hide => Command::Hide,
        Invocation::Start => {
            error!("a primary instance is already running");
            return ExitCode::FAILURE;
        }
        Invocation::Audio => unreachable!("handled before single-instance claim"),
    };
    match single_instance::send_to_primary(socket, command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("failed to reach the primary instance: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn start_daemon(
    commands_rx: mpsc::UnboundedReceiver<Command>,
    initial_command: Option<Command>,
    log: &DiagnosticLog,
) -> ExitCode {
    let settings_path = default_settings_path();
    let settings = load_settings(&settings_path);
    let _ = save_settings(&settings_path, &settings);
    info!(
        path = ?settings_path,
        engine = ?settings.preferred_engine,
        device = ?settings.preferred_input_device,
        "settings loaded"
    );

    let initialized = match initialize_preferred(settings.preferred_engine) {
        Ok(initialized) => initialized,
        Err(e) => {
            error!("no ASR engine available: {e}");
            log.log(Level::Fatal, "main", &format!("engine initializer exhausted: {e}"));
            return ExitCode::FAILURE;
        }
    };
    if initialized.fallback_occurred {
        let reason = initialized.fallback_reason.clone().unwrap_or_default();
        warn!(
            preferred = ?settings.preferred_engine,
            actual = ?initialized.kind,
            reason = %reason,
            "engine fallback occurred"
        );
        log.log(
            Level::Warn,
            "engine",
            &format!(
                "fallback occurred: preferred={:?} actual={:?} reason={reason}",
                settings.preferred_engine, initialized.kind
            ),
        );
    }

    let pipeline = Pipeline::new(initialized.engine);
    let ime = ime_client::ImeClient::with_default_socket();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (controller, mut state_rx) =
        SessionController::new(pipeline.clone(), ime, ArboardSink, events_tx.clone());
    session::spawn_pipeline_forwarder(&pipeline, events_tx.clone());
    session::spawn_command_forwarder(commands_rx, events_tx.clone());

    if let Some(command) = initial_command {
        let _ = events_tx.send(ControllerEvent::Command(command));
    }

    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = state_rx.borrow().clone();
            debug!(?state, "capsule state changed");
        }
    });

    info!("nextalk primary instance running");
    tokio::select! {
        () = controller.run(events_rx) => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to install shutdown signal handler: {e}");
            }
            info!("shutdown signal received, stopping pipeline");
            let _ = pipeline.stop(FlushPolicy::Discard);
        }
    }

    ExitCode::SUCCESS
}

fn run_audio_picker() -> ExitCode {
    let devices = enumerate_input_devices();
    if devices.is_empty() {
        eprintln!("no input devices found");
        return ExitCode::FAILURE;
    }

    println!("Available input devices:");
    for (i, device) in devices.iter().enumerate() {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_recommended {
            tags.push("recommended");
        }
        if !device.available {
            tags.push("unavailable");
        }
        let suffix = if tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tags.join(", "))
        };
        println!("  {}) {}{suffix}", i + 1, device.name);
    }

    print!("Select a device (number, or Enter to cancel): ");
    let _ = std::io::stdout().flush();
    let mut input = String::new();
    if std::io::stdin().read_line(&mut input).is_err() {
        eprintln!("failed to read selection");
        return ExitCode::FAILURE;
    }
    let input = input.trim();
    if input.is_empty() {
        println!("cancelled");
        return ExitCode::SUCCESS;
    }

    let Ok(choice) = input.parse::<usize>() else {
        eprintln!("not a number: {input}");
        return ExitCode::FAILURE;
    };
    let Some(device) = choice.checked_sub(1).and_then(|i| devices.get(i)) else {
        eprintln!("out of range: {choice}");
        return ExitCode::FAILURE;
    };

    let settings_path = default_settings_path();
    let mut settings = load_settings(&settings_path);
    settings.preferred_input_device = Some(device.name.clone());
    settings.normalize();
    match save_settings(&settings_path, &settings) {
        Ok(()) => {
            println!("saved \"{}\" as the preferred input device.", device.name);
            println!("restart nextalk for the change to take effect.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("failed to save settings: {e}");
            ExitCode::FAILURE
        }
    }
}
