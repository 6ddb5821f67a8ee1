//! `handeye-cli` – HandEye Command Line Interface
//!
//! Entry point of the HandEye telemetry stack.  It:
//!
//! 1. Loads `~/.handeye/config.toml`, writing the defaults on first run.
//! 2. `handeye run` streams a simulated depth sensor through the telemetry
//!    pipeline to the configured transport (a simulated peripheral, or the
//!    host Bluetooth adapter in builds with the `ble` feature) and prints
//!    link activity.
//! 3. `handeye config` shows the effective configuration.
//! 4. Intercepts **Ctrl-C** to release the peripheral and print a summary.

mod config;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use colored::Colorize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use handeye_hal::SimDepthSensor;
use handeye_middleware::{BleTransport, EventBus, SimPeripheral, SimTransport, Topic, TopicReceiver};
use handeye_runtime::{PipelineRuntime, RuntimeReport, init_tracing};
use handeye_types::{EventPayload, HandEyeError, PeripheralState, PeripheralTarget};

use config::TransportKind;

// ─────────────────────────────────────────────────────────────────────────────
// Command line
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Run {
        seconds: Option<u64>,
        fps: Option<f64>,
    },
    Config,
    Help,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let mut args = args.into_iter();
    let command = match args.next().as_deref() {
        None | Some("run") => {
            let mut seconds = None;
            let mut fps = None;
            while let Some(flag) = args.next() {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for {flag}"))?;
                match flag.as_str() {
                    "--seconds" => {
                        seconds = Some(value.parse().map_err(|_| format!("invalid --seconds '{value}'"))?)
                    }
                    "--fps" => fps = Some(value.parse().map_err(|_| format!("invalid --fps '{value}'"))?),
                    other => return Err(format!("unknown option '{other}'")),
                }
            }
            Command::Run { seconds, fps }
        }
        Some("config") => Command::Config,
        Some("help" | "--help" | "-h") => Command::Help,
        Some(other) => return Err(format!("unknown command '{other}'")),
    };
    Ok(command)
}

fn main() {
    // Held until exit; flushes exported spans on drop.
    let _tracing = init_tracing("handeye");

    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            println!("{}: {e}\n", "Error".red().bold());
            print_help();
            std::process::exit(2);
        }
    };

    print_banner();
    let cfg = load_or_initialise();

    match command {
        Command::Help => print_help(),
        Command::Config => print_config(&cfg),
        Command::Run { seconds, fps } => {
            if let Err(e) = run(&cfg, seconds, fps) {
                println!("{}: {e}", "Run failed".red().bold());
                std::process::exit(1);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────────────────────────

fn load_or_initialise() -> config::Config {
    let mut cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {e}", "Error saving config".red()),
            }
            cfg
        }
        Err(e) => {
            println!("{}: {e}", "Config error".red());
            println!("  Using default configuration.");
            config::Config::default()
        }
    };
    for skipped in config::apply_overrides(&mut cfg, |key| std::env::var(key).ok()) {
        println!("{}: {skipped}", "Ignoring environment override".yellow());
    }
    cfg
}

fn print_config(cfg: &config::Config) {
    println!();
    println!("  {}", "Effective configuration".bold());
    match toml::to_string_pretty(cfg) {
        Ok(raw) => {
            for line in raw.lines() {
                println!("    {line}");
            }
        }
        Err(e) => println!("{}: {e}", "Failed to render config".red()),
    }
    println!();
    println!("  {}", "Environment overrides".bold());
    for var in config::OVERRIDE_VARS {
        match std::env::var(var) {
            Ok(v) => println!("    {} = {}", var.cyan(), v),
            Err(_) => println!("    {} {}", var.dimmed(), "(unset)".dimmed()),
        }
    }
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Run
// ─────────────────────────────────────────────────────────────────────────────

fn run(cfg: &config::Config, seconds: Option<u64>, fps: Option<f64>) -> Result<(), HandEyeError> {
    let pipeline_config = cfg.pipeline_config()?;
    let fps = fps.unwrap_or(cfg.sensor_fps);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – releasing peripheral …".yellow().bold());
        flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler");
    }

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|e| HandEyeError::Config(format!("failed to start async runtime: {e}")))?;

    runtime.block_on(async move {
        let bus = EventBus::default();
        let printer = tokio::spawn(print_events(
            bus.subscribe_to(Topic::Link),
            bus.subscribe_to(Topic::Telemetry),
        ));

        let transport = open_transport(cfg.transport, &pipeline_config.link.target).await?;
        println!("  Transport: {}", cfg.transport.to_string().bold());

        let mut pipeline = PipelineRuntime::start(pipeline_config, transport, bus);
        let sensor = SimDepthSensor::new("sim_tof", cfg.sensor_width, cfg.sensor_height);
        pipeline.attach_sensor(Box::new(sensor), fps)?;

        println!(
            "  Streaming simulated depth at {} fps{}.  Press {} to stop.\n",
            fps.to_string().bold(),
            seconds.map(|s| format!(" for {s} s")).unwrap_or_default(),
            "Ctrl-C".bold()
        );

        let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        let mut poll = tokio::time::interval(Duration::from_millis(100));
        loop {
            poll.tick().await;
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                info!("run duration elapsed");
                break;
            }
        }

        let report = pipeline.shutdown().await?;
        printer.abort();
        print_summary(&report);
        Ok::<(), HandEyeError>(())
    })
}

async fn open_transport(
    kind: TransportKind,
    target: &PeripheralTarget,
) -> Result<Arc<dyn BleTransport>, HandEyeError> {
    match kind {
        TransportKind::Sim => Ok(Arc::new(
            SimTransport::new(true)
                .with_peripheral(SimPeripheral::bystander("c4:4f:33:01:02:03", "Headphones"))
                .with_peripheral(SimPeripheral::for_target("24:6f:28:aa:bb:cc", target)),
        )),
        #[cfg(feature = "ble")]
        TransportKind::Ble => Ok(Arc::new(handeye_middleware::BluestTransport::new().await?)),
        #[cfg(not(feature = "ble"))]
        TransportKind::Ble => Err(HandEyeError::Config(
            "this build has no Bluetooth support; rebuild with `--features ble`".to_string(),
        )),
    }
}

async fn print_events(mut link: TopicReceiver, mut telemetry: TopicReceiver) {
    loop {
        let received = tokio::select! {
            r = link.recv() => r,
            r = telemetry.recv() => r,
        };
        let event = match received {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                println!("  {}", format!("… {n} events skipped").dimmed());
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match event.payload {
            EventPayload::LinkStateChanged { to, .. } => {
                let label = format!("{to}");
                let label = match to {
                    PeripheralState::Ready => label.green().bold(),
                    PeripheralState::Disconnected => label.red(),
                    _ => label.yellow(),
                };
                println!("  {} link {}", "◆".cyan(), label);
            }
            EventPayload::PeripheralDiscovered { name, rssi, .. } => println!(
                "  {} found {} ({})",
                "◇".cyan(),
                name.as_deref().unwrap_or("<unnamed>").bold(),
                rssi.map(|r| format!("{r} dBm")).unwrap_or_else(|| "rssi n/a".to_string())
            ),
            EventPayload::TelemetrySent(message) => {
                println!("  {} {:?}", "→".green(), message.as_bytes())
            }
            EventPayload::FrameDropped(_) | EventPayload::HardwareFault { .. } => {}
        }
    }
}

fn print_summary(report: &RuntimeReport) {
    let p = report.pipeline;
    let l = report.link;
    println!();
    println!("  {}", "Session summary".bold());
    println!("    frames processed   {}", p.frames);
    println!("    telemetry sent     {}", p.sent.to_string().green());
    println!("    rate limited       {}", p.rate_limited);
    println!("    degenerate grids   {}", p.degenerate);
    println!("    link not ready     {}", p.not_ready);
    println!("    writes confirmed   {}/{}", l.writes_confirmed, l.writes_dispatched);
    if l.writes_failed > 0 {
        println!("    writes failed      {}", l.writes_failed.to_string().red());
    }
    if let Some(pump) = report.pump {
        println!("    frames captured    {} ({} dropped)", pump.captured, pump.dropped);
    }
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner & help
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   _  _              _ ___         "#.bold().cyan());
    println!("{}", r#"  | || |__ _ _ _  __| | __|_  _ ___ "#.bold().cyan());
    println!("{}", r#"  | __ / _` | ' \/ _` | _|| || / -_)"#.bold().cyan());
    println!("{}", r#"  |_||_\__,_|_||_\__,_|___|\_, \___|"#.bold().cyan());
    println!("{}", r#"                           |__/     "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "HandEye".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Depth-grid telemetry for wearable haptics");
    println!();
}

fn print_help() {
    println!("  {}", "Usage".bold());
    println!("    handeye run [--seconds N] [--fps F]   stream simulated depth telemetry");
    println!("    handeye config                        show the effective configuration");
    println!("    handeye help                          show this message");
    println!();
}
