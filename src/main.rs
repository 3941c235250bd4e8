#![warn(clippy::pedantic)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use async_std::task;
use chrono::Local;
use clap::{Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn};

use labsweep::communications::Comms;
use labsweep::configs;
use labsweep::control::Event;
use labsweep::session::{RunKind, Session};
use labsweep::sim::SimulatedLab;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Diode calibration and field sweeps on a magnetic resonance bench"
)]
struct Cli {
    /// Configuration file, looked up in the working directory and next to the executable
    #[arg(
        short,
        long,
        global = true,
        default_value = "config.toml",
        value_hint = ValueHint::FilePath
    )]
    config: PathBuf,

    /// Run once and exit. Without a command, serve remote commands until killed
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Trace the diode response over the scan range
    Scan,
    /// Scan, pick the maxima and equalise the diode voltage over them
    Calibrate,
    /// One field sweep with the configured source settings
    Sweep,
    /// Field sweeps over every (frequency, power) row of a table
    FreqSweep {
        #[arg(value_hint = ValueHint::FilePath)]
        table: PathBuf,
    },
}

impl From<Command> for RunKind {
    fn from(cmd: Command) -> Self {
        match cmd {
            Command::Scan => RunKind::Scan,
            Command::Calibrate => RunKind::Calibrate,
            Command::Sweep => RunKind::Sweep,
            Command::FreqSweep { table } => RunKind::FrequencySweep(table),
        }
    }
}

fn log_event(event: &Event) {
    match event {
        Event::Setpoint(_) | Event::Sample { .. } => debug!("{} {:?}", event.kind(), event.pair()),
        Event::DomainFallback { .. } | Event::NotConverged { .. } => {
            warn!("{} {:?}", event.kind(), event.pair());
        }
        Event::Converged { .. } | Event::SweepDone { .. } => {
            info!("{} {:?}", event.kind(), event.pair());
        }
    }
}

fn run_once(mut session: Session, kind: RunKind) -> Result<(), String> {
    session.start(kind).map_err(|e| e.to_string())?;
    loop {
        while let Ok(event) = session.events().try_recv() {
            log_event(&event);
        }
        if let Some(res) = session.poll() {
            while let Ok(event) = session.events().try_recv() {
                log_event(&event);
            }
            return res.map(|_| ()).map_err(|e| e.to_string());
        }
        thread::sleep(Duration::from_millis(50));
    }
}

async fn serve(mut session: Session, mut comms: Comms) {
    info!(
        "publishing on port {}, listening for commands on port {}",
        comms.logs_port(),
        comms.command_port()
    );
    loop {
        while let Some(request) = comms.handle_socket_request(&mut session).await {
            info!("handled socket request <{request}>");
        }
        while let Ok(event) = session.events().try_recv() {
            log_event(&event);
            if let Err(e) = comms.publish_event(&event).await {
                warn!("failed to publish event: {e}");
            }
        }
        // the outcome is logged by the session
        let _ = session.poll();
        task::sleep(Duration::from_millis(10)).await;
    }
}

fn run(config_file: &Path, kind: Option<RunKind>) -> Result<(), String> {
    let cfg = configs::load_config(config_file)?;
    let settings = configs::settings_from_config(&cfg)?;
    let lab = if settings.noisy {
        SimulatedLab::noisy()
    } else {
        SimulatedLab::new()
    };
    let mut bench = lab.bench(settings.realtime);
    if let Some(plan) = settings.bands.clone() {
        bench = bench
            .with_band_switch(plan, Box::new(lab.circulator()))
            .map_err(|e| e.to_string())?;
    }
    if let Some(kind) = kind {
        return run_once(Session::new(settings, bench), kind);
    }
    task::block_on(async {
        let comms = configs::comms_from_config(&settings).await?;
        serve(Session::new(settings, bench), comms).await;
        Ok::<(), String>(())
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(buf, "[{}] {} {}", Local::now(), record.level(), record.args())
        })
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(&cli.config, cli.command.map(RunKind::from)) {
        error!("{e}");
        process::exit(1);
    }
}
