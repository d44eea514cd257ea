use std::{error::Error, io, path::Path};

use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use forkq::{
    cli::{Cli, Commands, parse_args},
    config::{Config, load_config, parse_duration},
    hooks::{HookRegistry, register_command_hooks},
    runtime::{self, RuntimeMode},
    signals,
    status::{StatusReport, write_jobs},
    store::NewJob,
    supervisor::{Supervisor, SupervisorSettings},
};

fn main() -> Result<(), Box<dyn Error>> {
    let args = parse_args();
    init_logging(&args);
    runtime::init(if args.sys {
        RuntimeMode::System
    } else {
        RuntimeMode::User
    });

    let config = load(args.config.as_deref())?;

    match args.command {
        Commands::Start => {
            let code = start_foreground(config)?;
            std::process::exit(code);
        }
        Commands::Stop => stop_supervisors(&config)?,
        Commands::Status { json, no_color } => {
            let store = config.open_store()?;
            let report = StatusReport::collect(&*store)?;
            let mut stdout = io::stdout().lock();
            if json {
                report.write_json(&mut stdout)?;
            } else {
                report.write_table(&mut stdout, !no_color)?;
            }
        }
        Commands::Enqueue {
            queue,
            priority,
            delay,
            command,
        } => {
            let mut job = NewJob::new(queue, command.join(" ")).priority(priority);
            if let Some(delay) = delay {
                let delay = chrono::Duration::from_std(parse_duration(&delay)?)?;
                job = job.scheduled_at(Utc::now() + delay);
            }
            let store = config.open_store()?;
            let id = store.enqueue(job)?;
            println!("{id}");
        }
        Commands::Jobs { state, limit } => {
            let store = config.open_store()?;
            let jobs = store.jobs()?;
            write_jobs(&mut io::stdout().lock(), &jobs, state, limit)?;
        }
    }

    Ok(())
}

fn init_logging(args: &Cli) {
    let filter = if let Some(level) = args.log_level {
        EnvFilter::new(level.as_str())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

fn load(path: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    match load_config(path) {
        Ok(config) => Ok(config),
        Err(err) => {
            error!("Failed to load configuration: {err}");
            Err(err.into())
        }
    }
}

/// Runs the supervisor and returns the exit status for this OS process.
fn start_foreground(config: Config) -> Result<i32, Box<dyn Error>> {
    let topology = config.topology()?;
    let store = config.open_store()?;
    let hooks = HookRegistry::new();
    register_command_hooks(&hooks, &config.hooks);

    info!(
        "Starting forkq supervisor with {} child process(es), store at {}",
        topology.process_count(),
        config.store_dir().display()
    );
    let supervisor = Supervisor::new(
        topology,
        SupervisorSettings::from_config(&config),
        store,
        hooks,
    );
    let exit = supervisor.start()?;
    Ok(exit.code())
}

fn stop_supervisors(config: &Config) -> Result<(), Box<dyn Error>> {
    let store = config.open_store()?;
    let report = StatusReport::collect(&*store)?;
    let mut stopped = 0;
    for status in report.local_supervisors() {
        let pid = status.registration.identity.pid;
        info!("Sending SIGTERM to supervisor {pid}");
        signals::terminate(nix::unistd::Pid::from_raw(pid as i32))?;
        stopped += 1;
    }
    if stopped == 0 {
        warn!("No running forkq supervisor found");
    }
    Ok(())
}
