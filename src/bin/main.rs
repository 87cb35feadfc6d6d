use std::{
    error::Error,
    io::{self, IsTerminal, Write},
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::Utc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tandem::{
    cli::{Cli, Commands, parse_args},
    config,
    constants::DEFAULT_TAIL_LINES,
    control::ControlOutcome,
    ipc::ControlResponse,
    runtime::{self, RuntimeMode},
    status::render_table,
    system::{System, SystemOptions},
};

fn main() -> ExitCode {
    let args = parse_args();
    init_logging(&args);

    if args.sys {
        runtime::init(RuntimeMode::System);
    }

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
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

fn load_system(args: Cli) -> Result<(System, Commands), Box<dyn Error>> {
    let base_dir = std::env::current_dir()?;
    let config_path = config::find_config_path(args.file.as_deref(), &base_dir);
    let system = System::load(
        &config_path,
        SystemOptions {
            project: args.project_name,
            context: args.context,
            merge: args.manifest.into(),
        },
    )?;
    Ok((system, args.command))
}

fn run(args: Cli) -> Result<(), Box<dyn Error>> {
    let (system, command) = load_system(args)?;

    match command {
        Commands::Up { services } => {
            if services.is_empty() {
                info!("Bringing up '{}'", system.name);
            }
            report(system.up(&services)?);
        }
        Commands::Down { services } => report(system.down(&services)?),
        Commands::Start { services } => report(system.start(&services)?),
        Commands::Stop { services } => report(system.stop(&services)?),
        Commands::Restart { services } => report(system.restart(&services)?),
        Commands::Kill { signal, services } => {
            report(system.kill(&services, signal.as_deref())?)
        }
        Commands::Top { services, no_color } => {
            let colored = !no_color && io::stdout().is_terminal();
            match system.top(&services)? {
                ControlOutcome::Done(ControlResponse::Status(rows)) => {
                    print!("{}", render_table(&rows, colored, Utc::now()));
                }
                other => report(vec![other]),
            }
        }
        Commands::Logs {
            follow,
            tail,
            services,
        } => {
            let running = Arc::new(AtomicBool::new(true));
            if follow {
                let running = Arc::clone(&running);
                ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))?;
            }
            let tail = tail.map_or(Some(DEFAULT_TAIL_LINES), |t| t.0);
            let mut stdout = io::stdout().lock();
            let outcomes = system.logs(&services, follow, tail, &mut stdout, &running)?;
            stdout.flush()?;
            report(
                outcomes
                    .into_iter()
                    .filter(|o| !matches!(o, ControlOutcome::Done(ControlResponse::Log { .. })))
                    .collect(),
            );
        }
        Commands::Reload => {
            system.reload()?;
            info!("Supervising process for '{}' reloaded", system.name);
        }
        Commands::Config { services } => {
            if services {
                for name in system.service_names() {
                    println!("{name}");
                }
            } else {
                print!("{}", system.manifest()?.render());
            }
        }
    }

    Ok(())
}

/// Prints what the supervising process had to say. Channel failures were already
/// logged by the control plane.
fn report(outcomes: Vec<ControlOutcome>) {
    for outcome in outcomes {
        match outcome {
            ControlOutcome::Done(ControlResponse::Message(message)) => println!("{message}"),
            ControlOutcome::Done(ControlResponse::Error(message)) => eprintln!("{message}"),
            ControlOutcome::Done(ControlResponse::Status(rows)) => {
                print!("{}", render_table(&rows, false, Utc::now()));
            }
            ControlOutcome::Done(ControlResponse::Ok | ControlResponse::Log { .. }) => {}
            ControlOutcome::Failed(reason) => eprintln!("{reason}"),
        }
    }
}
