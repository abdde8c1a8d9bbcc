//! Entry point: parse the command line, validate privileges, build the
//! environment-derived configuration, start logging, then hand control to
//! the [`supervisor::Supervisor`]. Mirrors `nodm.c`'s `main`.

mod child;
mod cli;
mod config;
mod error;
mod logging;
mod pam_session;
mod signals;
mod supervisor;
mod vt;
mod x_options;
mod xserver;
mod xsession;

use std::process::exit;

use log::info;
use nix::unistd::Uid;

use cli::{Action, Cli};
use config::Config;
use error::Error;
use logging::{LogConfig, Verbosity};
use supervisor::Supervisor;

fn main() {
    let cli = match Cli::parse() {
        Ok(cli) => cli,
        Err(err) => {
            eprintln!("nodm: {err}");
            eprint!("{}", cli::usage());
            exit(err.exit_code());
        }
    };

    match cli.action {
        Action::Help => {
            print!("{}", cli::usage());
            exit(0);
        }
        Action::Version => {
            println!("{}", cli::version());
            exit(0);
        }
        Action::Run => {}
    }

    if let Err(err) = check_privileges(&cli) {
        eprintln!("nodm: {err}");
        exit(err.exit_code());
    }

    let err = run(&cli);
    log_final_error(&err);
    exit(err.exit_code());
}

/// Unless running nested, `nodm` manages real VTs, PAM sessions and user
/// switches, all of which require uid 0.
fn check_privileges(cli: &Cli) -> Result<(), Error> {
    if cli.nested || Uid::effective().is_root() {
        Ok(())
    } else {
        Err(Error::NoPerm)
    }
}

/// Builds configuration, starts logging, then runs the supervisor until a
/// terminal condition is reached. `nodm` never exits with success while
/// actually supervising a session: the only clean stop is `UserQuit`.
fn run(cli: &Cli) -> Error {
    let attempt = || -> Result<Error, Error> {
        let config = Config::from_env(cli)?;

        let verbosity = if cli.verbose {
            Verbosity::Verbose
        } else if cli.quiet {
            Verbosity::Warn
        } else {
            Verbosity::Info
        };

        logging::init(&LogConfig {
            program_name: "nodm",
            log_to_syslog: cli.syslog.resolve(!cli.nested),
            log_to_stderr: cli.stderr.resolve(cli.nested),
            verbosity,
        })?;

        info!("nodm starting up (nested={})", cli.nested);

        let mut supervisor = Supervisor::new(&config);
        supervisor.start()?;

        Ok(supervisor.wait_restart_loop())
    };

    attempt().unwrap_or_else(|err| err)
}

/// `logging::init` may never have run (e.g. a bad `NODM_*` value rejected
/// before it gets there), so this always writes to stderr directly in
/// addition to whatever sinks happen to be live.
fn log_final_error(err: &Error) {
    eprintln!("nodm: {err}");
    match err {
        Error::UserQuit => info!("nodm shutting down: {err}"),
        _ => log::error!("nodm exiting: {err}"),
    }
}
