//! Environment-derived configuration. Mirrors `nodm.c`'s `read_config`:
//! six `NODM_*` variables, all optional, folded together with the
//! `--nested` flag into one immutable snapshot handed to the `Supervisor`.

use std::env;

use crate::cli::Cli;
use crate::error::Error;
use crate::x_options::{self, ParsedXOptions};

const DEFAULT_USER: &str = "root";
const DEFAULT_XSESSION: &str = "/etc/X11/Xsession";
const DEFAULT_MIN_SESSION_TIME: u64 = 60;
const DEFAULT_X_TIMEOUT: u64 = 30;
const DEFAULT_FIRST_VT: i32 = 7;
const NESTED_X_OPTIONS: &str = "/usr/bin/Xnest :1";

#[derive(Debug, Clone)]
pub struct Config {
    pub run_as_user: String,
    pub session_command: String,
    pub x_argv: Vec<String>,
    pub display_name: String,
    pub minimum_session_time_seconds: u64,
    pub x_timeout_seconds: u64,
    /// Lowest VT number to probe from; `-1` disables allocation entirely.
    pub first_vt: i32,
    pub nested: bool,
    pub use_pam: bool,
    pub cleanup_xsession_errors: bool,
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_u64(name: &str, default: u64) -> Result<u64, Error> {
    match env_var(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| Error::BadArg(format!("{name} must be a non-negative integer, got '{value}'"))),
    }
}

fn parse_i32(name: &str, default: i32) -> Result<i32, Error> {
    match env_var(name) {
        None => Ok(default),
        Some(value) => value
            .parse()
            .map_err(|_| Error::BadArg(format!("{name} must be an integer, got '{value}'"))),
    }
}

impl Config {
    pub fn from_env(cli: &Cli) -> Result<Self, Error> {
        let run_as_user = if cli.nested {
            String::new()
        } else {
            env_var("NODM_USER").unwrap_or_else(|| DEFAULT_USER.to_string())
        };

        let session_command =
            env_var("NODM_XSESSION").unwrap_or_else(|| DEFAULT_XSESSION.to_string());

        let x_options_raw = env_var("NODM_X_OPTIONS").unwrap_or_else(|| {
            if cli.nested {
                NESTED_X_OPTIONS.to_string()
            } else {
                String::new()
            }
        });

        let ParsedXOptions {
            argv,
            display_name,
            vt_override,
        } = x_options::parse_words(x_options::shell_split(&x_options_raw)?);

        let minimum_session_time_seconds =
            parse_u64("NODM_MIN_SESSION_TIME", DEFAULT_MIN_SESSION_TIME)?;
        let x_timeout_seconds = parse_u64("NODM_X_TIMEOUT", DEFAULT_X_TIMEOUT)?;

        let first_vt = if cli.nested {
            -1
        } else if vt_override {
            -1
        } else {
            parse_i32("NODM_FIRST_VT", DEFAULT_FIRST_VT)?
        };

        Ok(Config {
            run_as_user,
            session_command,
            x_argv: argv,
            display_name,
            minimum_session_time_seconds,
            x_timeout_seconds,
            first_vt,
            nested: cli.nested,
            use_pam: !cli.nested,
            cleanup_xsession_errors: !cli.nested,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_defaults_disable_vt_pam_and_user_switch() {
        let cli = Cli {
            action: crate::cli::Action::Run,
            verbose: false,
            quiet: false,
            nested: true,
            syslog: crate::cli::Tristate::Unset,
            stderr: crate::cli::Tristate::Unset,
        };

        // SAFETY: test runs single-threaded within this process; no other
        // test in this module reads these variables concurrently.
        unsafe {
            env::remove_var("NODM_X_OPTIONS");
            env::remove_var("NODM_USER");
            env::remove_var("NODM_FIRST_VT");
        }

        let config = Config::from_env(&cli).unwrap();
        assert_eq!(config.run_as_user, "");
        assert!(!config.use_pam);
        assert_eq!(config.first_vt, -1);
        assert_eq!(config.x_argv[0], "/usr/bin/Xnest");
    }
}
