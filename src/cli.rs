//! Command line parsing. Long options only, no option arguments of its own
//! (every flag is boolean) — mirrors `nodm.c`'s `getopt_long` table, minus
//! the short forms that table never defined in the first place.

use std::env::args;

use crate::error::Error;

pub fn usage() -> String {
    format!(
        r#"nodm {version}
A minimal auto-login display manager

USAGE: nodm [OPTIONS]

OPTIONS:
        --help          Print this help and exit
        --version       Print the version and exit
        --verbose       Log at verbose level (info and debug messages)
        --quiet         Log warnings and errors only
        --nested        Nested mode: no root required, no PAM, no user
                         switch, no VT allocation
        --syslog        Enable the syslog sink (default unless --nested)
        --no-syslog     Disable the syslog sink
        --stderr        Enable the stderr sink (default with --nested)
        --no-stderr     Disable the stderr sink
"#,
        version = env!("CARGO_PKG_VERSION")
    )
}

pub fn version() -> String {
    format!("nodm {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tristate {
    Unset,
    Enabled,
    Disabled,
}

impl Tristate {
    pub fn resolve(self, default: bool) -> bool {
        match self {
            Tristate::Unset => default,
            Tristate::Enabled => true,
            Tristate::Disabled => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run,
    Help,
    Version,
}

#[derive(Debug, Clone)]
pub struct Cli {
    pub action: Action,
    pub verbose: bool,
    pub quiet: bool,
    pub nested: bool,
    pub syslog: Tristate,
    pub stderr: Tristate,
}

impl Cli {
    pub fn parse() -> Result<Self, Error> {
        let mut cli = Cli {
            action: Action::Run,
            verbose: false,
            quiet: false,
            nested: false,
            syslog: Tristate::Unset,
            stderr: Tristate::Unset,
        };

        for arg in args().skip(1) {
            match arg.trim() {
                "--help" => cli.action = Action::Help,
                "--version" => cli.action = Action::Version,
                "--verbose" => cli.verbose = true,
                "--quiet" => cli.quiet = true,
                "--nested" => cli.nested = true,
                "--syslog" => cli.syslog = Tristate::Enabled,
                "--no-syslog" => cli.syslog = Tristate::Disabled,
                "--stderr" => cli.stderr = Tristate::Enabled,
                "--no-stderr" => cli.stderr = Tristate::Disabled,
                other => {
                    return Err(Error::Usage(format!("unrecognised argument '{other}'")));
                }
            }
        }

        if cli.verbose && cli.quiet {
            return Err(Error::Usage(
                "--verbose and --quiet are mutually exclusive".to_string(),
            ));
        }

        Ok(cli)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tristate_resolves_to_default_when_unset() {
        assert!(Tristate::Unset.resolve(true));
        assert!(!Tristate::Unset.resolve(false));
    }

    #[test]
    fn tristate_overrides_default() {
        assert!(!Tristate::Disabled.resolve(true));
        assert!(Tristate::Enabled.resolve(false));
    }
}
