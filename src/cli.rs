use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, Command};

pub const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (build ", env!("GIT_HASH"), ")");

/// How much goes to stderr besides the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    Quiet,
    /// Lifecycle and connection events, no stanza content.
    Default,
    /// Also per-connection stanza tracing.
    Xmpp,
}

#[derive(Debug, Clone)]
pub struct CliArgs {
    pub config_path: PathBuf,
    pub domain: Option<String>,
    pub bind_address: Option<String>,
    pub log_dir: Option<PathBuf>,
    pub verbosity: Verbosity,
    pub check_config: bool,
}

impl CliArgs {
    pub fn parse() -> Self {
        Self::from_matches(build_command().get_matches())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        build_command()
            .try_get_matches_from(args)
            .map(Self::from_matches)
    }

    fn from_matches(matches: clap::ArgMatches) -> Self {
        let verbosity = match matches.get_one::<String>("verbose").map(String::as_str) {
            None => Verbosity::Quiet,
            Some("xmpp") => Verbosity::Xmpp,
            Some(_) => Verbosity::Default,
        };

        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("fluux-server.toml")),
            domain: matches.get_one::<String>("domain").cloned(),
            bind_address: matches.get_one::<String>("bind").cloned(),
            log_dir: matches.get_one::<String>("log-dir").map(PathBuf::from),
            verbosity,
            check_config: matches.get_flag("check-config"),
        }
    }
}

fn build_command() -> Command {
    Command::new("fluux-server")
        .version(VERSION)
        .about("XMPP server connection layer")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("fluux-server.toml"),
        )
        .arg(
            Arg::new("domain")
                .short('d')
                .long("domain")
                .value_name("DOMAIN")
                .help("XMPP domain served by this instance (overrides config)"),
        )
        .arg(
            Arg::new("bind")
                .short('b')
                .long("bind")
                .value_name("ADDRESS")
                .help("IP address the listeners bind to (overrides config)"),
        )
        .arg(
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .help("Directory for the daily-rotating log file"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .value_name("LEVEL")
                .num_args(0..=1)
                .require_equals(true)
                .default_missing_value("default")
                .value_parser(["default", "xmpp"])
                .help("Also log to stderr; --verbose=xmpp adds stanza tracing"),
        )
        .arg(
            Arg::new("check-config")
                .long("check-config")
                .help("Validate the configuration and exit")
                .action(ArgAction::SetTrue),
        )
}
