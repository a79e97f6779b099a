use std::ffi::OsString;

use clap::parser::ValueSource;
use clap::{CommandFactory, FromArgMatches, Parser};
use orchestrator_client::{parse_init_data, Attributes, ClientError};

#[derive(Parser, Debug, Clone)]
#[command(name = "orchestrator-agent", version, about, long_about = None)]
pub struct Args {
    /// Base URL of the orchestrator control API
    #[arg(long, env = "ORCHESTRATOR_URL")]
    pub orchestrator_url: String,

    /// Bearer secret sent with every control call
    #[arg(long, env = "ORCHESTRATOR_SECRET", hide_env_values = true)]
    pub orchestrator_secret: String,

    /// Port the monitored service listens on
    #[arg(long, env = "ORCHESTRATOR_SERVICE_PORT")]
    pub orchestrator_service_port: Option<u16>,

    /// JSON object of registration attributes. `"<random-uuid>"` values are replaced
    #[arg(long, env = "ORCHESTRATOR_INIT_DATA", default_value = "{}")]
    pub init_data: String,

    /// Only heartbeat while a process with this name is running
    #[arg(long, env = "ORCHESTRATOR_EXTERNAL_SERVICE_NAME")]
    pub external_service_name: Option<String>,

    /// Instance id suffix, defaults to the service port
    #[arg(long, env = "ORCHESTRATOR_INSTANCE_SUFFIX")]
    pub instance_suffix: Option<String>,
}

/// The process whose presence gates heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalService {
    pub name: String,
    /// When the name is passed on our own command line, this agent matches the probe too.
    pub min_processes: usize,
}

#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Args,
    pub external_service: Option<ExternalService>,
}

impl Args {
    pub fn parse_invocation() -> Invocation {
        Self::try_parse_invocation_from(std::env::args_os()).unwrap_or_else(|e| e.exit())
    }

    pub fn try_parse_invocation_from<I, T>(iter: I) -> Result<Invocation, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(iter)?;
        let args = Self::from_arg_matches(&matches)?;

        let min_processes = match matches.value_source("external_service_name") {
            Some(ValueSource::CommandLine) => 2,
            _ => 1,
        };
        let external_service = args
            .external_service_name
            .clone()
            .filter(|name| !name.is_empty())
            .map(|name| ExternalService {
                name,
                min_processes,
            });

        Ok(Invocation {
            args,
            external_service,
        })
    }

    pub fn attributes(&self) -> Result<Attributes, ClientError> {
        parse_init_data(&self.init_data)
    }
}
