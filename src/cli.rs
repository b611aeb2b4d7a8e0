use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, about = "tunnelbar keeps your ssh port forwards up and in sync with a config file", long_about = None)]
pub(crate) struct TunnelbarCli {
    /// custom config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    /// debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
pub(crate) enum Command {
    /// start the configured tunnels and supervise them (default)
    Up {
        /// only bring up this server, can be repeated
        #[arg(short, long = "server", value_name = "NAME")]
        servers: Vec<String>,
    },
    /// validate the config file
    Check,
    /// print the configured servers and ports
    List,
    /// create the config file from the bundled example
    Init,
    /// open the config file in your editor
    Edit,
}
