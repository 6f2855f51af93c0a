//! Command-line interface definition.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use emessenger_core::parse_client_id;

use crate::config::ClientConfig;

/// emessenger - Text messages through a mailbox relay
#[derive(Debug, Parser)]
#[command(name = "emessenger")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "EMESSENGER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug output
    #[arg(long, short = 'v')]
    pub debug: bool,

    /// Relay URL (ws:// only)
    #[arg(long, short, env = "EMESSENGER_SERVER")]
    pub server: Option<String>,

    /// Our client ID on the relay
    #[arg(long, env = "EMESSENGER_CLIENT_ID", value_parser = parse_client_id)]
    pub client_id: Option<u8>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Applies command-line overrides on top of the file configuration.
    pub fn apply_overrides(&self, config: &mut ClientConfig) {
        if let Some(ref url) = self.server {
            config.server.url = url.clone();
        }
        if let Some(id) = self.client_id {
            config.server.client_id = id;
        }
        if let Command::Server {
            bind: Some(ref bind),
            ..
        } = self.command
        {
            config.relay.bind = bind.clone();
        }
    }
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send one message and exit
    Send {
        /// Recipient client ID
        #[arg(long, value_parser = parse_client_id)]
        to: u8,

        /// Message text (at most 255 bytes)
        text: String,
    },

    /// Print incoming messages until interrupted
    Listen {
        /// One JSON object per message
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat: stdin lines go to the peer, deliveries are printed
    Chat {
        /// Peer client ID
        #[arg(long, value_parser = parse_client_id)]
        to: u8,
    },

    /// Decode a hex-encoded frame and print it as JSON
    Decode {
        /// Frame bytes, e.g. `020101020268 69`
        #[arg(num_args = 1.., required = true)]
        hex: Vec<String>,
    },

    /// Run the relay server in the foreground
    Server {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,

        /// Log as JSON lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Validate configuration
    Validate,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn send_arguments() {
        let cli = parse(&["emessenger", "--client-id", "3", "send", "--to", "7", "hello"]);
        assert_eq!(cli.client_id, Some(3));
        match cli.command {
            Command::Send { to, text } => {
                assert_eq!(to, 7);
                assert_eq!(text, "hello");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn client_id_must_fit_a_byte() {
        assert!(Cli::try_parse_from(["emessenger", "--client-id", "256", "listen"]).is_err());

        let err = Cli::try_parse_from(["emessenger", "chat", "--to", "peer"]).unwrap_err();
        assert!(err.to_string().contains("not a number between 0 and 255"));

        match parse(&["emessenger", "chat", "--to", " 9 "]).command {
            Command::Chat { to } => assert_eq!(to, 9),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn overrides_replace_file_values() {
        let cli = parse(&[
            "emessenger",
            "--server",
            "ws://relay.example:9000",
            "--client-id",
            "42",
            "server",
            "--bind",
            "127.0.0.1:9000",
        ]);
        let mut config = ClientConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.server.url, "ws://relay.example:9000");
        assert_eq!(config.server.client_id, 42);
        assert_eq!(config.relay.bind, "127.0.0.1:9000");
    }

    #[test]
    fn no_overrides_keeps_config() {
        let cli = parse(&["emessenger", "listen", "--json"]);
        let mut config = ClientConfig::default();
        cli.apply_overrides(&mut config);
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn decode_accepts_split_hex() {
        let cli = parse(&["emessenger", "decode", "0000", "01"]);
        match cli.command {
            Command::Decode { hex } => assert_eq!(hex, vec!["0000", "01"]),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
