use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::providers::Endpoint;

pub const API_KEY_ENV: &str = "CHAT_BRIDGE_API_KEY";
pub const TOKEN_ENV: &str = "CHAT_BRIDGE_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "chat-bridge")]
#[command(version)]
#[command(about = "Streaming chat bridge with ordered failover across Ollama backends")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the bridge server
    Serve {
        /// TOML configuration file
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Listen address, overrides the config file
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Backend as URL=MODEL; repeat in failover order. Replaces configured endpoints
        #[arg(long = "endpoint", short = 'e', value_parser = Endpoint::parse_spec)]
        endpoints: Vec<Endpoint>,

        /// Shared bearer token required from clients (or CHAT_BRIDGE_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Chat with a running bridge from the terminal
    Chat {
        /// Bridge chat URL
        #[arg(long, default_value = "http://127.0.0.1:8787/chat")]
        url: String,

        /// Bearer token sent to the bridge (or CHAT_BRIDGE_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// Send a single message and exit
        #[arg(long)]
        once: Option<String>,

        /// Print the model's <think> reasoning as well as the answer
        #[arg(long)]
        show_reasoning: bool,
    },

    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Command-line value first, then the environment variable.
pub fn resolve_secret(flag: Option<String>, env_var: &str) -> Option<String> {
    flag.or_else(|| std::env::var(env_var).ok())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_with_ordered_endpoints() {
        let cli = Cli::parse_from([
            "chat-bridge",
            "serve",
            "--endpoint",
            "http://a:11434=deepseek-r1:latest",
            "-e",
            "http://b:11434=deepseek-r1:1.5b",
            "--listen",
            "0.0.0.0:9000",
        ]);
        match cli.command {
            Command::Serve { endpoints, listen, config, api_key } => {
                assert_eq!(endpoints.len(), 2);
                assert_eq!(endpoints[0].address, "http://a:11434");
                assert_eq!(endpoints[0].model, "deepseek-r1:latest");
                assert_eq!(endpoints[1].address, "http://b:11434");
                assert_eq!(listen.map(|l| l.port()), Some(9000));
                assert!(config.is_none());
                assert!(api_key.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn bad_endpoint_spec_is_rejected() {
        let res = Cli::try_parse_from(["chat-bridge", "serve", "--endpoint", "no-model-here"]);
        assert!(res.is_err());
    }

    #[test]
    fn chat_defaults() {
        let cli = Cli::parse_from(["chat-bridge", "chat"]);
        match cli.command {
            Command::Chat { url, token, once, show_reasoning } => {
                assert_eq!(url, "http://127.0.0.1:8787/chat");
                assert!(token.is_none());
                assert!(once.is_none());
                assert!(!show_reasoning);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn chat_once() {
        let cli = Cli::parse_from(["chat-bridge", "chat", "--once", "hello there"]);
        assert!(matches!(cli.command, Command::Chat { once: Some(ref m), .. } if m == "hello there"));
    }

    #[test]
    fn completions_shell() {
        let cli = Cli::parse_from(["chat-bridge", "completions", "bash"]);
        assert!(matches!(cli.command, Command::Completions { shell: Shell::Bash }));
    }

    #[test]
    fn subcommand_is_required() {
        assert!(Cli::try_parse_from(["chat-bridge"]).is_err());
    }

    #[test]
    fn flag_beats_environment() {
        assert_eq!(
            resolve_secret(Some("flag".into()), "CHAT_BRIDGE_TEST_UNSET_VAR"),
            Some("flag".into())
        );
        assert_eq!(resolve_secret(None, "CHAT_BRIDGE_TEST_UNSET_VAR"), None);
        assert_eq!(resolve_secret(Some(String::new()), "CHAT_BRIDGE_TEST_UNSET_VAR"), None);
    }
}
