use std::io::{self, Write};

use chat_bridge::cli::{resolve_secret, Cli, Command, API_KEY_ENV, TOKEN_ENV};
use chat_bridge::think::split_reasoning;
use chat_bridge::{
    server, BridgeConfig, ChatClient, ChatMessage, Conversation, ReplySink, TerminalSink, Timeouts,
};
use clap::{CommandFactory, Parser};
use colored::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_bridge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            config,
            listen,
            endpoints,
            api_key,
        } => {
            let base = match config {
                Some(path) => BridgeConfig::load(path).await?,
                None => BridgeConfig::default(),
            };
            let config =
                base.with_overrides(listen, endpoints, resolve_secret(api_key, API_KEY_ENV));
            server::serve(config).await?;
        }
        Command::Chat {
            url,
            token,
            once,
            show_reasoning,
        } => {
            let token = resolve_secret(token, TOKEN_ENV);
            let client = ChatClient::new(url, token, &Timeouts::default());
            match once {
                Some(message) => chat_once(&client, &message, show_reasoning).await?,
                None => chat_interactive(&client, show_reasoning).await?,
            }
        }
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "chat-bridge", &mut io::stdout());
        }
    }

    Ok(())
}

/// Collects nothing; errors go to stderr.
struct QuietSink;

impl ReplySink for QuietSink {
    fn replace_reply(&mut self, _transcript: &str) {}

    fn notify_error(&mut self, message: &str) {
        eprintln!("{} {}", "error:".bright_red().bold(), message);
    }
}

/// One message, answer on stdout. Suitable for pipes.
async fn chat_once(
    client: &ChatClient,
    message: &str,
    show_reasoning: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut conversation = Conversation::new();
    let reply: ChatMessage = client.send(&mut conversation, message, &mut QuietSink).await?;
    let parts = split_reasoning(&reply.content);
    if show_reasoning {
        if let Some(reasoning) = parts.reasoning {
            eprintln!("{}", reasoning.dimmed());
        }
    }
    println!("{}", parts.answer);
    Ok(())
}

async fn chat_interactive(
    client: &ChatClient,
    show_reasoning: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "CHAT BRIDGE".bright_cyan().bold());
    println!("{}: {}", "Bridge".bright_yellow(), client.url());
    println!("{}", "/reset clears the conversation, /quit exits".dimmed());

    let mut conversation = Conversation::new();
    let mut sink = TerminalSink::new(io::stdout(), show_reasoning);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{} ", "you>".bright_green().bold());
        let _ = io::stdout().flush();

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        match line.trim() {
            "" => continue,
            "/quit" | "/exit" => break,
            "/reset" => {
                conversation = Conversation::new();
                println!("{}", "conversation cleared".dimmed());
            }
            text => {
                // Failures were already reported through the sink.
                let _ = client.send(&mut conversation, text, &mut sink).await;
            }
        }
    }
    Ok(())
}
