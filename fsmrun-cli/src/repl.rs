//! Interactive REPL.
//!
//! Lines of the form `name = value` write an input or variable; any other
//! bare identifier that is not a REPL keyword pulses the input of that name.
//! Events pushed by the server are printed as they arrive.

use crate::commands::{format_event, format_status};
use colored::Colorize;
use fsmrun_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::net::SocketAddr;
use tokio::sync::broadcast::error::RecvError;

const HELP_TEXT: &str = r#"
Available commands:
  <name> = <value>    Write an input or variable
  <name>              Pulse an input (call)
  status              Show state, inputs, outputs, variables and timers
  model               Print the running model document
  reset               Restart the machine from its initial state
  shutdown            Stop the runtime
  server-help         Show the server's usage text
  help                Show this help
  quit, exit          Exit the REPL
"#;

/// A parsed REPL line.
#[derive(Debug, PartialEq, Eq)]
enum ReplCommand<'a> {
    Set { name: &'a str, value: &'a str },
    Call { name: &'a str },
    Status,
    Model,
    Reset,
    Shutdown,
    ServerHelp,
    Help,
    Quit,
    Invalid(String),
}

fn parse_line(line: &str) -> ReplCommand<'_> {
    if let Some((name, value)) = line.split_once('=') {
        let name = name.trim();
        if !is_identifier(name) {
            return ReplCommand::Invalid(format!("Invalid name: {}", name));
        }
        return ReplCommand::Set {
            name,
            value: value.trim(),
        };
    }

    match line {
        "status" => ReplCommand::Status,
        "model" => ReplCommand::Model,
        "reset" => ReplCommand::Reset,
        "shutdown" => ReplCommand::Shutdown,
        "server-help" => ReplCommand::ServerHelp,
        "help" | "?" => ReplCommand::Help,
        "quit" | "exit" | "q" => ReplCommand::Quit,
        name if is_identifier(name) => ReplCommand::Call { name },
        other => ReplCommand::Invalid(format!(
            "Unknown command: {}. Type 'help' for help.",
            other
        )),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

pub async fn run(client: Client, addr: SocketAddr) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "fsmrun CLI".bold().cyan());
    println!("Connecting to {}...", addr);

    client.connect().await?;
    println!("{}", "Connected!".green());

    // Print pushed events while the prompt is waiting
    let mut events = client.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                // Answers to REPL requests are printed by the request itself
                Ok(fsmrun_protocol::Event::Status(_)) | Ok(fsmrun_protocol::Event::Fsm { .. }) => {}
                Ok(event) => println!("{}", format_event(&event)),
                Err(RecvError::Lagged(n)) => println!("{}: lagged {} events", "Warning".yellow(), n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".fsmrun_history"))
        .unwrap_or_else(|_| ".fsmrun_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        if !client.is_connected() {
            println!("{}", "Connection closed by server".red());
            break;
        }

        let prompt = format!("{} ", "fsmrun>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => {
                        if !output.is_empty() {
                            println!("{}\n", output);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => println!("{}: {}\n", "Error".red(), e),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("^D");
                break;
            }
            Err(err) => {
                println!("{}: {:?}", "Error".red(), err);
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);

    printer.abort();
    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    match parse_line(line) {
        ReplCommand::Set { name, value } => {
            client.set(name, value).await?;
            Ok(Some(String::new()))
        }
        ReplCommand::Call { name } => {
            client.call(name).await?;
            Ok(Some(String::new()))
        }
        ReplCommand::Status => Ok(Some(format_status(&client.status().await?))),
        ReplCommand::Model => Ok(Some(client.request_model().await?)),
        ReplCommand::Reset => {
            client.reset().await?;
            Ok(Some(String::new()))
        }
        ReplCommand::Shutdown => {
            client.shutdown().await?;
            Ok(None)
        }
        // The server's answer is a log event, printed by the event printer
        ReplCommand::ServerHelp => {
            client.help().await?;
            Ok(Some(String::new()))
        }
        ReplCommand::Help => Ok(Some(HELP_TEXT.to_string())),
        ReplCommand::Quit => Ok(None),
        ReplCommand::Invalid(message) => Ok(Some(message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment() {
        assert_eq!(
            parse_line("in = 1"),
            ReplCommand::Set {
                name: "in",
                value: "1"
            }
        );
        assert_eq!(
            parse_line("msg=hello world"),
            ReplCommand::Set {
                name: "msg",
                value: "hello world"
            }
        );
        assert!(matches!(parse_line("1x = 2"), ReplCommand::Invalid(_)));
    }

    #[test]
    fn test_parse_keywords_and_calls() {
        assert_eq!(parse_line("status"), ReplCommand::Status);
        assert_eq!(parse_line("exit"), ReplCommand::Quit);
        assert_eq!(parse_line("server-help"), ReplCommand::ServerHelp);
        assert_eq!(parse_line("start"), ReplCommand::Call { name: "start" });
        assert!(matches!(parse_line("two words"), ReplCommand::Invalid(_)));
    }
}
