//! Command execution and event formatting.

use crate::Commands;
use colored::Colorize;
use fsmrun_client::Client;
use fsmrun_protocol::{Event, StatusReport};
use std::time::Duration;
use tokio::sync::broadcast;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(
    client: &Client,
    cmd: Commands,
    wait: Duration,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Repl | Commands::Watch => unreachable!(),

        Commands::Set { name, value } => {
            let events = client.subscribe();
            client.set(&name, &value).await?;
            Ok(collect_events(events, wait).await)
        }

        Commands::Call { name } => {
            let events = client.subscribe();
            client.call(&name).await?;
            Ok(collect_events(events, wait).await)
        }

        Commands::Reset => {
            let events = client.subscribe();
            client.reset().await?;
            Ok(collect_events(events, wait).await)
        }

        Commands::Status { json } => {
            let report = client.status().await?;
            if json {
                Ok(serde_json::to_string_pretty(&report)?)
            } else {
                Ok(format_status(&report))
            }
        }

        Commands::Help => Ok(client.help().await?),

        Commands::Model => Ok(client.request_model().await?),

        Commands::Shutdown => {
            client.shutdown().await?;
            Ok(format!("{} shutdown", "Requested".green()))
        }
    }
}

/// Formats every event received within `wait`, one per line.
///
/// An `error` event ends the wait early.
pub async fn collect_events(mut events: broadcast::Receiver<Event>, wait: Duration) -> String {
    let deadline = tokio::time::Instant::now() + wait;
    let mut lines = Vec::new();

    while let Ok(Ok(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        let is_error = matches!(event, Event::Error { .. });
        lines.push(format_event(&event));
        if is_error {
            break;
        }
    }
    lines.join("\n")
}

/// Formats an event as one timestamped line.
pub fn format_event(event: &Event) -> String {
    let time = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
    format!("{} {}", time.dimmed(), describe_event(event))
}

fn describe_event(event: &Event) -> String {
    match event {
        Event::StateChange { name, from } => match from {
            Some(from) => format!("{} {} -> {}", "state".bold(), from, name.yellow()),
            None => format!("{} {}", "state".bold(), name.yellow()),
        },
        Event::Output { name, value } => format!("{} {} = {}", "output".green(), name.cyan(), value),
        Event::Input { name, value } => format!("{} {} = {}", "input".blue(), name.cyan(), value),
        Event::Variable { name, value } => {
            format!("{} {} = {}", "variable".magenta(), name.cyan(), value)
        }
        Event::TimerStart { from, to, ms } => {
            format!("{} {} -> {} in {}ms", "timer".bold(), from, to, ms)
        }
        Event::TimerExpired { from, to } => {
            format!("{} {} -> {} expired", "timer".bold(), from, to)
        }
        Event::Fsm { model } => format!("{} {} bytes", "model".bold(), model.len()),
        Event::Log { message } => format!("{} {}", "log".dimmed(), message),
        Event::Error { code, message } => format!("{} {}: {}", "error".red(), code, message),
        Event::Status(report) => format!("{} {}", "status".bold(), report.state.yellow()),
        Event::Ping => "ping".dimmed().to_string(),
        Event::Shutdown { message } => format!("{} {}", "shutdown".red(), message),
        Event::Disconnect { message } => format!("{} {}", "disconnect".dimmed(), message),
    }
}

/// Formats a status report for display.
pub fn format_status(report: &StatusReport) -> String {
    let mut output = format!("{} {}\n", "State:".bold(), report.state.yellow());

    if !report.inputs.is_empty() {
        output.push_str(&format!("{}\n", "Inputs:".bold()));
        for input in &report.inputs {
            output.push_str(&format!("  {} = {}\n", input.name.cyan(), input.value));
        }
    }

    if !report.outputs.is_empty() {
        output.push_str(&format!("{}\n", "Outputs:".bold()));
        for out in &report.outputs {
            output.push_str(&format!("  {} = {}\n", out.name.cyan(), out.value));
        }
    }

    if !report.variables.is_empty() {
        output.push_str(&format!("{}\n", "Variables:".bold()));
        for var in &report.variables {
            output.push_str(&format!(
                "  {} {} = {}\n",
                var.var_type.dimmed(),
                var.name.cyan(),
                var.value
            ));
        }
    }

    if report.timers.is_empty() {
        output.push_str(&format!("{}", "No timers armed".dimmed()));
    } else {
        output.push_str(&format!("{}\n", "Timers:".bold()));
        for timer in &report.timers {
            output.push_str(&format!(
                "  {} -> {} in {}ms\n",
                timer.from, timer.to, timer.ms
            ));
        }
    }

    output.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmrun_protocol::{ErrorCode, NamedValue, TimerReport, VariableReport};

    #[test]
    fn test_format_status() {
        colored::control::set_override(false);
        let report = StatusReport {
            state: "TIMING".to_string(),
            inputs: vec![NamedValue {
                name: "in".to_string(),
                value: "0".to_string(),
            }],
            outputs: vec![NamedValue {
                name: "out".to_string(),
                value: "1".to_string(),
            }],
            variables: vec![VariableReport {
                name: "timeout".to_string(),
                var_type: "int".to_string(),
                value: "5000".to_string(),
            }],
            timers: vec![TimerReport {
                from: "TIMING".to_string(),
                to: "IDLE".to_string(),
                ms: 4200,
            }],
        };

        let text = format_status(&report);
        assert!(text.starts_with("State: TIMING"));
        assert!(text.contains("  in = 0"));
        assert!(text.contains("  int timeout = 5000"));
        assert!(text.contains("  TIMING -> IDLE in 4200ms"));
    }

    #[test]
    fn test_describe_event() {
        colored::control::set_override(false);
        let text = describe_event(&Event::StateChange {
            name: "ACTIVE".to_string(),
            from: Some("IDLE".to_string()),
        });
        assert_eq!(text, "state IDLE -> ACTIVE");

        let text = describe_event(&Event::error(ErrorCode::UnknownName, "no such name: x"));
        assert_eq!(text, "error UNKNOWN_NAME: no such name: x");
    }

    #[tokio::test]
    async fn test_collect_events_stops_on_error() {
        colored::control::set_override(false);
        let (tx, rx) = broadcast::channel(8);
        tx.send(Event::Output {
            name: "out".to_string(),
            value: "1".to_string(),
        })
        .unwrap();
        tx.send(Event::error(ErrorCode::BadRequest, "bad")).unwrap();
        tx.send(Event::Ping).unwrap();

        let text = collect_events(rx, Duration::from_secs(5)).await;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("output out = 1"));
        assert!(lines[1].ends_with("error BAD_REQUEST: bad"));
    }
}
