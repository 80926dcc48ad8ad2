//! Interactive REPL.

use crate::commands::{
    format_json, format_notification, format_page, parse_filters, parse_json_arg, parse_target,
};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use syncwire_client::Client;
use syncwire_protocol::QueryOptions;
use tokio::sync::broadcast::error::RecvError;

const HELP_TEXT: &str = r#"
Available commands:
  help                              Show this help
  ping                              Ping the engine

  read <schema.entity> [filters]    List records (filters: col:op:value)
  get <schema.entity> <id>          Read one record
  create <schema.entity> <json>     Create a record
  update <schema.entity> <id> <json>  Update a record
  delete <schema.entity> <id>       Delete a record
  meta <schema.entity>              Show the entity descriptor

  sub <schema.entity> [filters]     Subscribe; notifications print as they arrive
  unsub <subscription_id>           Remove a subscription

  quit, exit                        Exit the REPL
"#;

pub async fn run(client: Client, addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "syncwire CLI".bold().cyan());
    println!("Connecting to {} as {}...", addr, client.connection_id());

    client.connect().await?;
    println!("{}", "Connected!".green());

    let mut notes = client.notifications();
    tokio::spawn(async move {
        loop {
            match notes.recv().await {
                Ok(note) => println!("\n{}", format_notification(&note)),
                Err(RecvError::Lagged(n)) => {
                    println!("\n{}: lagged {} notifications", "Warning".yellow(), n)
                }
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
        .map(|h| std::path::PathBuf::from(h).join(".syncwire_history"))
        .unwrap_or_else(|_| ".syncwire_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "syncwire>".cyan());
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_command(&client, line).await {
                    Ok(Some(output)) => println!("{}\n", output),
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
    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

/// Returns `None` when the REPL should exit.
async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(Some(String::new()));
    }

    let cmd = parts[0].to_lowercase();
    let args = &parts[1..];
    // JSON arguments may contain spaces.
    let rest = |from: usize| args[from..].join(" ");

    match cmd.as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" | "q" => Ok(None),

        "ping" => {
            let rtt = client.ping().await?;
            Ok(Some(format!("{} ({:.1} ms)", "PONG".green(), rtt.as_secs_f64() * 1000.0)))
        }

        "read" | "r" => {
            if args.is_empty() {
                return Ok(Some("Usage: read <schema.entity> [col:op:value ...]".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let filters: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();
            let options = QueryOptions {
                filters: parse_filters(&filters)?,
                ..Default::default()
            };
            let page = client.read(schema, entity, options).await?;
            Ok(Some(format_page(&page)))
        }

        "get" | "g" => {
            if args.len() < 2 {
                return Ok(Some("Usage: get <schema.entity> <id>".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let record = client.get(schema, entity, args[1]).await?;
            Ok(Some(format_json(&record)))
        }

        "create" | "c" => {
            if args.len() < 2 {
                return Ok(Some("Usage: create <schema.entity> <json>".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let record = client.create(schema, entity, parse_json_arg(&rest(1))?).await?;
            Ok(Some(format!("{}\n{}", "Created".green(), format_json(&record))))
        }

        "update" | "u" => {
            if args.len() < 3 {
                return Ok(Some("Usage: update <schema.entity> <id> <json>".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let record = client
                .update(schema, entity, args[1], parse_json_arg(&rest(2))?)
                .await?;
            Ok(Some(format!("{}\n{}", "Updated".green(), format_json(&record))))
        }

        "delete" | "d" => {
            if args.len() < 2 {
                return Ok(Some("Usage: delete <schema.entity> <id>".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            client.delete(schema, entity, args[1]).await?;
            Ok(Some(format!("{} {} {}", "Deleted".green(), args[0].cyan(), args[1])))
        }

        "meta" | "m" => {
            if args.is_empty() {
                return Ok(Some("Usage: meta <schema.entity>".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let (descriptor, total) = client.meta(schema, entity).await?;
            Ok(Some(format!("{} rows\n{}", total, format_json(&descriptor))))
        }

        "sub" | "subscribe" => {
            if args.is_empty() {
                return Ok(Some("Usage: sub <schema.entity> [col:op:value ...]".to_string()));
            }
            let (schema, entity) = parse_target(args[0])?;
            let filters: Vec<String> = args[1..].iter().map(|s| s.to_string()).collect();
            let sub_id = client
                .subscribe(schema, entity, parse_filters(&filters)?)
                .await?;
            Ok(Some(format!("{} {}", "Subscribed".green(), sub_id.cyan())))
        }

        "unsub" | "unsubscribe" => {
            if args.is_empty() {
                return Ok(Some("Usage: unsub <subscription_id>".to_string()));
            }
            if client.unsubscribe(args[0]).await? {
                Ok(Some(format!("{} {}", "Removed".green(), args[0].cyan())))
            } else {
                Ok(Some(format!(
                    "{}: subscription {} not found",
                    "Warning".yellow(),
                    args[0]
                )))
            }
        }

        _ => Ok(Some(format!(
            "Unknown command: {}. Type 'help' for help.",
            cmd
        ))),
    }
}
