//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use syncwire_client::{Client, Page};
use syncwire_protocol::{
    FilterOperator, FilterOption, Notification, QueryOptions, SortDirection, SortOption,
};
use tokio::sync::broadcast::error::RecvError;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Executes a command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> CliResult<String> {
    match cmd {
        Commands::Repl => unreachable!(),

        Commands::Ping => {
            let rtt = client.ping().await?;
            Ok(format!("{} ({:.1} ms)", "PONG".green(), rtt.as_secs_f64() * 1000.0))
        }

        Commands::Read {
            target,
            id,
            filters,
            sort,
            limit,
            offset,
            columns,
        } => {
            let (schema, entity) = parse_target(&target)?;
            if let Some(id) = id {
                let record = client.get(schema, entity, &id).await?;
                return Ok(format_json(&record));
            }

            let options = QueryOptions {
                filters: parse_filters(&filters)?,
                sort: sort.iter().map(|s| parse_sort(s)).collect::<CliResult<_>>()?,
                limit,
                offset,
                columns,
                ..Default::default()
            };
            let page = client.read(schema, entity, options).await?;
            Ok(format_page(&page))
        }

        Commands::Create { target, data } => {
            let (schema, entity) = parse_target(&target)?;
            let record = client
                .create(schema, entity, parse_json_arg(&data)?)
                .await?;
            Ok(format!("{} {}\n{}", "Created".green(), target.cyan(), format_json(&record)))
        }

        Commands::Update { target, id, data } => {
            let (schema, entity) = parse_target(&target)?;
            let record = client
                .update(schema, entity, &id, parse_json_arg(&data)?)
                .await?;
            Ok(format!(
                "{} {} {}\n{}",
                "Updated".green(),
                target.cyan(),
                id,
                format_json(&record)
            ))
        }

        Commands::Delete { target, id } => {
            let (schema, entity) = parse_target(&target)?;
            client.delete(schema, entity, &id).await?;
            Ok(format!("{} {} {}", "Deleted".green(), target.cyan(), id))
        }

        Commands::Meta { target } => {
            let (schema, entity) = parse_target(&target)?;
            let (descriptor, total) = client.meta(schema, entity).await?;
            Ok(format!(
                "{} ({} rows)\n{}",
                target.cyan().bold(),
                total,
                format_json(&descriptor)
            ))
        }

        // Handled in main.rs
        Commands::Subscribe { .. } | Commands::HashToken { .. } => unreachable!(),
    }
}

/// Subscribes and prints notifications as JSON lines until Ctrl+C.
pub async fn watch(client: &Client, target: &str, filters: &[String]) -> CliResult<()> {
    let (schema, entity) = parse_target(target)?;
    let mut notes = client.notifications();
    let sub_id = client
        .subscribe(schema, entity, parse_filters(filters)?)
        .await?;

    eprintln!("{} {} (sub_id: {})", "Watching".green(), target.cyan(), sub_id);
    eprintln!("{}", "Press Ctrl+C to stop...".dimmed());

    loop {
        tokio::select! {
            note = notes.recv() => match note {
                Ok(note) => println!("{}", serde_json::to_string(&note)?),
                Err(RecvError::Lagged(n)) => {
                    eprintln!("{}: lagged {} notifications", "Warning".yellow(), n);
                }
                Err(RecvError::Closed) => {
                    eprintln!("{}", "Connection closed".red());
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\n{}", "Stopping watch...".dimmed());
                let _ = client.unsubscribe(&sub_id).await;
                break;
            }
        }
    }
    Ok(())
}

pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Splits `schema.entity`.
pub fn parse_target(target: &str) -> CliResult<(&str, &str)> {
    match target.split_once('.') {
        Some((schema, entity)) if !schema.is_empty() && !entity.is_empty() => Ok((schema, entity)),
        _ => Err(format!("expected schema.entity, got '{}'", target).into()),
    }
}

/// Parses `column:operator:value`. The value is read as JSON when it parses,
/// otherwise as a plain string; `in` also accepts a comma-separated list.
pub fn parse_filter(spec: &str) -> CliResult<FilterOption> {
    let mut parts = spec.splitn(3, ':');
    let (Some(column), Some(op), Some(raw)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected column:operator:value, got '{}'", spec).into());
    };
    if column.is_empty() {
        return Err(format!("missing column in filter '{}'", spec).into());
    }

    let operator = FilterOperator::parse(op);
    let value = match serde_json::from_str::<Value>(raw) {
        Ok(value) => value,
        Err(_) if operator == FilterOperator::In => Value::Array(
            raw.split(',')
                .map(|item| Value::String(item.trim().to_string()))
                .collect(),
        ),
        Err(_) => Value::String(raw.to_string()),
    };
    Ok(FilterOption::new(column, operator, value))
}

pub fn parse_filters(specs: &[String]) -> CliResult<Vec<FilterOption>> {
    specs.iter().map(|s| parse_filter(s)).collect()
}

/// Parses `column[:asc|desc]`.
pub fn parse_sort(spec: &str) -> CliResult<SortOption> {
    let (column, direction) = match spec.split_once(':') {
        Some((column, "asc")) => (column, SortDirection::Asc),
        Some((column, "desc")) => (column, SortDirection::Desc),
        Some((_, other)) => return Err(format!("unknown sort direction '{}'", other).into()),
        None => (spec, SortDirection::Asc),
    };
    Ok(SortOption {
        column: column.to_string(),
        direction,
    })
}

/// Parses a JSON argument (either inline JSON or @file.json).
pub fn parse_json_arg(arg: &str) -> CliResult<Value> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

pub fn format_page(page: &Page) -> String {
    if page.records.is_empty() {
        return "No records".yellow().to_string();
    }
    let mut output = String::new();
    for record in &page.records {
        output.push_str(&serde_json::to_string(record).unwrap_or_else(|_| record.to_string()));
        output.push('\n');
    }
    output.push_str(
        &format!(
            "{} of {} records",
            page.records.len(),
            page.meta.total.unwrap_or(page.records.len() as u64)
        )
        .dimmed()
        .to_string(),
    );
    output
}

pub fn format_notification(note: &Notification) -> String {
    format!(
        "[{}] {} {}.{} {}",
        note.subscription_id.cyan(),
        note.operation.as_str().yellow(),
        note.schema,
        note.entity,
        note.data
    )
}

/// Formats JSON for display.
pub fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
