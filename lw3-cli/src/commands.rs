//! Command execution.

use crate::Commands;
use colored::Colorize;
use lw3_client::Client;
use lw3_protocol::Value;

/// Executes a one-shot command and returns the formatted output.
pub async fn execute(client: &Client, cmd: Commands) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::Get { path } => get(client, &path).await,
        Commands::Set { path, value } => set(client, &path, &value).await,
        Commands::Call { path, args } => call(client, &path, &args).await,
        Commands::Ls { path } => ls(client, &path).await,
        Commands::Man { target } => man(client, &target).await,
        Commands::Dump { path } => dump(client, &path).await,
        Commands::Repl | Commands::Watch { .. } => Err("not a one-shot command".into()),
    }
}

pub async fn get(client: &Client, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let value = client.get(path).await?;
    Ok(format_value(&value))
}

pub async fn set(
    client: &Client,
    path: &str,
    value: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    client.set(path, value).await?;
    Ok(format!("{} {}={}", "OK".green(), path.cyan(), value))
}

pub async fn call(
    client: &Client,
    path: &str,
    args: &str,
) -> Result<String, Box<dyn std::error::Error>> {
    let result = client.call(path, args).await?;
    if result.is_empty() {
        Ok("OK".green().to_string())
    } else {
        Ok(result)
    }
}

pub async fn ls(client: &Client, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let children = client.children(path).await?;
    if children.is_empty() {
        return Ok("No child nodes".yellow().to_string());
    }
    Ok(children
        .iter()
        .map(|child| child.cyan().to_string())
        .collect::<Vec<_>>()
        .join("\n"))
}

pub async fn man(client: &Client, target: &str) -> Result<String, Box<dyn std::error::Error>> {
    let manuals = client.manual(target).await?;
    let width = manuals.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    Ok(manuals
        .iter()
        .map(|(name, manual)| format!("{}  {}", format!("{:width$}", name).cyan(), manual))
        .collect::<Vec<_>>()
        .join("\n"))
}

pub async fn dump(client: &Client, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let properties = client.fetch_all(path).await?;
    let object: serde_json::Map<String, serde_json::Value> = properties
        .into_iter()
        .map(|(name, value)| Ok((name, serde_json::to_value(&value)?)))
        .collect::<Result<_, serde_json::Error>>()?;
    Ok(serde_json::to_string_pretty(&object)?)
}

/// Formats a converted value for display.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string().yellow().to_string(),
        Value::Number(_) => value.to_string().yellow().to_string(),
        Value::String(s) => format!("{:?}", s),
        Value::List(items) => format!(
            "[{}]",
            items.iter().map(format_value).collect::<Vec<_>>().join(", ")
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_value() {
        colored::control::set_override(false);
        assert_eq!(format_value(&Value::String("a\nb".into())), "\"a\\nb\"");
        assert_eq!(format_value(&Value::Number(5.42)), "5.42");
        assert_eq!(
            format_value(&Value::List(vec![Value::Bool(true), Value::Number(1.0)])),
            "[true, 1]"
        );
    }
}
