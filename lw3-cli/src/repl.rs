//! Interactive REPL.

use crate::commands;
use colored::Colorize;
use lw3_client::Client;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};
use std::time::Duration;

const HELP_TEXT: &str = r#"
Available commands:
  help                          Show this help

  get <path.Property>           Read a property
  set <path.Property> <value>   Write a property (rest of the line is the value)
  call <path:method> [args]     Invoke a method with comma separated arguments
  ls [path]                     List child nodes
  man <target>                  Show manuals (/NODE.*, /NODE.Prop, /NODE:method)
  dump <path>                   Print all properties as JSON

  open <path> [rule]            Print changes of a node (rule: Prop or Prop=value)
  close <id>                    Stop a subscription
  subs                          Show the number of subscriptions

  quit, exit                    Exit the REPL
"#;

pub async fn run(
    client: Client,
    server: &str,
    connect_timeout: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "LW3 CLI".bold().cyan());
    println!("Connecting to {}...", server);

    match client.wait_connected(connect_timeout).await {
        Ok(()) => println!("{}", "Connected!".green()),
        Err(_) => println!(
            "{}",
            "Server not reachable yet, retrying in the background.".yellow()
        ),
    }

    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".lw3_history"))
        .unwrap_or_else(|_| ".lw3_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    loop {
        let prompt = format!("{} ", "lw3>".cyan());
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

    client.disconnect();
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_command(
    client: &Client,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let (cmd, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let args: Vec<&str> = rest.split_whitespace().collect();

    let output = match cmd.to_lowercase().as_str() {
        "help" | "?" => HELP_TEXT.to_string(),

        "quit" | "exit" | "q" => return Ok(None),

        "get" => match args.as_slice() {
            [path] => commands::get(client, path).await?,
            _ => "Usage: get <path.Property>".to_string(),
        },

        "set" => match rest.split_once(char::is_whitespace) {
            Some((path, value)) => commands::set(client, path, value.trim_start()).await?,
            None if !rest.is_empty() => commands::set(client, rest, "").await?,
            None => "Usage: set <path.Property> <value>".to_string(),
        },

        "call" => match rest.split_once(char::is_whitespace) {
            Some((path, call_args)) => commands::call(client, path, call_args.trim()).await?,
            None if !rest.is_empty() => commands::call(client, rest, "").await?,
            None => "Usage: call <path:method> [args]".to_string(),
        },

        "ls" => commands::ls(client, args.first().copied().unwrap_or("/")).await?,

        "man" => match args.as_slice() {
            [target] => commands::man(client, target).await?,
            _ => "Usage: man <target>".to_string(),
        },

        "dump" => match args.as_slice() {
            [path] => commands::dump(client, path).await?,
            _ => "Usage: dump <path>".to_string(),
        },

        "open" => match args.as_slice() {
            [path, rule @ ..] if rule.len() <= 1 => {
                let rule = rule.first().copied().unwrap_or("");
                let id = client
                    .open(path, rule, None, |path, property, value| {
                        println!(
                            "{} {}.{}={}",
                            "CHG".yellow(),
                            path,
                            property.cyan(),
                            value
                        );
                    })
                    .await?;
                format!("{} subscription {}", "Opened".green(), id)
            }
            _ => "Usage: open <path> [rule]".to_string(),
        },

        "close" => match args.as_slice() {
            [id] => {
                let id: u64 = id.parse()?;
                client.close(id).await?;
                format!("{} subscription {}", "Closed".green(), id)
            }
            _ => "Usage: close <id>".to_string(),
        },

        "subs" => format!("{} subscription(s)", client.subscription_count()),

        other => format!(
            "{}: unknown command '{}'. Type 'help' for available commands.",
            "Error".red(),
            other
        ),
    };
    Ok(Some(output))
}
