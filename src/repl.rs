//! Interactive REPL.

use crate::commands::{self, Output};
use colored::Colorize;
use muxis_client::{Client, ClientError, ConnectionConfig, Subscription, Transaction};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Config, Editor};

const HELP_TEXT: &str = r#"
Any server command is sent as typed, e.g.  SET greeting "hello world"

Double-quoted arguments understand \n, \t, \" and \xHH escapes.
Single-quoted arguments are taken literally.

Client-side commands:
  help                          Show this help
  quit, exit                    Exit the REPL

  watch <key...>                Watch keys for the next transaction
  multi                         Start queueing commands
  exec                          Commit queued commands
  discard, unwatch              Abandon the transaction

  subscribe <channel...>        Print messages until Ctrl+C
  psubscribe <pattern...>       Same, for glob patterns
"#;

/// Open transaction and whether MULTI has been entered.
struct TxSession {
    tx: Transaction,
    multi: bool,
}

pub async fn run(
    config: ConnectionConfig,
    output: Output,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "muxis CLI".bold().cyan());
    println!("Connecting to {}...", config.endpoint);

    let client = Client::connect(config).await?;
    println!("{}", "Connected!".green());

    // Create readline editor
    let rl_config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .build();
    let mut rl: Editor<(), DefaultHistory> = Editor::with_config(rl_config)?;

    let history_path = std::env::var("HOME")
        .map(|h| std::path::PathBuf::from(h).join(".muxis_history"))
        .unwrap_or_else(|_| ".muxis_history".into());
    let _ = rl.load_history(&history_path);

    println!("Type 'help' for available commands.\n");

    let mut session: Option<TxSession> = None;

    loop {
        let prompt = match &session {
            Some(s) if s.multi => format!("{} ", "muxis(TX)>".yellow()),
            Some(_) => format!("{} ", "muxis(WATCH)>".yellow()),
            None => format!("{} ", "muxis>".cyan()),
        };
        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match execute_repl_line(&client, &mut session, output, line).await {
                    Ok(Some(text)) => println!("{}", text),
                    Ok(None) => break,
                    Err(e) => println!("{}: {}", "Error".red(), e),
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

    if let Some(open) = session.take() {
        let _ = open.tx.discard().await;
    }
    let _ = client.close().await;
    println!("{}", "Disconnected.".dimmed());

    Ok(())
}

async fn execute_repl_line(
    client: &Client,
    session: &mut Option<TxSession>,
    output: Output,
    line: &str,
) -> Result<Option<String>, Box<dyn std::error::Error>> {
    let words = commands::split_line(line)?;
    let Some((name, args)) = words.split_first() else {
        return Ok(Some(String::new()));
    };

    match name.to_lowercase().as_str() {
        "help" | "?" => Ok(Some(HELP_TEXT.to_string())),

        "quit" | "exit" => Ok(None),

        "watch" => {
            if args.is_empty() {
                return Ok(Some("Usage: watch <key...>".to_string()));
            }
            if session.as_ref().is_some_and(|s| s.multi) {
                return Ok(Some(
                    "(error) ERR WATCH inside MULTI is not allowed".red().to_string(),
                ));
            }
            let open = match session.take() {
                Some(open) => open,
                None => TxSession {
                    tx: client.transaction().await?,
                    multi: false,
                },
            };
            let open = session.insert(open);
            open.tx.watch(args.iter()).await?;
            Ok(Some("OK".green().to_string()))
        }

        "multi" => {
            match session {
                Some(open) if open.multi => {
                    return Ok(Some(
                        "(error) ERR MULTI calls can not be nested".red().to_string(),
                    ));
                }
                Some(open) => open.multi = true,
                None => {
                    *session = Some(TxSession {
                        tx: client.transaction().await?,
                        multi: true,
                    });
                }
            }
            Ok(Some("OK".green().to_string()))
        }

        "exec" => match session.take() {
            Some(open) if open.multi => {
                let outcome = open.tx.commit().await?;
                Ok(Some(output.transaction(&outcome)))
            }
            other => {
                *session = other;
                Ok(Some("(error) ERR EXEC without MULTI".red().to_string()))
            }
        },

        "discard" | "unwatch" => match session.take() {
            Some(open) => {
                open.tx.discard().await?;
                Ok(Some("OK".green().to_string()))
            }
            None => Ok(Some("OK".green().to_string())),
        },

        "subscribe" | "psubscribe" if session.is_none() => {
            if args.is_empty() {
                return Ok(Some(format!("Usage: {} <name...>", name.to_lowercase())));
            }
            let sub = if name.eq_ignore_ascii_case("subscribe") {
                client.subscribe(args.iter().cloned()).await?
            } else {
                client.psubscribe(args.iter().cloned()).await?
            };
            println!(
                "{}",
                format!("Listening on {} (Ctrl+C to stop)", args.join(", ")).dimmed()
            );
            follow(sub, output).await?;
            Ok(Some(String::new()))
        }

        _ => {
            let Some(cmd) = commands::to_command(&words) else {
                return Ok(Some(String::new()));
            };
            match session {
                Some(open) if open.multi => match open.tx.stage(cmd).await {
                    Ok(_) => Ok(Some("QUEUED".green().to_string())),
                    Err(ClientError::Command(err)) => Ok(Some(output.reply(&Err(err)))),
                    Err(e) => Err(e.into()),
                },
                // the watching transaction owns the connection's write path
                Some(_) => Ok(Some(
                    "(error) run MULTI, or DISCARD to release the watched keys"
                        .red()
                        .to_string(),
                )),
                None => Ok(Some(output.result(client.command(cmd).await)?)),
            }
        }
    }
}

/// Prints messages from a subscription until Ctrl+C or connection loss.
pub async fn follow(mut sub: Subscription, output: Output) -> Result<(), ClientError> {
    loop {
        tokio::select! {
            message = sub.next() => match message {
                Some(message) => println!("{}", output.message(&message)),
                None => {
                    println!("{}", "Subscription closed by connection loss.".yellow());
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("\n{}", "Stopped.".dimmed());
                break;
            }
        }
    }
    sub.unsubscribe().await
}
