//! `mclaw agent` — talk to the agent directly: one-shot with `-m`, or an
//! interactive REPL.

use super::runtime;
use mclaw_config::Config;
use std::io::Write;
use std::path::Path;

const SESSION_KEY: &str = "cli:direct";

pub async fn run(
    config_path: &Path,
    message: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let cfg = Config::load_from(config_path)?;
    let rt = runtime::build(cfg).await?;

    if let Some(message) = message {
        let response = rt.agent.process_direct(&message, SESSION_KEY).await?;
        println!("{response}");
        return Ok(());
    }

    println!("mclaw interactive agent (model: {})", rt.switcher.current_model());
    println!("Type your message, or 'exit' to quit.\n");

    let stdin = std::io::stdin();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }

        match rt.agent.process_direct(line, SESSION_KEY).await {
            Ok(response) => println!("mclaw> {response}\n"),
            Err(e) => println!("mclaw> {}\n", mclaw_agent::format_error_for_user(&e)),
        }
    }

    Ok(())
}
