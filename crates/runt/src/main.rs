use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use kernel_session::{
    JupyterBackend, KernelSpec, KernelSpecs, LaunchOptions, OutputMessage, SessionConfig,
    SessionLauncher, SpecResolver, StreamName,
};
use log::error;
use tabled::{settings::Style, Table, Tabled};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// List installed kernel specs
    Specs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Start a kernel, run each snippet in order, then shut it down
    Exec {
        /// The kernel to launch (default: the configured or detected default)
        #[arg(long, short)]
        kernel: Option<String>,
        /// Print each execution result as JSON instead of streaming output
        #[arg(long)]
        json: bool,
        /// Code to execute (reads from stdin if not provided)
        code: Vec<String>,
    },
}

#[derive(Tabled)]
struct SpecTableRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "LANGUAGE")]
    language: String,
    #[tabled(rename = "DEFAULT")]
    default: String,
}

impl SpecTableRow {
    fn new(spec: &KernelSpec, default_name: &str) -> Self {
        SpecTableRow {
            name: spec.name.clone(),
            display_name: spec.display_name.clone(),
            language: spec.language.clone().unwrap_or_else(|| "-".to_string()),
            default: if spec.name == default_name { "*" } else { "" }.to_string(),
        }
    }
}

fn print_spec_table(specs: &KernelSpecs) {
    let rows: Vec<SpecTableRow> = specs
        .specs
        .values()
        .map(|spec| SpecTableRow::new(spec, &specs.default_name))
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let backend = JupyterBackend::new(SessionConfig::from_env());

    match cli.command {
        Some(Commands::Specs { json }) => list_specs(&backend, json).await?,
        Some(Commands::Exec { kernel, json, code }) => {
            let ok = execute_code(&backend, kernel, json, code).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        None => println!("No command specified. Use --help for usage information."),
    }

    Ok(())
}

async fn list_specs(backend: &JupyterBackend, json: bool) -> Result<()> {
    let specs = SpecResolver::new(backend).list_specs().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
    } else {
        print_spec_table(&specs);
    }
    Ok(())
}

fn read_snippets(code: Vec<String>) -> Result<Vec<String>> {
    if !code.is_empty() {
        return Ok(code);
    }
    let mut buffer = String::new();
    io::stdin().read_to_string(&mut buffer)?;
    Ok(vec![buffer])
}

fn print_output(output: &OutputMessage) {
    match output {
        OutputMessage::Stream { name, text } => match name {
            StreamName::Stdout => {
                print!("{}", text);
                let _ = io::stdout().flush();
            }
            StreamName::Stderr => {
                eprint!("{}", text);
                let _ = io::stderr().flush();
            }
        },
        OutputMessage::Display { .. } => {
            if let Some(text) = output.plain_text() {
                println!("{}", text);
            }
        }
        OutputMessage::Error {
            ename,
            evalue,
            traceback,
        } => {
            eprintln!("{}: {}", ename, evalue);
            for line in traceback {
                eprintln!("{}", line);
            }
        }
        OutputMessage::ExecutionComplete { .. } => {}
    }
}

/// Run every snippet on one session. Returns false if any of them failed.
async fn execute_code(
    backend: &JupyterBackend,
    kernel: Option<String>,
    json: bool,
    code: Vec<String>,
) -> Result<bool> {
    let snippets = read_snippets(code)?;

    let name = match kernel {
        Some(name) => name,
        None => SpecResolver::new(backend).list_specs().await?.default_name,
    };

    let mut session = SessionLauncher::new(backend)
        .start(&LaunchOptions::new(name))
        .await?;

    let succeeded = Arc::new(AtomicBool::new(true));
    for snippet in snippets {
        let future = match session.execute(&snippet).await {
            Ok(future) => future,
            Err(e) => {
                eprintln!("Error: {}", e);
                succeeded.store(false, Ordering::SeqCst);
                break;
            }
        };

        if json {
            match future.wait().await {
                Ok(result) => {
                    if !result.success {
                        succeeded.store(false, Ordering::SeqCst);
                    }
                    println!("{}", serde_json::to_string(&result)?);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    succeeded.store(false, Ordering::SeqCst);
                }
            }
        } else {
            let flag = succeeded.clone();
            future
                .subscribe(move |item| match item {
                    Ok(output) => {
                        if matches!(output, OutputMessage::Error { .. }) {
                            flag.store(false, Ordering::SeqCst);
                        }
                        print_output(&output);
                    }
                    Err(e) => {
                        eprintln!("Error: {}", e);
                        flag.store(false, Ordering::SeqCst);
                    }
                })
                .finished()
                .await;
        }
    }

    if let Err(e) = session.shutdown().await {
        error!("Kernel was not shut down cleanly: {}", e);
    }

    Ok(succeeded.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_exec_args() {
        let cli = Cli::try_parse_from(["runt", "exec", "-k", "deno", "1 + 1", "2 + 2"]).unwrap();
        match cli.command {
            Some(Commands::Exec { kernel, json, code }) => {
                assert_eq!(kernel.as_deref(), Some("deno"));
                assert!(!json);
                assert_eq!(code, vec!["1 + 1", "2 + 2"]);
            }
            _ => panic!("expected exec"),
        }
    }

    #[test]
    fn test_spec_table_row_marks_default() {
        let python = KernelSpec::new("python3", "Python 3", Some("python"));
        let bare = KernelSpec::new("custom", "Custom", None);

        let row = SpecTableRow::new(&python, "python3");
        assert_eq!(row.default, "*");
        assert_eq!(row.language, "python");

        let row = SpecTableRow::new(&bare, "python3");
        assert_eq!(row.default, "");
        assert_eq!(row.language, "-");
    }
}
