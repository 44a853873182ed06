use std::io::Write;

use anyhow::Result;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use skillcall::agent::{ExecutionMode, RunOutput, RunRequest, StreamChunk};
use skillcall::config::Config;
use skillcall::skills::{LoadOptions, SkillCatalog, SkillManager};
use skillcall::AgentBuilder;

fn print_help() {
    println!(
        "\
skillcall v{}

Chat with an LLM that can call the skills described in a manifest folder.

USAGE:
    skillcall [OPTIONS] [CONFIG_PATH]

ARGUMENTS:
    CONFIG_PATH    Path to TOML configuration file [default: config/agent.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit

PROMPT COMMANDS:
    /mode <wait_response|execution_only|get_args>    Execution mode for later prompts
    /skills                                          List registered skills
    /help                                            This message

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, skillcall=debug,warn)
    OPENAI_API_KEY        API key for OpenAI models
    ANTHROPIC_API_KEY     API key for Anthropic Claude models
    GROQ_API_KEY          API key for Groq-hosted models

EXAMPLES:
    skillcall                             # uses config/agent.toml
    skillcall ./ollama.toml               # custom config path
    RUST_LOG=debug skillcall              # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("skillcall v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("skillcall=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;
    info!("LLM: {} ({})", config.llm.provider, config.llm.model);

    let mut manager = SkillManager::new();
    if let Some(folder) = &config.skills.folder {
        let mut options = LoadOptions::default();
        if let Some(tags) = &config.skills.tags {
            options = options.with_tags(tags.iter().cloned());
        }
        let report = manager.load_from_folder(folder, &SkillCatalog::new(), &options);
        info!(
            "Skills from {}: {} registered, {} skipped, {} failed",
            folder.display(),
            report.registered.len(),
            report.skipped.len(),
            report.failed.len()
        );
        for failure in &report.failed {
            warn!("  {}: {}", failure.name, failure.error);
        }
    }

    let agent = AgentBuilder::from_config(&config, manager.shared())?.build()?;
    info!("Skills: {}", agent.skill_names().join(", "));

    let mut mode = ExecutionMode::default();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received, exiting");
                return Ok(());
            }
        };
        let Some(line) = line else {
            return Ok(());
        };
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }

        // Slash commands never reach the LLM
        if let Some(command) = prompt.strip_prefix('/') {
            let mut parts = command.splitn(2, ' ');
            match (parts.next().unwrap_or(""), parts.next().map(str::trim)) {
                ("mode", Some(value)) => match value.parse() {
                    Ok(m) => {
                        mode = m;
                        println!("mode: {mode}");
                    }
                    Err(e) => println!("{e}"),
                },
                ("skills", _) => println!("{}", agent.skill_names().join("\n")),
                ("help", _) => print_help(),
                _ => println!("Unknown command: /{command}\nType /help for available commands."),
            }
            continue;
        }

        match agent.run(RunRequest::new(prompt).mode(mode)).await {
            Ok(output) => print_output(output).await,
            Err(e) => error!("Run failed: {e}"),
        }
    }
}

async fn print_output(output: RunOutput) {
    match output {
        RunOutput::Text(text) => println!("{text}"),
        RunOutput::Arguments(calls) => {
            for call in calls {
                println!("{}({})", call.name, call.arguments.clone().into_value());
            }
        }
        RunOutput::Dispatched(receipt) => {
            for outcome in receipt.wait_all().await {
                match outcome.result {
                    Ok(value) => println!("{} -> {value}", outcome.name),
                    Err(e) => println!("{e}"),
                }
            }
        }
        RunOutput::Response(response) => println!("{}", response.raw),
        RunOutput::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(StreamChunk::Text(text)) => {
                        print!("{text}");
                        let _ = std::io::stdout().flush();
                    }
                    Ok(StreamChunk::Dispatch(output)) => {
                        println!();
                        Box::pin(print_output(output)).await;
                    }
                    Ok(StreamChunk::Response(response)) => println!("\n{}", response.raw),
                    Err(e) => error!("Stream failed: {e}"),
                }
            }
            println!();
        }
    }
}
