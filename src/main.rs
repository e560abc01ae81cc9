//! ThinkDeeper CLI
//!
//! Runs the reasoning-length controller over a local Llama checkpoint, or over the built-in
//! simulated model when no checkpoint is given.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use thinkdeeper::backend::loader::load_llama_dir;
use thinkdeeper::backend::simulated::Ramble;
use thinkdeeper::backend::{Drive, LlamaSource, SimulatedSource};
use thinkdeeper::inference::Sampler;
use thinkdeeper::{
    ConfigError, ForceClosePolicy, Generation, ReasoningController, SessionConfig, ThinkDeeperOptions,
    ThinkError, TokenSource,
};

/// How the prompt is wrapped before generation.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum Template {
    /// `<|im_start|>user ... <|im_start|>assistant` turn markup
    #[default]
    Chatml,
    /// Prompt passed through untouched
    Raw,
}

impl Template {
    #[must_use]
    pub fn apply(self, prompt: &str) -> String {
        match self {
            Self::Chatml => {
                format!("<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n")
            }
            Self::Raw => prompt.to_string(),
        }
    }
}

/// Output format for the completion.
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Completion text only
    #[default]
    Plain,
    /// JSON with counters and substitutions
    Json,
}

/// ThinkDeeper - keep a model thinking for a bounded amount of reasoning.
#[derive(Debug, Parser)]
#[command(
    name = "thinkdeeper",
    version,
    about = "Enforce minimum and maximum reasoning length while decoding",
    long_about = "Drives a model one token at a time. An end-of-thinking marker proposed before the \
                  minimum is replaced with a continuation phrase; the span is closed by force once \
                  the maximum or the thought-switch cap is reached.\n\n\
                  Without --model-dir a simulated model is used."
)]
struct Cli {
    /// The user prompt
    #[arg(index = 1)]
    prompt: Option<String>,

    /// Controller options: inline JSON or a path to a JSON file (request payloads with a
    /// nested `thinkdeeper_config` object are accepted too)
    #[arg(long)]
    options: Option<String>,

    /// Minimum reasoning units before the thinking span may close
    #[arg(long)]
    min_units: Option<usize>,

    /// Reasoning units after which the span is force-closed
    #[arg(long)]
    max_units: Option<usize>,

    /// Thought switches after which the span is force-closed
    #[arg(long)]
    max_switches: Option<usize>,

    /// Cap on answer units after the span closes
    #[arg(long)]
    max_answer_units: Option<usize>,

    /// Text seeded right after the start marker
    #[arg(long)]
    prefill: Option<String>,

    /// Replacement phrase for a premature close (repeatable)
    #[arg(long = "replacement")]
    replacements: Vec<String>,

    /// Stop right after a forced end marker instead of letting the model answer
    #[arg(long)]
    halt_on_force_close: bool,

    /// Directory with config.json, tokenizer.json and model.safetensors
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Sampling temperature (0 = greedy)
    #[arg(short, long, default_value = "1.0")]
    temperature: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    top_k: usize,

    /// Top-p (nucleus) sampling (1 = disabled)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Random seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// Prompt template
    #[arg(long, value_enum, default_value = "chatml")]
    template: Template,

    /// Output format
    #[arg(long, value_enum, default_value = "plain")]
    format: OutputFormat,

    /// Interactive REPL mode
    #[arg(short, long)]
    interactive: bool,

    /// Debug logging on stderr
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Serialize)]
struct JsonOutput<'a> {
    prompt: &'a str,
    backend: &'static str,
    #[serde(flatten)]
    generation: &'a Generation,
    generation_time_ms: u64,
    seed: Option<u64>,
    config: &'a SessionConfig,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if is_config_error(&err) {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("thinkdeeper=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("thinkdeeper=info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || cause
                .downcast_ref::<ThinkError>()
                .is_some_and(ThinkError::is_config)
    })
}

fn run(cli: &Cli) -> Result<()> {
    let config = session_config(cli)?;
    tracing::debug!(?config, "resolved session config");

    match &cli.model_dir {
        Some(dir) => {
            let loaded = load_llama_dir(dir, &candle_core::Device::Cpu)
                .context("Failed to load model directory")?;
            let sampler = Sampler {
                temperature: cli.temperature,
                top_k: cli.top_k,
                top_p: cli.top_p,
            };
            let source = LlamaSource::new(loaded.model, loaded.tokenizer, sampler, cli.seed);
            let controller = ReasoningController::new(source, config).map_err(ThinkError::from)?;
            drive(controller, cli, "llama")
        }
        None => {
            let source = SimulatedSource::new(Drive::Ramble(Ramble::new(cli.seed)))
                .with_markers(&config.start_marker, &config.end_marker);
            let controller = ReasoningController::new(source, config).map_err(ThinkError::from)?;
            drive(controller, cli, "simulated")
        }
    }
}

/// Options file (or inline JSON) overlaid with explicit flags.
fn session_config(cli: &Cli) -> Result<SessionConfig> {
    let base = match cli.options.as_deref() {
        Some(raw) if raw.trim_start().starts_with('{') => parse_options(raw)?,
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read options file {path}"))?;
            parse_options(&raw).with_context(|| format!("Invalid options file {path}"))?
        }
        None => ThinkDeeperOptions::default(),
    };

    let flags = ThinkDeeperOptions {
        min_reasoning_units: cli.min_units,
        max_reasoning_units: cli.max_units,
        max_thought_switches: cli.max_switches,
        max_answer_units: cli.max_answer_units,
        replacement_phrases: (!cli.replacements.is_empty()).then(|| cli.replacements.clone()),
        prefill: cli.prefill.clone(),
        force_close: cli.halt_on_force_close.then_some(ForceClosePolicy::Halt),
        ..ThinkDeeperOptions::default()
    };

    Ok(SessionConfig::resolve(&base.merged(flags))?)
}

fn parse_options(raw: &str) -> Result<ThinkDeeperOptions, ConfigError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    ThinkDeeperOptions::from_request(&value)
}

fn drive<S: TokenSource>(
    mut controller: ReasoningController<S>,
    cli: &Cli,
    backend: &'static str,
) -> Result<()> {
    let mut rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    if cli.interactive {
        return run_interactive_mode(&mut controller, &mut rng, cli, backend);
    }

    let prompt = cli.prompt.as_deref().context(
        "No prompt provided. Usage: thinkdeeper \"How many r's are in strawberry?\"\n\
         Or run interactive mode: thinkdeeper --interactive\n\
         Run thinkdeeper --help for more options.",
    )?;
    let (generation, generation_time_ms) = generate_once(&mut controller, &mut rng, cli, prompt)?;
    output(cli, backend, controller.config(), prompt, &generation, generation_time_ms)
}

fn run_interactive_mode<S: TokenSource>(
    controller: &mut ReasoningController<S>,
    rng: &mut StdRng,
    cli: &Cli,
    backend: &'static str,
) -> Result<()> {
    println!("ThinkDeeper - Interactive Mode ({backend} backend)");
    println!("Type a prompt and press Enter. Type 'quit' or 'exit' to leave.\n");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        print!("> ");
        stdout.flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let input = input.trim();

        if input.eq_ignore_ascii_case("quit") || input.eq_ignore_ascii_case("exit") {
            break;
        }
        if input.is_empty() {
            continue;
        }

        match generate_once(controller, rng, cli, input) {
            Ok((generation, generation_time_ms)) => {
                output(cli, backend, controller.config(), input, &generation, generation_time_ms)?;
                println!();
            }
            Err(err) => {
                eprintln!("Error: {err:#}");
                eprintln!();
            }
        }
    }

    Ok(())
}

fn generate_once<S: TokenSource>(
    controller: &mut ReasoningController<S>,
    rng: &mut StdRng,
    cli: &Cli,
    prompt: &str,
) -> Result<(Generation, u64)> {
    let formatted = cli.template.apply(prompt);

    let start = Instant::now();
    let generation = controller.run(&formatted, rng)?;
    let generation_time_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);

    Ok((generation, generation_time_ms))
}

fn output(
    cli: &Cli,
    backend: &'static str,
    config: &SessionConfig,
    prompt: &str,
    generation: &Generation,
    generation_time_ms: u64,
) -> Result<()> {
    match cli.format {
        OutputFormat::Plain => {
            print!("{}", generation.text);
            if !generation.text.ends_with('\n') {
                println!();
            }
        }
        OutputFormat::Json => {
            let payload = JsonOutput {
                prompt,
                backend,
                generation,
                generation_time_ms,
                seed: cli.seed,
                config,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
    }

    Ok(())
}
