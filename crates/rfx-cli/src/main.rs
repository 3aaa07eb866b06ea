use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use rfx_core::links;
use rfx_core::{
    CancellationToken, Config, ConfigLoader, ControllerSetup, ConversationSession, CycleError,
    CycleEvent, CycleReport, EvaluationHarness, EventCollector, Monologue, OrchestrationController,
    ResearchContext, TelemetryOptions, build_controller, build_link_validator, focus_phrase,
    init_telemetry, persist_monologue, resolve_contexts,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tracing::{info, warn};
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "rfx",
    version,
    about = "Answer questionnaire questions with checked, cited answers"
)]
struct Cli {
    /// Configuration file (defaults to $RFX_CONFIG, then ./rfx.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer a single question in a fresh session.
    Ask(AskArgs),
    /// Interactive session reading questions from stdin.
    Chat(ChatArgs),
    /// Answer every line of one or more questionnaire files.
    Batch(BatchArgs),
    /// Check the reachability of URLs.
    CheckLinks(CheckLinksArgs),
    /// Summarise a cycles.jsonl log.
    Eval(EvalArgs),
}

#[derive(Args, Debug)]
struct AskArgs {
    #[arg(long)]
    question: String,

    /// Research context to scope search (repeatable): "Azure AI", fabric, copilot-studio, m365-copilot.
    #[arg(long = "context")]
    contexts: Vec<String>,

    /// Print the intermediate agent messages.
    #[arg(long)]
    monologue: bool,

    /// Print the intermediate agent messages as a Mermaid flowchart.
    #[arg(long)]
    mermaid: bool,

    /// Persist the intermediate agent messages as JSON in this directory.
    #[arg(long)]
    trace_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long = "context")]
    contexts: Vec<String>,
}

#[derive(Args, Debug)]
struct BatchArgs {
    /// Questionnaire file or directory, one question per line.
    #[arg(long)]
    path: PathBuf,

    /// Recurse into subdirectories.
    #[arg(long, default_value_t = false)]
    recursive: bool,

    #[arg(long = "context")]
    contexts: Vec<String>,
}

#[derive(Args, Debug)]
struct CheckLinksArgs {
    #[arg(required = true)]
    urls: Vec<String>,
}

#[derive(Args, Debug)]
struct EvalArgs {
    /// Path to a cycles.jsonl file.
    #[arg(long)]
    log: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;

    init_telemetry(TelemetryOptions {
        env_filter: std::env::var("RUST_LOG")
            .ok()
            .or_else(|| Some(format!("warn,rfx_core={}", config.logging.level))),
        ..TelemetryOptions::default()
    })?;
    rfx_core::metrics::init_metrics_from_env("rfx");

    let rt = Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Command::Ask(args) => ask_command(&config, args).await,
            Command::Chat(args) => chat_command(&config, args).await,
            Command::Batch(args) => batch_command(&config, args).await,
            Command::CheckLinks(args) => check_links_command(&config, args).await,
            Command::Eval(args) => eval_command(args),
        }
    })
}

/// Every Ctrl-C press for the rest of the process.
///
/// Listening replaces the default SIGINT handler, so one listener is kept for
/// the whole run and each command decides what a press means.
fn interrupts() -> UnboundedReceiver<()> {
    let (sender, receiver) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if sender.send(()).is_err() {
                break;
            }
        }
    });
    receiver
}

/// Drive `work` to completion, cancelling `cancel` on each interrupt.
async fn until_interrupted<F, T>(
    work: F,
    cancel: &CancellationToken,
    interrupts: &mut UnboundedReceiver<()>,
) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(work);
    loop {
        tokio::select! {
            output = &mut work => return output,
            Some(()) = interrupts.recv() => cancel.cancel(),
        }
    }
}

/// Run one question; Ctrl-C cancels it.
async fn ask_interruptible(
    controller: &OrchestrationController,
    session: &mut ConversationSession,
    question: &str,
    interrupts: &mut UnboundedReceiver<()>,
) -> Result<CycleReport, CycleError> {
    let cancel = CancellationToken::new();
    until_interrupted(controller.ask(session, question, &cancel), &cancel, interrupts).await
}

async fn ask_command(config: &Config, args: AskArgs) -> Result<()> {
    let contexts = resolve_contexts(config, &args.contexts);
    let expose = args.monologue || args.mermaid || args.trace_dir.is_some();
    let controller = build_controller(
        config,
        ControllerSetup {
            expose_monologue: expose,
            events: None,
        },
    )?;
    let mut session = ConversationSession::new(contexts);
    info!(session_id = %session.id(), focus = %session.focus(), "asking question");

    let mut interrupts = interrupts();
    let result = ask_interruptible(&controller, &mut session, &args.question, &mut interrupts).await;
    let monologue = match &result {
        Ok(report) => report.monologue.clone(),
        Err(err) => err.failure().map(|f| f.monologue.clone()).unwrap_or_default(),
    };
    let rendered = Monologue::from_turns(&monologue);
    if args.monologue {
        eprintln!("{}", rendered.render_markdown());
    }
    if args.mermaid {
        eprintln!("{}", rendered.render_mermaid());
    }
    if let Some(dir) = &args.trace_dir {
        let path = persist_monologue(dir, session.id(), &monologue)?;
        info!(path = %path.display(), "monologue written");
    }

    match result {
        Ok(report) => {
            println!("{}", report.answer.text);
            Ok(())
        }
        Err(CycleError::IterationExhausted(failure)) => {
            println!("{}", failure.summary());
            if let Some(answer) = &failure.last_answer {
                println!("\nLast unapproved draft:\n{}", answer.text);
            }
            bail!("question was not approved")
        }
        Err(CycleError::Cancelled) => bail!("question cancelled"),
    }
}

async fn chat_command(config: &Config, args: ChatArgs) -> Result<()> {
    let (events, mut receiver) = EventCollector::new();
    let mut controller = build_controller(
        config,
        ControllerSetup {
            expose_monologue: false,
            events: Some(events),
        },
    )?;
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let CycleEvent::StageEntered {
                iteration, stage, ..
            } = event
            {
                eprintln!("  .. {stage} (iteration {iteration})");
            }
        }
    });

    let mut session = ConversationSession::new(resolve_contexts(config, &args.contexts));
    let mut interrupts = interrupts();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!(
        "Answering for {}. Commands: /contexts a,b  /monologue  /reset  /quit. Ctrl-C cancels a running question, or exits at the prompt.",
        session.focus()
    );

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let line = tokio::select! {
            line = lines.next_line() => line?,
            Some(()) = interrupts.recv() => None,
        };
        let Some(line) = line else {
            println!();
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match input {
            "/quit" | "/exit" => break,
            "/reset" => {
                let contexts = session.contexts().clone();
                session = ConversationSession::new(contexts);
                println!("Started a new session ({}).", session.id());
                continue;
            }
            "/monologue" => {
                let expose = !controller.options().expose_monologue;
                controller.set_expose_monologue(expose);
                println!("Inner monologue {}.", if expose { "on" } else { "off" });
                continue;
            }
            _ => {}
        }
        if let Some(list) = input.strip_prefix("/contexts") {
            let labels: Vec<&str> = list.split(',').map(str::trim).filter(|l| !l.is_empty()).collect();
            let contexts = ResearchContext::parse_all(&labels);
            println!("Now answering for {}.", focus_phrase(&contexts));
            session.set_contexts(contexts);
            continue;
        }

        match ask_interruptible(&controller, &mut session, input, &mut interrupts).await {
            Ok(report) => {
                print_monologue(&report.monologue);
                println!("{}\n", report.answer.text);
            }
            Err(CycleError::IterationExhausted(failure)) => {
                print_monologue(&failure.monologue);
                println!("{}\n", failure.summary());
            }
            Err(CycleError::Cancelled) => println!("Cancelled; nothing was added to the session.\n"),
        }
    }
    Ok(())
}

fn print_monologue(turns: &[rfx_core::ConversationTurn]) {
    if !turns.is_empty() {
        eprintln!("{}", Monologue::from_turns(turns).render_markdown());
    }
}

async fn batch_command(config: &Config, args: BatchArgs) -> Result<()> {
    let questions = collect_questions(&args.path, args.recursive)?;
    if questions.is_empty() {
        info!(path = %args.path.display(), "no questions found");
        return Ok(());
    }

    let controller = build_controller(config, ControllerSetup::default())?;
    let mut session = ConversationSession::new(resolve_contexts(config, &args.contexts));
    let (mut approved, mut failed) = (0usize, 0usize);
    let mut interrupts = interrupts();

    for (index, question) in questions.iter().enumerate() {
        println!("## {}. {question}", index + 1);
        match ask_interruptible(&controller, &mut session, question, &mut interrupts).await {
            Ok(report) => {
                approved += 1;
                println!("[approved after {} iteration(s)]\n{}\n", report.iterations, report.answer.text);
            }
            Err(CycleError::IterationExhausted(failure)) => {
                failed += 1;
                println!("[failed]\n{}\n", failure.summary());
            }
            Err(CycleError::Cancelled) => {
                warn!("batch cancelled");
                break;
            }
        }
    }

    println!("{approved} approved, {failed} failed, {} total", questions.len());
    Ok(())
}

fn collect_questions(path: &Path, recursive: bool) -> Result<Vec<String>> {
    let files: Vec<PathBuf> = if path.is_file() {
        vec![path.to_path_buf()]
    } else {
        let mut files: Vec<PathBuf> = WalkDir::new(path)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .collect();
        files.sort();
        files
    };

    let mut questions = Vec::new();
    for file in files {
        let text =
            fs::read_to_string(&file).with_context(|| format!("failed to read {}", file.display()))?;
        questions.extend(
            text.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string),
        );
    }
    Ok(questions)
}

async fn check_links_command(config: &Config, args: CheckLinksArgs) -> Result<()> {
    let validator = build_link_validator(config)?;
    let settings = config.links.settings();
    let report = links::check_all(
        &validator,
        &args.urls,
        settings.max_concurrent,
        settings.verdict_budget(),
    )
    .await;
    for verdict in &report.verdicts {
        let status = verdict
            .status
            .map(|code| code.to_string())
            .unwrap_or_else(|| "-".to_string());
        if verdict.reachable {
            println!("ok    {status}  {}", verdict.url);
        } else {
            println!(
                "FAIL  {status}  {}  ({}: {})",
                verdict.url,
                verdict.reason.as_str(),
                verdict.detail.as_deref().unwrap_or("")
            );
        }
    }
    if !report.all_links_valid() {
        bail!("{} link(s) unreachable", report.invalid().count());
    }
    Ok(())
}

fn eval_command(args: EvalArgs) -> Result<()> {
    let metrics = EvaluationHarness::analyze_log(&args.log)?;
    println!("{}", metrics.summary());
    for session_id in &metrics.failures {
        println!("failed: {session_id}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn work_without_interrupt_completes_untouched() {
        let (_sender, mut receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let output = until_interrupted(async { 7 }, &cancel, &mut receiver).await;
        assert_eq!(output, 7);
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn every_interrupt_reaches_the_running_work() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        for round in 0..2 {
            let cancel = CancellationToken::new();
            let observed = cancel.clone();
            let work = async move {
                tokio::select! {
                    _ = observed.cancelled() => "cancelled",
                    _ = tokio::time::sleep(Duration::from_secs(60)) => "finished",
                }
            };
            sender.send(()).unwrap();
            let output = until_interrupted(work, &cancel, &mut receiver).await;
            assert_eq!(output, "cancelled", "round {round}");
        }
    }
}
