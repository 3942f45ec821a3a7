//! Reference CLI runner for the task execution engine: wraps a single root
//! [`Task`] invocation, wiring together the default [`StrategyResolver`]
//! registrations, an [`EngineConfig`], and a `tracing-subscriber` pipeline
//! for a one-shot run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::Value;
use task_engine_core::config::EngineConfig;
use task_engine_core::context::ExecutionContext;
use task_engine_core::errors::ErrorClass;
use task_engine_core::manager::TaskManager;
use task_engine_core::strategy::atomic::AtomicStrategy;
use task_engine_core::strategy::parallel::ParallelStrategy;
use task_engine_core::strategy::recursive::RecursiveStrategy;
use task_engine_core::strategy::resolver::StrategyResolver;
use task_engine_core::strategy::sequential::SequentialStrategy;
use task_engine_core::task::TaskMessage;

/// `run <task-json> [--max-depth N] [--concurrency N]`.
#[derive(Parser, Debug)]
#[command(name = "task-engine", version, about = "Hierarchical task execution engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Execute a single task description, read from a JSON file or `-` for stdin.
    Run {
        /// Path to a JSON document `{"description": "...", ...strategy options}`,
        /// or `-` to read the same shape from stdin.
        task_json: PathBuf,

        #[arg(long, default_value_t = 5)]
        max_depth: u32,

        #[arg(long, default_value_t = 4)]
        concurrency: usize,
    },
}

fn default_resolver() -> StrategyResolver {
    StrategyResolver::with_defaults(
        Arc::new(RecursiveStrategy::new()),
        Arc::new(ParallelStrategy::new()),
        Arc::new(SequentialStrategy::new()),
        Arc::new(AtomicStrategy::new()),
    )
}

async fn read_task_document(path: &PathBuf) -> std::io::Result<Value> {
    let bytes = if path.as_os_str() == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        tokio::io::stdin().read_to_end(&mut buf).await?;
        buf
    } else {
        tokio::fs::read(path).await?
    };
    serde_json::from_slice(&bytes).map_err(std::io::Error::other)
}

/// Exit codes: `0` success, `1` recoverable failure, `2` non-recoverable
/// (auth/permission/circular), `130` cancelled.
fn exit_code_for_failure(message: &str) -> ExitCode {
    let class = ErrorClass::classify(&task_engine_core::errors::ClassifiedError::new(message));
    match class {
        ErrorClass::TaskCancelled => ExitCode::from(130),
        _ if class.is_fatal() => ExitCode::from(2),
        _ => ExitCode::from(1),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            task_json,
            max_depth,
            concurrency,
        } => run(task_json, max_depth, concurrency).await,
    }
}

async fn run(task_json: PathBuf, max_depth: u32, concurrency: usize) -> ExitCode {
    let document = match read_task_document(&task_json).await {
        Ok(doc) => doc,
        Err(err) => {
            tracing::error!(error = %err, "failed to read task document");
            return ExitCode::from(2);
        }
    };

    let description = document
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("unnamed task")
        .to_string();

    let config = Arc::new(
        EngineConfig::builder()
            .concurrency(concurrency)
            .max_depth(max_depth)
            .build(),
    );

    let session_id = uuid::Uuid::new_v4().to_string();
    let manager = TaskManager::new(default_resolver());
    let probe_ctx = ExecutionContext::root("probe", session_id.clone(), max_depth, config.clone());
    let task = manager.create_task(description, None, None, Some(document), &probe_ctx);
    let ctx = ExecutionContext::root(task.id.clone(), session_id, max_depth, config);

    let outcome = task.receive_message(TaskMessage::Start, &ctx).await;
    match serde_json::to_string_pretty(&outcome) {
        Ok(rendered) => println!("{rendered}"),
        Err(err) => tracing::warn!(error = %err, "failed to render outcome as JSON"),
    }

    if outcome.success {
        ExitCode::SUCCESS
    } else {
        let message = outcome.result.as_str().map(str::to_string).unwrap_or_else(|| outcome.result.to_string());
        exit_code_for_failure(&message)
    }
}
