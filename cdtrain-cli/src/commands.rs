//! Run a training or evaluation job from a resolved configuration.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cdtrain_core::persistence::atomic_write;
use cdtrain_core::{ExperimentLayout, RunConfig, RunLogger, RunOutcome, Trainer, TracingLogger};

/// Archive the resolved configuration next to the experiment artifacts.
pub(crate) fn write_config_snapshot(config: &RunConfig, root: &Path) -> anyhow::Result<PathBuf> {
    let body = config.to_toml()?;
    let stamped = format!(
        "# cdtrain {} configuration, written {}\n{body}",
        config.cmd.as_str(),
        chrono::Local::now().to_rfc3339()
    );
    let path = root.join(format!("config_{}.toml", config.cmd.as_str()));
    atomic_write(&path, stamped.as_bytes())
        .with_context(|| format!("failed to write '{}'", path.display()))?;
    Ok(path)
}

/// Ask for free-form notes describing the run. Skipped without a terminal.
fn prompt_notes() -> anyhow::Result<Option<String>> {
    if !std::io::stdin().is_terminal() {
        return Ok(None);
    }
    let notes: String = dialoguer::Input::new()
        .with_prompt("Write some notes")
        .allow_empty(true)
        .interact_text()?;
    let notes = notes.trim();
    Ok((!notes.is_empty()).then(|| notes.to_string()))
}

/// Assemble the task and drive it through training or evaluation.
pub(crate) fn run(config: RunConfig, layout: ExperimentLayout, no_notes: bool) -> anyhow::Result<()> {
    let snapshot = write_config_snapshot(&config, layout.root())?;
    tracing::debug!(path = %snapshot.display(), "configuration archived");

    let logger: Arc<dyn RunLogger> = Arc::new(TracingLogger);
    if config.is_training() && !no_notes {
        if let Some(notes) = prompt_notes()? {
            logger.dump(&notes);
        }
    }

    let task = cdtrain_ml::build_task(&config).context("failed to assemble the task")?;
    let mut trainer = Trainer::new(&config, task, logger, Arc::new(layout))?;

    match trainer.run()? {
        RunOutcome::Trained(state) => {
            tracing::info!(
                epochs = state.start_epoch,
                best_score = state.best_score,
                best_epoch = state.best_epoch,
                "training finished"
            );
        }
        RunOutcome::Evaluated(Some(score)) => {
            tracing::info!(score, "evaluation finished");
        }
        RunOutcome::Evaluated(None) => {}
    }
    Ok(())
}
