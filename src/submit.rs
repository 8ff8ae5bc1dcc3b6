use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{info, warn};

use hypershell_scheduler::Scheduler;
use hypershell_store::Store;

/// Reads one task per line from `reader`, skipping blank lines and `#`
/// comments, and submits each to the scheduler (spec sections 4.1, 6).
/// Blocks on a full ready-queue — this *is* the backpressure point (spec
/// section 5). Returns the number of lines submitted.
pub async fn run_submitter<R>(scheduler: Arc<Scheduler>, mut reader: R, template: String) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let mut count = 0usize;
    loop {
        line.clear();
        let bytes = reader.read_line(&mut line).await?;
        if bytes == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match scheduler.submit_line(trimmed.to_string(), template.clone()).await {
            Ok(task) => {
                count += 1;
                info!(task_id = task.id, "submitted");
            }
            Err(e) => warn!(error = %e, line = trimmed, "failed to submit line"),
        }
    }
    info!(count, "submitter reached end of input");
    Ok(count)
}

/// Inserts one task directly into a shared store without owning a
/// ready-queue, for the standalone `submit` subcommand talking to an
/// already-running server's durable store. A background promoter on the
/// server side (`Scheduler::run_promoter`) picks these up.
pub async fn submit_direct(store: &dyn Store, args: String, template: String, max_attempts: u32) -> Result<u64, hypershell_store::StoreError> {
    if let Err(parse_err) = hypershell_template::validate(&template) {
        let task = store.insert(args, template, max_attempts).await?;
        store.fail_at_submission(task.id, parse_err.to_string()).await?;
        return Ok(task.id);
    }
    let task = store.insert(args, template, max_attempts).await?;
    Ok(task.id)
}
