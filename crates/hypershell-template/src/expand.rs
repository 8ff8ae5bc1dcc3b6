use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::TemplateError;
use crate::expr;
use crate::parser::{self, Segment};

/// Per-task bindings available to `{% %}` subshells and surfaced to the
/// shell environment alongside the expanded command (spec section 4.1).
#[derive(Debug, Clone)]
pub struct Bindings {
    pub task_id: u64,
    pub attempt: u32,
    pub host: Option<String>,
}

/// Expand `template` against `args`. Pure when the template contains no
/// `{% %}` subshell splice (spec testable property 5); the subshell form is
/// the one deliberate exception, since it is documented as running a
/// command.
pub async fn expand(template: &str, args: &str, bindings: &Bindings) -> Result<String, TemplateError> {
    let segments = parser::parse(template)?;
    let tokens: Vec<&str> = args.split_whitespace().collect();
    let mut out = String::new();

    for segment in segments {
        let piece = match segment {
            Segment::Literal(s) => s,
            Segment::FullArg => args.to_string(),
            Segment::Basename => Path::new(args)
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Segment::Dirname => Path::new(args)
                .parent()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Segment::StripExt => strip_ext(args),
            Segment::BasenameStripExt => {
                let base = Path::new(args)
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                strip_ext(&base)
            }
            Segment::BasenameStripAllExt => {
                let base = Path::new(args)
                    .file_name()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                strip_all_ext(&base)
            }
            Segment::Index(i) => token_at(&tokens, i)?.to_string(),
            Segment::Slice(start, stop, step) => token_slice(&tokens, start, stop, step)?,
            Segment::Subshell(cmd) => run_subshell(&cmd, args).await?,
            Segment::Expr(src) => expr::eval(&src, args)?,
        };
        out.push_str(&piece);
    }

    debug!(task_id = bindings.task_id, attempt = bindings.attempt, "template expanded");
    Ok(out)
}

fn strip_ext(s: &str) -> String {
    let path = Path::new(s);
    match (path.parent(), path.file_stem()) {
        (Some(parent), Some(stem)) if !parent.as_os_str().is_empty() => {
            parent.join(stem).to_string_lossy().into_owned()
        }
        (_, Some(stem)) => stem.to_string_lossy().into_owned(),
        _ => s.to_string(),
    }
}

fn strip_all_ext(s: &str) -> String {
    match s.split_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => s.to_string(),
    }
}

fn token_at<'a>(tokens: &[&'a str], i: i64) -> Result<&'a str, TemplateError> {
    let len = tokens.len();
    let idx = if i < 0 { i + len as i64 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(TemplateError::IndexOutOfRange { index: i, len });
    }
    Ok(tokens[idx as usize])
}

fn resolve_bound(i: Option<i64>, len: usize, default: usize) -> usize {
    match i {
        None => default,
        Some(n) => {
            let idx = if n < 0 { n + len as i64 } else { n };
            idx.clamp(0, len as i64) as usize
        }
    }
}

fn token_slice(
    tokens: &[&str],
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
) -> Result<String, TemplateError> {
    let len = tokens.len();
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(TemplateError::InvalidSlice("step cannot be zero".into()));
    }
    if step < 0 {
        return Err(TemplateError::InvalidSlice("negative step is not supported".into()));
    }
    let start = resolve_bound(start, len, 0);
    let stop = resolve_bound(stop, len, len).max(start);
    let selected: Vec<&str> = tokens[start..stop.min(len)]
        .iter()
        .step_by(step as usize)
        .copied()
        .collect();
    Ok(selected.join(" "))
}

async fn run_subshell(cmd: &str, arg: &str) -> Result<String, TemplateError> {
    let substituted = cmd.replace('@', arg);
    let shell = if cfg!(windows) { "cmd" } else { "/bin/sh" };
    let flag = if cfg!(windows) { "/C" } else { "-c" };

    let output = Command::new(shell)
        .arg(flag)
        .arg(&substituted)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| TemplateError::SubshellSpawnFailed(e.to_string()))?;

    if !output.status.success() {
        return Err(TemplateError::SubshellFailed(output.status.code()));
    }

    let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    while stdout.ends_with('\n') || stdout.ends_with('\r') {
        stdout.pop();
    }
    Ok(stdout)
}

/// Parse-only validation, used at submission time so a malformed template
/// is rejected before the task is ever dispatched.
pub fn validate(template: &str) -> Result<(), TemplateError> {
    parser::parse(template).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        Bindings { task_id: 1, attempt: 1, host: None }
    }

    #[tokio::test]
    async fn expands_full_arg() {
        assert_eq!(expand("echo {}", "0", &bindings()).await.unwrap(), "echo 0");
    }

    #[tokio::test]
    async fn expands_path_forms() {
        assert_eq!(expand("{/}", "/a/b/c.tar.gz", &bindings()).await.unwrap(), "c.tar.gz");
        assert_eq!(expand("{//}", "/a/b/c.tar.gz", &bindings()).await.unwrap(), "/a/b");
        assert_eq!(expand("{.}", "/a/b/c.tar.gz", &bindings()).await.unwrap(), "/a/b/c.tar");
        assert_eq!(expand("{/.}", "/a/b/c.tar.gz", &bindings()).await.unwrap(), "c.tar");
        assert_eq!(expand("{/-}", "/a/b/c.tar.gz", &bindings()).await.unwrap(), "c");
    }

    #[tokio::test]
    async fn expands_whitespace_slice() {
        assert_eq!(
            expand("echo {[1:3]}", "one two three four", &bindings()).await.unwrap(),
            "echo two three"
        );
    }

    #[tokio::test]
    async fn out_of_range_index_fails() {
        let err = expand("{[5]}", "one two three", &bindings()).await.unwrap_err();
        assert!(matches!(err, TemplateError::IndexOutOfRange { .. }));
    }

    #[tokio::test]
    async fn subshell_strips_trailing_newline() {
        let result = expand("{% echo @ %}", "hello", &bindings()).await.unwrap();
        assert_eq!(result, "hello");
    }

    #[tokio::test]
    async fn expr_form_evaluates() {
        assert_eq!(expand("{= upper(x) =}", "hi", &bindings()).await.unwrap(), "HI");
    }
}
