//! Environment assembly for a task's shell process (spec section 4.1).

const EXPORT_PREFIX: &str = "HYPERSHELL_EXPORT_";
const RESERVED: [&str; 2] = ["HYPERSHELL_EXE", "HYPERSHELL_CWD"];

/// Build the full environment for a task's subprocess: every
/// `HYPERSHELL_EXPORT_*` variable from the client's environment, with the
/// prefix stripped, plus the fixed `TASK_*` bindings. `HYPERSHELL_EXE` and
/// `HYPERSHELL_CWD` are reserved for the client itself and never propagated.
pub fn build_task_env<I>(client_env: I, task_id: u64, args: &str, attempt: u32, host: &str) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out = Vec::new();

    for (key, value) in client_env {
        if RESERVED.contains(&key.as_str()) {
            continue;
        }
        if let Some(stripped) = key.strip_prefix(EXPORT_PREFIX) {
            out.push((stripped.to_string(), value));
        }
    }

    out.push(("TASK_ID".to_string(), task_id.to_string()));
    out.push(("TASK_ARGS".to_string(), args.to_string()));
    out.push(("TASK_ATTEMPT".to_string(), attempt.to_string()));
    out.push(("TASK_HOST".to_string(), host.to_string()));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_export_prefix_and_adds_task_bindings() {
        let env = vec![
            ("HYPERSHELL_EXPORT_FOO".to_string(), "bar".to_string()),
            ("HYPERSHELL_EXE".to_string(), "/usr/bin/hyper-shell".to_string()),
            ("PATH".to_string(), "/usr/bin".to_string()),
        ];
        let built = build_task_env(env, 7, "arg", 2, "worker-1");
        assert!(built.contains(&("FOO".to_string(), "bar".to_string())));
        assert!(!built.iter().any(|(k, _)| k == "HYPERSHELL_EXE"));
        assert!(!built.iter().any(|(k, _)| k == "PATH"));
        assert!(built.contains(&("TASK_ID".to_string(), "7".to_string())));
        assert!(built.contains(&("TASK_ATTEMPT".to_string(), "2".to_string())));
        assert!(built.contains(&("TASK_HOST".to_string(), "worker-1".to_string())));
    }
}
