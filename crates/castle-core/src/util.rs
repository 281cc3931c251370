use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Poll `check` every `poll_interval` until it returns true, giving up after
/// `max_wait`. Errors from `check` propagate immediately.
pub fn wait_for<F>(
    poll_interval: Duration,
    max_wait: Duration,
    what: &str,
    mut check: F,
) -> anyhow::Result<()>
where
    F: FnMut() -> anyhow::Result<bool>,
{
    let start = Instant::now();
    loop {
        if check()? {
            return Ok(());
        }
        if start.elapsed() > max_wait {
            anyhow::bail!("Timed out waiting for {what}");
        }
        std::thread::sleep(poll_interval);
    }
}

/// Merge two configuration maps. Entries from `primary` win.
pub fn merge_config(
    primary: &BTreeMap<String, String>,
    fallback: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = primary.clone();
    for (k, v) in fallback {
        merged.entry(k.clone()).or_insert_with(|| v.clone());
    }
    merged
}

/// Render an argument list for humans, quoting arguments which contain spaces.
pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| {
            let a = a.as_ref();
            if a.contains(' ') {
                format!("\"{a}\"")
            } else {
                a.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Remote shell arguments which signal every process matching `pattern`.
///
/// The first character of the pattern is bracketed so the awk process does
/// not match itself.
pub fn kill_process_args(pattern: &str, signal: &str) -> Vec<String> {
    let effective = bracket_first_char(pattern);
    let mut args: Vec<String> = [
        "-n",
        "--",
        "ps",
        "aux",
        "|",
        "awk",
        format!("'/{effective}/ {{ print $2 }}'").as_str(),
        "|",
        "xargs",
        "-r",
        "kill",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(["-s".to_string(), signal.to_string(), "--".to_string()]);
    args
}

/// Remote shell arguments which print the pids of processes matching `pattern`.
pub fn process_pid_args(pattern: &str) -> Vec<String> {
    let effective = bracket_first_char(pattern);
    [
        "-n",
        "--",
        "ps",
        "aux",
        "|",
        "awk",
        format!("'/{effective}/ {{ print $2 }}'").as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn bracket_first_char(pattern: &str) -> String {
    let mut chars = pattern.chars();
    match chars.next() {
        Some(first) => format!("[{first}]{}", chars.as_str()),
        None => String::new(),
    }
}

/// Render an error and every source beneath it, one per line.
pub fn full_cause_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\nCaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
