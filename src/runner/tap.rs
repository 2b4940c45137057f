use regex::Regex;
use std::sync::OnceLock;

const NOT_OK_MARKER: &str = "not ok";
const BAIL_OUT_MARKER: &str = "Bail out!";

fn directive_regex() -> &'static Regex {
    static DIRECTIVE: OnceLock<Regex> = OnceLock::new();
    DIRECTIVE.get_or_init(|| Regex::new(r"(?i)#\s*(TODO|SKIP)\b").expect("valid directive regex"))
}

/// Whether TAP output reports a failure even though the process may exit 0.
///
/// `not ok` lines qualified with a TODO or SKIP directive are expected
/// failures and do not count.
pub(crate) fn contains_tap_failure(output: &str) -> bool {
    output.lines().map(str::trim).any(|line| {
        if line.starts_with(BAIL_OUT_MARKER) {
            return true;
        }
        line.starts_with(NOT_OK_MARKER) && !directive_regex().is_match(line)
    })
}

/// Failure explanation for a finished test, or `None` when it passed.
pub(crate) fn failure_text(
    exit_ok: bool,
    timed_out: bool,
    stdout: &str,
    stderr: &str,
) -> Option<String> {
    if timed_out {
        let mut text = "timed out".to_string();
        if !stderr.trim().is_empty() {
            text.push('\n');
            text.push_str(stderr);
        }
        return Some(text);
    }
    if !exit_ok {
        let text = if stderr.is_empty() { stdout } else { stderr };
        return Some(text.to_string());
    }
    contains_tap_failure(stdout).then(|| stdout.to_string())
}
