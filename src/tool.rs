//! The instrumentation tool, driven as a subprocess.
//!
//! perlcov needs only a narrow surface from Perl and `Devel::Cover`: run a test
//! file under instrumentation, and decode or re-encode database files whose
//! encoding Rust does not read. Everything else happens in-process.
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const COVER_DB_SCRIPT: &str = include_str!("../scripts/cover_db.pl");

/// Install hint printed when the setup check fails.
pub const INSTALL_HINT: &str = "Devel::Cover is not installed. Install with: cpan Devel::Cover";

#[derive(Debug, Clone, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversionOutcome {
    #[serde(default)]
    pub converted: Vec<PathBuf>,
    #[serde(default)]
    pub failed: Vec<FailedFile>,
}

/// Native files decoded by the tool, in the canonical JSON shape.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NativeBatch {
    /// `{ "runs": { <id>: { "count": {...} } } }`, ready for the record parser.
    #[serde(default)]
    pub runs: Value,
    #[serde(default)]
    pub structure: Vec<Value>,
    #[serde(default)]
    pub failed: Vec<FailedFile>,
}

/// Re-encoding capability for database files the reader cannot parse itself.
pub trait NativeCodec: Sync {
    /// Rewrite each file as JSON in place, in a single tool invocation.
    fn convert_to_json(&self, files: &[PathBuf]) -> Result<ConversionOutcome>;

    /// Decode run and structure files in a single tool invocation.
    fn decode_native(&self, runs: &[PathBuf], structures: &[PathBuf]) -> Result<NativeBatch>;
}

#[derive(Debug, Clone)]
pub struct PerlTool {
    perl: PathBuf,
    switches: Vec<String>,
}

/// Everything needed to launch one test file.
pub struct TestInvocation<'a> {
    pub cwd: &'a Path,
    pub include_paths: &'a [PathBuf],
    pub test_file: &'a Path,
    pub cover_options: Option<&'a str>,
    pub json_db: bool,
}

impl PerlTool {
    pub fn new(perl: PathBuf, switches: Vec<String>) -> Self {
        Self { perl, switches }
    }

    pub fn perl(&self) -> &Path {
        &self.perl
    }

    /// Verify `Devel::Cover` loads and return its version.
    pub fn check_installed(&self) -> Result<String> {
        let output = Command::new(&self.perl)
            .arg("-MDevel::Cover=-silent,1,-ignore,^\\-e$")
            .args(["-e", "print $Devel::Cover::VERSION"])
            .output()
            .with_context(|| format!("run {}", self.perl.display()))?;
        if !output.status.success() {
            let mut detail = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if detail.is_empty() {
                detail = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(anyhow!("{INSTALL_HINT}\nError: {detail}"));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn test_command(&self, invocation: &TestInvocation<'_>) -> Command {
        let mut cmd = Command::new(&self.perl);
        cmd.args(&self.switches);
        for include in invocation.include_paths {
            cmd.arg("-I").arg(include);
        }
        let lib = invocation.cwd.join("lib");
        if lib.is_dir() {
            cmd.arg("-I").arg(lib);
        }
        if let Some(options) = invocation.cover_options {
            cmd.arg(format!("-MDevel::Cover={options}"));
            if invocation.json_db {
                cmd.env("DEVEL_COVER_DB_FORMAT", "JSON");
            }
        }
        cmd.arg(invocation.test_file);
        cmd.current_dir(invocation.cwd);
        cmd
    }

    /// The `cover` report script installed next to the interpreter, or on PATH.
    pub fn cover_script(&self) -> PathBuf {
        self.perl
            .parent()
            .map(|dir| dir.join("cover"))
            .filter(|path| path.is_file())
            .or_else(|| which::which("cover").ok())
            .unwrap_or_else(|| PathBuf::from("cover"))
    }

    /// Render the HTML report for a consolidated database. With `quiet_stdout`,
    /// the report tool's chatter goes to stderr so stdout stays machine-readable.
    pub fn render_html(&self, cover_dir: &Path, quiet_stdout: bool) -> Result<()> {
        let cover = self.cover_script();
        let mut cmd = Command::new(&cover);
        cmd.args(["-report", "html"]).arg(cover_dir);
        if quiet_stdout {
            cmd.stdout(Stdio::from(std::io::stderr()));
        }
        let status = cmd
            .status()
            .with_context(|| format!("spawn {}", cover.display()))?;
        if !status.success() {
            return Err(anyhow!("cover command failed with status {status}"));
        }
        Ok(())
    }

    fn run_script(&self, mode: &str, inputs: &[(&str, &Path)]) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.perl)
            .args(["-e", COVER_DB_SCRIPT, mode])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {} for cover db {mode}", self.perl.display()))?;

        let mut listing = String::new();
        for (kind, path) in inputs {
            listing.push_str(kind);
            listing.push(':');
            listing.push_str(&path.to_string_lossy());
            listing.push('\n');
        }
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(listing.as_bytes())
                .context("write cover db file list")?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("wait for cover db {mode}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "cover db {mode} failed with status {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        Ok(output.stdout)
    }
}

impl NativeCodec for PerlTool {
    fn convert_to_json(&self, files: &[PathBuf]) -> Result<ConversionOutcome> {
        if files.is_empty() {
            return Ok(ConversionOutcome::default());
        }
        let inputs: Vec<(&str, &Path)> = files.iter().map(|p| ("run", p.as_path())).collect();
        let stdout = self.run_script("convert", &inputs)?;
        serde_json::from_slice(&stdout).context("parse cover db convert output")
    }

    fn decode_native(&self, runs: &[PathBuf], structures: &[PathBuf]) -> Result<NativeBatch> {
        if runs.is_empty() && structures.is_empty() {
            return Ok(NativeBatch::default());
        }
        let inputs: Vec<(&str, &Path)> = runs
            .iter()
            .map(|p| ("run", p.as_path()))
            .chain(structures.iter().map(|p| ("structure", p.as_path())))
            .collect();
        let stdout = self.run_script("decode", &inputs)?;
        serde_json::from_slice(&stdout).context("parse cover db decode output")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_of(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_command_orders_switches_includes_and_instrumentation() {
        let project = tempfile::TempDir::new().expect("tempdir");
        std::fs::create_dir(project.path().join("lib")).expect("mkdir lib");
        let tool = PerlTool::new(PathBuf::from("/usr/bin/perl"), vec!["-w".to_string()]);
        let includes = vec![PathBuf::from("/opt/local/lib")];
        let test = project.path().join("t/basic.t");
        let cmd = tool.test_command(&TestInvocation {
            cwd: project.path(),
            include_paths: &includes,
            test_file: &test,
            cover_options: Some("-db,/x,-silent,1"),
            json_db: true,
        });
        let args = args_of(&cmd);
        assert_eq!(args[0], "-w");
        assert_eq!(args[1..3], ["-I".to_string(), "/opt/local/lib".to_string()]);
        assert_eq!(args[3], "-I");
        assert!(args[4].ends_with("lib"));
        assert_eq!(args[5], "-MDevel::Cover=-db,/x,-silent,1");
        assert_eq!(args[6], test.display().to_string());
        let json_env = cmd
            .get_envs()
            .any(|(key, value)| key == "DEVEL_COVER_DB_FORMAT" && value == Some("JSON".as_ref()));
        assert!(json_env);
    }

    #[test]
    fn uninstrumented_command_has_no_cover_module() {
        let project = tempfile::TempDir::new().expect("tempdir");
        let tool = PerlTool::new(PathBuf::from("perl"), Vec::new());
        let test = project.path().join("t/basic.t");
        let cmd = tool.test_command(&TestInvocation {
            cwd: project.path(),
            include_paths: &[],
            test_file: &test,
            cover_options: None,
            json_db: true,
        });
        let args = args_of(&cmd);
        assert_eq!(args, vec![test.display().to_string()]);
        assert_eq!(cmd.get_envs().count(), 0);
    }

    #[test]
    fn native_batch_deserializes_tool_output() {
        let batch: NativeBatch = serde_json::from_str(
            r#"{"runs": {"r1": {"count": {"a.pm": {"statement": [1]}}}},
                "structure": [{"file": "a.pm", "statement": [4]}],
                "failed": [{"path": "/db/runs/x/cover.14", "error": "unrecognised encoding"}]}"#,
        )
        .expect("parse");
        assert_eq!(batch.structure.len(), 1);
        assert_eq!(batch.failed[0].error, "unrecognised encoding");
        assert!(batch.runs.get("r1").is_some());
    }
}
