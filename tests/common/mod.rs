//! Shared test infrastructure for integration tests.
//!
//! Integration tests drive the real `perlcov` binary against a stand-in
//! interpreter: a shell script that answers the `Devel::Cover` setup check and
//! "runs" a test file by echoing its TAP lines. Under instrumentation it also
//! writes a JSON run record into the database directory named by `-db,...`,
//! with statement counts taken from a `#cov [...]` line in the test file.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

const FAKE_PERL: &str = r#"#!/bin/sh
db=""
test=""
for arg in "$@"; do
  case "$arg" in
    -e) echo "1.40"; exit 0 ;;
    -MDevel::Cover=-db,*)
      rest="${arg#-MDevel::Cover=-db,}"
      db="${rest%%,*}"
      ;;
    -MDevel::Cover=*|-I) ;;
    *) test="$arg" ;;
  esac
done

if [ -n "$db" ]; then
  id="$(basename "$db").$$"
  mkdir -p "$db/runs/$id" "$db/structure"
  stmts=$(sed -n 's/^#cov //p' "$test")
  [ -n "$stmts" ] || stmts="[1]"
  printf '{"runs":{"%s":{"count":{"lib/Foo.pm":{"statement":%s}}}}}' "$id" "$stmts" > "$db/runs/$id/cover.14"
  printf '{"file":"lib/Foo.pm","statement":[10,11,12,13]}' > "$db/structure/foo-digest"
  if grep -q '^#fail-under-cover' "$test"; then
    echo "not ok 1 - broken by instrumentation"
    exit 1
  fi
fi

grep -v '^#' "$test"
if grep -q '^not ok' "$test"; then
  exit 1
fi
exit 0
"#;

/// A throwaway Perl project with a `lib/` tree and a fake interpreter.
pub struct Project {
    dir: TempDir,
    perl: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("lib")).expect("mkdir lib");
        fs::create_dir_all(dir.path().join("t")).expect("mkdir t");
        fs::write(dir.path().join("lib/Foo.pm"), "package Foo;\n1;\n").expect("write module");

        let perl = dir.path().join("fake-perl");
        write_executable(&perl, FAKE_PERL);

        Self { dir, perl }
    }

    /// Install a `cover` report script next to the fake interpreter.
    #[allow(dead_code)]
    pub fn add_cover_script(&self, body: &str) -> &Self {
        write_executable(&self.root().join("cover"), body);
        self
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Add `t/<name>` holding TAP output and optional statement counts.
    pub fn add_test(&self, name: &str, body: &str) -> &Self {
        fs::write(self.root().join("t").join(name), body).expect("write test");
        self
    }

    pub fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_perlcov"))
            .current_dir(self.root())
            .arg("--perl-path")
            .arg(&self.perl)
            .args(args)
            .env_remove("PERL_PATH")
            .env_remove("HARNESS_PERL_SWITCHES")
            .env_remove("RUST_LOG")
            .output()
            .expect("run perlcov")
    }

    /// Run with `--json` and parse the report from stdout.
    #[allow(dead_code)]
    pub fn run_json(&self, args: &[&str]) -> (Output, serde_json::Value) {
        let mut all = vec!["--json"];
        all.extend_from_slice(args);
        let output = self.run(&all);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let report = serde_json::from_str(&stdout).unwrap_or_else(|err| {
            panic!(
                "stdout is not a JSON report ({err}):\n{stdout}\nstderr:\n{}",
                String::from_utf8_lossy(&output.stderr)
            )
        });
        (output, report)
    }
}

fn write_executable(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("stat script").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod script");
}
