//! Per-test instrumentation scope.
//!
//! Test files named after the module they exercise (`Foo-Bar_edge.t` for
//! `Foo::Bar`) can be instrumented for that module alone, which is much
//! cheaper than instrumenting the whole source tree. Other files keep the
//! full scope; the merge across all runs restores incidental coverage.
use crate::util::absolutize;
use std::path::{Path, PathBuf};

const TEST_EXTENSION: &str = ".t";

/// Infer `Foo::Bar` from `.../Foo-Bar_suffix.t`; empty when no module applies.
pub fn extract_scope(test_file: &str) -> String {
    let base = Path::new(test_file)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    let Some(name) = base.strip_suffix(TEST_EXTENSION) else {
        return String::new();
    };
    if name.starts_with(|ch: char| ch.is_ascii_digit()) {
        return String::new();
    }
    let name = name.split('_').next().unwrap_or_default();
    if !name.starts_with(|ch: char| ch.is_ascii_uppercase()) {
        return String::new();
    }
    name.replace('-', "::")
}

/// `Foo::Bar` -> `Foo/Bar.pm`
pub fn module_file(module: &str) -> String {
    format!("{}.pm", module.replace("::", "/"))
}

/// Whether the module file exists under the project root, `lib/`, or a source root.
pub fn module_exists(module_file: &str, cwd: &Path, source_roots: &[PathBuf]) -> bool {
    let mut candidates = vec![cwd.join(module_file), cwd.join("lib").join(module_file)];
    candidates.extend(
        source_roots
            .iter()
            .map(|root| absolutize(root, cwd).join(module_file)),
    );
    candidates.iter().any(|path| path.is_file())
}

/// Inputs for one `-MDevel::Cover=...` option string.
pub struct CoverOptions<'a> {
    pub db_dir: &'a Path,
    pub cwd: &'a Path,
    pub source_roots: &'a [PathBuf],
    pub ignore_dirs: &'a [String],
    pub narrow: bool,
}

/// A resolved option string plus the module it was narrowed to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoverScope {
    pub options: String,
    pub module: Option<String>,
}

impl CoverOptions<'_> {
    pub fn for_test(&self, test_file: &Path) -> CoverScope {
        let mut parts = vec![
            "-db".to_string(),
            self.db_dir.display().to_string(),
            "-silent".to_string(),
            "1".to_string(),
            "-ignore".to_string(),
            "^t/".to_string(),
            "-ignore".to_string(),
            "\\.t$".to_string(),
        ];
        for root in self.source_roots {
            parts.push("+inc".to_string());
            parts.push(absolutize(root, self.cwd).display().to_string());
        }
        for dir in self.ignore_dirs {
            parts.push("-ignore".to_string());
            parts.push(dir.clone());
        }

        let mut module = None;
        if self.narrow {
            let candidate = extract_scope(&test_file.to_string_lossy());
            if !candidate.is_empty() {
                let file = module_file(&candidate);
                if module_exists(&file, self.cwd, self.source_roots) {
                    // -ignore has to precede -select or the selection is not honoured.
                    parts.push("-ignore".to_string());
                    parts.push("lib/".to_string());
                    parts.push("-select".to_string());
                    parts.push(file.trim_end_matches(".pm").to_string());
                    module = Some(candidate);
                }
            }
        }

        CoverScope {
            options: parts.join(","),
            module,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn extract_scope_follows_naming_convention() {
        let cases = [
            ("Module-Install-Something.t", "Module::Install::Something"),
            ("Module-Install-Something_specifier_multi.t", "Module::Install::Something"),
            ("t/Module-Install-Something.t", "Module::Install::Something"),
            ("/home/user/project/t/Module-Install-Something.t", "Module::Install::Something"),
            ("App-Foo-Bar-Baz-Qux.t", "App::Foo::Bar::Baz::Qux"),
            ("Module.t", "Module"),
            ("Module_variant.t", "Module"),
            ("basic.t", ""),
            ("00-load.t", ""),
            ("123-some-test.t", ""),
            ("my-test-file.t", ""),
            ("basic_test.t", ""),
            ("Module-Something.pm", ""),
            (".t", ""),
            ("_Module.t", ""),
        ];
        for (input, expected) in cases {
            assert_eq!(extract_scope(input), expected, "input {input}");
        }
    }

    #[test]
    fn module_file_uses_path_separators() {
        assert_eq!(module_file("Foo::Bar::Baz"), "Foo/Bar/Baz.pm");
        assert_eq!(module_file("Foo"), "Foo.pm");
    }

    fn project_with_module(rel: &str) -> TempDir {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(&path, "package X; 1;\n").expect("write module");
        dir
    }

    #[test]
    fn module_exists_checks_lib_and_source_roots() {
        let project = project_with_module("lib/Foo/Bar.pm");
        assert!(module_exists("Foo/Bar.pm", project.path(), &[]));
        assert!(!module_exists("Foo/Baz.pm", project.path(), &[]));

        let other = project_with_module("src/perl/Foo/Baz.pm");
        let roots = vec![PathBuf::from("src/perl")];
        assert!(module_exists("Foo/Baz.pm", other.path(), &roots));
    }

    #[test]
    fn narrowing_places_ignore_before_select() {
        let project = project_with_module("lib/Foo/Bar.pm");
        let db = project.path().join("cover_db_0");
        let roots = vec![PathBuf::from("lib")];
        let options = CoverOptions {
            db_dir: &db,
            cwd: project.path(),
            source_roots: &roots,
            ignore_dirs: &[],
            narrow: true,
        };
        let scope = options.for_test(Path::new("t/Foo-Bar_edge.t"));
        assert_eq!(scope.module.as_deref(), Some("Foo::Bar"));
        let ignore = scope.options.find(",-ignore,lib/").expect("ignore directive");
        let select = scope.options.find(",-select,Foo/Bar").expect("select directive");
        assert!(ignore < select);
        assert!(scope.options.starts_with(&format!("-db,{},-silent,1", db.display())));
    }

    #[test]
    fn no_narrowing_when_disabled_or_module_missing() {
        let project = project_with_module("lib/Foo/Bar.pm");
        let db = project.path().join("cover_db_0");
        let ignores = vec!["blib/".to_string()];
        let mut options = CoverOptions {
            db_dir: &db,
            cwd: project.path(),
            source_roots: &[],
            ignore_dirs: &ignores,
            narrow: false,
        };
        let scope = options.for_test(Path::new("t/Foo-Bar.t"));
        assert_eq!(scope.module, None);
        assert!(!scope.options.contains("-select"));
        assert!(scope.options.contains(",-ignore,blib/"));

        options.narrow = true;
        let scope = options.for_test(Path::new("t/Missing-Module.t"));
        assert_eq!(scope.module, None);
        assert!(!scope.options.contains("-select"));
    }
}
