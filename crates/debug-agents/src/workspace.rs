//! Per-session view of the project: the scanned index, the file being fixed,
//! the script that starts the program, and an in-memory copy of every
//! project file for the sandbox.
//!
//! Opening a workspace never fails. A project that cannot be scanned is
//! logged and the session continues in single-file mode.

use std::collections::BTreeMap;

use diagnostics::context::{keys, ContextAssembler, ContextBundle, ContextQuery};
use diagnostics::project::{ProjectIndex, ScanConfig};
use diagnostics::sandbox::Program;
use diagnostics::traceback::Diagnosis;
use diagnostics::DiagnosticsResult;
use tracing::{info, warn};

use crate::session::{SessionRequest, DEFAULT_ENTRY};

pub struct Workspace {
    assembler: Option<ContextAssembler>,
    target: String,
    entry_script: String,
    files: BTreeMap<String, String>,
}

impl Workspace {
    pub fn open(request: &SessionRequest, diagnosis: &Diagnosis, scan: &ScanConfig) -> Self {
        let assembler = request.project_root.as_ref().and_then(|root| {
            match ContextAssembler::from_root(root, scan) {
                Ok(assembler) => Some(assembler),
                Err(e) => {
                    warn!(root = %root.display(), error = %e, "Project scan failed, using single-file mode");
                    None
                }
            }
        });

        let target = assembler
            .as_ref()
            .and_then(|a| {
                [request.source_path.as_deref(), diagnosis.error_file.as_deref()]
                    .into_iter()
                    .flatten()
                    .find_map(|path| a.index().resolve_path(path))
            })
            .or_else(|| request.source_path.clone())
            .unwrap_or_else(|| DEFAULT_ENTRY.to_string());

        let entry_script = assembler
            .as_ref()
            .and_then(|a| entry_script(a.index(), request, diagnosis))
            .unwrap_or_else(|| target.clone());

        let mut files: BTreeMap<String, String> = assembler
            .as_ref()
            .map(|a| {
                a.index()
                    .files()
                    .map(|f| (f.relative_path.clone(), f.raw_text.clone()))
                    .collect()
            })
            .unwrap_or_default();
        files.insert(target.clone(), request.buggy_source.clone());

        if assembler.is_some() {
            info!(
                target = %target,
                entry_script = %entry_script,
                files = files.len(),
                "Workspace opened"
            );
        }
        Self {
            assembler,
            target,
            entry_script,
            files,
        }
    }

    pub fn has_project(&self) -> bool {
        self.assembler.is_some()
    }

    /// Project-relative path of the file being fixed.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Project-relative path of the script the sandbox starts.
    pub fn entry_script(&self) -> &str {
        &self.entry_script
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn files_mut(&mut self) -> &mut BTreeMap<String, String> {
        &mut self.files
    }

    /// The whole project with `candidate` in place of the file being fixed.
    pub fn program(&self, candidate: &str) -> Program {
        Program::with_candidate(&self.files, &self.target, &self.entry_script, candidate)
    }

    /// Cross-file context for the error site, `None` in single-file mode.
    ///
    /// The error file's own content is left out; prompts already carry it.
    pub fn context_for(
        &self,
        diagnosis: &Diagnosis,
        undefined_name: Option<&str>,
    ) -> DiagnosticsResult<Option<ContextBundle>> {
        let Some(assembler) = &self.assembler else {
            return Ok(None);
        };

        let mut query = diagnosis
            .context_query()
            .unwrap_or_else(|| ContextQuery::new(self.target.clone(), diagnosis.error_type.clone()));
        if assembler.index().resolve_path(&query.error_file).is_none() {
            query.error_file = self.target.clone();
        }
        if let Some(name) = undefined_name.filter(|n| !n.trim().is_empty()) {
            query.undefined_name = Some(name.trim().to_string());
        }

        let mut bundle = assembler.get_context(&query)?;
        bundle.remove(keys::ERROR_FILE_CONTENT);
        Ok(Some(bundle))
    }
}

/// A configured entry script, else the outermost traceback frame that lies
/// inside the project.
fn entry_script(index: &ProjectIndex, request: &SessionRequest, diagnosis: &Diagnosis) -> Option<String> {
    if let Some(configured) = &request.entry_script {
        match index.resolve_path(configured) {
            Some(path) => return Some(path),
            None => warn!(entry_script = %configured, "Configured entry script is not a project file"),
        }
    }
    diagnosis
        .frames
        .iter()
        .find_map(|frame| index.resolve_path(&frame.file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagnostics::traceback::parse_traceback;
    use std::fs;

    #[test]
    fn test_single_file_mode() {
        let request = SessionRequest::new("print(helllo)", "NameError: name 'helllo' is not defined", 3);
        let diagnosis = parse_traceback(&request.failure_report);
        let ws = Workspace::open(&request, &diagnosis, &ScanConfig::default());
        assert!(!ws.has_project());
        assert_eq!(ws.target(), "main.py");
        assert_eq!(ws.entry_script(), "main.py");
        assert_eq!(ws.program("print(hello)"), Program::single("print(hello)"));
        assert!(ws.context_for(&diagnosis, None).unwrap().is_none());
    }

    #[test]
    fn test_project_mode_resolves_sandbox_path() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.py"), "print(calculate(2, 3))\n").unwrap();
        fs::write(dir.path().join("utils.py"), "def calculate(a, b):\n    return a + b\n").unwrap();

        // Traceback from a sandbox run: absolute temp path ending in main.py
        let report = "Traceback (most recent call last):\n  File \"/tmp/sandbox-x1/main.py\", line 1, in <module>\nNameError: name 'calculate' is not defined";
        let request =
            SessionRequest::new("print(calculate(2, 3))\n", report, 3).with_project(dir.path(), None);
        let diagnosis = parse_traceback(report);
        let ws = Workspace::open(&request, &diagnosis, &ScanConfig::default());

        assert!(ws.has_project());
        assert_eq!(ws.target(), "main.py");
        assert_eq!(ws.entry_script(), "main.py");
        let program = ws.program("from utils import calculate\n");
        assert_eq!(program.other_files().keys().collect::<Vec<_>>(), vec!["utils.py"]);

        let bundle = ws.context_for(&diagnosis, None).unwrap().unwrap();
        assert!(!bundle.contains_key(keys::ERROR_FILE_CONTENT));
        let suggestions = bundle.get(keys::IMPORT_SUGGESTIONS).unwrap();
        assert_eq!(suggestions[0], "from utils import calculate");
    }

    fn write(root: &std::path::Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_error_in_library_runs_program_entry() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", "from utils import total\nprint(total([1, 2]))\n");
        write(dir.path(), "utils.py", "def total(xs):\n    return undefined_x\n");

        let report = "Traceback (most recent call last):\n  File \"/tmp/sandbox-a/main.py\", line 2, in <module>\n    print(total([1, 2]))\n  File \"/tmp/sandbox-a/utils.py\", line 2, in total\n    return undefined_x\nNameError: name 'undefined_x' is not defined";
        let request = SessionRequest::new("def total(xs):\n    return undefined_x\n", report, 3)
            .with_project(dir.path(), None);
        let diagnosis = parse_traceback(report);
        let ws = Workspace::open(&request, &diagnosis, &ScanConfig::default());

        assert_eq!(ws.target(), "utils.py");
        assert_eq!(ws.entry_script(), "main.py");
        let program = ws.program("def total(xs):\n    return sum(xs)\n");
        assert_eq!(program.entry, "main.py");
        assert_eq!(program.target, "utils.py");
        assert!(program.files["main.py"].contains("from utils import total"));
        assert!(program.candidate().contains("sum(xs)"));
    }

    #[test]
    fn test_nested_target_keeps_project_layout() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "main.py", "print('root entry')\n");
        write(dir.path(), "app/main.py", "print(calculate(2, 3))\n");
        write(dir.path(), "app/helpers.py", "def calculate(a, b):\n    return a + b\n");

        let report = "Traceback (most recent call last):\n  File \"/srv/project/app/main.py\", line 1, in <module>\nNameError: name 'calculate' is not defined";
        let request = SessionRequest::new("print(calculate(2, 3))\n", report, 3)
            .with_project(dir.path(), Some("app/main.py".into()));
        let diagnosis = parse_traceback(report);
        let ws = Workspace::open(&request, &diagnosis, &ScanConfig::default());

        assert_eq!(ws.target(), "app/main.py");
        assert_eq!(ws.entry_script(), "app/main.py");
        let program = ws.program("from helpers import calculate\nprint(calculate(2, 3))\n");
        assert_eq!(program.files["main.py"], "print('root entry')\n");
        assert!(program.files["app/main.py"].starts_with("from helpers"));
        assert!(program.files.contains_key("app/helpers.py"));
    }

    #[test]
    fn test_configured_entry_script_wins() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "cli.py", "import core\n");
        write(dir.path(), "core.py", "x = y\n");

        let report = "Traceback (most recent call last):\n  File \"core.py\", line 1, in <module>\nNameError: name 'y' is not defined";
        let diagnosis = parse_traceback(report);

        let configured = SessionRequest::new("x = y\n", report, 3)
            .with_project(dir.path(), None)
            .with_entry_script("cli.py");
        let ws = Workspace::open(&configured, &diagnosis, &ScanConfig::default());
        assert_eq!(ws.target(), "core.py");
        assert_eq!(ws.entry_script(), "cli.py");

        let unknown = SessionRequest::new("x = y\n", report, 3)
            .with_project(dir.path(), None)
            .with_entry_script("missing.py");
        let ws = Workspace::open(&unknown, &diagnosis, &ScanConfig::default());
        assert_eq!(ws.entry_script(), "core.py");
    }
}
