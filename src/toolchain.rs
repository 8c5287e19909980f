/// External collaborators: version control, the framework's setup, and suite bodies.
///
/// The lifecycle core only sequences these calls and inspects their exit status.
use crate::config::types::{BuildStep, EnvError, Result};
use crate::env::bootstrap::copy_tree;
use log::{debug, info, warn};
use std::path::Path;
use std::process::{Command, Output};

/// Narrow interface to everything that runs outside this crate
pub trait Toolchain: Send + Sync {
    fn clone_template(&self, template: &Path, dest: &Path) -> Result<()>;

    /// Whether the framework working copy has uncommitted changes
    fn framework_is_dirty(&self, framework: &Path) -> Result<bool>;

    /// History-preserving import of `branch` under `prefix`
    fn subtree_import(&self, repo: &Path, prefix: &str, framework: &Path, branch: &str)
        -> Result<()>;

    /// Plain copy of the framework working tree, version-control metadata excluded
    fn copy_framework(&self, framework: &Path, dest: &Path) -> Result<()>;

    /// Stage everything and commit; a clean tree is not an error
    fn commit_all(&self, repo: &Path, message: &str) -> Result<()>;

    fn run_setup(&self, repo: &Path, command: &[String]) -> Result<()>;

    /// Execute one suite body inside `repo` with the given bindings exported
    fn run_suite(
        &self,
        suite: &str,
        repo: &Path,
        command: &[String],
        vars: &[(String, String)],
    ) -> Result<()>;
}

/// Keep error payloads readable
fn tail(bytes: &[u8], lines: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

fn describe(output: &Output) -> String {
    let status = match output.status.code() {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    };
    let stderr = tail(&output.stderr, 20);
    if stderr.is_empty() {
        status
    } else {
        format!("{}: {}", status, stderr)
    }
}

/// `git` + shell implementation used by the CLI
#[derive(Debug, Clone, Default)]
pub struct GitToolchain;

impl GitToolchain {
    pub fn new() -> Self {
        Self
    }

    fn git(repo: &Path) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(repo);
        cmd
    }

    fn run_step(step: BuildStep, mut cmd: Command) -> Result<Output> {
        debug!("[{}] {:?}", step, cmd);
        let output = cmd
            .output()
            .map_err(|e| EnvError::build(step, format!("failed to spawn {:?}: {}", cmd, e)))?;
        if !output.status.success() {
            return Err(EnvError::build(step, describe(&output)));
        }
        if !output.stdout.is_empty() {
            debug!("[{}] {}", step, tail(&output.stdout, 40));
        }
        Ok(output)
    }

    fn command_for(step: BuildStep, argv: &[String]) -> Result<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| EnvError::build(step, "empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        Ok(cmd)
    }
}

impl Toolchain for GitToolchain {
    fn clone_template(&self, template: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new("git");
        cmd.arg("clone").arg("-q").arg(template).arg(dest);
        Self::run_step(BuildStep::CloneTemplate, cmd).map(|_| ())
    }

    fn framework_is_dirty(&self, framework: &Path) -> Result<bool> {
        let mut cmd = Self::git(framework);
        cmd.args(["status", "--porcelain"]);
        match Self::run_step(BuildStep::InspectFramework, cmd) {
            Ok(output) => Ok(!output.stdout.iter().all(u8::is_ascii_whitespace)),
            Err(e) => {
                // Not a git checkout: only a plain copy can import it
                warn!("Cannot inspect framework at {}: {}", framework.display(), e);
                Ok(true)
            }
        }
    }

    fn subtree_import(
        &self,
        repo: &Path,
        prefix: &str,
        framework: &Path,
        branch: &str,
    ) -> Result<()> {
        let mut cmd = Self::git(repo);
        cmd.args(["subtree", "add", "-P", prefix, "--squash"])
            .arg(framework)
            .arg(branch);
        Self::run_step(BuildStep::SubtreeImport, cmd).map(|_| ())
    }

    fn copy_framework(&self, framework: &Path, dest: &Path) -> Result<()> {
        let copied = copy_tree(framework, dest, &[".git"])
            .map_err(|e| EnvError::build(BuildStep::CopyFramework, e.to_string()))?;
        info!(
            "Copied {} framework entries from uncommitted working tree",
            copied
        );
        Ok(())
    }

    fn commit_all(&self, repo: &Path, message: &str) -> Result<()> {
        let mut add = Self::git(repo);
        add.args(["add", "-A"]);
        Self::run_step(BuildStep::Commit, add)?;

        let staged = Self::git(repo)
            .args(["diff", "--cached", "--quiet"])
            .status()
            .map_err(|e| EnvError::build(BuildStep::Commit, e.to_string()))?;
        if staged.success() {
            debug!("Nothing to commit in {}", repo.display());
            return Ok(());
        }

        let mut commit = Self::git(repo);
        commit.args(["commit", "-q", "-m", message]);
        Self::run_step(BuildStep::Commit, commit).map(|_| ())
    }

    fn run_setup(&self, repo: &Path, command: &[String]) -> Result<()> {
        let mut cmd = Self::command_for(BuildStep::Setup, command)?;
        cmd.current_dir(repo);
        Self::run_step(BuildStep::Setup, cmd).map(|_| ())
    }

    fn run_suite(
        &self,
        suite: &str,
        repo: &Path,
        command: &[String],
        vars: &[(String, String)],
    ) -> Result<()> {
        let (program, args) = command.split_first().ok_or_else(|| EnvError::SuiteFailed {
            suite: suite.to_string(),
            detail: "empty suite command".to_string(),
        })?;

        // Suite output goes straight to the terminal
        let status = Command::new(program)
            .args(args)
            .current_dir(repo)
            .envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .status()
            .map_err(|e| EnvError::SuiteFailed {
                suite: suite.to_string(),
                detail: format!("failed to spawn {}: {}", program, e),
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(EnvError::SuiteFailed {
                suite: suite.to_string(),
                detail: match status.code() {
                    Some(code) => format!("exit status {}", code),
                    None => "terminated by signal".to_string(),
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn test_setup_failure_names_step_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let err = GitToolchain::new()
            .run_setup(dir.path(), &sh("echo boom >&2; exit 3"))
            .unwrap_err();
        match err {
            EnvError::Build { step, detail } => {
                assert_eq!(step, BuildStep::Setup);
                assert!(detail.contains("exit status 3"));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_setup_runs_in_repo() {
        let dir = tempfile::tempdir().unwrap();
        GitToolchain::new()
            .run_setup(dir.path(), &sh("touch configured"))
            .unwrap();
        assert!(dir.path().join("configured").exists());
    }

    #[test]
    fn test_suite_sees_bindings() {
        let dir = tempfile::tempdir().unwrap();
        let vars = vec![("TESTBOX_ENV".to_string(), "doc".to_string())];
        GitToolchain::new()
            .run_suite("doc", dir.path(), &sh("test \"$TESTBOX_ENV\" = doc"), &vars)
            .unwrap();

        let err = GitToolchain::new()
            .run_suite("doc", dir.path(), &sh("exit 1"), &vars)
            .unwrap_err();
        assert!(matches!(err, EnvError::SuiteFailed { .. }));
    }

    #[test]
    fn test_empty_setup_command() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            GitToolchain::new().run_setup(dir.path(), &[]),
            Err(EnvError::Build { step: BuildStep::Setup, .. })
        ));
    }
}
