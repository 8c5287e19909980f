/// Suites and the catalog that orders them
///
/// A suite is anything that can run against a provisioned environment. The catalog
/// knows which family each suite belongs to and, for the sequential family, its index.
use crate::config::types::{EnvError, Result, ENVIRONMENT_UNIT, FOUNDATION, SEQUENTIAL};
use crate::env::layout::Environment;
use crate::env::registry::Bindings;
use crate::state::markers::validate_unit;
use crate::toolchain::Toolchain;
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SUITE_EXTENSION: &str = "bats";

/// What a suite body sees while it runs
pub struct SuiteContext<'a> {
    pub env: &'a Environment,
    pub bindings: &'a Bindings,
    pub toolchain: &'a dyn Toolchain,
}

pub trait Suite: Send + Sync {
    fn name(&self) -> &str;

    /// Run the body; `Err` marks the suite failed and leaves its `started` marker
    fn run(&self, ctx: &SuiteContext<'_>) -> Result<()>;
}

/// A suite file executed through an external runner command
#[derive(Debug, Clone)]
pub struct CommandSuite {
    name: String,
    command: Vec<String>,
}

impl CommandSuite {
    pub fn new(name: &str, runner: &[String], file: &Path) -> Self {
        let mut command = runner.to_vec();
        command.push(file.display().to_string());
        Self {
            name: name.to_string(),
            command,
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

impl Suite for CommandSuite {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, ctx: &SuiteContext<'_>) -> Result<()> {
        ctx.toolchain.run_suite(
            &self.name,
            &ctx.env.repo(),
            &self.command,
            &ctx.bindings.to_vars(),
        )
    }
}

/// Where a requested name lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuiteRef {
    Foundation,
    Sequential(usize),
    Independent(usize),
}

#[derive(Default)]
pub struct SuiteCatalog {
    sequential: Vec<Arc<dyn Suite>>,
    independent: Vec<Arc<dyn Suite>>,
}

/// `01-meta` → 1
fn numeric_prefix(name: &str) -> Option<u32> {
    let digits: String = name.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

fn suite_files(dir: &Path) -> Result<Vec<(String, PathBuf)>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(EnvError::io_at(e, dir.display())),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| EnvError::io_at(e, dir.display()))?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SUITE_EXTENSION) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if validate_unit(stem).is_err() {
            warn!("Skipping suite file with unusable name: {}", path.display());
            continue;
        }
        files.push((stem.to_string(), path));
    }
    files.sort();
    Ok(files)
}

impl SuiteCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        validate_unit(name)?;
        if [FOUNDATION, SEQUENTIAL, ENVIRONMENT_UNIT].contains(&name) {
            return Err(EnvError::Config(format!("suite name {:?} is reserved", name)));
        }
        if self.all().any(|s| s.name() == name) {
            return Err(EnvError::Config(format!("duplicate suite {:?}", name)));
        }
        Ok(())
    }

    /// Append to the sequential family; order of insertion is execution order
    pub fn add_sequential(&mut self, suite: impl Suite + 'static) -> Result<()> {
        self.check_name(suite.name())?;
        self.sequential.push(Arc::new(suite));
        Ok(())
    }

    pub fn add_independent(&mut self, suite: impl Suite + 'static) -> Result<()> {
        self.check_name(suite.name())?;
        self.independent.push(Arc::new(suite));
        Ok(())
    }

    /// Build the catalog from `<dir>/sequential/NN-*.bats` and `<dir>/standard/*.bats`
    pub fn discover(suites_dir: &Path, runner: &[String]) -> Result<Self> {
        let mut catalog = Self::new();

        let mut sequential: Vec<(u32, String, PathBuf)> = Vec::new();
        for (name, path) in suite_files(&suites_dir.join("sequential"))? {
            match numeric_prefix(&name) {
                Some(index) => sequential.push((index, name, path)),
                None => warn!("Sequential suite {} has no numeric prefix; skipped", name),
            }
        }
        sequential.sort();
        for (_, name, path) in sequential {
            catalog.add_sequential(CommandSuite::new(&name, runner, &path))?;
        }

        for (name, path) in suite_files(&suites_dir.join("standard"))? {
            catalog.add_independent(CommandSuite::new(&name, runner, &path))?;
        }

        debug!(
            "Discovered {} sequential and {} independent suites under {}",
            catalog.sequential.len(),
            catalog.independent.len(),
            suites_dir.display()
        );
        Ok(catalog)
    }

    /// Resolve a suite name; sequential suites also answer to their bare number
    pub fn lookup(&self, name: &str) -> Result<SuiteRef> {
        if name == FOUNDATION {
            return Ok(SuiteRef::Foundation);
        }
        if let Some(i) = self.sequential.iter().position(|s| s.name() == name) {
            return Ok(SuiteRef::Sequential(i));
        }
        if let Some(i) = self.independent.iter().position(|s| s.name() == name) {
            return Ok(SuiteRef::Independent(i));
        }
        if !name.is_empty() && name.chars().all(|c| c.is_ascii_digit()) {
            let wanted = numeric_prefix(name);
            if let Some(i) = self
                .sequential
                .iter()
                .position(|s| numeric_prefix(s.name()) == wanted)
            {
                return Ok(SuiteRef::Sequential(i));
            }
        }
        Err(EnvError::UnknownSuite(name.to_string()))
    }

    pub fn sequential(&self) -> &[Arc<dyn Suite>] {
        &self.sequential
    }

    pub fn independent(&self) -> &[Arc<dyn Suite>] {
        &self.independent
    }

    pub fn get(&self, suite: SuiteRef) -> Option<&Arc<dyn Suite>> {
        match suite {
            SuiteRef::Foundation => None,
            SuiteRef::Sequential(i) => self.sequential.get(i),
            SuiteRef::Independent(i) => self.independent.get(i),
        }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn Suite>> {
        self.sequential.iter().chain(self.independent.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FnSuite;

    fn ok(name: &str) -> FnSuite {
        FnSuite::new(name, |_| Ok(()))
    }

    #[test]
    fn test_lookup() {
        let mut catalog = SuiteCatalog::new();
        catalog.add_sequential(ok("00-validate")).unwrap();
        catalog.add_sequential(ok("01-meta")).unwrap();
        catalog.add_independent(ok("doc")).unwrap();

        assert_eq!(catalog.lookup("foundation").unwrap(), SuiteRef::Foundation);
        assert_eq!(catalog.lookup("01-meta").unwrap(), SuiteRef::Sequential(1));
        assert_eq!(catalog.lookup("1").unwrap(), SuiteRef::Sequential(1));
        assert_eq!(catalog.lookup("01").unwrap(), SuiteRef::Sequential(1));
        assert_eq!(catalog.lookup("doc").unwrap(), SuiteRef::Independent(0));
        assert!(matches!(
            catalog.lookup("nope"),
            Err(EnvError::UnknownSuite(_))
        ));
    }

    #[test]
    fn test_rejects_reserved_and_duplicate_names() {
        let mut catalog = SuiteCatalog::new();
        assert!(catalog.add_independent(ok("foundation")).is_err());
        assert!(catalog.add_independent(ok("sequential")).is_err());
        catalog.add_independent(ok("doc")).unwrap();
        assert!(catalog.add_sequential(ok("doc")).is_err());
        assert!(catalog.add_independent(ok("../doc")).is_err());
    }

    #[test]
    fn test_discover_orders_by_numeric_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let seq = dir.path().join("sequential");
        let std_dir = dir.path().join("standard");
        fs::create_dir_all(&seq).unwrap();
        fs::create_dir_all(&std_dir).unwrap();
        for f in ["10-final.bats", "02-dist.bats", "00-validate.bats", "notes.txt", "helper.bats"] {
            fs::write(seq.join(f), "").unwrap();
        }
        for f in ["doc.bats", "pgtle-install.bats", "README.md"] {
            fs::write(std_dir.join(f), "").unwrap();
        }

        let runner = vec!["bats".to_string()];
        let catalog = SuiteCatalog::discover(dir.path(), &runner).unwrap();
        let names: Vec<&str> = catalog.sequential().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["00-validate", "02-dist", "10-final"]);
        let names: Vec<&str> = catalog.independent().iter().map(|s| s.name()).collect();
        assert_eq!(names, ["doc", "pgtle-install"]);
    }

    #[test]
    fn test_discover_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = SuiteCatalog::discover(&dir.path().join("absent"), &[]).unwrap();
        assert!(catalog.sequential().is_empty());
        assert!(catalog.independent().is_empty());
    }

    #[test]
    fn test_command_suite_appends_file() {
        let runner = vec!["bats".to_string(), "--tap".to_string()];
        let suite = CommandSuite::new("doc", &runner, Path::new("/t/standard/doc.bats"));
        assert_eq!(suite.command(), ["bats", "--tap", "/t/standard/doc.bats"]);
    }
}
