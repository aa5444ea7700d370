//! Static import analysis of tenant programs and best-effort installation of
//! the packages they need.

pub mod installer;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use crate::error::{PlatformError, PlatformResult, bounded};

pub use installer::{CommandInstaller, ModuleDirectoryIndex};

/// Modules the host provides to every program; never installed.
pub const STDLIB_MODULES: &[&str] = &["platform", "os", "json", "time", "math", "text"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InstallError {
    #[error("could not run installer: {0}")]
    Spawn(String),
    #[error("installer exited with {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("installer timed out after {0:?}")]
    TimedOut(std::time::Duration),
}

/// Host package manager.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn install(&self, distributions: &[String]) -> Result<(), InstallError>;
}

/// Index of distributions already available to programs.
#[async_trait]
pub trait InstalledPackages: Send + Sync {
    async fn is_installed(&self, distribution: &str) -> bool;
}

pub struct DependencyResolver {
    stdlib: BTreeSet<String>,
    aliases: BTreeMap<String, String>,
    installed: Arc<dyn InstalledPackages>,
    installer: Arc<dyn PackageInstaller>,
}

impl DependencyResolver {
    pub fn new(
        aliases: BTreeMap<String, String>,
        installed: Arc<dyn InstalledPackages>,
        installer: Arc<dyn PackageInstaller>,
    ) -> Self {
        Self {
            stdlib: STDLIB_MODULES.iter().map(|s| s.to_string()).collect(),
            aliases,
            installed,
            installer,
        }
    }

    /// Distribution names that `source` needs and the host does not have yet.
    pub async fn plan(&self, source: &str) -> Vec<String> {
        let wanted: BTreeSet<String> = detect_imports(source)
            .into_iter()
            .filter(|name| !self.stdlib.contains(name))
            .map(|name| self.aliases.get(&name).cloned().unwrap_or(name))
            .collect();

        let mut missing = Vec::new();
        for dist in wanted {
            if !self.installed.is_installed(&dist).await {
                missing.push(dist);
            }
        }
        missing
    }

    /// Install whatever [`plan`](Self::plan) reports. Returns what was installed.
    pub async fn ensure(&self, source: &str) -> PlatformResult<Vec<String>> {
        let missing = self.plan(source).await;
        if missing.is_empty() {
            return Ok(missing);
        }
        info!("installing packages: {}", missing.join(", "));
        match self.installer.install(&missing).await {
            Ok(()) => Ok(missing),
            Err(e) => {
                warn!("package install failed: {e}");
                Err(PlatformError::DependencyInstall(bounded(&e.to_string(), 200)))
            }
        }
    }
}

/// Package roots named by `import "..."` statements.
///
/// Comments and string literals are skipped, so an import mentioned in either
/// is not reported. Relative imports (`./x`) are local files, not packages.
pub fn detect_imports(source: &str) -> BTreeSet<String> {
    let chars: Vec<char> = source.chars().collect();
    let len = chars.len();
    let mut found = BTreeSet::new();
    let mut i = 0;

    while i < len {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < len && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => i = skip_block_comment(&chars, i),
            '"' | '`' | '\'' => i = read_literal(&chars, i).1,
            c if is_ident_char(c) => {
                let start = i;
                while i < len && is_ident_char(chars[i]) {
                    i += 1;
                }
                if chars[start..i].iter().collect::<String>() != "import" {
                    continue;
                }
                let mut j = i;
                while j < len && chars[j].is_whitespace() {
                    j += 1;
                }
                if j < len && chars[j] == '"' {
                    let (path, end) = read_literal(&chars, j);
                    if let Some(root) = import_root(&path) {
                        found.insert(root);
                    }
                    i = end;
                }
            }
            _ => i += 1,
        }
    }
    found
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Rhai block comments nest.
fn skip_block_comment(chars: &[char], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match (chars[i], chars.get(i + 1).copied()) {
            ('/', Some('*')) => {
                depth += 1;
                i += 2;
            }
            ('*', Some('/')) => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return i;
                }
            }
            _ => i += 1,
        }
    }
    i
}

/// Returns the literal's content and the index just past it.
fn read_literal(chars: &[char], start: usize) -> (String, usize) {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' if quote != '`' => {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                }
                i += 2;
            }
            c if c == quote => return (out, i + 1),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    (out, i)
}

fn import_root(path: &str) -> Option<String> {
    let path = path.trim();
    if path.starts_with('.') || path.starts_with('/') {
        return None;
    }
    let root = path.split('/').next()?.trim_end_matches(".rhai").trim();
    (!root.is_empty()).then(|| root.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Fixed(BTreeSet<String>);

    #[async_trait]
    impl InstalledPackages for Fixed {
        async fn is_installed(&self, distribution: &str) -> bool {
            self.0.contains(distribution)
        }
    }

    #[derive(Default)]
    struct Recording {
        calls: Mutex<Vec<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl PackageInstaller for Recording {
        async fn install(&self, distributions: &[String]) -> Result<(), InstallError> {
            self.calls.lock().unwrap().push(distributions.to_vec());
            if self.fail {
                Err(InstallError::Failed {
                    code: Some(1),
                    stderr: "no such package".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn resolver(installer: Arc<Recording>) -> DependencyResolver {
        let installed = Arc::new(Fixed(["already_installed_pkg".to_string()].into()));
        let aliases = [("yaml".to_string(), "rhai-yaml".to_string())].into();
        DependencyResolver::new(aliases, installed, installer)
    }

    #[test]
    fn detects_imports_and_skips_comments_and_strings() {
        let source = r#"
            import "requests" as req;
            import "utils/strings" as s;
            import "./local" as l;
            // import "commented";
            /* import "blocked" /* nested */ import "still_blocked"; */
            let text = "import \"quoted\"";
            let tpl = `import "templated"`;
            fn on_update(u) { reimport("x"); }
        "#;
        let found: Vec<String> = detect_imports(source).into_iter().collect();
        assert_eq!(found, vec!["requests".to_string(), "utils".to_string()]);
    }

    #[tokio::test]
    async fn installs_only_missing_non_stdlib_packages() {
        let installer = Arc::new(Recording::default());
        let r = resolver(installer.clone());
        let source = r#"
            import "requests" as r;
            import "os" as os;
            import "already_installed_pkg" as a;
            fn on_update(u) {}
        "#;

        let installed = r.ensure(source).await.unwrap();
        assert_eq!(installed, vec!["requests".to_string()]);
        assert_eq!(*installer.calls.lock().unwrap(), vec![vec!["requests".to_string()]]);
    }

    #[tokio::test]
    async fn aliases_map_to_distribution_names() {
        let installer = Arc::new(Recording::default());
        let r = resolver(installer);
        let plan = r.plan(r#"import "yaml" as y;"#).await;
        assert_eq!(plan, vec!["rhai-yaml".to_string()]);
    }

    #[tokio::test]
    async fn nothing_to_install_skips_installer() {
        let installer = Arc::new(Recording::default());
        let r = resolver(installer.clone());
        r.ensure(r#"import "json" as j;"#).await.unwrap();
        assert!(installer.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn installer_failure_is_dependency_error() {
        let installer = Arc::new(Recording {
            fail: true,
            ..Default::default()
        });
        let r = resolver(installer);
        let err = r.ensure(r#"import "missing" as m;"#).await.unwrap_err();
        assert!(matches!(
            err,
            PlatformError::DependencyInstall(msg) if msg.contains("no such package")
        ));
    }
}
