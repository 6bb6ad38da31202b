//! Script builder: wraps source and bundles it with an external toolchain.
//!
//! Every build runs in its own scratch directory under the system temp dir.
//! The directory lives exactly as long as the [`BuiltBundle`] (or the
//! type-check) that owns it.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::validator::ValidationResult;

/// Scratch directory prefix for builds.
pub const BUILD_DIR_PREFIX: &str = "plane-runner";
/// Scratch directory prefix for type-checks.
pub const TYPECHECK_DIR_PREFIX: &str = "plane-validate";
/// Scratch directory prefix for pre-built bundles staged for execution.
pub const EXEC_DIR_PREFIX: &str = "runner-exec";

const INSTALL_STEP: &str = "npm install";
const BUNDLE_STEP: &str = "npm run build";
const TYPECHECK_STEP: &str = "tsc";

/// Captured output beyond this many bytes is cut from the front in errors.
const MAX_ERROR_OUTPUT: usize = 4096;

/// Errors from the bundling toolchain.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A toolchain step exited unsuccessfully.
    #[error("{step} failed with code {}{}", exit_label(.code), output_tail(.output))]
    CommandFailed {
        /// Which step failed, e.g. `"npm install"`.
        step: &'static str,
        /// Exit code; `None` if the process was killed by a signal.
        code: Option<i32>,
        /// Captured stdout followed by stderr.
        output: String,
    },

    /// A toolchain step ran past its deadline and was killed.
    #[error("{step} timed out after {timeout_secs}s")]
    Timeout {
        /// Which step timed out.
        step: &'static str,
        /// Configured step timeout in seconds.
        timeout_secs: u64,
    },

    /// Scratch directory or process spawn failure.
    #[error("build I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}

fn output_tail(output: &str) -> String {
    let output = output.trim();
    if output.is_empty() {
        return String::new();
    }
    let mut start = output.len().saturating_sub(MAX_ERROR_OUTPUT);
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!(": {}", &output[start..])
}

/// One toolchain command: a program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    /// Program name or path.
    pub program: String,
    /// Arguments passed verbatim.
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Build a command from a program and arguments.
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Programs and arguments for each toolchain step.
#[derive(Debug, Clone)]
pub struct ToolchainConfig {
    /// Dependency install step, run with `NODE_ENV=development`.
    pub install: ToolCommand,
    /// Bundle step; must leave `dist/bundle.js` behind.
    pub bundle: ToolCommand,
    /// Type-check step, run in a directory holding `index.ts`.
    pub typecheck: ToolCommand,
    /// Ask esbuild for `dist/bundle.js.map`.
    pub sourcemap: bool,
    /// Kill any step that runs longer than this.
    pub step_timeout: Option<Duration>,
}

impl ToolchainConfig {
    /// The npm/esbuild/tsc toolchain using the given `npm` and `npx` binaries.
    pub fn npm(npm: &str, npx: &str) -> Self {
        Self {
            install: ToolCommand::new(npm, &["install", "--include=dev"]),
            bundle: ToolCommand::new(npm, &["run", "build"]),
            typecheck: ToolCommand::new(npx, &["-y", "typescript@^5.0.0", "--", "tsc", "--noEmit"]),
            sourcemap: false,
            step_timeout: None,
        }
    }
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self::npm("npm", "npx")
    }
}

/// A uniquely named directory under the system temp dir, removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<temp>/<prefix>-<uuid>`.
    pub async fn create(prefix: &str) -> std::io::Result<Self> {
        let path = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { path })
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Removal runs on the blocking pool when dropped inside a runtime, since
/// a build directory holds a whole `node_modules` tree.
impl Drop for ScratchDir {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || remove_scratch_dir(&path));
            }
            Err(_) => remove_scratch_dir(&path),
        }
    }
}

fn remove_scratch_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to remove scratch directory"
            );
        }
    }
}

/// A bundle on disk. Dropping it deletes its scratch directory.
#[derive(Debug)]
pub struct BuiltBundle {
    path: PathBuf,
    sourcemap: Option<String>,
    _dir: ScratchDir,
}

impl BuiltBundle {
    /// Write a pre-built bundle into a fresh scratch directory.
    pub async fn stage(code: &str) -> Result<Self, BuildError> {
        let dir = ScratchDir::create(EXEC_DIR_PREFIX).await?;
        let path = dir.path().join("bundle.js");
        tokio::fs::write(&path, code).await?;
        Ok(Self {
            path,
            sourcemap: None,
            _dir: dir,
        })
    }

    /// Path of the bundle file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The sourcemap, when the toolchain produced one.
    pub fn sourcemap(&self) -> Option<&str> {
        self.sourcemap.as_deref()
    }

    /// Read the bundle source.
    pub async fn read(&self) -> std::io::Result<String> {
        tokio::fs::read_to_string(&self.path).await
    }
}

/// Wrap bare statements into an exported async `main`; modules pass through.
pub fn wrap_source(code: &str, inline: bool) -> String {
    if inline {
        format!("export async function main() {{\n    {code}\n  }}")
    } else {
        code.to_string()
    }
}

fn package_json(sourcemap: bool) -> Result<String, serde_json::Error> {
    let mut build = String::from(
        "./node_modules/.bin/esbuild index.js --bundle --outfile=dist/bundle.js \
         --platform=node --format=iife --global-name=globalThis",
    );
    if sourcemap {
        build.push_str(" --sourcemap");
    }
    serde_json::to_string_pretty(&json!({
        "name": "@plane/runner-script-dynamic",
        "version": "1.0.0",
        "main": "dist/bundle.js",
        "scripts": { "build": build },
        "dependencies": {},
        "devDependencies": { "esbuild": "^0.19.0" },
    }))
}

fn tsconfig_json() -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&json!({
        "compilerOptions": {
            "target": "ES2020",
            "module": "ESNext",
            "moduleResolution": "node",
            "strict": true,
            "esModuleInterop": true,
            "skipLibCheck": true,
            "forceConsistentCasingInFileNames": true,
            "noEmit": true,
            "resolveJsonModule": true,
            "allowSyntheticDefaultImports": true,
        },
        "include": ["index.ts"],
    }))
}

/// Turn failed `tsc` output into one error per line.
///
/// Summary lines (`Found N errors`) are dropped. If nothing is left, the
/// whole output is the single error.
pub fn parse_tsc_output(output: &str) -> Vec<String> {
    let lines: Vec<String> = output
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.contains("Found"))
        .map(str::to_string)
        .collect();
    if !lines.is_empty() {
        lines
    } else if output.is_empty() {
        vec!["TypeScript compilation failed".to_string()]
    } else {
        vec![output.to_string()]
    }
}

fn captured(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Bundles and type-checks scripts with the configured toolchain.
#[derive(Debug, Clone, Default)]
pub struct ScriptBuilder {
    toolchain: ToolchainConfig,
}

impl ScriptBuilder {
    /// Create a builder using `toolchain`.
    pub fn new(toolchain: ToolchainConfig) -> Self {
        Self { toolchain }
    }

    /// The configured toolchain.
    pub fn toolchain(&self) -> &ToolchainConfig {
        &self.toolchain
    }

    /// Bundle `code` into a single IIFE. No retries.
    pub async fn build(&self, code: &str, inline: bool) -> Result<BuiltBundle, BuildError> {
        let start = Instant::now();
        let dir = ScratchDir::create(BUILD_DIR_PREFIX).await?;
        tracing::info!(
            dir = %dir.path().display(),
            code_len = code.len(),
            inline,
            "build: starting"
        );

        let package = package_json(self.toolchain.sourcemap).map_err(std::io::Error::from)?;
        tokio::fs::write(dir.path().join("index.js"), wrap_source(code, inline)).await?;
        tokio::fs::write(dir.path().join("package.json"), package).await?;
        tokio::fs::create_dir_all(dir.path().join("dist")).await?;

        self.run_step(
            INSTALL_STEP,
            &self.toolchain.install,
            dir.path(),
            &[("NODE_ENV", "development")],
        )
        .await?;
        self.run_step(BUNDLE_STEP, &self.toolchain.bundle, dir.path(), &[])
            .await?;

        let path = dir.path().join("dist").join("bundle.js");
        if !tokio::fs::try_exists(&path).await? {
            return Err(BuildError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "bundle step did not produce dist/bundle.js",
            )));
        }
        let sourcemap = match tokio::fs::read_to_string(path.with_extension("js.map")).await {
            Ok(map) => Some(map),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            sourcemap = sourcemap.is_some(),
            "build: complete"
        );
        Ok(BuiltBundle {
            path,
            sourcemap,
            _dir: dir,
        })
    }

    /// Type-check `code` with `tsc` in strict mode. Never errors: toolchain
    /// failures come back as a single violation.
    pub async fn typecheck(&self, code: &str, inline: bool) -> ValidationResult {
        match self.try_typecheck(code, inline).await {
            Ok(result) => result,
            Err(BuildError::Io(e)) => ValidationResult {
                valid: false,
                violations: vec![format!("Failed to run tsc: {e}")],
            },
            Err(e) => ValidationResult {
                valid: false,
                violations: vec![e.to_string()],
            },
        }
    }

    async fn try_typecheck(&self, code: &str, inline: bool) -> Result<ValidationResult, BuildError> {
        let dir = ScratchDir::create(TYPECHECK_DIR_PREFIX).await?;
        let tsconfig = tsconfig_json().map_err(std::io::Error::from)?;
        tokio::fs::write(dir.path().join("index.ts"), wrap_source(code, inline)).await?;
        tokio::fs::write(dir.path().join("tsconfig.json"), tsconfig).await?;

        let output = self
            .run_command(
                TYPECHECK_STEP,
                &self.toolchain.typecheck,
                dir.path(),
                &[("NODE_ENV", "development")],
            )
            .await?;
        if output.status.success() {
            return Ok(ValidationResult::ok());
        }
        let errors = parse_tsc_output(&captured(&output));
        tracing::debug!(errors = errors.len(), "typecheck: failed");
        Ok(ValidationResult {
            valid: false,
            violations: errors,
        })
    }

    async fn run_step(
        &self,
        step: &'static str,
        command: &ToolCommand,
        cwd: &Path,
        envs: &[(&str, &str)],
    ) -> Result<(), BuildError> {
        let output = self.run_command(step, command, cwd, envs).await?;
        if output.status.success() {
            tracing::debug!(step, "build step succeeded");
            return Ok(());
        }
        let code = output.status.code();
        tracing::warn!(step, code = ?code, "build step failed");
        Err(BuildError::CommandFailed {
            step,
            code,
            output: captured(&output),
        })
    }

    async fn run_command(
        &self,
        step: &'static str,
        command: &ToolCommand,
        cwd: &Path,
        envs: &[(&str, &str)],
    ) -> Result<Output, BuildError> {
        let mut cmd = tokio::process::Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        for (key, value) in envs {
            cmd.env(key, value);
        }

        match self.toolchain.step_timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| BuildError::Timeout {
                    step,
                    timeout_secs: limit.as_secs(),
                })?
                .map_err(BuildError::from),
            None => Ok(cmd.output().await?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ToolCommand {
        ToolCommand::new("sh", &["-c", script])
    }

    fn toolchain(install: &str, bundle: &str, typecheck: &str) -> ToolchainConfig {
        ToolchainConfig {
            install: sh(install),
            bundle: sh(bundle),
            typecheck: sh(typecheck),
            sourcemap: false,
            step_timeout: None,
        }
    }

    #[test]
    fn inline_code_is_wrapped_in_main() {
        assert_eq!(
            wrap_source("return 42;", true),
            "export async function main() {\n    return 42;\n  }"
        );
        let module = "export async function main() { return 1; }";
        assert_eq!(wrap_source(module, false), module);
    }

    #[test]
    fn package_json_declares_iife_build() {
        let pkg: serde_json::Value = serde_json::from_str(&package_json(false).unwrap()).unwrap();
        let build = pkg["scripts"]["build"].as_str().unwrap();
        assert!(build.contains("--format=iife --global-name=globalThis"));
        assert!(!build.contains("--sourcemap"));
        assert_eq!(pkg["devDependencies"]["esbuild"], "^0.19.0");

        let pkg: serde_json::Value = serde_json::from_str(&package_json(true).unwrap()).unwrap();
        assert!(pkg["scripts"]["build"].as_str().unwrap().ends_with("--sourcemap"));
    }

    #[test]
    fn tsconfig_is_strict_and_check_only() {
        let cfg: serde_json::Value = serde_json::from_str(&tsconfig_json().unwrap()).unwrap();
        assert_eq!(cfg["compilerOptions"]["strict"], true);
        assert_eq!(cfg["compilerOptions"]["noEmit"], true);
        assert_eq!(cfg["compilerOptions"]["target"], "ES2020");
    }

    #[test]
    fn tsc_output_drops_summary_lines() {
        let out = "index.ts(1,7): error TS2322: Type 'string' is not assignable to type 'number'.\n\nFound 1 error in index.ts:1\n";
        assert_eq!(
            parse_tsc_output(out),
            vec!["index.ts(1,7): error TS2322: Type 'string' is not assignable to type 'number'."]
        );
    }

    #[test]
    fn tsc_output_fallbacks() {
        assert_eq!(parse_tsc_output(""), vec!["TypeScript compilation failed"]);
        assert_eq!(parse_tsc_output("Found 2 errors.\n"), vec!["Found 2 errors.\n"]);
    }

    async fn wait_removed(path: &Path) {
        for _ in 0..200 {
            if !path.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was not removed", path.display());
    }

    #[tokio::test]
    async fn scratch_dirs_are_unique_and_removed() {
        let a = ScratchDir::create("runner-test").await.unwrap();
        let b = ScratchDir::create("runner-test").await.unwrap();
        assert_ne!(a.path(), b.path());
        assert!(a.path().file_name().unwrap().to_string_lossy().starts_with("runner-test-"));

        let path = a.path().to_path_buf();
        std::fs::write(path.join("file"), "x").unwrap();
        drop(a);
        wait_removed(&path).await;
    }

    #[test]
    fn scratch_dir_dropped_outside_a_runtime_is_removed_inline() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let dir = rt.block_on(ScratchDir::create("runner-test")).unwrap();
        let path = dir.path().to_path_buf();
        drop(rt);
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn command_failed_message_includes_output_tail() {
        let err = BuildError::CommandFailed {
            step: INSTALL_STEP,
            code: Some(1),
            output: "npm ERR! network\n".into(),
        };
        assert_eq!(err.to_string(), "npm install failed with code 1: npm ERR! network");

        let err = BuildError::CommandFailed {
            step: BUNDLE_STEP,
            code: None,
            output: String::new(),
        };
        assert_eq!(err.to_string(), "npm run build failed with code signal");
    }

    #[test]
    fn output_tail_respects_char_boundaries() {
        let long = "é".repeat(MAX_ERROR_OUTPUT);
        let tail = output_tail(&long);
        assert!(tail.len() <= MAX_ERROR_OUTPUT + 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn install_runs_with_development_env() {
        let builder = ScriptBuilder::new(toolchain(
            r#"test "$NODE_ENV" = development"#,
            "cp index.js dist/bundle.js",
            "true",
        ));
        let bundle = builder.build("return 1;", true).await.unwrap();
        let text = bundle.read().await.unwrap();
        assert!(text.starts_with("export async function main()"));
        assert!(bundle.sourcemap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_step_reports_code_and_output() {
        let builder = ScriptBuilder::new(toolchain("echo boom >&2; exit 3", "true", "true"));
        let err = builder.build("return 1;", true).await.unwrap_err();
        match err {
            BuildError::CommandFailed { step, code, output } => {
                assert_eq!(step, INSTALL_STEP);
                assert_eq!(code, Some(3));
                assert!(output.contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_bundle_is_an_error() {
        let builder = ScriptBuilder::new(toolchain("true", "true", "true"));
        let err = builder.build("return 1;", true).await.unwrap_err();
        assert!(matches!(err, BuildError::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound), "{err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn sourcemap_is_returned_when_present() {
        let builder = ScriptBuilder::new(toolchain(
            "true",
            "cp index.js dist/bundle.js && echo '{\"version\":3}' > dist/bundle.js.map",
            "true",
        ));
        let bundle = builder.build("export function main() {}", false).await.unwrap();
        assert_eq!(bundle.sourcemap().map(str::trim), Some("{\"version\":3}"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn bundle_dir_is_removed_on_drop() {
        let builder = ScriptBuilder::new(toolchain("true", "cp index.js dist/bundle.js", "true"));
        let bundle = builder.build("return 1;", true).await.unwrap();
        let dir = bundle.path().parent().unwrap().parent().unwrap().to_path_buf();
        assert!(dir.exists());
        drop(bundle);
        wait_removed(&dir).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn step_timeout_kills_slow_steps() {
        let mut tc = toolchain("sleep 5", "true", "true");
        tc.step_timeout = Some(Duration::from_millis(100));
        let start = Instant::now();
        let err = ScriptBuilder::new(tc).build("return 1;", true).await.unwrap_err();
        assert!(matches!(err, BuildError::Timeout { step: INSTALL_STEP, .. }), "{err:?}");
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn typecheck_passes_and_fails() {
        let ok = ScriptBuilder::new(toolchain("true", "true", "test -f index.ts && test -f tsconfig.json"));
        assert_eq!(ok.typecheck("const x: number = 1;", false).await, ValidationResult::ok());

        let failing = ScriptBuilder::new(toolchain(
            "true",
            "true",
            "echo \"index.ts(2,11): error TS2322: nope\"; echo 'Found 1 error.'; exit 2",
        ));
        let result = failing.typecheck("const x: number = 'a';", true).await;
        assert!(!result.valid);
        assert_eq!(result.violations, vec!["index.ts(2,11): error TS2322: nope"]);
    }

    #[tokio::test]
    async fn typecheck_spawn_failure_is_a_violation() {
        let mut tc = ToolchainConfig::default();
        tc.typecheck = ToolCommand::new("/nonexistent/runner-tsc", &[]);
        let result = ScriptBuilder::new(tc).typecheck("const x = 1;", false).await;
        assert!(!result.valid);
        assert!(result.violations[0].starts_with("Failed to run tsc:"), "{:?}", result.violations);
    }

    #[tokio::test]
    async fn staged_bundles_live_in_exec_dirs() {
        let bundle = BuiltBundle::stage("function main() { return 1; }").await.unwrap();
        let dir_name = bundle.path().parent().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(dir_name.starts_with("runner-exec-"), "{dir_name}");
        assert_eq!(bundle.read().await.unwrap(), "function main() { return 1; }");
    }
}
