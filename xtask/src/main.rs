//! Development tasks for hearth, run as `cargo xtask <task>`
//!
//! `ci` is what the pipeline runs: formatting, clippy, tests, a dry resolve
//! of the bundled stack and a release build.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use xshell::{cmd, Shell};

/// Shipped next to the binary so a fresh checkout is not needed to run the stack
const BUNDLE: &[&str] = &["hearth.yaml", ".env.example"];
const ARTIFACT_DIR: &str = "target/release-artifacts";

#[derive(Parser)]
#[command(name = "xtask", about = "Development tasks for hearth")]
struct Cli {
    #[command(subcommand)]
    task: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Compile the hearth binary
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Run the workspace tests
    Test {
        /// Only tests whose name contains this filter
        filter: Option<String>,
    },
    /// rustfmt check and clippy with warnings denied
    Lint,
    /// Format the workspace
    Fmt,
    /// Resolve hearth.yaml against .env.example without touching docker
    CheckStack,
    /// Release build plus the stack bundle in target/release-artifacts
    Dist,
    /// Everything the pipeline runs
    Ci,
}

struct Tasks {
    sh: Shell,
    root: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let tasks = Tasks::new()?;

    match cli.task {
        Task::Build { release } => tasks.build(release),
        Task::Test { filter } => tasks.test(filter.as_deref()),
        Task::Lint => tasks.lint(),
        Task::Fmt => tasks.fmt(),
        Task::CheckStack => tasks.check_stack(),
        Task::Dist => tasks.dist(),
        Task::Ci => tasks.ci(),
    }
}

impl Tasks {
    fn new() -> Result<Self> {
        let sh = Shell::new()?;
        let located = cmd!(sh, "cargo locate-project --workspace --message-format=plain")
            .read()
            .context("locating the workspace")?;
        let root = Path::new(located.trim())
            .parent()
            .map(Path::to_path_buf)
            .context("workspace manifest has no parent directory")?;
        sh.change_dir(&root);
        Ok(Self { sh, root })
    }

    fn build(&self, release: bool) -> Result<()> {
        let profile = release.then_some("--release");
        cmd!(self.sh, "cargo build --bin hearth {profile...}").run()?;
        Ok(())
    }

    fn test(&self, filter: Option<&str>) -> Result<()> {
        cmd!(self.sh, "cargo test --workspace {filter...}").run()?;
        Ok(())
    }

    fn lint(&self) -> Result<()> {
        cmd!(self.sh, "cargo fmt --all -- --check").run()?;
        cmd!(self.sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
        Ok(())
    }

    fn fmt(&self) -> Result<()> {
        cmd!(self.sh, "cargo fmt --all").run()?;
        Ok(())
    }

    /// Runs `hearth config` on the bundled manifest with every variable from
    /// `.env.example` exported, so a missing key or a broken reference fails
    fn check_stack(&self) -> Result<()> {
        let scratch = self.root.join("target/check-stack");
        std::fs::create_dir_all(&scratch)?;
        let manifest = self.root.join("hearth.yaml");

        let mut command = cmd!(self.sh, "cargo run --quiet --bin hearth -- -C {scratch} -f {manifest} config")
            .env("HEARTH_DATA_DIR", scratch.join("data"));
        for (key, value) in dotenv_pairs(&self.root.join(".env.example"))? {
            command = command.env(key, value);
        }
        command.run().context("bundled stack does not resolve")?;
        Ok(())
    }

    fn dist(&self) -> Result<()> {
        self.build(true)?;

        let out = self.root.join(ARTIFACT_DIR);
        if out.exists() {
            std::fs::remove_dir_all(&out)?;
        }
        std::fs::create_dir_all(&out)?;

        let binary = self.root.join("target/release/hearth");
        if !binary.exists() {
            bail!("{} was not produced", binary.display());
        }
        std::fs::copy(&binary, out.join("hearth"))?;
        for file in BUNDLE {
            std::fs::copy(self.root.join(file), out.join(file))
                .with_context(|| format!("copying {}", file))?;
        }
        eprintln!("artifacts in {}", out.display());
        Ok(())
    }

    fn ci(&self) -> Result<()> {
        self.lint()?;
        self.test(None)?;
        self.check_stack()?;
        self.build(true)
    }
}

/// `KEY=value` lines of a dotenv file; comments and blank lines are skipped
fn dotenv_pairs(path: &Path) -> Result<Vec<(String, String)>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        .collect())
}
