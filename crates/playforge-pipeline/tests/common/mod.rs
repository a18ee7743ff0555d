#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tempfile::TempDir;

use playforge_core::test_helpers;
use playforge_pipeline::{GameSession, Pipeline, PipelineConfig};

/// How the stand-in toolchain behaves when invoked.
#[derive(Debug, Clone, Copy)]
pub enum Toolchain {
    /// Writes `index.html` into the `--output` directory.
    Succeeds,
    /// Exits 1 with a plain error message.
    Fails,
    /// Exits 0 without producing an entry point.
    NoEntryPoint,
    /// Reports `EBUSY` on the first `n` runs, then succeeds.
    BusyFor(u32),
    /// Sleeps before succeeding, recording overlapping runs.
    Slow { millis: u64 },
}

/// A pipeline over a temporary sandbox with a shell-script toolchain.
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub config: PipelineConfig,
    pub dir: TempDir,
}

impl TestPipeline {
    pub async fn new(toolchain: Toolchain) -> Self {
        Self::with_config(toolchain, |_| {}).await
    }

    pub async fn with_config(toolchain: Toolchain, tweak: impl FnOnce(&mut PipelineConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cli_path = write_toolchain(dir.path(), toolchain);
        let mut config = test_config(dir.path(), cli_path);
        tweak(&mut config);
        let pipeline = Pipeline::new(config.clone()).await.unwrap();
        Self {
            pipeline,
            config,
            dir,
        }
    }

    /// Build a fresh pipeline over the same sandbox, as after a restart.
    pub async fn reopen(&mut self) {
        self.pipeline = Pipeline::new(self.config.clone()).await.unwrap();
    }

    pub fn root(&self) -> &Path {
        self.pipeline.sandbox.root()
    }

    /// Number of times the toolchain has been started.
    pub fn invocations(&self) -> usize {
        read_lines(&self.dir.path().join("runs.log")).len()
    }

    /// Runs that started while another run for the same session was active.
    pub fn overlaps(&self) -> usize {
        read_lines(&self.dir.path().join("overlaps.log")).len()
    }

    /// Highest number of toolchain processes seen running at once.
    pub fn peak_concurrency(&self) -> usize {
        read_lines(&self.dir.path().join("peaks.log"))
            .iter()
            .filter_map(|l| l.trim().parse().ok())
            .max()
            .unwrap_or(0)
    }

    pub async fn session(&self, name: &str) -> GameSession {
        self.pipeline
            .create_session(None, test_helpers::complete_document(name))
            .await
            .unwrap()
    }
}

pub fn test_config(dir: &Path, cli_path: PathBuf) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.toolchain.cli_path = cli_path;
    config.toolchain.command_timeout_secs = 10;
    config.sandbox.root = dir.join("sandbox");
    config.recovery.retry_delay_ms = 10;
    config.recovery.max_delay_ms = 50;
    config
}

pub fn document(name: &str) -> Value {
    test_helpers::complete_document(name)
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(String::from).collect())
        .unwrap_or_default()
}

/// Write the toolchain script under `dir/bin`. The sandbox clears the
/// environment, so every path the script needs is baked into its text.
fn write_toolchain(dir: &Path, toolchain: Toolchain) -> PathBuf {
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let state = dir.display();

    let prelude = format!(
        r#"#!/bin/sh
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; shift; fi
  shift
done
runs=$(cat "{state}/runs.log" 2>/dev/null | wc -l)
echo run >> "{state}/runs.log"
"#
    );
    let produce = r#"mkdir -p "$out"
printf '<html><body>game</body></html>' > "$out/index.html"
printf 'console.log(1);' > "$out/game.js"
exit 0
"#;
    let body = match toolchain {
        Toolchain::Succeeds => produce.to_string(),
        Toolchain::Fails => "echo 'error: layout Main references unknown object' >&2\nexit 1\n".to_string(),
        Toolchain::NoEntryPoint => "exit 0\n".to_string(),
        Toolchain::BusyFor(n) => format!(
            "if [ $runs -lt {n} ]; then echo 'write failed: EBUSY' >&2; exit 1; fi\n{produce}"
        ),
        Toolchain::Slow { millis } => {
            let secs = millis as f64 / 1000.0;
            format!(
                r#"mkdir -p "{state}/locks"
lock="{state}/locks/$(basename "$(dirname "$out")")"
if ! mkdir "$lock" 2>/dev/null; then echo overlap >> "{state}/overlaps.log"; fi
mkdir -p "{state}/running"
touch "{state}/running/$$"
ls "{state}/running" | wc -l >> "{state}/peaks.log"
sleep {secs}
rm -f "{state}/running/$$"
rmdir "$lock" 2>/dev/null
{produce}"#
            )
        },
    };

    let path = bin.join("playforge-export");
    std::fs::write(&path, format!("{prelude}{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
