//! Source builds of bitcoind images for `repo#branch` versions.

use crate::domain::tank::{SourceBuild, TankSpec};
use crate::error::{BackendError, BackendResult};
use crate::ports::outbound::CommandRunner;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Configure flags every source build starts with
pub const DEFAULT_BUILD_ARGS: &str = "--disable-tests --with-incompatible-bdb --without-gui --disable-bench --disable-fuzz-binary --enable-suppress-external-warnings";

/// Builds images with `docker build`
#[derive(Clone)]
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    docker: String,
    context: PathBuf,
}

impl ImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, docker: impl Into<String>, context: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            docker: docker.into(),
            context: context.into(),
        }
    }

    fn build_args(build: &SourceBuild) -> Vec<String> {
        let configure = match &build.build_args {
            Some(extra) => format!("{DEFAULT_BUILD_ARGS} {extra}"),
            None => DEFAULT_BUILD_ARGS.to_string(),
        };
        vec![
            "build".to_string(),
            "--build-arg".to_string(),
            format!("REPO={}", build.repo),
            "--build-arg".to_string(),
            format!("BRANCH={}", build.branch),
            "--build-arg".to_string(),
            format!("BUILD_ARGS={configure}"),
            "--tag".to_string(),
            build.image_tag(),
        ]
    }

    pub async fn build(&self, build: &SourceBuild) -> BackendResult<()> {
        let tag = build.image_tag();
        info!(repo = %build.repo, branch = %build.branch, tag = %tag, "building image");
        let mut args = Self::build_args(build);
        args.push(self.context.display().to_string());
        self.runner.run(&self.docker, &args, None).await?.into_stdout()?;
        Ok(())
    }

    /// Build every distinct source image once. Returns true when anything was built.
    pub async fn build_all(&self, tanks: &[TankSpec]) -> BackendResult<bool> {
        let builds: BTreeMap<String, &SourceBuild> = tanks
            .iter()
            .filter_map(|t| t.build.as_ref())
            .map(|b| (b.image_tag(), b))
            .collect();
        let mut failures = Vec::new();
        for (tag, build) in &builds {
            if let Err(e) = self.build(build).await {
                failures.push(format!("{tag}: {e}"));
            }
        }
        if !failures.is_empty() {
            return Err(BackendError::Bulk {
                operation: "image build".to_string(),
                failures,
            });
        }
        Ok(!builds.is_empty())
    }
}
