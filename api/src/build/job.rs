//! A single build job: repository to pushed image. Jobs never propagate
//! errors out of the pool; every failure converges on the `Failed` state and
//! a terminal log record.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use binder_common::app::{AppSpec, Dependency};
use binder_common::build::BuildState;
use binder_common::log::Level;
use binder_common::storage::make_dir;
use binder_common::template::{render_file, Params};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::process::Command;
use tracing::{error, info, instrument};

use super::{containerfile, BuildContext};
use crate::persistence::{AppRecord, ServiceRecord};

const TAG: &str = "builder";

#[derive(thiserror::Error, Debug)]
pub enum BuildError {
    #[error("could not fetch repository: {0}")]
    FetchRepo(String),
    #[error("could not build service {0}")]
    Service(String),
    #[error("could not build app {0}")]
    ImageBuild(String),
    #[error("could not build the base image")]
    BaseImage,
    #[error("could not push {0} to the private registry")]
    Push(String),
    #[error("registry failure: {0}")]
    Registry(#[from] crate::persistence::Error),
    #[error("could not preload the app image: {0}")]
    Preload(#[from] binder_cluster::Error),
    #[error("build I/O failure: {0}")]
    InputOutput(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, BuildError>;

/// Run one job end to end.
#[instrument(skip_all, fields(app = %spec.name))]
pub async fn run(ctx: Arc<BuildContext>, spec: AppSpec) {
    let app = spec.name.clone();

    let record = match ctx.registry.create(spec).await {
        Ok(record) => record,
        Err(err) => {
            error!(%err, "could not persist the app record");
            return;
        }
    };

    // Single flight per app: a running build owns the app directory
    match ctx.registry.begin_build(&app).await {
        Ok(true) => {}
        Ok(false) => {
            info!("a build is already running, skipping");
            return;
        }
        Err(err) => {
            error!(%err, "could not transition into building");
            return;
        }
    }

    match execute(&ctx, &record).await {
        Ok(()) => {
            terminal_state(&ctx, &app, BuildState::Completed).await;
            ctx.log
                .info(TAG, format!("successfully built app {app}"), Some(&app));
        }
        Err(err) => {
            terminal_state(&ctx, &app, BuildState::Failed).await;
            ctx.log.error(TAG, err.to_string(), Some(&app));
        }
    }
}

async fn terminal_state(ctx: &BuildContext, app: &str, state: BuildState) {
    if let Err(err) = ctx.registry.update_build_state(app, state).await {
        error!(%err, %state, "could not record terminal build state");
    }
}

async fn execute(ctx: &BuildContext, record: &AppRecord) -> Result<()> {
    let spec = &record.spec;
    let app = spec.name.as_str();
    let dirs = &ctx.config.state;

    fetch_repo(ctx, spec).await?;

    let mut services = Vec::with_capacity(spec.services.len());
    if !spec.services.is_empty() {
        ctx.log
            .info(TAG, "building service dependencies", Some(app));
    }
    for service_ref in &spec.services {
        let service = ctx
            .services
            .get(&service_ref.name, &service_ref.version)
            .await?
            .ok_or_else(|| BuildError::Service(service_ref.full_name()))?;
        build_service(ctx, app, &service).await?;
        services.push(service);
    }

    let build_path = dirs.app_build(app);
    recreate_build_dir(&build_path).await?;

    ctx.log
        .info(TAG, "copying files and filling templates", Some(app));
    copy_tree(&dirs.images(), &build_path).await?;
    render_tree(&build_path, &spec_params(spec)).await?;

    if ctx.options.build_base {
        build_base_image(ctx, app).await?;
    }

    let app_img_path = build_path.join("app");
    make_dir(&app_img_path, false).await?;
    copy_tree(&dirs.app_repo(app), &app_img_path.join("repo")).await?;

    let suffix = tokio::fs::read_to_string(build_path.join("suffix").join("Dockerfile")).await?;
    let image = ctx.config.image_name(app);
    let base_image = ctx.config.base_image_name();

    if spec.has_dependency(Dependency::Dockerfile) {
        let repo_dockerfile = app_img_path
            .join("repo")
            .join(spec.dockerfile.as_deref().unwrap_or("Dockerfile"));
        let raw = tokio::fs::read_to_string(&repo_dockerfile).await?;
        let rewritten =
            containerfile::rewrite_repo_dockerfile(&raw, &base_image, spec.notebooks.as_deref(), &suffix);
        if rewritten.foreign_base {
            ctx.log.warn(
                TAG,
                "repository base image is not the platform base, building may fail",
                Some(app),
            );
        }
        tokio::fs::write(app_img_path.join("repo").join("Dockerfile"), rewritten.dockerfile)
            .await?;

        ctx.log.info(
            TAG,
            "starting custom image build (download logs for more details)",
            Some(app),
        );
        // Repository builds can be very chatty: keep their output file-only
        build_image(ctx, app, &image, &app_img_path.join("repo"), true).await?;
        ctx.log
            .info(TAG, "completed custom image build", Some(app));
    } else {
        ctx.log
            .info(TAG, "building app image from declared dependencies", Some(app));

        let mut clients = Vec::new();
        for service in &services {
            if let Some(snippet) = service.client_snippet().await? {
                clients.push((service.name.clone(), snippet));
            }
        }

        let dockerfile = containerfile::synthesize_dockerfile(spec, &base_image, &clients, &suffix);
        tokio::fs::write(app_img_path.join("Dockerfile"), dockerfile).await?;

        if spec.has_dependency(Dependency::Requirements) {
            tokio::fs::copy(
                dirs.util().join("handle-requirements.py"),
                app_img_path.join("handle-requirements.py"),
            )
            .await?;
        }

        build_image(ctx, app, &image, &app_img_path, false).await?;
    }

    squash_and_push(ctx, app, &image).await?;

    if ctx.options.preload {
        ctx.log
            .info(TAG, "preloading app image onto all nodes", Some(app));
        ctx.cluster.preload_image(app).await?;
    }

    Ok(())
}

/// Clone the repository with a clean slate. A URL answering 404 fails the
/// build before git is even invoked.
async fn fetch_repo(ctx: &BuildContext, spec: &AppSpec) -> Result<()> {
    let app = spec.name.as_str();
    ctx.log
        .info(TAG, format!("fetching {}", spec.repo), Some(app));

    match reqwest::get(&spec.repo).await {
        Ok(response) if response.status() == StatusCode::NOT_FOUND => {
            return Err(BuildError::FetchRepo("repository does not exist".to_string()))
        }
        Ok(_) => {}
        Err(err) => return Err(BuildError::FetchRepo(err.to_string())),
    }

    let repo_path = ctx.config.state.app_repo(app);
    if repo_path.is_dir() {
        tokio::fs::remove_dir_all(&repo_path).await?;
    }

    let output = Command::new("git")
        .args(["clone", "--recursive", &spec.repo])
        .arg(&repo_path)
        .output()
        .await?;
    if !output.status.success() {
        return Err(BuildError::FetchRepo(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    Ok(())
}

/// Build a service's images, skipped entirely when its spec matches the
/// last successful build.
async fn build_service(ctx: &BuildContext, app: &str, service: &ServiceRecord) -> Result<()> {
    if !service.needs_build() {
        ctx.log.info(
            TAG,
            format!(
                "{} unchanged since last build, not rebuilding",
                service.full_name()
            ),
            Some(app),
        );
        return Ok(());
    }

    let build_path = service.path.join("build");
    make_dir(&build_path, true).await?;
    for sub in ["components", "deployments", "images"] {
        let source = service.path.join(sub);
        if source.is_dir() {
            copy_tree(&source, &build_path.join(sub)).await?;
        }
    }
    render_tree(&build_path, &service.spec.string_params()).await?;

    for image in &service.spec.images {
        let image_name = format!(
            "{}/{}-{}",
            ctx.config.registry(),
            service.full_name(),
            image.name
        );
        let context = build_path.join("images").join(&image.name);

        let mut build = Command::new("docker");
        build.args(["build", "-t", &image_name]).arg(&context);
        if !run_streamed(ctx, app, build, false).await?.success() {
            return Err(BuildError::Service(service.full_name()));
        }

        let mut push = Command::new("docker");
        push.args(["push", &image_name]);
        if !run_streamed(ctx, app, push, false).await?.success() {
            return Err(BuildError::Service(service.full_name()));
        }
    }

    ctx.log.info(
        TAG,
        format!("successfully built {}", service.full_name()),
        Some(app),
    );
    ctx.services.save_last_build(service).await?;

    Ok(())
}

async fn build_base_image(ctx: &BuildContext, app: &str) -> Result<()> {
    ctx.log.info(TAG, "building base image", Some(app));

    let base_image = ctx.config.base_image_name();
    let context = ctx.config.state.images().join("base");

    let mut build = Command::new("docker");
    build.args(["build", "-t", &base_image]).arg(&context);
    if !run_streamed(ctx, app, build, false).await?.success() {
        return Err(BuildError::BaseImage);
    }

    ctx.log.info(
        TAG,
        format!("squashing and pushing {base_image} to the private registry"),
        Some(app),
    );
    let status = Command::new(ctx.config.state.squash_and_push())
        .arg(&base_image)
        .status()
        .await?;
    if !status.success() {
        return Err(BuildError::BaseImage);
    }

    Ok(())
}

async fn build_image(
    ctx: &BuildContext,
    app: &str,
    image: &str,
    context: &Path,
    file_only: bool,
) -> Result<()> {
    let mut build = Command::new("docker");
    build
        .args(["build", "-t", image, "--no-cache"])
        .arg(context);

    if !run_streamed(ctx, app, build, file_only).await?.success() {
        return Err(BuildError::ImageBuild(app.to_string()));
    }

    Ok(())
}

async fn squash_and_push(ctx: &BuildContext, app: &str, image: &str) -> Result<()> {
    ctx.log.info(
        TAG,
        format!("squashing and pushing {image} to the private registry"),
        Some(app),
    );

    let mut push = Command::new(ctx.config.state.squash_and_push());
    push.arg(image);
    if !run_streamed(ctx, app, push, false).await?.success() {
        return Err(BuildError::Push(app.to_string()));
    }

    Ok(())
}

/// Run a subprocess with both output streams forwarded line-by-line to the
/// log plane: stdout at INFO, stderr at ERROR.
async fn run_streamed(
    ctx: &BuildContext,
    app: &str,
    mut command: Command,
    file_only: bool,
) -> std::io::Result<std::process::ExitStatus> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;

    if let Some(stdout) = child.stdout.take() {
        ctx.log
            .write_stream(TAG, Level::Info, stdout, Some(app.to_string()), file_only);
    }
    if let Some(stderr) = child.stderr.take() {
        ctx.log
            .write_stream(TAG, Level::Error, stderr, Some(app.to_string()), file_only);
    }

    child.wait().await
}

/// Empty the build directory while keeping the state document alive; the
/// running build's own transition record lives there.
async fn recreate_build_dir(build: &Path) -> std::io::Result<()> {
    make_dir(build, false).await?;

    let mut entries = tokio::fs::read_dir(build).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_name() == ".build_state" {
            continue;
        }
        if entry.metadata().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }

    Ok(())
}

/// The spec itself is the parameter set for the shipped image templates.
fn spec_params(spec: &AppSpec) -> Params {
    let Ok(Value::Object(fields)) = serde_json::to_value(spec) else {
        return Params::new();
    };

    fields
        .into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(raw) => raw,
                other => other.to_string(),
            };
            (key, value)
        })
        .collect()
}

async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((from, to)) = stack.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                stack.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }

    Ok(())
}

async fn render_tree(root: &Path, params: &Params) -> std::io::Result<()> {
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                stack.push(entry.path());
            } else if entry.file_name() != ".build_state" {
                render_file(&entry.path(), params).await?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use binder_common::storage::StateDir;

    use super::*;

    #[tokio::test]
    async fn recreate_build_dir_keeps_the_state_document() {
        let dir = tempfile::tempdir().unwrap();
        let build = dir.path().join("build");
        tokio::fs::create_dir_all(build.join("app")).await.unwrap();
        tokio::fs::write(build.join(".build_state"), "{}").await.unwrap();
        tokio::fs::write(build.join("stale"), "x").await.unwrap();

        recreate_build_dir(&build).await.unwrap();

        assert!(build.join(".build_state").exists());
        assert!(!build.join("stale").exists());
        assert!(!build.join("app").exists());
    }

    #[tokio::test]
    async fn copy_and_render_build_context() {
        let dir = tempfile::tempdir().unwrap();
        let dirs = StateDir::new(dir.path());
        tokio::fs::create_dir_all(dirs.images().join("suffix"))
            .await
            .unwrap();
        tokio::fs::write(
            dirs.images().join("suffix/Dockerfile"),
            "LABEL app={{name}}\n",
        )
        .await
        .unwrap();

        let build = dirs.app_build("acme-demo");
        recreate_build_dir(&build).await.unwrap();
        copy_tree(&dirs.images(), &build).await.unwrap();

        let spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        render_tree(&build, &spec_params(&spec)).await.unwrap();

        assert_eq!(
            tokio::fs::read_to_string(build.join("suffix/Dockerfile"))
                .await
                .unwrap(),
            "LABEL app=acme-demo\n"
        );
    }

    #[test]
    fn spec_params_stringify_every_field() {
        let mut spec = AppSpec::new("acme-demo", "https://github.com/acme/demo");
        spec.notebooks = Some("nb".to_string());
        let params = spec_params(&spec);

        assert_eq!(params.get("name").unwrap(), "acme-demo");
        assert_eq!(params.get("repo").unwrap(), "https://github.com/acme/demo");
        assert_eq!(params.get("notebooks").unwrap(), "nb");
    }
}
