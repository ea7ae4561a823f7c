use std::{
    env,
    ffi::OsString,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Instant,
};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::types::{RenderBackend, RenderError};
use crate::domain::{RenderArgs, Snapshot};

/// Renders through an external headless-browser command.
///
/// The command is invoked as `<program> [args..] --user-agent <ua> <url>` and
/// must print either a JSON document `{"html": "...", "requests": [...]}` or
/// the raw markup on stdout. A non-zero exit status is a render failure. The
/// child is killed when the render future is dropped, so pool timeouts and
/// terminations do not leak browser processes.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: PathBuf,
    args: Vec<String>,
    user_agent: String,
}

impl CommandRenderer {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, user_agent: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args,
            user_agent: user_agent.into(),
        }
    }

    pub fn from_settings(settings: &crate::config::RendererSettings) -> Self {
        Self::new(
            settings.command.clone(),
            settings.args.clone(),
            settings.user_agent.clone(),
        )
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }
}

#[async_trait]
impl RenderBackend for CommandRenderer {
    async fn render(&self, args: &RenderArgs) -> Result<Snapshot, RenderError> {
        let started_at = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("--user-agent")
            .arg(&self.user_agent)
            .arg(&args.url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| {
                warn!(
                    target = "application::render::command",
                    op = "command::render",
                    result = "error",
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    error_code = "spawn",
                    program = %self.program.display(),
                    error = %err,
                    "Failed to spawn renderer"
                );
                if err.kind() == ErrorKind::NotFound {
                    RenderError::Unavailable(format!("{}: {err}", self.program.display()))
                } else {
                    RenderError::Io(err)
                }
            })?;

        if !output.status.success() {
            let exit_code = output.status.code();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                target = "application::render::command",
                op = "command::render",
                result = "error",
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                exit_code = exit_code.map(i64::from).unwrap_or(-1),
                error_code = "exit_status",
                url = %args.url,
                stderr = %stderr,
                "Renderer exited unsuccessfully"
            );
            return Err(RenderError::Exit { exit_code, stderr });
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|err| RenderError::InvalidOutput(format!("stdout is not utf-8: {err}")))?;
        let snapshot = parse_output(&stdout)?;

        info!(
            target = "application::render::command",
            op = "command::render",
            result = "ok",
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            url = %args.url,
            html_bytes = snapshot.html.len(),
            requests = snapshot.requests.len(),
            "Renderer produced snapshot"
        );
        Ok(snapshot)
    }

    async fn probe(&self) -> Result<(), RenderError> {
        match resolve_program(&self.program).await {
            Some(_) => Ok(()),
            None => Err(RenderError::Unavailable(format!(
                "{} not found",
                self.program.display()
            ))),
        }
    }
}

fn parse_output(stdout: &str) -> Result<Snapshot, RenderError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(RenderError::InvalidOutput("empty output".to_string()));
    }
    if trimmed.starts_with('{') {
        return serde_json::from_str(trimmed)
            .map_err(|err| RenderError::InvalidOutput(format!("malformed snapshot document: {err}")));
    }
    Ok(Snapshot::new(trimmed))
}

async fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return is_file(program).await.then(|| program.to_path_buf());
    }
    let paths = env::var_os("PATH").unwrap_or_else(OsString::new);
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(program);
        if is_file(&candidate).await {
            return Some(candidate);
        }
    }
    None
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{collections::BTreeMap, fs, os::unix::fs::PermissionsExt};
    use tempfile::TempDir;

    fn make_executable(path: &PathBuf) {
        let mut perms = fs::metadata(path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).expect("set perms");
    }

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-browser");
        fs::write(&path, body).expect("write script");
        make_executable(&path);
        path
    }

    fn args() -> RenderArgs {
        RenderArgs {
            url: "http://localhost:3001/about".to_string(),
            pathname: "/about".to_string(),
            route: "/about".to_string(),
            variant: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn passes_user_agent_and_url() {
        let dir = TempDir::new().expect("temp dir");
        let args_path = dir.path().join("args.log");
        let program = script(
            &dir,
            &format!(
                r#"#!/bin/sh
echo "$@" > "{args_file}"
printf '{{"html":"<main>about</main>","requests":["/api/about"]}}'
"#,
                args_file = args_path.display()
            ),
        );

        let renderer = CommandRenderer::new(program, vec!["--wait".to_string()], "crawlsnap/1");
        let snapshot = renderer.render(&args()).await.expect("render");
        assert_eq!(snapshot.html, "<main>about</main>");
        assert_eq!(snapshot.requests, vec!["/api/about"]);

        let logged = fs::read_to_string(&args_path).expect("read args");
        assert_eq!(
            logged.trim(),
            "--wait --user-agent crawlsnap/1 http://localhost:3001/about"
        );
    }

    #[tokio::test]
    async fn surfaces_exit_status_and_stderr() {
        let dir = TempDir::new().expect("temp dir");
        let program = script(
            &dir,
            r#"#!/bin/sh
echo "navigation timeout" >&2
exit 3
"#,
        );

        let renderer = CommandRenderer::new(program, Vec::new(), "crawlsnap/1");
        match renderer.render(&args()).await {
            Err(RenderError::Exit { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(stderr, "navigation timeout");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let dir = TempDir::new().expect("temp dir");
        let renderer = CommandRenderer::new(dir.path().join("absent"), Vec::new(), "crawlsnap/1");

        assert!(matches!(
            renderer.probe().await,
            Err(RenderError::Unavailable(_))
        ));
        assert!(matches!(
            renderer.render(&args()).await,
            Err(RenderError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn probe_accepts_existing_program() {
        let dir = TempDir::new().expect("temp dir");
        let program = script(&dir, "#!/bin/sh\nexit 0\n");
        let renderer = CommandRenderer::new(program, Vec::new(), "crawlsnap/1");
        renderer.probe().await.expect("probe");
    }
}
