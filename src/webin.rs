use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;

use crate::config::WebinSettings;
use crate::credential::{Credential, PASSWORD_ENV};
use crate::domain::{AssemblyName, Stage};
use crate::error::SubmitError;

/// One call of the submission service for one assembly.
#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub stage: Stage,
    pub assembly: AssemblyName,
    pub manifest: Utf8PathBuf,
    pub output_dir: Utf8PathBuf,
}

/// Everything the service printed, kept verbatim for the attempt log.
#[derive(Debug, Clone, Default)]
pub struct ServiceOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

pub trait SubmissionService {
    /// Runs the service once. `Err` means the call could not be made at all;
    /// a call that ran and failed is `Ok` with `success == false`.
    fn run(
        &self,
        request: &ServiceRequest,
        credential: &Credential,
    ) -> Result<ServiceOutput, SubmitError>;
}

impl<T: SubmissionService + ?Sized> SubmissionService for &T {
    fn run(
        &self,
        request: &ServiceRequest,
        credential: &Credential,
    ) -> Result<ServiceOutput, SubmitError> {
        (**self).run(request, credential)
    }
}

/// Webin-CLI driven through `java -jar`.
#[derive(Debug, Clone)]
pub struct WebinCli {
    java: PathBuf,
    jar: PathBuf,
    context: String,
}

impl WebinCli {
    /// Resolves java and the Webin-CLI jar up front so a batch never starts
    /// with a broken toolchain.
    pub fn locate(settings: &WebinSettings) -> Result<Self, SubmitError> {
        let java = resolve_program(&settings.java)
            .ok_or_else(|| SubmitError::MissingTool(settings.java.clone()))?;
        if !settings.jar.is_file() {
            return Err(SubmitError::MissingTool(format!(
                "Webin-CLI jar at {} (set webin.jar in kira-submit.json or --webin-jar)",
                settings.jar.display()
            )));
        }
        tracing::debug!(java = %java.display(), jar = %settings.jar.display(), "webin-cli located");
        Ok(Self {
            java,
            jar: settings.jar.clone(),
            context: settings.context.clone(),
        })
    }

    /// Command-line arguments for one call. The password is never part of
    /// them; Webin-CLI reads it from [`PASSWORD_ENV`].
    pub fn arguments(&self, request: &ServiceRequest, username: &str) -> Vec<String> {
        let mut args = vec![
            "-jar".to_string(),
            self.jar.display().to_string(),
            "-context".to_string(),
            self.context.clone(),
            "-userName".to_string(),
            username.to_string(),
            "-passwordEnv".to_string(),
            PASSWORD_ENV.to_string(),
            "-manifest".to_string(),
            request.manifest.to_string(),
            "-outputDir".to_string(),
            request.output_dir.to_string(),
        ];
        args.extend(request.stage.mode_args().iter().map(|arg| arg.to_string()));
        args
    }
}

impl SubmissionService for WebinCli {
    fn run(
        &self,
        request: &ServiceRequest,
        credential: &Credential,
    ) -> Result<ServiceOutput, SubmitError> {
        let args = self.arguments(request, credential.username());
        tracing::debug!(
            assembly = %request.assembly,
            stage = %request.stage,
            "running {} {}",
            self.java.display(),
            args.join(" ")
        );
        let output = Command::new(&self.java)
            .args(&args)
            .env(PASSWORD_ENV, credential.secret())
            .stdin(Stdio::null())
            .output()
            .map_err(|err| SubmitError::RemoteService {
                name: request.assembly.to_string(),
                stage: request.stage.to_string(),
                message: format!("failed to start {}: {err}", self.java.display()),
            })?;
        Ok(ServiceOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

fn resolve_program(program: &str) -> Option<PathBuf> {
    let as_path = Path::new(program);
    if as_path.components().count() > 1 {
        return as_path.is_file().then(|| as_path.to_path_buf());
    }
    find_in_path(program)
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.is_file() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.is_file() {
            return Some(plain);
        }
    }
    None
}
