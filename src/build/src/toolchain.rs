//! External Go toolchain invocation.
//!
//! Compiles a reference path into an artifact file, extracts build ids,
//! and probes packages and modules with `go list`. The compiler is a
//! trait so the image builder (and its tests) can swap the toolchain
//! out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kolite_core::cancel::CancelToken;
use kolite_core::config;
use kolite_core::error::{KoError, Result};
use kolite_core::platform::Platform;
use serde::Deserialize;
use sha2::{Digest as _, Sha256};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Produces artifact files for reference paths.
#[async_trait]
pub trait Compiler: Send + Sync {
    /// Compile `path` for `platform`, returning the artifact file.
    async fn build(
        &self,
        token: &CancelToken,
        path: &str,
        platform: &Platform,
        disable_optimizations: bool,
    ) -> Result<PathBuf>;

    /// The toolchain-assigned id embedded in an artifact.
    async fn build_id(&self, file: &Path) -> Result<String>;

    /// Resolve a reference path to its package.
    async fn package_info(&self, path: &str) -> Result<GoPackage>;
}

/// A probed Go package.
#[derive(Debug, Clone, Deserialize)]
pub struct GoPackage {
    #[serde(rename = "Dir")]
    pub dir: PathBuf,
    #[serde(rename = "Name")]
    pub name: String,
}

impl GoPackage {
    /// Whether the package builds a command.
    pub fn is_command(&self) -> bool {
        self.name == "main"
    }
}

/// One module from `go list -m -json all`.
#[derive(Debug, Clone, Deserialize)]
pub struct ModInfo {
    #[serde(rename = "Path")]
    pub path: String,
    #[serde(rename = "Dir", default)]
    pub dir: Option<PathBuf>,
    #[serde(rename = "Main", default)]
    pub main: bool,
}

/// The module graph of the project in the working directory.
#[derive(Debug, Clone)]
pub struct Modules {
    pub main: ModInfo,
    pub deps: HashMap<String, ModInfo>,
}

/// Read the module graph, or `None` when the project does not use go
/// modules. The output is a concatenated sequence of JSON objects.
pub async fn module_info() -> Result<Option<Modules>> {
    let output = match Command::new("go")
        .args(["list", "-mod=readonly", "-json", "-m", "all"])
        .output()
        .await
    {
        Ok(output) if output.status.success() => output,
        _ => return Ok(None),
    };

    let mut main = None;
    let mut deps = HashMap::new();
    for info in serde_json::Deserializer::from_slice(&output.stdout).into_iter::<ModInfo>() {
        let info = info.map_err(|e| {
            KoError::Serialization(format!("error reading module data: {}", e))
        })?;
        if info.main {
            main = Some(info.clone());
        }
        deps.insert(info.path.clone(), info);
    }

    match main {
        Some(main) => Ok(Some(Modules { main, deps })),
        None => Err(KoError::Config("couldn't find main module".to_string())),
    }
}

/// The real `go` toolchain.
#[derive(Debug, Default)]
pub struct GoToolchain;

impl GoToolchain {
    pub fn new() -> Self {
        GoToolchain
    }

    /// The environment for a build: the caller's environment with the
    /// adapter's variables overriding it.
    fn build_env(platform: &Platform) -> Result<Vec<(String, String)>> {
        let mut env: Vec<(String, String)> = std::env::vars().collect();

        let mut set = |key: &str, value: String| {
            match env.iter_mut().find(|(k, _)| k == key) {
                Some(pair) => pair.1 = value,
                None => env.push((key.to_string(), value)),
            }
        };

        set("CGO_ENABLED", "0".to_string());
        set("GOOS", platform.os.clone());
        set("GOARCH", platform.architecture.clone());
        if platform.architecture.starts_with("arm") {
            if let Some(goarm) = platform.goarm()? {
                set("GOARM", goarm);
            }
        }
        Ok(env)
    }

    /// Hash over args and env, excluding env vars in the project's own
    /// namespace, used to key stable output directories.
    fn hash_inputs(args: &[String], env: &[(String, String)]) -> String {
        let filtered: Vec<String> = env
            .iter()
            .filter(|(k, _)| !k.starts_with("KO"))
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut hasher = Sha256::new();
        hasher.update(args.join(" "));
        hasher.update(" ");
        hasher.update(filtered.join(" "));
        hex::encode(hasher.finalize())
    }

    fn output_dir(path: &str, args: &[String], env: &[(String, String)]) -> Result<PathBuf> {
        if config::stable_output() {
            let dir = std::env::temp_dir()
                .join("ko-app")
                .join(path)
                .join(Self::hash_inputs(args, env));
            std::fs::create_dir_all(&dir)?;
            return Ok(dir);
        }
        Ok(tempfile::Builder::new().prefix("ko").tempdir()?.into_path())
    }
}

#[async_trait]
impl Compiler for GoToolchain {
    async fn build(
        &self,
        token: &CancelToken,
        path: &str,
        platform: &Platform,
        disable_optimizations: bool,
    ) -> Result<PathBuf> {
        let env = Self::build_env(platform)?;

        let mut args: Vec<String> = vec!["build".to_string()];
        if disable_optimizations {
            // Disable optimizations (-N) and inlining (-l).
            args.push("-gcflags".to_string());
            args.push("all=-N -l".to_string());
        }
        args.push("-trimpath".to_string());

        let out_dir = Self::output_dir(path, &args, &env)?;
        let file = out_dir.join("out");
        args.push("-o".to_string());
        args.push(file.to_string_lossy().to_string());
        args.push(path.to_string());

        tracing::info!("Building {} for {}", path, platform);

        let mut child = Command::new("go")
            .args(&args)
            .env_clear()
            .envs(env)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let mut stderr_pipe = child.stderr.take().ok_or_else(|| KoError::Toolchain {
            stderr: "stderr pipe unavailable".to_string(),
        })?;
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr_pipe.read_to_end(&mut buf).await;
            buf
        });

        let status = tokio::select! {
            status = child.wait() => Some(status?),
            _ = token.cancelled() => None,
        };
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

        let status = match status {
            Some(status) => status,
            None => {
                let _ = child.kill().await;
                if !config::stable_output() {
                    let _ = std::fs::remove_dir_all(&out_dir);
                }
                return Err(KoError::Cancelled);
            }
        };

        if !status.success() {
            if !config::stable_output() {
                let _ = std::fs::remove_dir_all(&out_dir);
            }
            tracing::error!("Unexpected error running \"go build\": {}", stderr.trim());
            return Err(KoError::Toolchain { stderr });
        }
        Ok(file)
    }

    async fn build_id(&self, file: &Path) -> Result<String> {
        let output = Command::new("go")
            .args(["tool", "buildid"])
            .arg(file)
            .output()
            .await?;
        if !output.status.success() {
            return Err(KoError::Toolchain {
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn package_info(&self, path: &str) -> Result<GoPackage> {
        let output = Command::new("go")
            .args(["list", "-json"])
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(KoError::Import(format!(
                "cannot resolve package for {:?}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| KoError::Import(format!("cannot decode package for {:?}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_env_adapter_wins() {
        std::env::set_var("GOOS", "darwin");
        let platform = Platform::new("linux", "amd64");
        let env = GoToolchain::build_env(&platform).unwrap();

        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("CGO_ENABLED"), Some("0".to_string()));
        assert_eq!(get("GOOS"), Some("linux".to_string()));
        assert_eq!(get("GOARCH"), Some("amd64".to_string()));
        // The adapter's value replaced the caller's; no duplicate entry.
        assert_eq!(env.iter().filter(|(k, _)| k == "GOOS").count(), 1);
        std::env::remove_var("GOOS");
    }

    #[test]
    fn test_build_env_sets_goarm() {
        let platform = Platform::new("linux", "arm").with_variant("v7");
        let env = GoToolchain::build_env(&platform).unwrap();
        assert!(env.iter().any(|(k, v)| k == "GOARM" && v == "7"));
    }

    #[test]
    fn test_build_env_rejects_malformed_variant() {
        let platform = Platform::new("linux", "arm").with_variant("bogus");
        assert!(matches!(
            GoToolchain::build_env(&platform),
            Err(KoError::Platform(_))
        ));
    }

    #[test]
    fn test_hash_inputs_ignores_ko_vars() {
        let args = vec!["build".to_string(), "-trimpath".to_string()];
        let base = vec![("HOME".to_string(), "/root".to_string())];
        let mut with_ko = base.clone();
        with_ko.push(("KO_DOCKER_REPO".to_string(), "gcr.io/x".to_string()));

        assert_eq!(
            GoToolchain::hash_inputs(&args, &base),
            GoToolchain::hash_inputs(&args, &with_ko)
        );
    }

    #[test]
    fn test_hash_inputs_sensitive_to_args() {
        let env = vec![("HOME".to_string(), "/root".to_string())];
        let a = GoToolchain::hash_inputs(&["build".to_string()], &env);
        let b = GoToolchain::hash_inputs(&["build".to_string(), "-trimpath".to_string()], &env);
        assert_ne!(a, b);
    }

    #[test]
    fn test_package_is_command() {
        let package = GoPackage {
            dir: PathBuf::from("/src/app"),
            name: "main".to_string(),
        };
        assert!(package.is_command());
        let library = GoPackage {
            dir: PathBuf::from("/src/lib"),
            name: "lib".to_string(),
        };
        assert!(!library.is_command());
    }

    #[test]
    fn test_modules_decode_concatenated_json() {
        let stream = br#"{"Path":"github.com/foo/bar","Dir":"/src/bar","Main":true}
{"Path":"github.com/dep/one","Dir":"/gopath/one"}"#;
        let mut main = None;
        let mut deps = HashMap::new();
        for info in serde_json::Deserializer::from_slice(stream).into_iter::<ModInfo>() {
            let info = info.unwrap();
            if info.main {
                main = Some(info.clone());
            }
            deps.insert(info.path.clone(), info);
        }
        assert_eq!(main.unwrap().path, "github.com/foo/bar");
        assert_eq!(deps.len(), 2);
    }
}
