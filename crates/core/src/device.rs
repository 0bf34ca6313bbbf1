use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{Error, Result};

/// Environment state captured before a backup run and put back afterwards.
/// Some devices flip these while app data is being archived.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvSnapshot {
    pub input_method: String,
    pub accessibility_services: String,
}

/// Opaque OS-helper boundary: the calls either succeed or fail, nothing about
/// how they work leaks into the task engine.
pub trait DeviceEnv: Send + Sync {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<EnvSnapshot>> + Send + 'a>>;

    fn restore<'a>(
        &'a self,
        snapshot: &'a EnvSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    fn grant_install_permission<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Argv templates for the shell-backed environment. A trailing value argument
/// is appended to the two setters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DeviceCommands {
    pub get_input_method: Vec<String>,
    pub set_input_method: Vec<String>,
    pub get_accessibility_services: Vec<String>,
    pub set_accessibility_services: Vec<String>,
    pub grant_install_permission: Vec<String>,
}

pub struct ShellDeviceEnv {
    commands: DeviceCommands,
}

impl ShellDeviceEnv {
    pub fn new(commands: DeviceCommands) -> Self {
        Self { commands }
    }

    async fn run(argv: &[String], extra: Option<&str>) -> Result<String> {
        let (program, args) = argv.split_first().ok_or_else(|| Error::InvalidConfig {
            message: "device command is not configured".to_string(),
        })?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        if let Some(extra) = extra {
            cmd.arg(extra);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(event = "device.exec", program = %program, "device.exec");
        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(Error::InvalidConfig {
                message: format!(
                    "device command {program} exited with {}: {stderr}",
                    output.status.code().unwrap_or(-1)
                ),
            });
        }
        Ok(stdout)
    }
}

impl DeviceEnv for ShellDeviceEnv {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<EnvSnapshot>> + Send + 'a>> {
        Box::pin(async move {
            let input_method = Self::run(&self.commands.get_input_method, None).await?;
            let accessibility_services =
                Self::run(&self.commands.get_accessibility_services, None).await?;
            Ok(EnvSnapshot {
                input_method,
                accessibility_services,
            })
        })
    }

    fn restore<'a>(
        &'a self,
        snapshot: &'a EnvSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            Self::run(&self.commands.set_input_method, Some(&snapshot.input_method)).await?;
            Self::run(
                &self.commands.set_accessibility_services,
                Some(&snapshot.accessibility_services),
            )
            .await?;
            Ok(())
        })
    }

    fn grant_install_permission<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            Self::run(&self.commands.grant_install_permission, None).await?;
            Ok(())
        })
    }
}

/// Canned environment for tests: records every call, optionally fails grants.
#[derive(Debug, Default)]
pub struct ScriptedDeviceEnv {
    pub canned: EnvSnapshot,
    pub fail_grant: bool,
    pub grants: AtomicUsize,
    pub restored: Mutex<Vec<EnvSnapshot>>,
}

impl ScriptedDeviceEnv {
    pub fn new(canned: EnvSnapshot) -> Self {
        Self {
            canned,
            ..Self::default()
        }
    }
}

impl DeviceEnv for ScriptedDeviceEnv {
    fn snapshot<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<EnvSnapshot>> + Send + 'a>> {
        Box::pin(async move { Ok(self.canned.clone()) })
    }

    fn restore<'a>(
        &'a self,
        snapshot: &'a EnvSnapshot,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.restored.lock().await.push(snapshot.clone());
            Ok(())
        })
    }

    fn grant_install_permission<'a>(
        &'a self,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.grants.fetch_add(1, Ordering::Relaxed);
            if self.fail_grant {
                return Err(Error::InvalidConfig {
                    message: "install permission was refused".to_string(),
                });
            }
            Ok(())
        })
    }
}
