use serde::Deserialize;
use zbus::{
    Connection, proxy,
    zvariant::{OwnedObjectPath, Value},
};

use crate::{
    constants::SCOPE_UNIT_PREFIX,
    core::domain::{ExecutionLimits, RunId},
};

#[proxy(
    interface = "org.freedesktop.systemd1.Manager",
    default_service = "org.freedesktop.systemd1",
    default_path = "/org/freedesktop/systemd1"
)]
trait SystemdManager {
    fn start_transient_unit(
        &self,
        name: &str,
        mode: &str,
        properties: &[(&str, Value<'_>)],
        aux: &[(&str, &[(&str, Value<'_>)])],
    ) -> zbus::Result<OwnedObjectPath>;

    fn kill_unit(&self, name: &str, whom: &str, signal: i32) -> zbus::Result<()>;

    fn stop_unit(&self, name: &str, mode: &str) -> zbus::Result<OwnedObjectPath>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeBus {
    #[default]
    Off,
    User,
    System,
}

/// Places sandbox processes into transient systemd scopes so the kernel
/// enforces memory and task limits on the whole process tree.
#[derive(Debug, Clone)]
pub struct ScopeManager {
    manager: SystemdManagerProxy<'static>,
}

#[derive(Debug, Clone)]
pub struct ScopeHandle {
    pub unit: String,
    pub memory_limited: bool,
}

impl ScopeManager {
    pub async fn connect(bus: ScopeBus) -> zbus::Result<Option<Self>> {
        let connection = match bus {
            ScopeBus::Off => return Ok(None),
            ScopeBus::User => Connection::session().await?,
            ScopeBus::System => Connection::system().await?,
        };
        let manager = SystemdManagerProxy::new(&connection).await?;
        tracing::info!("Sandbox scopes via the {:?} systemd manager", bus);

        Ok(Some(Self { manager }))
    }

    #[tracing::instrument(skip(self, limits))]
    pub async fn attach(
        &self,
        run_id: RunId,
        pid: u32,
        limits: &ExecutionLimits,
    ) -> zbus::Result<ScopeHandle> {
        let unit = unit_name(run_id);
        let mut properties: Vec<(&str, Value<'_>)> = vec![
            ("Description", Value::from(format!("playground run {run_id}"))),
            ("PIDs", Value::from(vec![pid])),
            ("CollectMode", Value::from("inactive-or-failed")),
        ];
        if let Some(bytes) = limits.memory_bytes {
            properties.push(("MemoryMax", Value::from(bytes)));
            properties.push(("MemorySwapMax", Value::from(0u64)));
        }
        if let Some(count) = limits.pids_count {
            properties.push(("TasksMax", Value::from(u64::from(count))));
        }

        self.manager
            .start_transient_unit(&unit, "fail", &properties, &[])
            .await?;
        tracing::debug!("Started scope {}", unit);

        Ok(ScopeHandle {
            unit,
            memory_limited: limits.memory_bytes.is_some(),
        })
    }

    pub async fn kill(&self, scope: &ScopeHandle) -> zbus::Result<()> {
        self.manager
            .kill_unit(&scope.unit, "all", nix::sys::signal::Signal::SIGKILL as i32)
            .await
    }

    pub async fn stop(&self, scope: &ScopeHandle) -> zbus::Result<()> {
        self.manager.stop_unit(&scope.unit, "replace").await?;
        Ok(())
    }
}

pub fn unit_name(run_id: RunId) -> String {
    format!("{SCOPE_UNIT_PREFIX}{}.scope", run_id.simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_unit_name() {
        let run_id = Uuid::parse_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();

        assert_eq!(
            unit_name(run_id),
            "playground-run-67e5504410b1426f9247bb680e5fe0c8.scope"
        );
    }

    #[tokio::test]
    async fn test_off_does_not_connect() {
        assert!(ScopeManager::connect(ScopeBus::Off).await.unwrap().is_none());
    }
}
