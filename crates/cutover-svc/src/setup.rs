//! Service installation, removal and repair

use std::path::PathBuf;

use tracing::info;

use cutover_core::config::ServiceConfig;
use cutover_core::machine;
use cutover_store::DatabasePool;

/// Failure modes of the management commands
#[derive(Debug)]
pub enum CommandError {
    /// A precondition was not satisfied (exit code 2)
    Prerequisites(String),
    /// The command itself failed (exit code 1)
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for CommandError {
    fn from(error: anyhow::Error) -> Self {
        CommandError::Failed(error)
    }
}

fn unit_path() -> PathBuf {
    PathBuf::from("/etc/systemd/system/cutoverd.service")
}

fn unit_contents(config: &ServiceConfig) -> String {
    format!(
        "[Unit]\n\
         Description=Cutover workstation migration coordination service\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=simple\n\
         ExecStart=/usr/local/bin/cutoverd run-foreground\n\
         Restart=on-failure\n\
         RestartSec=5\n\
         WorkingDirectory={state_dir}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        state_dir = config.service.state_dir.display()
    )
}

/// Create the state directory, run migrations and install the unit file
pub async fn install(config: &ServiceConfig) -> Result<(), CommandError> {
    let state_dir = &config.service.state_dir;
    std::fs::create_dir_all(state_dir).map_err(|e| {
        CommandError::Prerequisites(format!(
            "cannot create state directory {}: {e}",
            state_dir.display()
        ))
    })?;

    // Opening the pool applies every pending migration.
    DatabasePool::open(&config.db_path())
        .await
        .map_err(|e| CommandError::Failed(anyhow::anyhow!(e)))?;

    let unit = unit_path();
    std::fs::write(&unit, unit_contents(config)).map_err(|e| {
        CommandError::Prerequisites(format!("cannot write unit file {}: {e}", unit.display()))
    })?;

    info!(unit = %unit.display(), state_dir = %state_dir.display(), "Service installed");
    println!("Installed. Enable with: systemctl enable --now cutoverd");
    Ok(())
}

/// Remove the unit file and the listening socket; state is preserved
pub async fn uninstall(config: &ServiceConfig) -> Result<(), CommandError> {
    let unit = unit_path();
    if unit.exists() {
        std::fs::remove_file(&unit)
            .map_err(|e| CommandError::Failed(anyhow::anyhow!("removing unit file: {e}")))?;
        info!(unit = %unit.display(), "Unit file removed");
    }

    let socket = config.socket_path(&machine_ident(config));
    if socket.exists() {
        std::fs::remove_file(&socket)
            .map_err(|e| CommandError::Failed(anyhow::anyhow!("removing socket: {e}")))?;
        info!(socket = %socket.display(), "Stale socket removed");
    }

    println!("Uninstalled. State directory left in place.");
    Ok(())
}

/// Re-run migrations and clear anything stale left by a crash
pub async fn repair(config: &ServiceConfig) -> Result<(), CommandError> {
    if !config.service.state_dir.exists() {
        return Err(CommandError::Prerequisites(format!(
            "state directory {} does not exist; run install first",
            config.service.state_dir.display()
        )));
    }

    let pool = DatabasePool::open(&config.db_path())
        .await
        .map_err(|e| CommandError::Failed(anyhow::anyhow!(e)))?;
    let version = pool
        .schema_version()
        .await
        .map_err(|e| CommandError::Failed(anyhow::anyhow!(e)))?;

    let socket = config.socket_path(&machine_ident(config));
    if socket.exists() {
        std::fs::remove_file(&socket)
            .map_err(|e| CommandError::Failed(anyhow::anyhow!("removing stale socket: {e}")))?;
        info!(socket = %socket.display(), "Stale socket removed");
    }

    info!(schema_version = version, "Repair complete");
    println!("Repaired. Schema at version {version}.");
    Ok(())
}

/// Machine identifier: config override or autodetected
pub fn machine_ident(config: &ServiceConfig) -> String {
    config
        .service
        .machine_id
        .clone()
        .unwrap_or_else(machine::machine_ident)
}
