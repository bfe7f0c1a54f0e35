//! Host provisioner: OS accounts via shadow-utils, volume directories on the
//! local filesystem, database objects through an admin connection.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::{chown, Group, User};
use sqlx::postgres::PgPool;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{quote_ident, ProvisionError, StepStatus, SystemProvisioner};

/// `groupadd`/`useradd`: the name is already in use.
const EXIT_ALREADY_EXISTS: i32 = 9;

/// `userdel`/`groupdel`: the name does not exist.
const EXIT_NOT_FOUND: i32 = 6;

/// SQLSTATE `duplicate_object`.
const DUPLICATE_OBJECT: &str = "42710";

/// SQLSTATE `duplicate_database`.
const DUPLICATE_DATABASE: &str = "42P04";

const VOLUME_MODE: u32 = 0o770;

/// Provisioner acting on the local host and the platform database server.
pub struct HostProvisioner {
    admin: PgPool,
    timeout: Duration,
}

impl HostProvisioner {
    /// `admin` must be allowed to create roles and databases. Every command
    /// and statement is bounded by `timeout`.
    pub fn new(admin: PgPool, timeout: Duration) -> Self {
        Self { admin, timeout }
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<Output, ProvisionError> {
        debug!(program, ?args, "Running command");
        let output = Command::new(program).args(args).kill_on_drop(true).output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(result) => result.map_err(|source| ProvisionError::Spawn {
                command: program.to_string(),
                source,
            }),
            Err(_) => {
                warn!(program, timeout_ms = self.timeout.as_millis() as u64, "Command timed out, killed");
                Err(ProvisionError::Timeout {
                    operation: program.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn execute_ddl(&self, sql: &str) -> Result<(), ProvisionError> {
        match tokio::time::timeout(self.timeout, sqlx::query(sql).execute(&self.admin)).await {
            Ok(result) => result.map(|_| ()).map_err(ProvisionError::Database),
            Err(_) => Err(ProvisionError::Timeout {
                operation: "database statement".to_string(),
                timeout: self.timeout,
            }),
        }
    }
}

/// Interpret a command's exit: success, or the code meaning "nothing to do".
fn exit_status(
    command: &str,
    output: &Output,
    benign_code: i32,
) -> Result<StepStatus, ProvisionError> {
    match output.status.code() {
        Some(0) => Ok(StepStatus::Created),
        Some(code) if code == benign_code => Ok(StepStatus::AlreadyExisted),
        code => Err(ProvisionError::Command {
            command: command.to_string(),
            code,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }),
    }
}

fn sql_state(e: &ProvisionError) -> Option<String> {
    match e {
        ProvisionError::Database(sqlx::Error::Database(db)) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[async_trait]
impl SystemProvisioner for HostProvisioner {
    async fn ensure_group(&self, group: &str) -> Result<StepStatus, ProvisionError> {
        let output = self.run("groupadd", &[group]).await?;
        exit_status("groupadd", &output, EXIT_ALREADY_EXISTS)
    }

    async fn ensure_user(&self, user: &str, group: &str) -> Result<StepStatus, ProvisionError> {
        let output = self
            .run(
                "useradd",
                &[
                    "--system",
                    "--no-create-home",
                    "--shell",
                    "/usr/sbin/nologin",
                    "--gid",
                    group,
                    user,
                ],
            )
            .await?;
        exit_status("useradd", &output, EXIT_ALREADY_EXISTS)
    }

    async fn add_to_group(&self, user: &str, group: &str) -> Result<(), ProvisionError> {
        let output = self.run("usermod", &["--append", "--groups", group, user]).await?;
        exit_status("usermod", &output, 0).map(|_| ())
    }

    async fn ensure_volume(
        &self,
        path: &Path,
        user: &str,
        group: &str,
    ) -> Result<StepStatus, ProvisionError> {
        let io_err = |source| ProvisionError::Io {
            path: path.to_path_buf(),
            source,
        };

        let status = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => StepStatus::AlreadyExisted,
            Ok(_) => {
                return Err(ProvisionError::Io {
                    path: path.to_path_buf(),
                    source: std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "exists and is not a directory",
                    ),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(path).await.map_err(io_err)?;
                StepStatus::Created
            }
            Err(e) => return Err(io_err(e)),
        };

        // Ownership and mode are re-applied on every pass.
        let ownership = |message: String| ProvisionError::Ownership {
            path: path.to_path_buf(),
            message,
        };
        let uid = User::from_name(user)
            .map_err(|e| ownership(e.to_string()))?
            .ok_or_else(|| ownership(format!("unknown user {user}")))?
            .uid;
        let gid = Group::from_name(group)
            .map_err(|e| ownership(e.to_string()))?
            .ok_or_else(|| ownership(format!("unknown group {group}")))?
            .gid;
        chown(path, Some(uid), Some(gid)).map_err(|e| ownership(e.to_string()))?;

        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(VOLUME_MODE))
            .await
            .map_err(io_err)?;

        Ok(status)
    }

    async fn ensure_db_role(&self, role: &str, password: &str) -> Result<StepStatus, ProvisionError> {
        let ident = quote_ident(role)?;
        let create = format!(
            "CREATE ROLE {ident} WITH LOGIN PASSWORD {}",
            quote_literal(password)
        );

        match self.execute_ddl(&create).await {
            Ok(()) => Ok(StepStatus::Created),
            Err(e) if sql_state(&e).as_deref() == Some(DUPLICATE_OBJECT) => {
                // Keep the derived password authoritative.
                let alter = format!(
                    "ALTER ROLE {ident} WITH LOGIN PASSWORD {}",
                    quote_literal(password)
                );
                self.execute_ddl(&alter).await?;
                Ok(StepStatus::AlreadyExisted)
            }
            Err(e) => Err(e),
        }
    }

    async fn ensure_database(&self, database: &str, owner: &str) -> Result<StepStatus, ProvisionError> {
        let sql = format!(
            "CREATE DATABASE {} OWNER {}",
            quote_ident(database)?,
            quote_ident(owner)?
        );

        match self.execute_ddl(&sql).await {
            Ok(()) => Ok(StepStatus::Created),
            Err(e) if sql_state(&e).as_deref() == Some(DUPLICATE_DATABASE) => {
                Ok(StepStatus::AlreadyExisted)
            }
            Err(e) => Err(e),
        }
    }

    async fn grant_privileges(&self, database: &str, role: &str) -> Result<(), ProvisionError> {
        let sql = format!(
            "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
            quote_ident(database)?,
            quote_ident(role)?
        );
        self.execute_ddl(&sql).await
    }

    async fn remove_volume(&self, path: &Path) -> Result<(), ProvisionError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {
                info!(path = %path.display(), "Removed volume directory");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ProvisionError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    async fn drop_database(&self, database: &str) -> Result<(), ProvisionError> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_ident(database)?);
        self.execute_ddl(&sql).await
    }

    async fn drop_db_role(&self, role: &str) -> Result<(), ProvisionError> {
        let sql = format!("DROP ROLE IF EXISTS {}", quote_ident(role)?);
        self.execute_ddl(&sql).await
    }

    async fn delete_user(&self, user: &str) -> Result<(), ProvisionError> {
        let output = self.run("userdel", &[user]).await?;
        exit_status("userdel", &output, EXIT_NOT_FOUND).map(|_| ())
    }

    async fn delete_group(&self, group: &str) -> Result<(), ProvisionError> {
        let output = self.run("groupdel", &[group]).await?;
        exit_status("groupdel", &output, EXIT_NOT_FOUND).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    fn provisioner() -> HostProvisioner {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        HostProvisioner::new(pool, Duration::from_millis(200))
    }

    #[test]
    fn test_exit_status() {
        assert_eq!(
            exit_status("groupadd", &output(0, ""), EXIT_ALREADY_EXISTS).unwrap(),
            StepStatus::Created
        );
        assert_eq!(
            exit_status("groupadd", &output(9, "exists"), EXIT_ALREADY_EXISTS).unwrap(),
            StepStatus::AlreadyExisted
        );

        match exit_status("useradd", &output(1, "permission denied\n"), EXIT_ALREADY_EXISTS) {
            Err(ProvisionError::Command { code, stderr, .. }) => {
                assert_eq!(code, Some(1));
                assert_eq!(stderr, "permission denied");
            }
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_hung_command_times_out() {
        let started = std::time::Instant::now();
        let result = provisioner().run("sleep", &["5"]).await;

        match result {
            Err(ProvisionError::Timeout { operation, timeout }) => {
                assert_eq!(operation, "sleep");
                assert_eq!(timeout, Duration::from_millis(200));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_quote_literal() {
        assert_eq!(quote_literal("abc"), "'abc'");
        assert_eq!(quote_literal("a'b"), "'a''b'");
    }

    #[tokio::test]
    async fn test_remove_missing_volume_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = provisioner();

        let target = dir.path().join("1a2b3c4d");
        assert!(provisioner.remove_volume(&target).await.is_ok());

        tokio::fs::create_dir_all(target.join("uploads")).await.unwrap();
        provisioner.remove_volume(&target).await.unwrap();
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn test_volume_over_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("1a2b3c4d");
        tokio::fs::write(&target, b"not a dir").await.unwrap();

        let result = provisioner().ensure_volume(&target, "nobody", "nogroup").await;
        assert!(matches!(result, Err(ProvisionError::Io { .. })));
    }
}
