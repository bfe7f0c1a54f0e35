//! In-memory provisioner for tests and local development.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;

use super::{ProvisionError, StepStatus, SystemProvisioner};

/// Resource kinds, used for failure injection and creation counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionStep {
    Group,
    User,
    Membership,
    Volume,
    Role,
    Database,
    Grant,
}

#[derive(Default)]
struct State {
    groups: BTreeSet<String>,
    users: BTreeSet<String>,
    memberships: BTreeSet<(String, String)>,
    volumes: BTreeSet<PathBuf>,
    roles: BTreeSet<String>,
    databases: BTreeSet<String>,
    grants: BTreeSet<(String, String)>,
    created: HashMap<ProvisionStep, usize>,
    failures: HashSet<ProvisionStep>,
}

/// Provisioner backed by in-memory sets.
#[derive(Default)]
pub struct InMemoryProvisioner {
    state: Mutex<State>,
}

impl InMemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every operation on `step` fail until cleared.
    pub fn fail_on(&self, step: ProvisionStep) {
        self.state().failures.insert(step);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// How many times `step` actually created something.
    pub fn created(&self, step: ProvisionStep) -> usize {
        self.state().created.get(&step).copied().unwrap_or(0)
    }

    pub fn has_group(&self, group: &str) -> bool {
        self.state().groups.contains(group)
    }

    pub fn has_user(&self, user: &str) -> bool {
        self.state().users.contains(user)
    }

    pub fn is_member(&self, user: &str, group: &str) -> bool {
        self.state()
            .memberships
            .contains(&(user.to_string(), group.to_string()))
    }

    pub fn has_volume(&self, path: &Path) -> bool {
        self.state().volumes.contains(path)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.state().roles.contains(role)
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state().databases.contains(database)
    }

    fn check(state: &State, step: ProvisionStep) -> Result<(), ProvisionError> {
        if state.failures.contains(&step) {
            return Err(ProvisionError::Injected(format!(
                "in-memory provisioner configured to fail {step:?}"
            )));
        }
        Ok(())
    }

    fn ensure<T: Ord>(
        &self,
        step: ProvisionStep,
        select: impl FnOnce(&mut State) -> &mut BTreeSet<T>,
        value: T,
    ) -> Result<StepStatus, ProvisionError> {
        let mut state = self.state();
        Self::check(&state, step)?;

        if !select(&mut *state).insert(value) {
            return Ok(StepStatus::AlreadyExisted);
        }
        *state.created.entry(step).or_default() += 1;
        debug!(?step, "[FAKE] Created");
        Ok(StepStatus::Created)
    }

    fn remove<T: Ord, Q>(
        &self,
        step: ProvisionStep,
        select: impl FnOnce(&mut State) -> &mut BTreeSet<T>,
        value: &Q,
    ) -> Result<(), ProvisionError>
    where
        T: std::borrow::Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut state = self.state();
        Self::check(&state, step)?;
        select(&mut *state).remove(value);
        Ok(())
    }
}

#[async_trait]
impl SystemProvisioner for InMemoryProvisioner {
    async fn ensure_group(&self, group: &str) -> Result<StepStatus, ProvisionError> {
        self.ensure(ProvisionStep::Group, |s| &mut s.groups, group.to_string())
    }

    async fn ensure_user(&self, user: &str, group: &str) -> Result<StepStatus, ProvisionError> {
        if !self.has_group(group) {
            return Err(ProvisionError::Command {
                command: format!("useradd {user}"),
                code: Some(6),
                stderr: format!("group '{group}' does not exist"),
            });
        }
        self.ensure(ProvisionStep::User, |s| &mut s.users, user.to_string())
    }

    async fn add_to_group(&self, user: &str, group: &str) -> Result<(), ProvisionError> {
        self.ensure(
            ProvisionStep::Membership,
            |s| &mut s.memberships,
            (user.to_string(), group.to_string()),
        )
        .map(|_| ())
    }

    async fn ensure_volume(
        &self,
        path: &Path,
        _user: &str,
        _group: &str,
    ) -> Result<StepStatus, ProvisionError> {
        self.ensure(ProvisionStep::Volume, |s| &mut s.volumes, path.to_path_buf())
    }

    async fn ensure_db_role(&self, role: &str, _password: &str) -> Result<StepStatus, ProvisionError> {
        self.ensure(ProvisionStep::Role, |s| &mut s.roles, role.to_string())
    }

    async fn ensure_database(&self, database: &str, owner: &str) -> Result<StepStatus, ProvisionError> {
        if !self.has_role(owner) {
            return Err(ProvisionError::Injected(format!("role \"{owner}\" does not exist")));
        }
        self.ensure(ProvisionStep::Database, |s| &mut s.databases, database.to_string())
    }

    async fn grant_privileges(&self, database: &str, role: &str) -> Result<(), ProvisionError> {
        self.ensure(
            ProvisionStep::Grant,
            |s| &mut s.grants,
            (database.to_string(), role.to_string()),
        )
        .map(|_| ())
    }

    async fn remove_volume(&self, path: &Path) -> Result<(), ProvisionError> {
        self.remove(ProvisionStep::Volume, |s| &mut s.volumes, path)
    }

    async fn drop_database(&self, database: &str) -> Result<(), ProvisionError> {
        self.remove(ProvisionStep::Database, |s| &mut s.databases, database)?;
        self.state().grants.retain(|(db, _)| db != database);
        Ok(())
    }

    async fn drop_db_role(&self, role: &str) -> Result<(), ProvisionError> {
        self.remove(ProvisionStep::Role, |s| &mut s.roles, role)
    }

    async fn delete_user(&self, user: &str) -> Result<(), ProvisionError> {
        self.remove(ProvisionStep::User, |s| &mut s.users, user)?;
        self.state().memberships.retain(|(u, _)| u != user);
        Ok(())
    }

    async fn delete_group(&self, group: &str) -> Result<(), ProvisionError> {
        self.remove(ProvisionStep::Group, |s| &mut s.groups, group)?;
        self.state().memberships.retain(|(_, g)| g != group);
        Ok(())
    }
}
