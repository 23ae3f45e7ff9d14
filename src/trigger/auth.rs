/// Authorization seam for manual runs
///
/// Identity and sessions live outside this service; the dispatcher only asks
/// whether a principal may run a workflow.

use crate::workflow::types::Workflow;
use async_trait::async_trait;
use std::collections::HashSet;

/// Caller identity as resolved by the surrounding platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Option<String>,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
        }
    }
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn can_run(&self, principal: &Principal, workflow: &Workflow) -> bool;
}

/// Default for single-tenant deployments
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn can_run(&self, _principal: &Principal, _workflow: &Workflow) -> bool {
        true
    }
}

/// Only the listed user ids may start manual runs
#[derive(Debug, Default, Clone)]
pub struct UserAllowList {
    users: HashSet<String>,
}

impl UserAllowList {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Authorizer for UserAllowList {
    async fn can_run(&self, principal: &Principal, _workflow: &Workflow) -> bool {
        principal
            .user_id
            .as_ref()
            .map(|id| self.users.contains(id))
            .unwrap_or(false)
    }
}
