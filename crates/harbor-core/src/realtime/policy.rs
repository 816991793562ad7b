//! Channel access policies.

use super::rate_limit::RateLimitConfig;
use crate::error::{CoreError, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

/// Gateway header carrying the caller's id.
pub const USER_HEADER: &str = "x-harbor-user";

/// Gateway header carrying `project:role` pairs.
pub const ROLES_HEADER: &str = "x-harbor-roles";

/// Role a subject holds within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Owner,
    Editor,
    Viewer,
    /// Machine identity (bootstrap agents, background workers).
    Service,
}

impl FromStr for Role {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "owner" => Ok(Role::Owner),
            "editor" => Ok(Role::Editor),
            "viewer" => Ok(Role::Viewer),
            "service" => Ok(Role::Service),
            other => Err(CoreError::Validation(format!("unknown role: {other}"))),
        }
    }
}

/// Who is subscribing or publishing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subject {
    pub id: String,
    pub authenticated: bool,
    pub project_roles: HashMap<String, Role>,
    /// Internal callers; bypass role checks but not subscriber caps.
    pub system: bool,
    /// Channels this subject may subscribe to regardless of its roles,
    /// issued after a resource-level check such as session ownership.
    pub grants: HashSet<String>,
}

impl Subject {
    /// Unauthenticated caller.
    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            ..Self::default()
        }
    }

    /// Authenticated user without project roles.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: true,
            ..Self::default()
        }
    }

    /// Internal identity used by the server itself.
    pub fn system(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            authenticated: true,
            system: true,
            ..Self::default()
        }
    }

    /// Let this subject subscribe to `channel` without a matching role.
    pub fn with_grant(mut self, channel: impl Into<String>) -> Self {
        self.grants.insert(channel.into());
        self
    }

    pub fn with_role(mut self, project_id: impl Into<String>, role: Role) -> Self {
        self.project_roles.insert(project_id.into(), role);
        self
    }

    /// Parse roles in the form `project:role,project:role`.
    pub fn with_roles_header(mut self, header: &str) -> Result<Self> {
        for pair in header.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (project, role) = pair
                .rsplit_once(':')
                .ok_or_else(|| CoreError::Validation(format!("malformed role entry: {pair}")))?;
            self.project_roles
                .insert(project.trim().to_string(), role.parse()?);
        }
        Ok(self)
    }

    fn role_in(&self, project_id: &str) -> Option<Role> {
        self.project_roles.get(project_id).copied()
    }
}

/// Operation being authorised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Subscribe,
    Publish,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Subscribe => f.write_str("subscribe"),
            Access::Publish => f.write_str("publish"),
        }
    }
}

/// Authorization and quota rule for channels matching `pattern`.
///
/// Patterns are `:`-separated; `*` matches exactly one non-empty segment.
/// For project-scoped policies the first `*` captures the project id.
#[derive(Debug, Clone)]
pub struct ChannelAccessPolicy {
    pub pattern: String,
    pub require_auth: bool,
    pub project_scoped: bool,
    /// Roles allowed to subscribe; empty admits any subject passing the
    /// auth check.
    pub subscribe_roles: Vec<Role>,
    /// Roles allowed to publish; empty admits any subject passing the
    /// auth check.
    pub publish_roles: Vec<Role>,
    pub max_subscribers: Option<usize>,
    /// Publish budget per `(channel, key)`.
    pub rate: RateLimitConfig,
}

impl ChannelAccessPolicy {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            require_auth: true,
            project_scoped: false,
            subscribe_roles: Vec::new(),
            publish_roles: Vec::new(),
            max_subscribers: None,
            rate: RateLimitConfig::default(),
        }
    }

    pub fn project_scoped(mut self) -> Self {
        self.project_scoped = true;
        self
    }

    pub fn public(mut self) -> Self {
        self.require_auth = false;
        self
    }

    pub fn subscribe_roles(mut self, roles: &[Role]) -> Self {
        self.subscribe_roles = roles.to_vec();
        self
    }

    pub fn publish_roles(mut self, roles: &[Role]) -> Self {
        self.publish_roles = roles.to_vec();
        self
    }

    pub fn max_subscribers(mut self, max: usize) -> Self {
        self.max_subscribers = Some(max);
        self
    }

    pub fn rate(mut self, rate: RateLimitConfig) -> Self {
        self.rate = rate;
        self
    }

    /// Wildcard captures if `channel` matches.
    pub fn captures<'a>(&self, channel: &'a str) -> Option<Vec<&'a str>> {
        let mut pattern = self.pattern.split(':');
        let mut segments = channel.split(':');
        let mut captures = Vec::new();
        loop {
            match (pattern.next(), segments.next()) {
                (None, None) => return Some(captures),
                (Some("*"), Some(seg)) if !seg.is_empty() => captures.push(seg),
                (Some(p), Some(seg)) if p == seg => {}
                _ => return None,
            }
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        self.captures(channel).is_some()
    }

    fn check(&self, channel: &str, subject: &Subject, access: Access, subscribers: usize) -> Result<()> {
        if self.require_auth && !subject.authenticated {
            return Err(CoreError::AccessDenied(format!(
                "{access} on {channel} requires authentication"
            )));
        }

        if access == Access::Subscribe {
            if let Some(max) = self.max_subscribers {
                if subscribers >= max {
                    return Err(CoreError::AccessDenied(format!(
                        "{channel} is at its subscriber limit ({max})"
                    )));
                }
            }
        }

        let roles = match access {
            Access::Subscribe => &self.subscribe_roles,
            Access::Publish => &self.publish_roles,
        };
        let granted = access == Access::Subscribe && subject.grants.contains(channel);
        if subject.system || roles.is_empty() || granted {
            return Ok(());
        }

        let allowed = if self.project_scoped {
            self.captures(channel)
                .and_then(|caps| caps.first().copied())
                .and_then(|project| subject.role_in(project))
                .is_some_and(|role| roles.contains(&role))
        } else {
            subject.project_roles.values().any(|r| roles.contains(r))
        };

        if allowed {
            Ok(())
        } else {
            Err(CoreError::AccessDenied(format!(
                "{} may not {access} on {channel}",
                subject.id
            )))
        }
    }
}

/// Ordered policy list; first matching pattern wins, unknown channels are
/// denied.
#[derive(Debug, Clone)]
pub struct AccessPolicySet {
    policies: Vec<ChannelAccessPolicy>,
}

impl AccessPolicySet {
    pub fn new(policies: Vec<ChannelAccessPolicy>) -> Self {
        Self { policies }
    }

    /// Policy governing `channel`.
    pub fn find(&self, channel: &str) -> Option<&ChannelAccessPolicy> {
        self.policies.iter().find(|p| p.matches(channel))
    }

    /// Authorise `access` on `channel`; `subscribers` is the channel's
    /// current subscriber count.
    pub fn evaluate(
        &self,
        channel: &str,
        subject: &Subject,
        access: Access,
        subscribers: usize,
    ) -> Result<&ChannelAccessPolicy> {
        let policy = self
            .find(channel)
            .ok_or_else(|| CoreError::AccessDenied(format!("no policy for channel {channel}")))?;
        policy.check(channel, subject, access, subscribers)?;
        Ok(policy)
    }

    pub fn check_access(&self, channel: &str, subject: &Subject, access: Access, subscribers: usize) -> bool {
        self.evaluate(channel, subject, access, subscribers).is_ok()
    }
}

impl Default for AccessPolicySet {
    fn default() -> Self {
        use Role::*;
        Self::new(vec![
            ChannelAccessPolicy::new("project:*:files")
                .project_scoped()
                .subscribe_roles(&[Owner, Editor, Viewer, Service])
                .publish_roles(&[Owner, Editor, Service])
                .max_subscribers(100),
            ChannelAccessPolicy::new("project:*:reload")
                .project_scoped()
                .subscribe_roles(&[Owner, Editor, Viewer, Service])
                .publish_roles(&[Owner, Editor, Service])
                .max_subscribers(100),
            // Session owners subscribe through a grant issued by the API.
            ChannelAccessPolicy::new("session:*")
                .subscribe_roles(&[Service])
                .publish_roles(&[Service])
                .max_subscribers(20),
            ChannelAccessPolicy::new("presence:*")
                .project_scoped()
                .subscribe_roles(&[Owner, Editor, Viewer])
                .publish_roles(&[Owner, Editor, Viewer])
                .max_subscribers(200)
                .rate(RateLimitConfig::per_second(5)),
        ])
    }
}
