//! Directory rules and access control.
//!
//! Every mount becomes a [`DirectoryRule`]. Rules are kept deepest prefix
//! first, so the first matching rule is the one that decides permissions.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use liveorigin_common::{Error, Result};

use crate::config::{Backend, Config, MountConfig, UserConfig};

/// Who may perform an access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// `$ALL`: anyone, no credentials needed.
    All,
    /// `$NONE`: nobody.
    Nobody,
    /// Listed users and `@groups`.
    Members(Vec<Member>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Member {
    User(String),
    Group(String),
}

impl Principal {
    pub fn parse(spec: &str) -> Self {
        match spec.trim() {
            "$ALL" => Principal::All,
            "$NONE" | "" => Principal::Nobody,
            list => Principal::Members(
                list.split(',')
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .map(|e| match e.strip_prefix('@') {
                        Some(group) => Member::Group(group.to_owned()),
                        None => Member::User(e.to_owned()),
                    })
                    .collect(),
            ),
        }
    }

    fn admits(&self, user: &str, groups: &[String]) -> bool {
        match self {
            Principal::All => true,
            Principal::Nobody => false,
            Principal::Members(members) => members.iter().any(|m| match m {
                Member::User(u) => u == user,
                Member::Group(g) => groups.iter().any(|ug| ug == g),
            }),
        }
    }
}

/// Kind of access being checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// One mount with its permissions.
#[derive(Debug, Clone)]
pub struct DirectoryRule {
    /// URL prefix, `/` or `/name`.
    pub prefix: String,
    pub root: PathBuf,
    pub backend: Backend,
    pub read: Principal,
    pub write: Principal,
}

impl DirectoryRule {
    fn from_mount(mount: &MountConfig) -> Self {
        Self {
            prefix: mount.url_prefix(),
            root: mount.path.clone(),
            backend: mount.backend,
            read: Principal::parse(&mount.read),
            write: Principal::parse(&mount.write),
        }
    }

    /// Whether the rule covers `path` (segment-wise prefix match).
    pub fn matches(&self, path: &str) -> bool {
        if self.prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Part of `path` below the rule's prefix, without a leading slash.
    pub fn relative<'a>(&self, path: &'a str) -> &'a str {
        let rest = if self.prefix == "/" {
            path
        } else {
            path.strip_prefix(self.prefix.as_str()).unwrap_or(path)
        };
        rest.trim_start_matches('/')
    }

    fn principal(&self, access: Access) -> &Principal {
        match access {
            Access::Read => &self.read,
            Access::Write => &self.write,
        }
    }
}

/// Mount table plus the user database.
#[derive(Debug)]
pub struct Acl {
    rules: Vec<DirectoryRule>,
    users: HashMap<String, UserConfig>,
    /// Passwords already checked against their bcrypt hash.
    verified: HashMap<String, String>,
}

impl Acl {
    pub fn from_config(config: &Config) -> Self {
        let mut rules: Vec<DirectoryRule> = config.mounts.iter().map(DirectoryRule::from_mount).collect();
        // Deepest prefix first; equal depths keep configuration order.
        rules.sort_by_key(|r| std::cmp::Reverse(r.prefix.len()));
        Self {
            rules,
            users: config.users.clone(),
            verified: HashMap::new(),
        }
    }

    pub fn rule(&self, index: usize) -> &DirectoryRule {
        &self.rules[index]
    }

    /// Indices of rules covering `path`, deepest first.
    pub fn matching(&self, path: &str) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.matches(path))
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of rules covering `path` that carry a write principal.
    pub fn writable(&self, path: &str) -> Vec<usize> {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| r.matches(path) && r.write != Principal::Nobody)
            .map(|(i, _)| i)
            .collect()
    }

    /// Check `access` on rule `index`.
    ///
    /// Returns the authenticated user, if any. Missing credentials on a
    /// restricted rule yield 401, wrong or insufficient ones 403.
    pub fn authorize(
        &mut self,
        index: usize,
        access: Access,
        credentials: Option<(String, String)>,
    ) -> Result<Option<String>> {
        let principal = self.rules[index].principal(access).clone();
        match principal {
            Principal::All => return Ok(credentials.map(|(user, _)| user)),
            Principal::Nobody => {
                return Err(Error::forbidden(format!(
                    "{:?} access denied on {}",
                    access, self.rules[index].prefix
                )))
            }
            Principal::Members(_) => {}
        }
        let Some((user, password)) = credentials else {
            return Err(Error::Unauthorized);
        };
        if !self.verify(&user, &password) {
            debug!(user, "invalid credentials");
            return Err(Error::forbidden(format!("invalid credentials for {user}")));
        }
        let groups = self
            .users
            .get(&user)
            .map(|u| u.groups.as_slice())
            .unwrap_or(&[]);
        if principal.admits(&user, groups) {
            Ok(Some(user))
        } else {
            Err(Error::forbidden(format!(
                "{user} may not {} {}",
                match access {
                    Access::Read => "read",
                    Access::Write => "write",
                },
                self.rules[index].prefix
            )))
        }
    }

    /// Check a user's password without any rule attached.
    pub fn authenticate(&mut self, user: &str, password: &str) -> bool {
        self.verify(user, password)
    }

    fn verify(&mut self, user: &str, password: &str) -> bool {
        if self.verified.get(user).map(String::as_str) == Some(password) {
            return true;
        }
        let Some(entry) = self.users.get(user) else {
            return false;
        };
        let ok = bcrypt::verify(password, &entry.password_hash).unwrap_or(false);
        if ok {
            self.verified.insert(user.to_owned(), password.to_owned());
        }
        ok
    }
}
