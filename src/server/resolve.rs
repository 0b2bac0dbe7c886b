//! Mapping request paths to resources.
//!
//! Reads try live producers first (unless static mode is on), then the
//! mounts covering the path, deepest first. Permissions always come from the
//! deepest matching rule.

use std::fs;
use std::path::PathBuf;

use tracing::trace;

use liveorigin_common::paths::sanitize_url_path;
use liveorigin_common::{Error, Result};
use liveorigin_http::ListingEntry;

use super::acl::Access;
use super::Engine;
use crate::config::Backend;
use crate::live::{LiveResource, ResourceLocation};

/// What a read request resolved to.
#[derive(Debug)]
pub(crate) enum Resolved {
    /// Resource a producer is still writing.
    Live(LiveResource),
    /// Regular file in a disk mount.
    File { path: PathBuf, metadata: fs::Metadata },
    /// Finished node of a memory mount.
    Memory { key: String },
    /// Directory, listed if enabled.
    Directory { entries: Vec<ListingEntry> },
}

#[derive(Debug)]
pub(crate) struct Resolution {
    pub resource: Resolved,
    pub user: Option<String>,
}

/// Destination of a write request.
#[derive(Debug)]
pub(crate) struct WriteTarget {
    pub location: ResourceLocation,
    pub existed: bool,
    pub user: Option<String>,
}

type Credentials = Option<(String, String)>;

impl Engine {
    pub(crate) fn resolve_read(&mut self, path: &str, credentials: Credentials) -> Result<Resolution> {
        let rules = self.acl.matching(path);
        let user = match rules.first() {
            Some(&deepest) => self.acl.authorize(deepest, Access::Read, credentials)?,
            None => None,
        };

        if !self.config.server.static_mode {
            if let Some(live) = self.producers.lookup(path) {
                trace!(path, producer = %live.producer, "resolved to live resource");
                return Ok(Resolution {
                    resource: Resolved::Live(live),
                    user,
                });
            }
        }

        for idx in rules {
            let rule = self.acl.rule(idx);
            let resource = match rule.backend {
                Backend::Disk => {
                    let rel = sanitize_url_path(rule.relative(path))
                        .ok_or_else(|| Error::forbidden(format!("{path} escapes its mount")))?;
                    let full = rule.root.join(rel);
                    match fs::metadata(&full) {
                        Ok(meta) if meta.is_file() => Resolved::File {
                            path: full,
                            metadata: meta,
                        },
                        Ok(meta) if meta.is_dir() => Resolved::Directory {
                            entries: disk_listing(&full)?,
                        },
                        _ => continue,
                    }
                }
                Backend::Memory => {
                    let key = path.trim_end_matches('/');
                    if self.store.contains(key) {
                        Resolved::Memory { key: key.to_owned() }
                    } else {
                        let entries = memory_listing(&self.store.names_under(&format!("{key}/")), key, &self.store);
                        if entries.is_empty() && key != rule.prefix.trim_end_matches('/') {
                            continue;
                        }
                        Resolved::Directory { entries }
                    }
                }
            };
            trace!(path, prefix = %rule.prefix, "resolved in mount");
            return Ok(Resolution { resource, user });
        }
        Err(Error::not_found(path))
    }

    /// Resolve the destination of a PUT, POST or DELETE.
    pub(crate) fn resolve_write(&mut self, path: &str, credentials: Credentials) -> Result<WriteTarget> {
        let rules = self.acl.writable(path);
        let Some(&idx) = rules.first() else {
            return Err(Error::forbidden(format!("no writable mount for {path}")));
        };
        let user = self.acl.authorize(idx, Access::Write, credentials)?;
        let location = self.location_in(idx, path)?;
        let existed = match &location {
            ResourceLocation::Disk(full) => {
                if full.is_dir() {
                    return Err(Error::MethodNotAllowed(format!("{path} is a directory")));
                }
                full.is_file()
            }
            ResourceLocation::Memory(key) => self.store.contains(key),
        };
        Ok(WriteTarget {
            location,
            existed,
            user,
        })
    }

    /// Storage location of `path` under the deepest writable mount, without
    /// any credential check.
    pub(crate) fn location_for(&self, path: &str) -> Result<ResourceLocation> {
        let idx = *self
            .acl
            .writable(path)
            .first()
            .ok_or_else(|| Error::not_found(format!("no writable mount for {path}")))?;
        self.location_in(idx, path)
    }

    fn location_in(&self, idx: usize, path: &str) -> Result<ResourceLocation> {
        let rule = self.acl.rule(idx);
        match rule.backend {
            Backend::Disk => {
                let rel = sanitize_url_path(rule.relative(path))
                    .filter(|rel| rel.components().next().is_some())
                    .ok_or_else(|| Error::forbidden(format!("invalid write target {path}")))?;
                Ok(ResourceLocation::Disk(rule.root.join(rel)))
            }
            Backend::Memory => Ok(ResourceLocation::Memory(path.trim_end_matches('/').to_owned())),
        }
    }
}

fn disk_listing(dir: &std::path::Path) -> Result<Vec<ListingEntry>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        entries.push(ListingEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    Ok(entries)
}

/// Immediate children of `dir` among memory node names.
fn memory_listing(names: &[String], dir: &str, store: &liveorigin_vfs::MemStore) -> Vec<ListingEntry> {
    let mut entries: Vec<ListingEntry> = Vec::new();
    for name in names {
        let rest = &name[dir.len() + 1..];
        match rest.split_once('/') {
            Some((sub, _)) => {
                if !entries.iter().any(|e| e.is_dir && e.name == sub) {
                    entries.push(ListingEntry {
                        name: sub.to_owned(),
                        is_dir: true,
                        size: 0,
                    });
                }
            }
            None => entries.push(ListingEntry {
                name: rest.to_owned(),
                is_dir: false,
                size: store.stat(name).map(|i| i.size).unwrap_or(0),
            }),
        }
    }
    entries
}
