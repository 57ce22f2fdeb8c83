//! The logical project that owns an ordered set of upstreams.

use {
    bundler_config::{BundlerConfig, TransportKind, UpstreamEntry},
    bundler_mcp::{ConnectionParams, UpstreamDescriptor},
    chrono::{DateTime, Utc},
};

use crate::error::{Error, Result};

/// Lowercase, ASCII alphanumerics kept, runs of anything else collapsed to `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug = slug.trim_end_matches('-');
    if slug.is_empty() {
        "project".to_string()
    } else {
        slug.to_string()
    }
}

pub fn descriptor_from_entry(entry: &UpstreamEntry) -> UpstreamDescriptor {
    let connection = match entry.transport {
        TransportKind::Stdio => ConnectionParams::Local {
            command: entry.command.clone(),
            args: entry.args.clone(),
            cwd: entry.cwd.clone(),
            env: entry.env.clone(),
        },
        TransportKind::Http => ConnectionParams::Remote {
            url: entry.url.clone().unwrap_or_default(),
            headers: entry.headers.clone(),
        },
    };
    UpstreamDescriptor {
        alias: entry.alias.trim().to_string(),
        connection,
        include_tools: entry.include_tools.clone(),
        keep_warm: entry.keep_warm,
        requires_auth: entry.auth,
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub slug: String,
    /// Registration order.
    pub upstreams: Vec<UpstreamDescriptor>,
    /// Bumped by every successful snapshot rebuild.
    pub revision: u64,
    pub last_mutated: DateTime<Utc>,
}

impl Project {
    pub fn new(name: &str, upstreams: Vec<UpstreamDescriptor>) -> Self {
        Self {
            slug: slugify(name),
            upstreams,
            revision: 0,
            last_mutated: Utc::now(),
        }
    }

    /// Enabled upstreams from the config, in file order.
    ///
    /// `last_mutated` should be when the config last changed, so a persisted
    /// snapshot built after that point is still served.
    pub fn from_config(config: &BundlerConfig, last_mutated: DateTime<Utc>) -> Self {
        let upstreams = config
            .project
            .upstreams
            .iter()
            .filter(|e| e.enabled)
            .map(descriptor_from_entry)
            .collect();
        Self {
            last_mutated,
            ..Self::new(&config.project.name, upstreams)
        }
    }

    pub fn upstream(&self, alias: &str) -> Option<&UpstreamDescriptor> {
        self.upstreams.iter().find(|u| u.alias == alias)
    }

    pub fn touch(&mut self) {
        self.last_mutated = Utc::now();
    }

    pub fn add_upstream(&mut self, descriptor: UpstreamDescriptor) -> Result<()> {
        if self.upstream(&descriptor.alias).is_some() {
            return Err(Error::DuplicateAlias {
                alias: descriptor.alias,
            });
        }
        self.upstreams.push(descriptor);
        self.touch();
        Ok(())
    }

    /// Replace in place, keeping the registration position.
    pub fn update_upstream(&mut self, descriptor: UpstreamDescriptor) -> Result<()> {
        let slot = self
            .upstreams
            .iter_mut()
            .find(|u| u.alias == descriptor.alias)
            .ok_or_else(|| Error::UnknownAlias {
                alias: descriptor.alias.clone(),
            })?;
        *slot = descriptor;
        self.touch();
        Ok(())
    }

    pub fn remove_upstream(&mut self, alias: &str) -> Result<UpstreamDescriptor> {
        let idx = self
            .upstreams
            .iter()
            .position(|u| u.alias == alias)
            .ok_or_else(|| Error::UnknownAlias {
                alias: alias.to_string(),
            })?;
        let removed = self.upstreams.remove(idx);
        self.touch();
        Ok(removed)
    }
}
