//! Path Manager: the name → [`Path`](crate::path::Path) registry, including
//! regex path-entry matching and diff-based config application.
//!
//! A `DashMap` keyed registry behind an `Arc`, handed out via a composition
//! root, generalized into a dynamically reloadable, regex-matched path table.

use std::sync::Arc;

use dashmap::DashMap;
use regex::Regex;

use crate::config::{PathConfig, PathmuxConfig};
use crate::error::{PathmuxError, PathmuxResult};
use crate::path::{Path, PathDeps};
use crate::runtime::TaskSpawner;
use crate::static_source::{StaticSourceFactory, UnconfiguredSourceFactory};

/// Matches a concrete requested path name (e.g. `"cam1"`) against a
/// configured path-table key, which is either an exact name, one of the
/// three synonymous catch-alls (`all`, `all_others`, `~^.*$`), or a
/// `~`-prefixed regular expression.
pub struct PathMatcher<'a> {
    requested: &'a str,
}

impl<'a> PathMatcher<'a> {
    pub fn new(requested: &'a str) -> Self {
        Self { requested }
    }

    /// Whether `pattern` (a path-table key) matches this matcher's
    /// requested name.
    pub fn matches_pattern(&self, pattern: &str) -> bool {
        match pattern {
            "all" | "all_others" | "~^.*$" => true,
            p if p.starts_with('~') => Regex::new(&p[1..])
                .map(|re| re.is_match(self.requested))
                .unwrap_or(false),
            p => p == self.requested,
        }
    }

    /// Whether `pattern` is one of the three mutually-aliased catch-all
    /// keys, which must only ever be consulted after every other entry has
    /// failed to match, regardless of where they sit in table order.
    pub fn is_catch_all(pattern: &str) -> bool {
        matches!(pattern, "all" | "all_others" | "~^.*$")
    }
}

/// Extracts named regex capture groups from a `~`-prefixed pattern against a
/// requested path, for `$G1`-style substitution in `source`/redirect targets
///.
pub fn capture_groups(pattern: &str, requested: &str) -> Vec<String> {
    let Some(body) = pattern.strip_prefix('~') else {
        return Vec::new();
    };
    let Ok(re) = Regex::new(body) else {
        return Vec::new();
    };
    let Some(caps) = re.captures(requested) else {
        return Vec::new();
    };
    (1..caps.len())
        .map(|i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default())
        .collect()
}

/// Outcome of matching a requested path name against the configured table:
/// which entry matched (if any), and its capture groups.
pub struct PathLookup {
    pub pattern: String,
    pub config: PathConfig,
    pub captures: Vec<String>,
}

/// Result of reconciling a new configuration against the live registry
///).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDiff {
    pub removed: Vec<String>,
    pub restarted: Vec<String>,
}

/// Owns every live [`Path`] and the current configuration snapshot used to
/// create on-demand entries. One instance lives for the process lifetime;
/// `apply_config` swaps in a new `PathmuxConfig` and reconciles the registry.
pub struct PathManager {
    paths: DashMap<String, Arc<Path>>,
    config: parking_lot::RwLock<Arc<PathmuxConfig>>,
    spawner: Arc<dyn TaskSpawner>,
    source_factory: Arc<dyn StaticSourceFactory>,
}

impl PathManager {
    /// Builds a manager with no protocol front-ends wired in: every
    /// on-demand static source fails immediately (see
    /// `UnconfiguredSourceFactory`). The server binary composition root
    /// calls `with_source_factory` instead once real adapters exist.
    pub fn new(config: PathmuxConfig, spawner: Arc<dyn TaskSpawner>) -> Arc<Self> {
        Self::with_source_factory(config, spawner, Arc::new(UnconfiguredSourceFactory))
    }

    pub fn with_source_factory(
        config: PathmuxConfig,
        spawner: Arc<dyn TaskSpawner>,
        source_factory: Arc<dyn StaticSourceFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths: DashMap::new(),
            config: parking_lot::RwLock::new(Arc::new(config)),
            spawner,
            source_factory,
        })
    }

    /// Resolves a requested path name against the configured table,
    /// returning `None` if nothing matches and `defaultAllowCreate` is
    /// unset to synthesize an ad-hoc entry.
    pub fn lookup_config(&self, requested: &str) -> Option<PathLookup> {
        let config = self.config.read().clone();
        if let Some((pattern, path_config, captures)) = Self::lookup_in(&config, requested) {
            return Some(PathLookup {
                pattern,
                config: path_config,
                captures,
            });
        }
        if config.default_allow_create {
            return Some(PathLookup {
                pattern: requested.to_string(),
                config: PathConfig::default(),
                captures: Vec::new(),
            });
        }
        None
    }

    /// Returns the `Path` for `name`, creating it on first reference if the
    /// config table (or `defaultAllowCreate`) permits it.
    pub fn get_or_create(self: &Arc<Self>, name: &str) -> PathmuxResult<Arc<Path>> {
        if let Some(existing) = self.paths.get(name) {
            return Ok(Arc::clone(&existing));
        }
        let lookup = self
            .lookup_config(name)
            .ok_or_else(|| PathmuxError::PathNotConfigured(name.to_string()))?;
        Ok(self.instantiate(name.to_string(), lookup.config, lookup.captures))
    }

    /// Eagerly instantiates every configured path whose source is a static
    /// (non-publisher, non-on-demand) pull source, so its runner starts
    /// connecting at startup instead of waiting for the first reader. Called
    /// once from `bootstrap` after the manager is built.
    pub fn start_configured_sources(self: &Arc<Self>) {
        let names: Vec<String> = self
            .config
            .read()
            .paths
            .iter()
            .filter(|(pattern, cfg)| {
                !PathMatcher::is_catch_all(pattern)
                    && cfg.source.is_on_demand_capable()
                    && !cfg.source_on_demand
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.get_or_create(&name) {
                log::warn!("[PathManager] could not start configured source {name}: {e}");
            }
        }
    }

    /// Returns the already-created `Path` for `name`, if one exists, without
    /// creating it.
    pub fn find(&self, name: &str) -> Option<Arc<Path>> {
        self.paths.get(name).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<Arc<Path>> {
        self.paths.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn current_config(&self) -> Arc<PathmuxConfig> {
        self.config.read().clone()
    }

    /// Reconciles the live registry against a newly loaded configuration:
    /// paths removed from the table are torn down and dropped; paths whose
    /// source or recording settings changed are torn down and rebuilt on
    /// next reference; paths whose only difference is hooks (or any other
    /// non-restart-worthy field) are reloaded in place via
    /// `Path::apply_config`; paths newly added to the table are eagerly
    /// instantiated if their source is a static (non-publisher) one,
    /// mirroring what `bootstrap` does on first startup.
    pub fn apply_config(self: &Arc<Self>, new_config: PathmuxConfig) -> ConfigDiff {
        let old_config = self.config.read().clone();
        let mut removed = Vec::new();
        let mut restarted = Vec::new();
        let mut reloaded = Vec::new();

        for entry in self.paths.iter() {
            let name = entry.key().clone();
            let old_lookup = Self::lookup_in(&old_config, &name);
            let new_lookup = Self::lookup_in(&new_config, &name);
            match (old_lookup, new_lookup) {
                (_, None) => removed.push(name),
                (Some((_, old, _)), Some((_, new, _))) if old != new => {
                    if Self::needs_restart(&old, &new) {
                        restarted.push(name);
                    } else {
                        reloaded.push(name);
                    }
                }
                _ => {}
            }
        }

        for name in &removed {
            if let Some((_, path)) = self.paths.remove(name) {
                path.shutdown();
            }
        }
        for name in &restarted {
            if let Some((_, path)) = self.paths.remove(name) {
                path.shutdown();
            }
        }
        for name in &reloaded {
            if let Some(path) = self.paths.get(name) {
                if let Some((_, config, captures)) = Self::lookup_in(&new_config, name) {
                    path.apply_config(config, captures);
                }
            }
        }

        *self.config.write() = Arc::new(new_config);
        log::info!(
            "[PathManager] config applied: {} removed, {} restarted, {} reloaded in place",
            removed.len(),
            restarted.len(),
            reloaded.len()
        );

        // Newly-added (and just-restarted) static sources get going right
        // away rather than waiting for a first reader, same as at boot.
        self.start_configured_sources();

        ConfigDiff { removed, restarted }
    }

    /// Whether `old` -> `new` differs enough to require tearing the path
    /// down and rebuilding it from scratch, versus reloading the running
    /// actor's config in place. Source identity/kind and recording settings
    /// are load-bearing for the running static-source task and the stream's
    /// wiring; everything else (hooks, fallback, override policy, SRT
    /// passphrases, recent-units window) can change under a live path.
    fn needs_restart(old: &PathConfig, new: &PathConfig) -> bool {
        old.source != new.source
            || old.source_on_demand != new.source_on_demand
            || old.recording != new.recording
    }

    /// Builds and registers a `Path` without requiring a caller to already
    /// hold a reference to it, used both by `get_or_create` and by
    /// `apply_config`'s eager instantiation of newly-added static sources.
    fn instantiate(self: &Arc<Self>, name: String, config: PathConfig, captures: Vec<String>) -> Arc<Path> {
        let queue_capacity = self.config.read().write_queue_size;
        let path = Path::new(
            name.clone(),
            config,
            captures,
            PathDeps {
                manager: Arc::downgrade(self),
                spawner: Arc::clone(&self.spawner),
                queue_capacity,
                source_factory: Arc::clone(&self.source_factory),
            },
        );
        self.paths.entry(name).or_insert_with(|| path).clone()
    }

    /// Resolves `requested` against `config`'s path table: exact match
    /// first, then non-catch-all regex entries in table order, then the
    /// catch-all aliases (`all`/`all_others`/`~^.*$`) last regardless of
    /// where they sit in the table, so a catch-all entry declared before a
    /// more specific one never shadows it.
    fn lookup_in(config: &PathmuxConfig, requested: &str) -> Option<(String, PathConfig, Vec<String>)> {
        if let Some(exact) = config.paths.get(requested) {
            return Some((requested.to_string(), exact.clone(), Vec::new()));
        }
        let matcher = PathMatcher::new(requested);
        for (pattern, path_config) in &config.paths {
            if pattern == requested || PathMatcher::is_catch_all(pattern) {
                continue;
            }
            if matcher.matches_pattern(pattern) {
                return Some((
                    pattern.clone(),
                    path_config.clone(),
                    capture_groups(pattern, requested),
                ));
            }
        }
        config
            .paths
            .iter()
            .find(|(pattern, _)| PathMatcher::is_catch_all(pattern))
            .map(|(pattern, cfg)| (pattern.clone(), cfg.clone(), Vec::new()))
    }

    /// Describes every live path for the management API.
    pub fn describe_all(&self) -> Vec<crate::path::PathDescription> {
        self.paths.iter().map(|e| e.value().describe()).collect()
    }
}
