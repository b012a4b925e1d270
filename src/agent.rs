//! Agent mode implementation
//!
//! Runs the reconciliation loop: every `wait_time` seconds the agent reloads
//! its configuration and declarations, refreshes discovery, renders each
//! declaration's artifacts and applies the ones whose content changed.

use crate::config::{AgentSettings, AppDeclaration, Config, ConfigSource, ENV_MARATHON_APP_ID};
use crate::discovery::{marathon_api, Discovery};
use crate::error::SurokError;
use crate::store::{Artifact, Store, StoreRecord};
use crate::templating::{self, Renderer};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tokio::time::{interval_at, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// What happened to one declaration during a cycle
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppOutcome {
    /// Artifacts (destination paths or variable names) rewritten this cycle
    pub changed: Vec<String>,
    /// Some artifact failed to render or write
    pub failed: bool,
    pub reloaded: bool,
}

/// Summary of one reconciliation cycle
#[derive(Debug, Default)]
pub struct CycleReport {
    pub apps: BTreeMap<String, AppOutcome>,
    pub swept: Vec<StoreRecord>,
    pub duration: Duration,
}

pub struct Agent {
    config: Config,
    sources: Vec<ConfigSource>,
    discovery: Discovery,
    store: Store,
    renderer: Renderer,
    client: reqwest::Client,
    cycle_count: u64,
}

impl Agent {
    /// `sources` are re-applied at the start of every cycle
    pub fn new(
        config: Config,
        sources: Vec<ConfigSource>,
        discovery: Discovery,
        store: Store,
    ) -> Result<Self> {
        Ok(Self {
            config,
            sources,
            discovery,
            store,
            renderer: Renderer::new(),
            client: marathon_api::http_client()?,
            cycle_count: 0,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    /// Run cycles until interrupted, or a single cycle when `once` is set
    pub async fn run(&mut self, once: bool) -> Result<()> {
        info!("Starting surok agent");
        if once {
            self.run_cycle().await;
            return Ok(());
        }

        let mut period = self.wait_time();
        let mut ticker = interval_at(tokio::time::Instant::now(), period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_cycle().await;
                    let next = self.wait_time();
                    if next != period {
                        info!("Cycle interval changed to {}s", next.as_secs());
                        period = next;
                        ticker = interval_at(tokio::time::Instant::now() + period, period);
                        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    }
                }

                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        Ok(())
    }

    fn wait_time(&self) -> Duration {
        Duration::from_secs(self.config.settings().wait_time.max(1))
    }

    /// One full reconciliation pass
    #[instrument(skip(self))]
    pub async fn run_cycle(&mut self) -> CycleReport {
        let start = Instant::now();
        self.cycle_count += 1;
        self.reload_config();

        let apps = self.discovery.refresh_all(&self.config).await;
        let settings = self.config.settings().clone();

        let cache_hosts = if settings.memcached.enabled
            && settings.memcached.configured_hosts().is_empty()
        {
            self.discovery.cache_hosts(&settings).await
        } else {
            Vec::new()
        };
        self.store.check(&settings, &cache_hosts).await;

        let mut report = CycleReport::default();
        for (name, app) in &apps {
            let outcome = self.reconcile_app(&settings, app).await;
            report.apps.insert(name.clone(), outcome);
        }

        report.swept = self.store.clear().await;
        for record in &report.swept {
            undo_artifact(record);
        }

        report.duration = start.elapsed();
        debug!(
            "Cycle {} finished in {:?}: {} declarations, {} swept",
            self.cycle_count,
            report.duration,
            report.apps.len(),
            report.swept.len()
        );
        report
    }

    fn reload_config(&mut self) {
        let before = self.config.hash();
        for source in &self.sources {
            self.config.apply(source);
        }
        if self.config.hash() != before {
            info!("Configuration changed");
            debug!("Conf={}", self.config.dump());
        }
    }

    #[instrument(skip_all, fields(app = %app.conf_name))]
    async fn reconcile_app(&mut self, settings: &AgentSettings, app: &AppDeclaration) -> AppOutcome {
        let services = self.discovery.resolve(settings, app).await;
        let my = templating::build_context(services, &app.conf_name);
        let mut outcome = AppOutcome::default();

        for (name, source) in &app.environments {
            let value = match self.renderer.render(name, source, &my) {
                Ok(value) => value,
                Err(e) => {
                    error!("{}", e);
                    outcome.failed = true;
                    let withheld = Artifact::Env {
                        name: name.clone(),
                        value: String::new(),
                    };
                    self.store.touch(app.store, &withheld.identity()).await;
                    continue;
                }
            };
            let artifact = Artifact::Env {
                name: name.clone(),
                value: value.clone(),
            };
            if self.store.check_update(app.store, &artifact).await {
                info!("Set environment variable {}", name);
                std::env::set_var(name, value);
                outcome.changed.push(name.clone());
            }
        }

        for (dest, source) in &app.files {
            let value = match self.renderer.render(dest, source, &my) {
                Ok(value) => value,
                Err(e) => {
                    error!("{}", e);
                    outcome.failed = true;
                    let withheld = Artifact::File {
                        dest: dest.clone(),
                        value: String::new(),
                    };
                    self.store.touch(app.store, &withheld.identity()).await;
                    continue;
                }
            };
            let artifact = Artifact::File {
                dest: dest.clone(),
                value: value.clone(),
            };
            if !self.store.check_update(app.store, &artifact).await {
                continue;
            }
            info!("Write new configuration of {}", dest);
            match std::fs::write(dest, value) {
                Ok(()) => outcome.changed.push(dest.clone()),
                Err(source) => {
                    error!(
                        "{}",
                        SurokError::Io {
                            path: PathBuf::from(dest),
                            source,
                        }
                    );
                    outcome.failed = true;
                    self.store.invalidate(app.store, &artifact.identity()).await;
                }
            }
        }

        if outcome.changed.is_empty() {
            return outcome;
        }
        if outcome.failed {
            warn!("Reload of {} suppressed, some artifacts failed", app.conf_name);
            return outcome;
        }
        match self.reload(settings, app).await {
            Ok(reloaded) => outcome.reloaded = reloaded,
            Err(e) => error!("Reload of {} failed: {:#}", app.conf_name, e),
        }
        outcome
    }

    /// Run the declaration's reload action; false when there is none
    async fn reload(&self, settings: &AgentSettings, app: &AppDeclaration) -> Result<bool> {
        if settings.marathon.restart {
            let app_id = self
                .config
                .normalizer()
                .env()
                .get(ENV_MARATHON_APP_ID)
                .ok_or_else(|| anyhow!("Cannot find {}", ENV_MARATHON_APP_ID))?;
            marathon_api::restart_app(&self.client, &settings.marathon, app_id).await?;
            return Ok(true);
        }
        let Some(cmd) = app.reload_cmd.as_deref() else {
            debug!("No reload command for {}", app.conf_name);
            return Ok(false);
        };
        run_reload_command(&app.conf_name, cmd).await?;
        Ok(true)
    }
}

async fn run_reload_command(conf_name: &str, cmd: &str) -> Result<()> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .with_context(|| format!("Failed to execute reload command: {}", cmd))?;
    info!(
        "Restart {} app:\n{}",
        conf_name,
        String::from_utf8_lossy(&output.stdout)
    );
    if !output.status.success() {
        return Err(anyhow!(
            "Reload command exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(())
}

/// Remove the file or variable behind a swept record
fn undo_artifact(record: &StoreRecord) {
    if let Some(dest) = &record.dest {
        match std::fs::remove_file(dest) {
            Ok(()) => info!("Removed stale file {}", dest),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => error!(
                "{}",
                SurokError::Io {
                    path: PathBuf::from(dest),
                    source,
                }
            ),
        }
    }
    if let Some(name) = &record.env {
        info!("Unset stale environment variable {}", name);
        std::env::remove_var(name);
    }
}
