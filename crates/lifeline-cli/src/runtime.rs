//! Wiring from the loaded config to the library components

use crate::cli::Cli;
use lifeline::orchestrator::register_configured;
use lifeline::{
    BackupStore, Config, DetachedProcess, Engine, FailurePolicy, Orchestrator, Result, Watchdog,
};

/// Global flags plus the loaded configuration
pub struct Runtime {
    pub config: Config,
    pub silent: bool,
    pub dry_run: bool,
    pub force: bool,
    pub yes: bool,
}

impl Runtime {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let config = Config::load(cli.config.as_deref())?;
        Ok(Self {
            config,
            silent: cli.silent,
            dry_run: cli.dry_run,
            force: cli.force,
            yes: cli.yes,
        })
    }

    pub fn store(&self) -> Result<BackupStore> {
        BackupStore::open(&self.config.paths.backup_root)
    }

    pub fn engine(&self) -> Result<Engine> {
        Ok(Engine::new(
            self.store()?,
            self.config.system.clone(),
            &self.config.paths.state_dir,
        )?
        .with_dry_run(self.dry_run))
    }

    /// Watchdog whose revert worker re-executes this binary
    pub fn watchdog(&self) -> Result<Watchdog> {
        Watchdog::new(
            self.config.channel.clone(),
            &self.config.paths.state_dir,
            Box::new(DetachedProcess::current_exe()?),
        )
    }

    /// Orchestrator with every configured task registered.
    ///
    /// `fail_fast` overrides the config's policy when given.
    pub fn orchestrator(&self, fail_fast: Option<bool>) -> Result<Orchestrator> {
        let policy =
            FailurePolicy::from_fail_fast(fail_fast.unwrap_or(self.config.orchestrator.fail_fast));
        let mut orch = Orchestrator::new(self.engine()?, &self.config.paths.markers_dir())?
            .with_watchdog(self.watchdog()?)
            .with_policy(policy)
            .with_force(self.force);
        register_configured(&mut orch, &self.config.tasks, &self.config.firewall)?;
        Ok(orch)
    }
}
