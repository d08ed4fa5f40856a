//! Master domain model: builders, schedulers and the trigger graph

use crate::core::{
    builder::Builder,
    config::{MasterConfig, Settings},
    graph::JobGraph,
    schedulers::Scheduler,
    step::StepDefaults,
};

/// A loaded master configuration
#[derive(Debug, Clone)]
pub struct Master {
    /// Master name
    pub name: String,

    /// Explicit runtime settings
    pub settings: Settings,

    /// Builders, in declared order
    pub builders: Vec<Builder>,

    /// Schedulers, in declared order
    pub schedulers: Vec<Scheduler>,

    /// Trigger graph between builders
    pub graph: JobGraph,
}

impl Master {
    /// Create a master from configuration
    pub fn from_config(config: &MasterConfig) -> Self {
        let defaults = StepDefaults {
            timeout_secs: config.settings.default_timeout_secs,
        };

        let builders: Vec<Builder> = config
            .builders
            .iter()
            .map(|b| Builder::from_config(b, &defaults))
            .collect();
        let schedulers: Vec<Scheduler> = config.schedulers.iter().map(Scheduler::from_config).collect();
        let graph = JobGraph::build(&builders, &schedulers);

        Master {
            name: config.name.clone(),
            settings: config.settings.clone(),
            builders,
            schedulers,
            graph,
        }
    }

    /// Get a builder by name
    pub fn builder(&self, name: &str) -> Option<&Builder> {
        self.builders.iter().find(|b| b.name == name)
    }

    /// Get a scheduler by name
    pub fn scheduler(&self, name: &str) -> Option<&Scheduler> {
        self.schedulers.iter().find(|s| s.name == name)
    }

    /// Builders reachable through a scheduler
    pub fn builders_of(&self, scheduler: &Scheduler) -> Vec<&Builder> {
        scheduler
            .builders
            .iter()
            .filter_map(|name| self.builder(name))
            .collect()
    }
}
