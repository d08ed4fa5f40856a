//! Builder domain model

use crate::core::{
    config::BuilderConfig,
    properties::{PropertyBag, PropertyValue},
    render::{RenderError, Renderable},
    step::{Step, StepDefaults},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// How a builder picks a worker for a new run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSelection {
    /// The pool member with the fewest running builds
    #[default]
    LeastLoaded,
    /// The first pool member, in declared order, with a free slot
    FirstAvailable,
}

/// A named job template: an ordered step sequence plus static metadata
#[derive(Debug, Clone)]
pub struct Builder {
    /// Builder name
    pub name: String,

    /// Ordered step sequence
    pub steps: Vec<Step>,

    /// Worker pool members (empty means every worker)
    pub workers: Vec<String>,

    /// Worker assignment rule
    pub next_worker: WorkerSelection,

    pub tags: Vec<String>,

    /// Environment template for remote commands
    pub env: BTreeMap<String, Renderable>,

    /// Always applied, overriding requested properties
    pub properties: BTreeMap<String, PropertyValue>,

    /// Applied only when the key is absent
    pub default_properties: BTreeMap<String, PropertyValue>,

    /// Resource lock keys held for the whole run
    pub locks: Vec<Renderable>,
}

impl Builder {
    /// Create a builder from configuration
    ///
    /// Repeated step names get a numeric suffix (`shell`, `shell_1`, ...).
    pub fn from_config(config: &BuilderConfig, defaults: &StepDefaults) -> Self {
        let mut seen: HashMap<String, usize> = HashMap::new();
        let steps = config
            .steps
            .iter()
            .map(|step_config| {
                let mut step = Step::from_config(step_config, defaults);
                let count = seen.entry(step.name.clone()).or_insert(0);
                if *count > 0 {
                    step.name = format!("{}_{}", step.name, count);
                }
                *count += 1;
                step
            })
            .collect();

        Builder {
            name: config.name.clone(),
            steps,
            workers: config.workers.clone(),
            next_worker: config.next_worker,
            tags: config.tags.clone(),
            env: config.env.clone(),
            properties: config.properties.clone(),
            default_properties: config.default_properties.clone(),
            locks: config.locks.clone(),
        }
    }

    /// Get a step by name
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Seed the initial bag of a run from the requested properties
    pub fn seed_properties(&self, requested: &PropertyBag) -> PropertyBag {
        let mut bag = requested.clone();
        for (key, value) in &self.properties {
            bag.set(key.clone(), value.clone(), "Builder");
        }
        for (key, value) in &self.default_properties {
            bag.set_default(key.clone(), value.clone(), "Builder");
        }
        bag
    }

    /// Materialize the process environment of a step
    ///
    /// Layers: the explicit base environment, the builder template, the
    /// step's overrides. Entries that render to null are removed.
    pub fn render_env(
        &self,
        step: &Step,
        bag: &PropertyBag,
        base: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, RenderError> {
        let mut env = base.clone();
        for template in [&self.env, &step.env] {
            for (name, value) in template {
                match value.render(bag)?.as_env_value() {
                    Some(rendered) => {
                        env.insert(name.clone(), rendered);
                    }
                    None => {
                        env.remove(name);
                    }
                }
            }
        }
        Ok(env)
    }

    /// Render the lock keys for a run: deduplicated, sorted, empty keys dropped
    pub fn render_locks(&self, bag: &PropertyBag) -> Result<Vec<String>, RenderError> {
        let mut keys = BTreeSet::new();
        for lock in &self.locks {
            let key = lock.render_string(bag)?;
            if !key.is_empty() {
                keys.insert(key);
            }
        }
        Ok(keys.into_iter().collect())
    }
}
