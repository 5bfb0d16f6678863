//! Module Registry
//!
//! A module is a function from a builder and its configuration to a
//! builder with more nodes registered. The registry maps module names to
//! those functions so a job can be assembled from configuration alone:
//! each enabled module is applied in order with its own parameter table.

use rustc_hash::FxHashMap;

use crate::config::Configuration;
use crate::error::{ConfigurationError, Error};
use crate::graph::GraphBuilder;

pub type RegistrationFn =
    Box<dyn Fn(GraphBuilder, &Configuration) -> Result<GraphBuilder, Error> + Send + Sync>;

#[derive(Default)]
pub struct ModuleRegistry {
    modules: FxHashMap<String, RegistrationFn>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module under a name. Later registrations replace
    /// earlier ones.
    pub fn register<F>(&mut self, name: impl Into<String>, module: F)
    where
        F: Fn(GraphBuilder, &Configuration) -> Result<GraphBuilder, Error> + Send + Sync + 'static,
    {
        self.modules.insert(name.into(), Box::new(module));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Apply one registered module.
    pub fn apply(
        &self,
        name: &str,
        builder: GraphBuilder,
        config: &Configuration,
    ) -> Result<GraphBuilder, Error> {
        let module = self
            .modules
            .get(name)
            .ok_or_else(|| ConfigurationError::Config {
                key: name.to_string(),
                reason: "no module registered under this name".to_string(),
            })?;
        module(builder, config)
    }

    /// Apply every module named in `enabled`, in order, each with its own
    /// configuration table (absent tables are empty).
    pub fn apply_all(
        &self,
        mut builder: GraphBuilder,
        enabled: &[String],
        configs: &FxHashMap<String, Configuration>,
    ) -> Result<GraphBuilder, Error> {
        let empty = Configuration::default();
        for name in enabled {
            let config = configs.get(name).unwrap_or(&empty);
            builder = self.apply(name, builder, config)?;
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::NodeOptions;

    #[test]
    fn modules_apply_in_order() {
        let mut registry = ModuleRegistry::new();
        registry.register("counter", |builder: GraphBuilder, config: &Configuration| {
            let scale: u32 = config.get_or("scale", 1)?;
            Ok(builder.transform(
                "scaled",
                ["value"],
                move |v: &u32| v * scale,
                "scaled_value",
                NodeOptions::serial(),
            ))
        });
        assert!(registry.contains("counter"));

        let config = Configuration::from_json(r#"{"scale": 3}"#).unwrap();
        let builder = GraphBuilder::new()
            .source("Source", |_sink| {})
            .source_product::<u32>("value");
        let builder = registry.apply("counter", builder, &config).unwrap();
        assert!(builder.build().is_ok());
    }

    #[test]
    fn unknown_modules_are_configuration_errors() {
        let registry = ModuleRegistry::new();
        let result = registry.apply(
            "ghost",
            GraphBuilder::new(),
            &Configuration::default(),
        );
        assert!(matches!(
            result,
            Err(Error::Configuration(ConfigurationError::Config { .. }))
        ));
    }
}
