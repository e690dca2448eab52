// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Registry mapping handler-kind names to constructor functions.
//!
//! Feature definitions reference poll and answer handlers by name. Names are
//! resolved once, when features are built from configuration, so an unknown
//! kind or a missing parameter is reported at load time.

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use thiserror::Error;

use crate::feature::{AnswerHandler, DeviceFeature, PollHandler};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandlerError {
    #[error("feature {feature}: unknown poll handler '{kind}'")]
    UnknownPollHandler { feature: String, kind: String },

    #[error("feature {feature}: unknown answer handler '{kind}'")]
    UnknownAnswerHandler { feature: String, kind: String },

    #[error("handler '{kind}' requires parameter '{param}'")]
    MissingParam { kind: &'static str, param: &'static str },
}

/// Numeric parameters attached to a feature definition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct HandlerParams(BTreeMap<String, u8>);

impl HandlerParams {
    pub fn get(&self, name: &str) -> Option<u8> {
        self.0.get(name).copied()
    }

    pub fn require(&self, kind: &'static str, param: &'static str) -> Result<u8, HandlerError> {
        self.get(param)
            .ok_or(HandlerError::MissingParam { kind, param })
    }

    pub fn insert(&mut self, name: impl Into<String>, value: u8) {
        self.0.insert(name.into(), value);
    }
}

/// Feature definition as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeatureConfig {
    pub name: String,
    #[serde(default = "default_handler_kind")]
    pub poll: String,
    #[serde(default = "default_handler_kind")]
    pub answer: String,
    #[serde(default)]
    pub group: Option<u8>,
    #[serde(default = "default_poll_always")]
    pub poll_always: bool,
    #[serde(default)]
    pub params: HandlerParams,
}

fn default_handler_kind() -> String {
    "none".to_string()
}

fn default_poll_always() -> bool {
    true
}

pub type PollHandlerFactory = fn(&HandlerParams) -> Result<PollHandler, HandlerError>;
pub type AnswerHandlerFactory = fn(&HandlerParams) -> Result<AnswerHandler, HandlerError>;

#[derive(Clone)]
pub struct HandlerRegistry {
    poll: HashMap<String, PollHandlerFactory>,
    answer: HashMap<String, AnswerHandlerFactory>,
}

impl HandlerRegistry {
    /// Create a registry with no handlers.
    pub fn new() -> Self {
        Self {
            poll: HashMap::new(),
            answer: HashMap::new(),
        }
    }

    /// Create a registry with every built-in handler registered.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register_poll_handler("none", |_| Ok(PollHandler::None));
        registry.register_poll_handler("status", |p| {
            Ok(PollHandler::Status {
                cmd2: p.get("cmd2").unwrap_or(0x00),
            })
        });
        registry.register_poll_handler("ping", |_| Ok(PollHandler::Ping));
        registry.register_poll_handler("engine", |_| Ok(PollHandler::Engine));
        registry.register_poll_handler("extended", |p| {
            Ok(PollHandler::Extended {
                cmd1: p.require("extended", "cmd1")?,
                cmd2: p.get("cmd2").unwrap_or(0x00),
            })
        });
        registry.register_answer_handler("none", |_| Ok(AnswerHandler::None));
        registry.register_answer_handler("ack", |_| Ok(AnswerHandler::Ack));
        registry.register_answer_handler("extended-reply", |_| Ok(AnswerHandler::ExtendedReply));
        registry
    }

    pub fn register_poll_handler(&mut self, name: &str, factory: PollHandlerFactory) {
        self.poll.insert(normalize_name(name), factory);
    }

    pub fn register_answer_handler(&mut self, name: &str, factory: AnswerHandlerFactory) {
        self.answer.insert(normalize_name(name), factory);
    }

    pub fn is_poll_handler_registered(&self, name: &str) -> bool {
        self.poll.contains_key(&normalize_name(name))
    }

    pub fn registered_poll_handlers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.poll.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build a feature, resolving its handler kinds.
    pub fn build_feature(&self, config: &FeatureConfig) -> Result<DeviceFeature, HandlerError> {
        let poll_factory = self.poll.get(&normalize_name(&config.poll)).ok_or_else(|| {
            HandlerError::UnknownPollHandler {
                feature: config.name.clone(),
                kind: config.poll.clone(),
            }
        })?;
        let answer_factory = self.answer.get(&normalize_name(&config.answer)).ok_or_else(|| {
            HandlerError::UnknownAnswerHandler {
                feature: config.name.clone(),
                kind: config.answer.clone(),
            }
        })?;

        let mut feature = DeviceFeature::new(
            config.name.clone(),
            poll_factory(&config.params)?,
            answer_factory(&config.params)?,
        );
        if let Some(group) = config.group {
            feature = feature.with_group(group);
        }
        if !config.poll_always {
            feature = feature.poll_once();
        }
        Ok(feature)
    }

    /// Build every feature of a device, stopping at the first invalid one.
    pub fn build_features(
        &self,
        configs: &[FeatureConfig],
    ) -> Result<Vec<DeviceFeature>, HandlerError> {
        configs.iter().map(|c| self.build_feature(c)).collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn normalize_name(name: &str) -> String {
    name.to_ascii_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feature(name: &str, poll: &str, answer: &str) -> FeatureConfig {
        FeatureConfig {
            name: name.to_string(),
            poll: poll.to_string(),
            answer: answer.to_string(),
            group: None,
            poll_always: true,
            params: HandlerParams::default(),
        }
    }

    #[test]
    fn test_builtin_kinds_resolve() {
        let registry = HandlerRegistry::with_builtin();
        assert!(registry.is_poll_handler_registered("Status"));
        assert!(registry.is_poll_handler_registered("PING"));
        assert_eq!(
            registry.registered_poll_handlers(),
            vec!["engine", "extended", "none", "ping", "status"]
        );

        let built = registry
            .build_feature(&feature("dimmer", "status", "ack"))
            .unwrap();
        assert_eq!(built.name(), "dimmer");
        assert_eq!(built.poll_handler(), &PollHandler::Status { cmd2: 0 });
    }

    #[test]
    fn test_answer_kind_names_are_normalized() {
        let registry = HandlerRegistry::with_builtin();
        assert!(registry
            .build_feature(&feature("config", "ping", "Extended_Reply"))
            .is_ok());
    }

    #[test]
    fn test_unknown_kind_rejected_at_build_time() {
        let registry = HandlerRegistry::with_builtin();
        let err = registry
            .build_feature(&feature("x", "thermostat", "ack"))
            .unwrap_err();
        assert_eq!(
            err,
            HandlerError::UnknownPollHandler {
                feature: "x".to_string(),
                kind: "thermostat".to_string()
            }
        );

        let err = registry
            .build_feature(&feature("x", "ping", "magic"))
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnknownAnswerHandler { .. }));
    }

    #[test]
    fn test_missing_param_rejected() {
        let registry = HandlerRegistry::with_builtin();
        let err = registry
            .build_feature(&feature("ext", "extended", "extended-reply"))
            .unwrap_err();
        assert_eq!(
            err,
            HandlerError::MissingParam {
                kind: "extended",
                param: "cmd1"
            }
        );

        let mut cfg = feature("ext", "extended", "extended-reply");
        cfg.params.insert("cmd1", 0x2e);
        cfg.group = Some(2);
        cfg.poll_always = false;
        let built = registry.build_feature(&cfg).unwrap();
        assert_eq!(built.group(), Some(2));
        assert!(!built.poll_always());
    }

    #[test]
    fn test_feature_config_from_toml() {
        let cfg: FeatureConfig = toml::from_str(
            r#"
name = "keypad"
poll = "extended"
answer = "extended-reply"
group = 1
params = { cmd1 = 0x2e, cmd2 = 0x00 }
"#,
        )
        .unwrap();
        assert_eq!(cfg.params.get("cmd1"), Some(0x2e));
        assert!(cfg.poll_always);

        let minimal: FeatureConfig = toml::from_str("name = \"led\"").unwrap();
        assert_eq!(minimal.poll, "none");
        assert_eq!(minimal.answer, "none");
    }
}
