/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const MIN_HASHTABLE_BITS: u8 = 1;
const MAX_HASHTABLE_BITS: u8 = 28;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("aggregator config invalid: {0}")]
    AggregatorConfigInvalid(String),
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub aggregator: AggregatorConfig,
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.len() == 0 {
            // parsing empty string leads to EOF error
            Ok(Self::default())
        } else {
            serde_yaml::from_str(contents)
                .map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct AggregatorConfig {
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub hashtable_bits: u8,
    pub expiration: ExpirationConfig,
    pub rules: Vec<RuleConfig>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            hashtable_bits: 17,
            expiration: ExpirationConfig::default(),
            rules: vec![],
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::AggregatorConfigInvalid(
                "poll-interval must be positive".to_owned(),
            ));
        }
        if !(MIN_HASHTABLE_BITS..=MAX_HASHTABLE_BITS).contains(&self.hashtable_bits) {
            return Err(ConfigError::AggregatorConfigInvalid(format!(
                "hashtable-bits {} out of range [{}, {}]",
                self.hashtable_bits, MIN_HASHTABLE_BITS, MAX_HASHTABLE_BITS
            )));
        }
        if self.expiration.active_timeout.is_zero() {
            return Err(ConfigError::AggregatorConfigInvalid(
                "expiration.active-timeout must be set".to_owned(),
            ));
        }
        if self.expiration.inactive_timeout.is_zero() {
            return Err(ConfigError::AggregatorConfigInvalid(
                "expiration.inactive-timeout must be set".to_owned(),
            ));
        }
        if self.rules.is_empty() {
            return Err(ConfigError::AggregatorConfigInvalid(
                "no rules configured".to_owned(),
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExpirationConfig {
    // maximum lifetime of an aggregate
    #[serde(with = "humantime_serde")]
    pub active_timeout: Duration,
    // idle time after which an aggregate is exported
    #[serde(with = "humantime_serde")]
    pub inactive_timeout: Duration,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct RuleConfig {
    pub template_id: u16,
    pub preceding: u16,
    pub biflow_aggregation: bool,
    pub flow_key: Vec<FieldConfig>,
    pub non_flow_key: Vec<FieldConfig>,
}

/// A field is named either by `ie` or by `id` and `enterprise`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FieldConfig {
    pub ie: Option<String>,
    pub id: Option<u16>,
    pub enterprise: u32,
    pub length: Option<u16>,
    pub modifier: Option<String>,
    #[serde(rename = "match")]
    pub pattern: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_yaml_file() {
        let c = Config::load_from_file("config/flow-aggregator.yaml")
            .expect("failed loading config file");
        assert_eq!(c.aggregator.poll_interval, Duration::from_millis(250));
        assert_eq!(c.aggregator.hashtable_bits, 17);
        assert_eq!(c.aggregator.expiration.active_timeout, Duration::from_secs(60));
        assert_eq!(c.aggregator.expiration.inactive_timeout, Duration::from_secs(5));
        assert!(!c.aggregator.rules.is_empty());
        let rule = &c.aggregator.rules[0];
        assert_eq!(rule.template_id, 998);
        assert_eq!(rule.flow_key[0].modifier.as_deref(), Some("mask/24"));
        assert_eq!(rule.flow_key[1].pattern.as_deref(), Some("80,443,1000:2000"));
        assert!(c.aggregator.validate().is_ok());
    }

    #[test]
    fn empty_and_invalid() {
        let c = Config::load("").unwrap();
        assert_eq!(c, Config::default());
        assert!(c.aggregator.validate().is_err());

        let c = Config::load(
            r#"
aggregator:
  hashtable-bits: 40
  expiration:
    active-timeout: 1m
    inactive-timeout: 1s
  rules:
    - template-id: 1
"#,
        )
        .unwrap();
        assert!(matches!(
            c.aggregator.validate(),
            Err(ConfigError::AggregatorConfigInvalid(_))
        ));

        assert!(Config::load("aggregator: [").is_err());
    }

    #[test]
    fn fields_by_id() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"
aggregator:
  poll-interval: 1s
  expiration:
    active-timeout: 2m
    inactive-timeout: 10s
  rules:
    - template-id: 7
      flow-key:
        - id: 8
        - id: 100
          enterprise: 9
          length: 2
"#,
        )
        .unwrap();
        let c = Config::load_from_file(file.path()).unwrap();
        assert_eq!(c.aggregator.poll_interval, Duration::from_secs(1));
        assert_eq!(c.aggregator.hashtable_bits, 17);
        let keys = &c.aggregator.rules[0].flow_key;
        assert_eq!(keys[0].id, Some(8));
        assert_eq!(keys[1].enterprise, 9);
        assert_eq!(keys[1].length, Some(2));
        assert!(c.aggregator.validate().is_ok());

        assert!(matches!(
            Config::load_from_file(file.path().with_extension("missing")),
            Err(ConfigError::YamlConfigInvalid(_))
        ));
    }
}
