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

//! Translation of the configured rules into [`Rule`]s.

use std::collections::HashSet;

use log::{debug, info};

use super::error::{Error, Result};
use super::information_element::{ids, InformationElement};
use super::rule::{Modifier, Pattern, Rule, RuleField};
use crate::config::{AggregatorConfig, FieldConfig, RuleConfig};

fn resolve_ie(cfg: &FieldConfig) -> Result<InformationElement> {
    let ie = match (cfg.ie.as_deref(), cfg.id) {
        (Some(name), _) => InformationElement::by_name(name)
            .ok_or_else(|| Error::UnknownInformationElement(name.to_owned()))?,
        (None, Some(id)) => InformationElement::by_id(id, cfg.enterprise).ok_or_else(|| {
            Error::UnknownInformationElement(format!("id {} enterprise {}", id, cfg.enterprise))
        })?,
        (None, None) => {
            return Err(Error::Config(
                "field needs either an ie name or an id".to_owned(),
            ))
        }
    };
    let ie = match cfg.length {
        Some(length) => ie.with_length(length),
        None => ie,
    };
    if ie.length == 0 && !ie.forward().is_private(ids::FRONT_PAYLOAD) {
        return Err(Error::Config(format!(
            "length of field {} must be specified",
            ie
        )));
    }
    Ok(ie)
}

fn flow_key_field(cfg: &FieldConfig) -> Result<RuleField> {
    let ie = resolve_ie(cfg)?;
    let modifier = match cfg.modifier.as_deref() {
        Some(m) => m.parse::<Modifier>().map_err(|_| Error::InvalidModifier {
            ie,
            modifier: m.to_owned(),
        })?,
        None => Modifier::Keep,
    };
    if modifier == Modifier::Aggregate {
        return Err(Error::InvalidModifier {
            ie,
            modifier: modifier.to_string(),
        });
    }
    let pattern = match cfg.pattern.as_deref() {
        Some(p) => Some(Pattern::parse(&ie, p)?),
        None => None,
    };
    RuleField::new(ie, modifier, pattern)
}

fn non_flow_key_field(cfg: &FieldConfig) -> Result<RuleField> {
    let ie = resolve_ie(cfg)?;
    if cfg.pattern.is_some() {
        return Err(Error::PatternNotSupported(ie));
    }
    RuleField::new(ie, Modifier::Aggregate, None)
}

impl TryFrom<&RuleConfig> for Rule {
    type Error = Error;

    fn try_from(cfg: &RuleConfig) -> Result<Self> {
        let mut fields = Vec::with_capacity(cfg.flow_key.len() + cfg.non_flow_key.len());
        for f in cfg.flow_key.iter() {
            fields.push(flow_key_field(f)?);
        }
        for f in cfg.non_flow_key.iter() {
            fields.push(non_flow_key_field(f)?);
        }
        if fields.is_empty() {
            return Err(Error::NoUsableFields(cfg.template_id));
        }
        let rule = Rule::new(cfg.template_id, cfg.biflow_aggregation, fields)?
            .with_preceding(cfg.preceding);
        debug!("{}", rule);
        Ok(rule)
    }
}

/// Ordered set of rules; template ids are unique.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RuleSet(Vec<Rule>);

impl RuleSet {
    pub fn new(rules: Vec<Rule>) -> Result<Self> {
        let mut ids = HashSet::new();
        for r in rules.iter() {
            if !ids.insert(r.id) {
                return Err(Error::DuplicatedTemplateId(r.id));
            }
        }
        Ok(Self(rules))
    }

    pub fn from_config(cfg: &AggregatorConfig) -> Result<Self> {
        let rules = cfg
            .rules
            .iter()
            .map(Rule::try_from)
            .collect::<Result<Vec<_>>>()?;
        info!("{} aggregation rules loaded", rules.len());
        Self::new(rules)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl IntoIterator for RuleSet {
    type Item = Rule;
    type IntoIter = std::vec::IntoIter<Rule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::aggregator::information_element::{ProtocolClasses, PEN_PRIVATE};
    use crate::config::Config;

    const RULES: &str = r#"
aggregator:
  expiration:
    active-timeout: 60s
    inactive-timeout: 5s
  rules:
    - template-id: 998
      flow-key:
        - ie: sourceIPv4Address
          modifier: mask/24
        - ie: destinationTransportPort
          match: "80,443"
        - id: 4
      non-flow-key:
        - ie: octetDeltaCount
        - ie: frontPayload
          length: 64
        - id: 3
          enterprise: 2003828736
"#;

    #[test]
    fn rules_from_config() {
        let cfg = Config::load(RULES).unwrap();
        let rules = RuleSet::from_config(&cfg.aggregator).unwrap();
        assert_eq!(rules.len(), 1);
        let rule = &rules.rules()[0];
        assert_eq!(rule.id, 998);
        assert_eq!(rule.fields.len(), 6);
        assert_eq!(rule.fields[0].modifier, Modifier::Mask(24));
        assert_eq!(rule.fields[0].ie.length, 5);
        assert!(rule.fields[1].pattern.is_some());
        assert!(rule.fields[2].ie.is_standard(ids::PROTOCOL_IDENTIFIER));
        assert_eq!(rule.fields[4].ie.length, 64);
        assert_eq!(rule.fields[5].ie, InformationElement::private(ids::MAX_PACKET_GAP, 4));
        assert_eq!(rule.fields[5].ie.enterprise, PEN_PRIVATE);
        assert_eq!(rule.valid_protocols(), ProtocolClasses::ALL);
    }

    #[test]
    fn config_errors() {
        let unknown = RuleConfig {
            template_id: 1,
            flow_key: vec![FieldConfig {
                ie: Some("sourceIPv9Address".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            Rule::try_from(&unknown),
            Err(Error::UnknownInformationElement(_))
        ));

        let unknown_id = RuleConfig {
            template_id: 1,
            flow_key: vec![FieldConfig {
                id: Some(100),
                enterprise: 9,
                length: Some(2),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            Rule::try_from(&unknown_id),
            Err(Error::UnknownInformationElement(_))
        ));

        let bad_pattern = RuleConfig {
            template_id: 1,
            flow_key: vec![FieldConfig {
                ie: Some("sourceIPv4Address".to_owned()),
                pattern: Some("10.0.0/8".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            Rule::try_from(&bad_pattern),
            Err(Error::InvalidPattern { .. })
        ));

        let short_payload = RuleConfig {
            template_id: 1,
            non_flow_key: vec![FieldConfig {
                ie: Some("frontPayload".to_owned()),
                length: Some(4),
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(matches!(
            Rule::try_from(&short_payload),
            Err(Error::FrontPayloadTooShort(4))
        ));

        let empty = RuleConfig {
            template_id: 7,
            ..Default::default()
        };
        assert!(matches!(Rule::try_from(&empty), Err(Error::NoUsableFields(7))));

        let rule = Rule::try_from(&RuleConfig {
            template_id: 7,
            flow_key: vec![FieldConfig {
                ie: Some("protocolIdentifier".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            RuleSet::new(vec![rule.clone(), rule]),
            Err(Error::DuplicatedTemplateId(7))
        ));
    }
}
