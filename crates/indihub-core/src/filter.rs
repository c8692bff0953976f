//! Traffic filter hook
//!
//! The share proxy runs every element batch through an optional filter
//! before it touches the local INDI-server (and, symmetrically, before
//! local replies go to the cloud). Rules are per-direction deny-lists of
//! element tag names.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::xml;

/// Per-direction filter rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Tag names dropped from cloud-to-local traffic.
    #[serde(default)]
    pub incoming_deny: Vec<String>,
    /// Tag names dropped from local-to-cloud traffic.
    #[serde(default)]
    pub outgoing_deny: Vec<String>,
}

/// Applies [`FilterConfig`] rules to element batches.
#[derive(Debug, Clone, Default)]
pub struct IndiFilter {
    config: FilterConfig,
}

impl IndiFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Filter cloud-to-local traffic.
    pub fn filter_incoming(&self, elements: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        Self::apply(&self.config.incoming_deny, elements)
    }

    /// Filter local-to-cloud traffic.
    pub fn filter_outgoing(&self, elements: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        Self::apply(&self.config.outgoing_deny, elements)
    }

    fn apply(deny: &[String], elements: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
        if deny.is_empty() {
            return elements;
        }
        elements
            .into_iter()
            .filter(|el| {
                let denied = xml::tag_name(el)
                    .map(|tag| deny.iter().any(|d| d.as_bytes() == tag))
                    .unwrap_or(false);
                if denied {
                    debug!(
                        "filter dropped element {}",
                        String::from_utf8_lossy(&el[..el.len().min(60)])
                    );
                }
                !denied
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_rules_pass_everything() {
        let filter = IndiFilter::default();
        let batch = vec![b"<a/>".to_vec(), b"<b/>".to_vec()];
        assert_eq!(filter.filter_incoming(batch.clone()), batch);
        assert_eq!(filter.filter_outgoing(batch.clone()), batch);
    }

    #[test]
    fn test_deny_list_drops_by_tag() {
        let filter = IndiFilter::new(FilterConfig {
            incoming_deny: vec!["newSwitchVector".to_string()],
            outgoing_deny: vec![],
        });
        let batch = vec![
            b"<newSwitchVector device='scope'><oneSwitch>On</oneSwitch></newSwitchVector>"
                .to_vec(),
            b"<newNumberVector device='scope'></newNumberVector>".to_vec(),
        ];
        let filtered = filter.filter_incoming(batch);
        assert_eq!(filtered.len(), 1);
        assert!(filtered[0].starts_with(b"<newNumberVector"));
    }

    #[test]
    fn test_directions_are_independent() {
        let filter = IndiFilter::new(FilterConfig {
            incoming_deny: vec!["a".to_string()],
            outgoing_deny: vec!["b".to_string()],
        });
        let batch = vec![b"<a/>".to_vec(), b"<b/>".to_vec()];
        assert_eq!(filter.filter_incoming(batch.clone()), vec![b"<b/>".to_vec()]);
        assert_eq!(filter.filter_outgoing(batch), vec![b"<a/>".to_vec()]);
    }
}
