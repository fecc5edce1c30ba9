use hso_cbor::Hash;
use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::record::StateId;

/// Domain / map / layer triple that locates a call in the business topology.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tfa {
    pub domain: String,
    #[serde(default)]
    pub map: String,
    #[serde(default)]
    pub layer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Security {
    pub actor: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Provenance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_state: Option<StateId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Hash>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Quality {
    pub precision: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_budget: Option<f64>,
}

impl Default for Quality {
    fn default() -> Self {
        Self {
            precision: 1e-6,
            energy_budget: None,
        }
    }
}

/// Per-call metadata carried on every orchestrator → backend call.
///
/// Envelopes are never mutated; stage calls derive a child with [`Envelope::child`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub trace_id: String,
    pub tfa: Tfa,
    #[serde(default)]
    pub segment: String,
    pub intent: String,
    pub security: Security,
    #[serde(default)]
    pub provenance: Provenance,
    pub deadline_ms: u64,
    #[serde(default)]
    pub quality: Quality,
    /// Set when the call carries a forecast field past its staleness bound.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stale: bool,
}

impl Envelope {
    pub fn builder(domain: impl Into<String>, intent: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder::new(domain.into(), intent.into())
    }

    pub fn domain(&self) -> &str {
        &self.tfa.domain
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.security.scopes.iter().any(|s| s == scope)
    }

    /// Derive the envelope for a stage call: same trace, new intent and deadline.
    pub fn child(&self, intent: impl Into<String>, deadline: &Deadline) -> Envelope {
        Envelope {
            intent: intent.into(),
            deadline_ms: deadline.remaining_ms(),
            ..self.clone()
        }
    }

    pub fn marked_stale(&self) -> Envelope {
        Envelope {
            stale: true,
            ..self.clone()
        }
    }

    pub fn with_inputs(&self, inputs: Vec<Hash>) -> Envelope {
        Envelope {
            provenance: Provenance {
                parent_state: self.provenance.parent_state.clone(),
                inputs,
            },
            ..self.clone()
        }
    }

    pub fn hash(&self) -> Result<Hash, serde_cbor::Error> {
        Hash::of_normalized(self)
    }
}

pub struct EnvelopeBuilder {
    trace_id: Option<String>,
    tfa: Tfa,
    segment: String,
    intent: String,
    security: Security,
    provenance: Provenance,
    deadline_ms: u64,
    quality: Quality,
}

impl EnvelopeBuilder {
    fn new(domain: String, intent: String) -> Self {
        Self {
            trace_id: None,
            tfa: Tfa {
                domain,
                map: String::new(),
                layer: String::new(),
            },
            segment: String::new(),
            intent,
            security: Security::default(),
            provenance: Provenance::default(),
            deadline_ms: 0,
            quality: Quality::default(),
        }
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn map(mut self, map: impl Into<String>) -> Self {
        self.tfa.map = map.into();
        self
    }

    pub fn layer(mut self, layer: impl Into<String>) -> Self {
        self.tfa.layer = layer.into();
        self
    }

    pub fn segment(mut self, segment: impl Into<String>) -> Self {
        self.segment = segment.into();
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.security.actor = actor.into();
        self
    }

    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.security.scopes.push(scope.into());
        self
    }

    pub fn parent_state(mut self, parent: Option<StateId>) -> Self {
        self.provenance.parent_state = parent;
        self
    }

    pub fn input(mut self, input: Hash) -> Self {
        self.provenance.inputs.push(input);
        self
    }

    pub fn deadline(mut self, deadline: &Deadline) -> Self {
        self.deadline_ms = deadline.remaining_ms();
        self
    }

    pub fn deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }

    pub fn quality(mut self, quality: Quality) -> Self {
        self.quality = quality;
        self
    }

    pub fn build(self) -> Envelope {
        Envelope {
            trace_id: self
                .trace_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            tfa: self.tfa,
            segment: self.segment,
            intent: self.intent,
            security: self.security,
            provenance: self.provenance,
            deadline_ms: self.deadline_ms,
            quality: self.quality,
            stale: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_to_documented_shape() {
        let env = Envelope::builder("grid-east", "cycle.solve")
            .trace_id("t-1")
            .map("ops")
            .layer("dispatch")
            .segment("s1")
            .actor("scheduler")
            .scope("solve")
            .deadline_ms(300)
            .build();
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(
            value,
            json!({
                "trace_id": "t-1",
                "tfa": {"domain": "grid-east", "map": "ops", "layer": "dispatch"},
                "segment": "s1",
                "intent": "cycle.solve",
                "security": {"actor": "scheduler", "scopes": ["solve"]},
                "provenance": {},
                "deadline_ms": 300,
                "quality": {"precision": 1e-6},
            })
        );
    }

    #[test]
    fn child_keeps_trace_and_marks_stale_separately() {
        let env = Envelope::builder("d", "cycle").deadline_ms(500).build();
        let child = env.child("forecast.nowcast", &Deadline::after_ms(100));
        assert_eq!(child.trace_id, env.trace_id);
        assert_eq!(child.intent, "forecast.nowcast");
        assert!(child.deadline_ms <= 100);
        assert!(!child.stale);
        let stale = child.marked_stale();
        assert!(stale.stale);
        assert!(!child.stale);
        assert_eq!(serde_json::to_value(&stale).unwrap()["stale"], json!(true));
    }

    #[test]
    fn generated_trace_ids_are_unique() {
        let a = Envelope::builder("d", "x").build();
        let b = Envelope::builder("d", "x").build();
        assert_ne!(a.trace_id, b.trace_id);
    }
}
