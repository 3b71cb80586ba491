//! AMQP 1.0 wire types
//!
//! Performatives, termini, delivery states and SASL frame bodies come from
//! `fe2o3-amqp-types`. Only a few shorthands the engine uses are defined here.

pub use fe2o3_amqp_types::{definitions, messaging, performatives, primitives, sasl};

use fe2o3_amqp_types::{
    definitions::ErrorCondition,
    messaging::{Accepted, DeliveryState, Rejected, Released, Source, Target},
};

/// The AMQP `error` type. Closing endpoints, failed transports and rejected
/// deliveries carry one.
pub type Condition = definitions::Error;

/// Creates a condition with a description
pub fn condition(kind: impl Into<ErrorCondition>, description: impl Into<String>) -> Condition {
    Condition {
        condition: kind.into(),
        description: Some(description.into()),
        info: None,
    }
}

/// The accepted outcome
pub fn accepted() -> DeliveryState {
    DeliveryState::Accepted(Accepted {})
}

/// The released outcome
pub fn released() -> DeliveryState {
    DeliveryState::Released(Released {})
}

/// The rejected outcome with an optional condition
pub fn rejected(error: Option<Condition>) -> DeliveryState {
    DeliveryState::Rejected(Rejected { error })
}

/// A source with only the address set
pub fn source(address: impl Into<String>) -> Source {
    Source::builder().address(address.into()).build()
}

/// A target with only the address set
pub fn target(address: impl Into<String>) -> Target {
    Target::builder().address(address.into()).build()
}

#[cfg(test)]
mod tests {
    use fe2o3_amqp_types::{
        definitions::{AmqpError, ErrorCondition},
        messaging::{DeliveryState, Source},
    };
    use serde_amqp::{from_slice, to_vec};

    use super::{condition, rejected, source, Condition};

    #[test]
    fn rejected_state_keeps_its_condition() {
        let state = rejected(Some(condition(AmqpError::DecodeError, "bad payload")));
        let buf = to_vec(&state).unwrap();
        let decoded: DeliveryState = from_slice(&buf).unwrap();
        match decoded {
            DeliveryState::Rejected(rejected) => {
                let error: Condition = rejected.error.unwrap();
                assert_eq!(
                    error.condition,
                    ErrorCondition::AmqpError(AmqpError::DecodeError)
                );
                assert_eq!(error.description.as_deref(), Some("bad payload"));
            }
            other => panic!("expecting rejected, found {:?}", other),
        }
    }

    #[test]
    fn source_carries_only_the_address() {
        let buf = to_vec(&source("q1")).unwrap();
        let decoded: Source = from_slice(&buf).unwrap();
        assert_eq!(decoded.address.as_deref(), Some("q1"));
        assert!(!decoded.dynamic);
    }
}
