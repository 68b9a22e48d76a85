/*!
# SensorLink DevKit - Harness et utilitaires de test

Bibliothèque facilitant les tests de bout en bout collector <-> nodes avec:
- Collector en process sur un port éphémère
- Pair TCP brut pour envoyer des frames arbitraires
- Capteurs déterministes pour les sessions
*/

pub mod raw_peer;
pub mod sensors;
pub mod test_utils;

pub use raw_peer::{Handshake, RawPeer};
pub use sensors::{SequenceSensor, StaticSensor};
pub use test_utils::{TestCollector, DEFAULT_WAIT};
