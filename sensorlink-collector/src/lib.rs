/**
 * SENSORLINK COLLECTOR - Bibliothèque du serveur central
 *
 * RÔLE : Sessions clients, liveness, historique des lectures et API snapshot.
 * Le binaire (main.rs) ne fait que l'assemblage ; la devkit réutilise ces
 * modules pour lancer un collector en process dans les tests.
 */

pub mod config;
pub mod connection;
pub mod health;
pub mod history;
pub mod http;
pub mod hub;
pub mod models;
pub mod monitor;
pub mod registry;
pub mod server;

pub use config::{load_config, load_config_from, CollectorConfig, LivenessConf};
pub use connection::{ConnectionHandler, ConnectionSettings, SessionEnd};
pub use health::{CollectorHealth, HealthTracker};
pub use history::{HistoryBuffer, HistoryEntry};
pub use hub::{Hub, SharedHub};
pub use models::{ClientStatus, ClientView, CollectorEvent, ReadingEvent, StatusEvent, StatusReason};
pub use registry::{ClientRegistry, ConnectOutcome, LivenessPolicy, RegistryError};
pub use server::CollectorServer;
