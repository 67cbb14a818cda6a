use crate::types::{QueryRetrieveLevel, RetrieveMethod, AE, UI};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use tracing::Level;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub server: DimseServerConfig,
	#[serde(default)]
	pub aets: Vec<AeConfig>,
	pub relocation: RelocationConfig,
	#[serde(default)]
	pub transform: TransformConfig,
	pub job: Option<JobConfig>,
}

impl AppConfig {
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("RELOCATE").separator("__"))
			.build()?;

		s.try_deserialize()
	}

	/// Looks up a configured peer by its application entity title.
	pub fn ae(&self, aet: &str) -> Option<&AeConfig> {
		self.aets.iter().find(|ae| ae.aet == aet)
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Also configurable via RUST_LOG
	#[serde(with = "level")]
	pub level: Level,
	/// Sentry DSN. Sentry stays disabled if unset.
	pub sentry: Option<String>,
}

/// The STORE-SCP that receives instances during a C-MOVE.
#[derive(Debug, Clone, Deserialize)]
pub struct DimseServerConfig {
	/// Our own application entity title. Used as calling AET and as C-MOVE destination.
	pub aet: AE,
	pub interface: IpAddr,
	pub port: u16,
	/// Only accept uncompressed transfer syntaxes.
	#[serde(default)]
	pub uncompressed: bool,
	/// Grace period (ms) for inbound associations to be released once the move is done.
	pub release_timeout: u64,
}

impl DimseServerConfig {
	pub fn address(&self) -> SocketAddr {
		SocketAddr::from((self.interface, self.port))
	}
}

/// A remote DICOM node that acts as source or destination of a relocation.
#[derive(Debug, Clone, Deserialize)]
pub struct AeConfig {
	pub aet: AE,
	pub host: IpAddr,
	pub port: u16,
	/// The node supports relational queries, so no hierarchical C-FIND cascade is needed.
	#[serde(default)]
	pub relational: bool,
	/// DIMSE message timeout (ms).
	pub timeout: u64,
}

impl AeConfig {
	pub fn address(&self) -> SocketAddr {
		SocketAddr::from((self.host, self.port))
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelocationConfig {
	pub method: RetrieveMethod,
	pub retrieve_level: QueryRetrieveLevel,
	pub storage_commitment: bool,
	/// Upper bound (ms) for the N-EVENT-REPORT after an N-ACTION.
	pub commitment_timeout: u64,
	/// Skip retrieval of identifiers that are already available at the destination.
	pub skip_if_present: bool,
	/// Stop after this many matching responses. 0 disables the ceiling.
	pub max_responses: usize,
	/// Interval (ms) in which the progress sink is updated and polled for cancellation.
	pub progress_interval: u64,
	/// Storage SOP classes proposed for embedded C-STORE sub-operations of a C-GET.
	#[serde(default)]
	pub storage_sop_classes: Vec<UI>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TransformConfig {
	pub enabled: bool,
	#[serde(default)]
	pub set: Vec<AttributeOverride>,
	#[serde(default)]
	pub remove: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeOverride {
	/// Keyword (`PatientName`) or tag (`00100010`, `(0010,0010)`).
	pub tag: String,
	pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
	pub study_instance_uid: UI,
	pub source: AE,
	pub destination: AE,
}

mod level {
	use serde::{Deserialize, Deserializer};
	use tracing::Level;

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
	where
		D: Deserializer<'de>,
	{
		let value = String::deserialize(deserializer)?;
		value.parse().map_err(serde::de::Error::custom)
	}
}
