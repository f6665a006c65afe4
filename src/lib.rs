pub mod analysis;
pub mod boundary;
pub mod device;
pub mod error;
pub mod filter;
pub mod processing;
pub mod protocol;
pub mod store;
pub mod stream;
pub mod types;
pub mod waveform;

pub use device::{AcquisitionDevice, ArenaDevice, RecordingArena, SoftwareLoopback};
pub use error::{EcaError, Result};
pub use protocol::{add_experiment, CompileOptions, CompiledExperiment};
pub use store::DataStore;
pub use stream::{run_session, SessionContext, SessionSummary};
pub use types::{ArenaMode, SessionConfig};
