//! `Switchyard` Core: transport taxonomy, service descriptors, the api call
//! envelope, and the log sink seam shared by every server component.

pub mod clock;
pub mod descriptor;
pub mod envelope;
pub mod log;
pub mod transport;

pub use clock::{ClockSource, SystemClock};
pub use descriptor::{DescriptorError, Permission, ServiceDescriptor};
pub use envelope::ApiCall;
pub use log::{LogLevel, LogRecord, LogSink, MemoryLogSink, TracingLogSink};
pub use transport::{TransportBinding, TransportParseError, TransportSpec, TransportType};
