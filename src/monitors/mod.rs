//! Optional telemetry samplers
//!
//! Each sampler is detected once at startup; the agent only schedules the
//! loops of samplers that reported themselves available.

pub mod command;
pub mod docker;
pub mod http_checks;
pub mod tls;

pub use command::{run_command, CommandOutput, CommandRunner, SystemRunner};
pub use docker::{send_container_metrics, ContainerMetrics, DockerMonitor};
pub use http_checks::{send_check_results, HttpCheckResult, HttpMonitor};
pub use tls::{TlsInfo, TlsInspector};
