//! External RTSP transcoding pipelines, one child process per camera index

mod supervisor;
pub mod types;

pub use supervisor::PipelineSupervisor;
pub use types::{endpoint_for, pipeline_description, PipelineStatus};
