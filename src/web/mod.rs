mod handlers;
mod routes;

pub use routes::{create_pipeline_router, create_stream_router};
