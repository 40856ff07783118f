use tracing::Subscriber;
use tracing_subscriber::{
    fmt::{Layer, MakeWriter},
    layer,
    registry::LookupSpan,
    Layer as _,
};

use super::LoggingConfiguration;

pub fn build_formatting_layer<S, W>(config: &LoggingConfiguration, writer: W) -> Box<dyn layer::Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    if config.log_format_json() {
        Layer::new()
            .json()
            .flatten_event(true)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_writer(writer)
            .boxed()
    } else {
        Layer::new()
            .compact()
            .with_target(true)
            .with_thread_names(true)
            .with_writer(writer)
            .boxed()
    }
}
