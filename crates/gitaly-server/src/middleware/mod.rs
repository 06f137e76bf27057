//! Interceptor chain run in front of every service.

use tonic::{Request, Status};

pub mod correlation_id;
pub mod log_fields;
pub mod logging;
pub mod request_info;

pub use log_fields::request_span;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MiddlewareTrace {
    pub steps: Vec<&'static str>,
}

#[must_use]
pub fn ordered_interceptor() -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    run_chain
}

fn run_chain(request: Request<()>) -> Result<Request<()>, Status> {
    let request = correlation_id::apply(request)?;
    let request = request_info::apply(request)?;
    let request = log_fields::apply(request)?;
    logging::apply(request)
}

fn mark_step(mut request: Request<()>, step: &'static str) -> Result<Request<()>, Status> {
    if let Some(trace) = request.extensions_mut().get_mut::<MiddlewareTrace>() {
        trace.steps.push(step);
    } else {
        request
            .extensions_mut()
            .insert(MiddlewareTrace { steps: vec![step] });
    }

    Ok(request)
}
